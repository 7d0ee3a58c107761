#![allow(dead_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::{Condvar, Mutex};

use shardsearch::error::{Result, ShardSearchError};
use shardsearch::prelude::*;
use shardsearch::query::QueryModel;
use shardsearch::result::{StoredFieldResolver, ViewFieldResolver};
use shardsearch::searcher::SearcherHandle;
use shardsearch::shard::{
    DocCollector, LiveWriter, ShardMetadata, ShardMetadataStore, ShardOpener, ShardReadView,
    WriterRegistry,
};

pub const WAIT: Duration = Duration::from_secs(20);
pub const POLL: Duration = Duration::from_millis(10);

/// Install a test log writer once. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Every document carries `title`, `body`, a `shard` number and its position `n`.
pub fn shard_docs(shard: u64, count: usize) -> Vec<MemoryDocument> {
    (0..count)
        .map(|n| {
            MemoryDocument::new()
                .with("title", format!("document {n}"))
                .with("body", if n % 2 == 0 { "even" } else { "odd" })
                .with("shard", shard as i64)
                .with("n", n as i64)
        })
        .collect()
}

/// An index with `shards` shards of `docs` documents each, all on version 1.
pub fn memory_index(shards: u64, docs: usize) -> Arc<MemoryIndex> {
    let index = Arc::new(MemoryIndex::new());
    for id in 0..shards {
        index.create_shard(ShardId(id), FormatVersion(1));
        index.add_segment(ShardId(id), shard_docs(id, docs));
    }
    index
}

pub fn schema() -> FieldSchema {
    FieldSchema::new()
        .with_field("title")
        .with_field("body")
        .with_field("shard")
        .with_field("n")
}

pub fn config() -> ShardSearchConfig {
    ShardSearchConfig::default()
        .with_max_threads(4)
        .with_max_match_threads(4)
        .with_poll_interval(POLL)
}

pub fn shard_ids(range: std::ops::Range<u64>) -> Vec<ShardId> {
    range.map(ShardId).collect()
}

/// How a wrapped view misbehaves while matching.
#[derive(Debug, Clone, Copy)]
pub enum MatchFault {
    /// Fail after collecting this many documents.
    ErrorAfter(usize),
    /// Panic after collecting this many documents.
    PanicAfter(usize),
}

/// Wraps a [`MemoryIndex`] and injects matching faults into selected shards.
///
/// Also counts matched documents per shard and flags any use of a view
/// after it was closed.
pub struct FaultyIndex {
    pub index: Arc<MemoryIndex>,
    faults: Mutex<AHashMap<ShardId, MatchFault>>,
    pub matched: Arc<AtomicUsize>,
    pub used_after_close: Arc<AtomicUsize>,
    pub live_views: Arc<AtomicUsize>,
    pub peak_live_views: Arc<AtomicUsize>,
}

impl FaultyIndex {
    pub fn new(index: Arc<MemoryIndex>) -> Arc<Self> {
        Arc::new(Self {
            index,
            faults: Mutex::new(AHashMap::new()),
            matched: Arc::new(AtomicUsize::new(0)),
            used_after_close: Arc::new(AtomicUsize::new(0)),
            live_views: Arc::new(AtomicUsize::new(0)),
            peak_live_views: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn inject(&self, shard: ShardId, fault: MatchFault) {
        self.faults.lock().insert(shard, fault);
    }

    fn wrap(&self, shard: ShardId, inner: Box<dyn ShardReadView>) -> Box<dyn ShardReadView> {
        let live = self.live_views.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live_views.fetch_max(live, Ordering::SeqCst);
        Box::new(FaultyView {
            shard,
            inner,
            fault: self.faults.lock().get(&shard).copied(),
            matched: Arc::clone(&self.matched),
            used_after_close: Arc::clone(&self.used_after_close),
            live_views: Arc::clone(&self.live_views),
            closed: Mutex::new(false),
        })
    }
}

impl ShardMetadataStore for FaultyIndex {
    fn load_shard(&self, id: ShardId) -> Result<ShardMetadata> {
        self.index.load_shard(id)
    }
}

impl WriterRegistry for FaultyIndex {
    fn live_writer_for(&self, _id: ShardId) -> Option<Arc<dyn LiveWriter>> {
        None
    }
}

impl ShardOpener for FaultyIndex {
    fn open(&self, shard: &ShardMetadata) -> Result<Box<dyn ShardReadView>> {
        let view = self.index.open(shard)?;
        Ok(self.wrap(shard.id, view))
    }
}

struct FaultyView {
    shard: ShardId,
    inner: Box<dyn ShardReadView>,
    fault: Option<MatchFault>,
    matched: Arc<AtomicUsize>,
    used_after_close: Arc<AtomicUsize>,
    live_views: Arc<AtomicUsize>,
    closed: Mutex<bool>,
}

impl FaultyView {
    fn note_use(&self) {
        if *self.closed.lock() {
            self.used_after_close.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for FaultyView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyView").field("shard", &self.shard).finish()
    }
}

struct FaultyCollector<'a> {
    shard: ShardId,
    inner: &'a mut dyn DocCollector,
    fault: Option<MatchFault>,
    seen: usize,
    matched: &'a AtomicUsize,
}

impl DocCollector for FaultyCollector<'_> {
    fn set_doc_base(&mut self, doc_base: u32) {
        self.inner.set_doc_base(doc_base);
    }

    fn collect(&mut self, doc: u32) -> Result<()> {
        match self.fault {
            Some(MatchFault::ErrorAfter(n)) if self.seen == n => {
                return Err(ShardSearchError::matching(self.shard, "simulated match failure"));
            }
            Some(MatchFault::PanicAfter(n)) if self.seen == n => {
                panic!("simulated matcher crash on shard {}", self.shard);
            }
            _ => {}
        }
        self.inner.collect(doc)?;
        self.seen += 1;
        self.matched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ShardReadView for FaultyView {
    fn num_docs(&self) -> u64 {
        self.inner.num_docs()
    }

    fn search(&self, query: &QueryModel, collector: &mut dyn DocCollector) -> Result<()> {
        self.note_use();
        let mut collector = FaultyCollector {
            shard: self.shard,
            inner: collector,
            fault: self.fault,
            seen: 0,
            matched: &self.matched,
        };
        self.inner.search(query, &mut collector)
    }

    fn stored_fields(&self, doc: u32, field_names: &[String]) -> Result<Vec<Option<FieldValue>>> {
        self.note_use();
        self.inner.stored_fields(doc, field_names)
    }

    fn refresh(&self) -> Result<bool> {
        self.inner.refresh()
    }

    fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            self.live_views.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.close()
    }
}

/// Resolver that fails selected documents, can be slowed down, and can be
/// held shut until [`open_gate`](Self::open_gate) is called.
pub struct TestResolver {
    failing: AHashSet<(ShardId, u32)>,
    delay: Duration,
    gate: Mutex<bool>,
    opened: Condvar,
    pub resolved: AtomicUsize,
    pub entered: AtomicUsize,
}

impl TestResolver {
    pub fn new() -> Self {
        Self {
            failing: AHashSet::new(),
            delay: Duration::ZERO,
            gate: Mutex::new(true),
            opened: Condvar::new(),
            resolved: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, shard: ShardId, doc: u32) -> Self {
        self.failing.insert((shard, doc));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn gated(self) -> Self {
        *self.gate.lock() = false;
        self
    }

    pub fn open_gate(&self) {
        *self.gate.lock() = true;
        self.opened.notify_all();
    }
}

impl StoredFieldResolver for TestResolver {
    fn resolve_stored_fields(
        &self,
        handle: &SearcherHandle,
        doc: u32,
        field_names: &[String],
    ) -> Result<Vec<Option<FieldValue>>> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        {
            let mut open = self.gate.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.failing.contains(&(handle.shard_id(), doc)) {
            return Err(ShardSearchError::Io(format!(
                "stored field block for doc {doc} is unreadable"
            )));
        }

        let values = ViewFieldResolver.resolve_stored_fields(handle, doc, field_names)?;
        self.resolved.fetch_add(1, Ordering::SeqCst);
        Ok(values)
    }
}

/// Backend over a [`FaultyIndex`] with a custom resolver.
pub fn faulty_backend(
    faulty: &Arc<FaultyIndex>,
    compiler: SimpleExpressionCompiler,
    resolver: Arc<dyn StoredFieldResolver>,
) -> SearchBackend {
    SearchBackend {
        metadata: faulty.clone(),
        writers: faulty.clone(),
        opener: faulty.clone(),
        compiler: Arc::new(compiler),
        resolver,
        schema: Arc::new(schema()),
    }
}
