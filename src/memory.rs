//! In-memory shards.
//!
//! [`MemoryIndex`] plays every external role the engine needs: metadata
//! store, writer registry and shard opener. Documents are grouped in
//! immutable segments like an on-disk index, and an attached
//! [`MemoryWriter`] exposes uncommitted documents to near-real-time views.
//! [`SimpleExpressionCompiler`] compiles a small `field:value` query syntax.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, ShardSearchError};
use crate::query::{CompileContext, ExpressionCompiler, QueryModel, QueryNode};
use crate::result::FieldValue;
use crate::shard::{
    DocCollector, FormatVersion, LiveWriter, ShardId, ShardMetadata, ShardMetadataStore,
    ShardOpener, ShardReadView, ShardStatus, WriterId, WriterRegistry,
};

/// A document: a bag of named stored values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryDocument {
    fields: AHashMap<String, FieldValue>,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn with<S: Into<String>, V: Into<FieldValue>>(mut self, name: S, value: V) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

type Segment = Arc<[MemoryDocument]>;
type SegmentList = Arc<RwLock<Vec<Segment>>>;
type PendingDocs = Arc<Mutex<Vec<MemoryDocument>>>;

#[derive(Debug)]
struct ShardEntry {
    metadata: ShardMetadata,
    segments: SegmentList,
    writer: Option<Arc<MemoryWriter>>,
    open_failure: Option<String>,
}

#[derive(Debug, Default)]
struct IndexState {
    shards: RwLock<AHashMap<ShardId, ShardEntry>>,
    next_writer: AtomicU64,
    views_opened: AtomicUsize,
    open_views: Arc<AtomicUsize>,
}

impl IndexState {
    fn take_open_failure(&self, shard: ShardId) -> Option<String> {
        self.shards
            .write()
            .get_mut(&shard)
            .and_then(|entry| entry.open_failure.take())
    }

    fn open_view(
        &self,
        shard: ShardId,
        segments: SegmentList,
        pending: Option<PendingDocs>,
    ) -> Result<Box<dyn ShardReadView>> {
        if let Some(message) = self.take_open_failure(shard) {
            return Err(ShardSearchError::open(shard, message));
        }

        self.views_opened.fetch_add(1, Ordering::SeqCst);
        self.open_views.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReadView::new(
            shard,
            segments,
            pending,
            Arc::clone(&self.open_views),
        )))
    }
}

/// A set of in-memory shards.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Arc<IndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty open shard. Replaces any shard with the same id.
    pub fn create_shard(&self, id: ShardId, version: FormatVersion) {
        self.state.shards.write().insert(
            id,
            ShardEntry {
                metadata: ShardMetadata::new(id, version),
                segments: Arc::new(RwLock::new(Vec::new())),
                writer: None,
                open_failure: None,
            },
        );
    }

    /// Commit a segment of documents to a shard.
    pub fn add_segment(&self, id: ShardId, docs: Vec<MemoryDocument>) {
        let mut shards = self.state.shards.write();
        if let Some(entry) = shards.get_mut(&id) {
            entry.metadata.document_count += docs.len() as u64;
            entry.segments.write().push(docs.into());
        }
    }

    /// Change a shard's status.
    pub fn set_status(&self, id: ShardId, status: ShardStatus) {
        if let Some(entry) = self.state.shards.write().get_mut(&id) {
            entry.metadata.status = status;
        }
    }

    /// Overwrite the document count recorded in a shard's metadata.
    pub fn set_document_count(&self, id: ShardId, document_count: u64) {
        if let Some(entry) = self.state.shards.write().get_mut(&id) {
            entry.metadata.document_count = document_count;
        }
    }

    /// Make the next attempt to open a view on `id` fail.
    pub fn fail_next_open<S: Into<String>>(&self, id: ShardId, message: S) {
        if let Some(entry) = self.state.shards.write().get_mut(&id) {
            entry.open_failure = Some(message.into());
        }
    }

    /// Attach a new live writer to a shard, replacing any current one.
    pub fn attach_writer(&self, id: ShardId) -> Result<Arc<MemoryWriter>> {
        let mut shards = self.state.shards.write();
        let entry = shards
            .get_mut(&id)
            .ok_or_else(|| ShardSearchError::not_found(format!("shard {id}")))?;
        let writer = Arc::new(MemoryWriter {
            id: WriterId(self.state.next_writer.fetch_add(1, Ordering::SeqCst)),
            shard: id,
            segments: Arc::clone(&entry.segments),
            pending: Arc::new(Mutex::new(Vec::new())),
            state: Arc::downgrade(&self.state),
        });
        entry.writer = Some(Arc::clone(&writer));
        Ok(writer)
    }

    /// Detach the live writer of a shard.
    pub fn detach_writer(&self, id: ShardId) {
        if let Some(entry) = self.state.shards.write().get_mut(&id) {
            entry.writer = None;
        }
    }

    /// Number of views opened so far.
    pub fn views_opened(&self) -> usize {
        self.state.views_opened.load(Ordering::SeqCst)
    }

    /// Number of views opened and not yet closed.
    pub fn open_views(&self) -> usize {
        self.state.open_views.load(Ordering::SeqCst)
    }
}

impl ShardMetadataStore for MemoryIndex {
    fn load_shard(&self, id: ShardId) -> Result<ShardMetadata> {
        self.state
            .shards
            .read()
            .get(&id)
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| ShardSearchError::not_found(format!("shard {id}")))
    }
}

impl WriterRegistry for MemoryIndex {
    fn live_writer_for(&self, id: ShardId) -> Option<Arc<dyn LiveWriter>> {
        let shards = self.state.shards.read();
        let writer = shards.get(&id)?.writer.as_ref()?;
        Some(Arc::clone(writer) as Arc<dyn LiveWriter>)
    }
}

impl ShardOpener for MemoryIndex {
    fn open(&self, shard: &ShardMetadata) -> Result<Box<dyn ShardReadView>> {
        let segments = self
            .state
            .shards
            .read()
            .get(&shard.id)
            .map(|entry| Arc::clone(&entry.segments))
            .ok_or_else(|| ShardSearchError::open(shard.id, "shard data not found"))?;
        self.state.open_view(shard.id, segments, None)
    }
}

/// A live writer holding documents that are not yet committed.
#[derive(Debug)]
pub struct MemoryWriter {
    id: WriterId,
    shard: ShardId,
    segments: SegmentList,
    pending: PendingDocs,
    state: Weak<IndexState>,
}

impl MemoryWriter {
    pub fn id(&self) -> WriterId {
        self.id
    }

    /// Add a document. It is visible to views opened from this writer, and
    /// to existing ones after a refresh.
    pub fn add_document(&self, doc: MemoryDocument) {
        self.pending.lock().push(doc);
    }

    /// Number of uncommitted documents.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Move pending documents into a committed segment.
    pub fn commit(&self) {
        let docs: Vec<MemoryDocument> = std::mem::take(&mut *self.pending.lock());
        if docs.is_empty() {
            return;
        }

        let count = docs.len() as u64;
        self.segments.write().push(docs.into());
        if let Some(state) = self.state.upgrade()
            && let Some(entry) = state.shards.write().get_mut(&self.shard)
        {
            entry.metadata.document_count += count;
        }
    }
}

impl LiveWriter for MemoryWriter {
    fn id(&self) -> WriterId {
        self.id
    }

    fn open_view(&self) -> Result<Box<dyn ShardReadView>> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| ShardSearchError::open(self.shard, "index has been dropped"))?;
        state.open_view(
            self.shard,
            Arc::clone(&self.segments),
            Some(Arc::clone(&self.pending)),
        )
    }
}

/// A point-in-time view over a shard's segments.
#[derive(Debug)]
pub struct MemoryReadView {
    shard: ShardId,
    source: SegmentList,
    pending: Option<PendingDocs>,
    snapshot: RwLock<Vec<Segment>>,
    closed: AtomicBool,
    open_views: Arc<AtomicUsize>,
}

impl MemoryReadView {
    fn new(
        shard: ShardId,
        source: SegmentList,
        pending: Option<PendingDocs>,
        open_views: Arc<AtomicUsize>,
    ) -> Self {
        let snapshot = Self::take_snapshot(&source, pending.as_ref());
        Self {
            shard,
            source,
            pending,
            snapshot: RwLock::new(snapshot),
            closed: AtomicBool::new(false),
            open_views,
        }
    }

    fn take_snapshot(source: &SegmentList, pending: Option<&PendingDocs>) -> Vec<Segment> {
        let mut segments = source.read().clone();
        if let Some(pending) = pending {
            let docs = pending.lock();
            if !docs.is_empty() {
                segments.push(docs.as_slice().into());
            }
        }
        segments
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShardSearchError::internal(format!(
                "view on shard {} is closed",
                self.shard
            )));
        }
        Ok(())
    }

    /// Whether the view has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ShardReadView for MemoryReadView {
    fn num_docs(&self) -> u64 {
        self.snapshot.read().iter().map(|s| s.len() as u64).sum()
    }

    fn search(&self, query: &QueryModel, collector: &mut dyn DocCollector) -> Result<()> {
        self.ensure_open()?;
        let segments = self.snapshot.read().clone();

        let mut doc_base = 0u32;
        for segment in &segments {
            collector.set_doc_base(doc_base);
            for (doc, document) in segment.iter().enumerate() {
                if query.root.matches(&|name: &str| document.get(name)) {
                    collector.collect(doc as u32)?;
                }
            }
            doc_base += segment.len() as u32;
        }
        Ok(())
    }

    fn stored_fields(&self, doc: u32, field_names: &[String]) -> Result<Vec<Option<FieldValue>>> {
        self.ensure_open()?;
        let segments = self.snapshot.read();

        let mut local = doc as usize;
        for segment in segments.iter() {
            if local < segment.len() {
                let document = &segment[local];
                return Ok(field_names
                    .iter()
                    .map(|name| document.get(name).cloned())
                    .collect());
            }
            local -= segment.len();
        }

        Err(ShardSearchError::extraction(
            self.shard,
            doc,
            "document is not in this view",
        ))
    }

    fn refresh(&self) -> Result<bool> {
        self.ensure_open()?;
        let fresh = Self::take_snapshot(&self.source, self.pending.as_ref());
        let mut snapshot = self.snapshot.write();

        let docs = |segments: &[Segment]| segments.iter().map(|s| s.len()).sum::<usize>();
        let changed = fresh.len() != snapshot.len() || docs(&fresh) != docs(&snapshot);
        *snapshot = fresh;
        Ok(changed)
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_views.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Compiles a small query syntax.
///
/// ```text
/// *               every document
/// field:value     field's text form equals value
/// field:val*      field's text form starts with val
/// NOT clause
/// a AND b         also written as "a b"
/// a OR b          binds looser than AND
/// ```
///
/// Fields must be indexed fields of the schema.
#[derive(Debug, Clone, Default)]
pub struct SimpleExpressionCompiler {
    supported_versions: Option<Vec<FormatVersion>>,
}

impl SimpleExpressionCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to compile for any version not in `versions`.
    pub fn with_supported_versions(mut self, versions: Vec<FormatVersion>) -> Self {
        self.supported_versions = Some(versions);
        self
    }

    fn parse_or(
        &self,
        tokens: &[&str],
        pos: &mut usize,
        context: &CompileContext,
        version: FormatVersion,
    ) -> Result<QueryNode> {
        let mut clauses = vec![self.parse_and(tokens, pos, context, version)?];
        while tokens.get(*pos) == Some(&"OR") {
            *pos += 1;
            clauses.push(self.parse_and(tokens, pos, context, version)?);
        }
        Ok(collapse(clauses, QueryNode::Or))
    }

    fn parse_and(
        &self,
        tokens: &[&str],
        pos: &mut usize,
        context: &CompileContext,
        version: FormatVersion,
    ) -> Result<QueryNode> {
        let mut clauses = vec![self.parse_unary(tokens, pos, context, version)?];
        loop {
            match tokens.get(*pos) {
                None | Some(&"OR") => break,
                Some(&"AND") => *pos += 1,
                Some(_) => {}
            }
            clauses.push(self.parse_unary(tokens, pos, context, version)?);
        }
        Ok(collapse(clauses, QueryNode::And))
    }

    fn parse_unary(
        &self,
        tokens: &[&str],
        pos: &mut usize,
        context: &CompileContext,
        version: FormatVersion,
    ) -> Result<QueryNode> {
        let token = tokens.get(*pos).copied().ok_or_else(|| {
            ShardSearchError::query_build(version, "expression ends unexpectedly")
        })?;
        *pos += 1;

        match token {
            "NOT" => Ok(QueryNode::Not(Box::new(
                self.parse_unary(tokens, pos, context, version)?,
            ))),
            "*" => Ok(QueryNode::All),
            "AND" | "OR" => Err(ShardSearchError::query_build(
                version,
                format!("unexpected '{token}'"),
            )),
            _ => {
                let (field, value) = token.split_once(':').ok_or_else(|| {
                    ShardSearchError::query_build(version, format!("expected field:value, got '{token}'"))
                })?;
                if !context.schema.get(field).is_some_and(|f| f.indexed) {
                    return Err(ShardSearchError::query_build(
                        version,
                        format!("unknown field '{field}'"),
                    ));
                }

                Ok(match value.strip_suffix('*') {
                    Some(prefix) => QueryNode::Prefix {
                        field: field.to_string(),
                        prefix: prefix.to_string(),
                    },
                    None => QueryNode::Term {
                        field: field.to_string(),
                        value: value.to_string(),
                    },
                })
            }
        }
    }
}

fn collapse(mut clauses: Vec<QueryNode>, combine: fn(Vec<QueryNode>) -> QueryNode) -> QueryNode {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        combine(clauses)
    }
}

impl ExpressionCompiler for SimpleExpressionCompiler {
    fn compile(
        &self,
        expression: &str,
        context: &CompileContext,
        version: FormatVersion,
    ) -> Result<QueryModel> {
        if let Some(supported) = &self.supported_versions
            && !supported.contains(&version)
        {
            return Err(ShardSearchError::query_build(
                version,
                "format version is not supported",
            ));
        }

        let tokens: Vec<&str> = expression.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(ShardSearchError::query_build(version, "expression is empty"));
        }

        let mut pos = 0;
        let root = self.parse_or(&tokens, &mut pos, context, version)?;
        if pos != tokens.len() {
            return Err(ShardSearchError::query_build(
                version,
                format!("unexpected '{}'", tokens[pos]),
            ));
        }

        Ok(QueryModel {
            version,
            root,
            time_basis: context.time_basis,
        })
    }
}
