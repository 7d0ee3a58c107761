//! Cache of opened shard searchers.
//!
//! Opening a searcher is expensive (file handles, mapped segments), so opened
//! handles are kept warm in a small cache keyed by shard and writer identity.
//!
//! Entries leave the cache when they sit idle too long, when they have lived
//! too long, or when the cache is over capacity (least recently used first).
//! Leaving the cache does not close a handle that is still in use: the close
//! is deferred until the last lease on it is released. Closing always happens
//! on a dedicated executor so eviction never stalls a search.
//!
//! Locking is per entry. The key map is only locked long enough to find or
//! insert a slot; opening happens under the slot's own lock, so opening one
//! shard never waits on another.
//!
//! The capacity bounds open views, not just cache entries. A view counts
//! from the moment it is about to be opened until its close has finished,
//! so evicted views that are still leased or still closing keep their place.
//! When every place is taken, `acquire` evicts an idle entry if there is one
//! and otherwise waits for a lease to be released or a close to finish.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::cancel::CancellationToken;
use crate::config::ShardSearchConfig;
use crate::error::{Result, ShardSearchError};
use crate::shard::{
    ShardId, ShardMetadata, ShardMetadataStore, ShardOpener, ShardReadView, WriterId,
    WriterRegistry,
};

/// Cache key: a shard plus the identity of the writer its view was opened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub shard: ShardId,
    pub writer: Option<WriterId>,
}

/// An opened read view over one shard.
#[derive(Debug)]
pub struct SearcherHandle {
    key: CacheKey,
    metadata: ShardMetadata,
    view: Box<dyn ShardReadView>,
    in_use: AtomicUsize,
    evicted: AtomicBool,
    close_scheduled: AtomicBool,
    closed: AtomicBool,
    created: Instant,
    last_access: Mutex<Instant>,
}

impl SearcherHandle {
    fn new(key: CacheKey, metadata: ShardMetadata, view: Box<dyn ShardReadView>) -> Self {
        let now = Instant::now();
        Self {
            key,
            metadata,
            view,
            in_use: AtomicUsize::new(0),
            evicted: AtomicBool::new(false),
            close_scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created: now,
            last_access: Mutex::new(now),
        }
    }

    /// Key this handle is cached under.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Shard this handle reads.
    pub fn shard_id(&self) -> ShardId {
        self.key.shard
    }

    /// Shard metadata as loaded when the handle was opened.
    pub fn metadata(&self) -> &ShardMetadata {
        &self.metadata
    }

    /// The underlying read view.
    pub fn view(&self) -> &dyn ShardReadView {
        self.view.as_ref()
    }

    /// Whether the view was opened from a live writer.
    pub fn is_writer_backed(&self) -> bool {
        self.key.writer.is_some()
    }

    /// Number of outstanding leases.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Whether the handle has left the cache.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Whether the view has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn is_expired(&self, idle_timeout: Duration, live_timeout: Duration) -> bool {
        self.created.elapsed() >= live_timeout || self.last_access.lock().elapsed() >= idle_timeout
    }
}

/// What a slot holds once its open attempt has finished.
#[derive(Debug)]
enum CachedSearcher {
    Handle(Arc<SearcherHandle>),
    Failed(ShardSearchError),
}

#[derive(Debug)]
struct CacheSlot {
    key: CacheKey,
    state: Mutex<Option<CachedSearcher>>,
    detached: AtomicBool,
    last_used: AtomicU64,
}

impl CacheSlot {
    fn new(key: CacheKey, tick: u64) -> Self {
        Self {
            key,
            state: Mutex::new(None),
            detached: AtomicBool::new(false),
            last_used: AtomicU64::new(tick),
        }
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// Counters describing cache activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearcherCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub open_failures: u64,
    pub evictions: u64,
    pub closes: u64,
    pub outstanding_closes: usize,
    pub open_views: usize,
    pub size: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    open_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Number of views that are open, being opened, or waiting to be closed.
#[derive(Debug, Default)]
struct ViewBudget {
    open: Mutex<usize>,
    room: Condvar,
}

impl ViewBudget {
    /// Take a place if fewer than `limit` are taken.
    fn try_reserve(&self, limit: usize) -> bool {
        let mut open = self.open.lock();
        if *open < limit {
            *open += 1;
            true
        } else {
            false
        }
    }

    fn is_full(&self, limit: usize) -> bool {
        *self.open.lock() >= limit
    }

    /// Give a place back once its view is closed or was never opened.
    fn release(&self) {
        let mut open = self.open.lock();
        *open = open.saturating_sub(1);
        self.room.notify_all();
    }

    /// Wake waiters without changing the count, e.g. when a handle goes idle.
    fn notify(&self) {
        let _open = self.open.lock();
        self.room.notify_all();
    }

    /// Wait up to `timeout` for a place to free up.
    fn wait(&self, limit: usize, timeout: Duration) {
        let mut open = self.open.lock();
        if *open >= limit {
            self.room.wait_for(&mut open, timeout);
        }
    }

    fn count(&self) -> usize {
        *self.open.lock()
    }
}

/// Single-purpose executor that closes evicted views.
struct CloseExecutor {
    pool: ThreadPool,
    outstanding: Mutex<usize>,
    drained: Condvar,
    closes: AtomicU64,
    budget: ViewBudget,
}

impl CloseExecutor {
    fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("searcher-close-{i}"))
            .build()
            .map_err(|e| {
                ShardSearchError::internal(format!("Failed to create close executor: {e}"))
            })?;

        Ok(Self {
            pool,
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            closes: AtomicU64::new(0),
            budget: ViewBudget::default(),
        })
    }

    fn schedule(self: &Arc<Self>, handle: Arc<SearcherHandle>) {
        if handle
            .close_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        *self.outstanding.lock() += 1;
        let executor = Arc::clone(self);
        self.pool.spawn(move || {
            if let Err(e) = handle.view.close() {
                error!(shard = %handle.shard_id(), error = %e, "failed to close searcher");
            }
            handle.closed.store(true, Ordering::SeqCst);
            executor.closes.fetch_add(1, Ordering::Relaxed);
            debug!(shard = %handle.shard_id(), writer = ?handle.key.writer, "closed searcher");

            // The place is free before the close stops counting as outstanding.
            executor.budget.release();

            let mut outstanding = executor.outstanding.lock();
            *outstanding -= 1;
            if *outstanding == 0 {
                executor.drained.notify_all();
            }
        });
    }

    fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.drained.wait(&mut outstanding);
        }
    }
}

struct CacheInner {
    metadata: Arc<dyn ShardMetadataStore>,
    writers: Arc<dyn WriterRegistry>,
    opener: Arc<dyn ShardOpener>,
    max_open_shards: AtomicUsize,
    idle_timeout: Duration,
    live_timeout: Duration,
    poll_interval: Duration,
    slots: Mutex<AHashMap<CacheKey, Arc<CacheSlot>>>,
    tick: AtomicU64,
    closer: Arc<CloseExecutor>,
    counters: CacheCounters,
}

/// Bounded cache of [`SearcherHandle`]s shared by every search in the process.
///
/// Cloning the cache yields another handle onto the same entries.
#[derive(Clone)]
pub struct SearcherCache {
    inner: Arc<CacheInner>,
}

/// A leased searcher. Dropping the lease releases it.
#[derive(Debug)]
pub struct SearcherLease {
    handle: Arc<SearcherHandle>,
    closer: Arc<CloseExecutor>,
}

impl std::fmt::Debug for CloseExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseExecutor")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl SearcherLease {
    /// A shared reference to the leased handle.
    ///
    /// The handle stays open while this lease is alive.
    pub fn handle(&self) -> &Arc<SearcherHandle> {
        &self.handle
    }
}

impl Deref for SearcherLease {
    type Target = SearcherHandle;

    fn deref(&self) -> &SearcherHandle {
        &self.handle
    }
}

impl Drop for SearcherLease {
    fn drop(&mut self) {
        let handle = &self.handle;
        handle.touch();
        let previous = handle.in_use.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            if handle.is_evicted() {
                self.closer.schedule(Arc::clone(handle));
            } else {
                // An idle handle can be evicted to make room.
                self.closer.budget.notify();
            }
        }
    }
}

impl SearcherCache {
    /// Create a cache over the given collaborators.
    pub fn new(
        config: &ShardSearchConfig,
        metadata: Arc<dyn ShardMetadataStore>,
        writers: Arc<dyn WriterRegistry>,
        opener: Arc<dyn ShardOpener>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(CacheInner {
                metadata,
                writers,
                opener,
                max_open_shards: AtomicUsize::new(config.max_open_shards.max(1)),
                idle_timeout: config.searcher_idle_timeout,
                live_timeout: config.searcher_live_timeout,
                poll_interval: config.poll_interval,
                slots: Mutex::new(AHashMap::new()),
                tick: AtomicU64::new(0),
                closer: Arc::new(CloseExecutor::new(config.close_threads)?),
                counters: CacheCounters::default(),
            }),
        })
    }

    /// Lease a searcher for `shard`, opening one if nothing valid is cached.
    ///
    /// Prefers a view backed by the shard's live writer so uncommitted
    /// documents are visible. Waits for as long as it takes when every place
    /// in the cache is leased; see [`acquire_cancellable`](Self::acquire_cancellable).
    pub fn acquire(&self, shard: ShardId) -> Result<SearcherLease> {
        self.acquire_cancellable(shard, &CancellationToken::new())
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`ShardSearchError::Terminated`] once `cancel` is set while waiting
    /// for room to open a view.
    pub fn acquire_cancellable(
        &self,
        shard: ShardId,
        cancel: &CancellationToken,
    ) -> Result<SearcherLease> {
        let metadata = self
            .inner
            .metadata
            .load_shard(shard)
            .map_err(|e| ShardSearchError::open(shard, e.to_string()))?;
        if !metadata.status.is_searchable() {
            return Err(ShardSearchError::open(
                shard,
                format!("shard status is {:?}", metadata.status),
            ));
        }

        let writer = self.inner.writers.live_writer_for(shard);
        let key = CacheKey {
            shard,
            writer: writer.as_ref().map(|w| w.id()),
        };
        self.evict_stale_writers(key);
        self.evict_expired();

        loop {
            let slot = self.slot_for(key);
            let mut state = slot.state.lock();
            if let Some(CachedSearcher::Failed(error)) = state.as_ref() {
                // Waiters on a failed open share its outcome.
                return Err(error.clone());
            }
            if slot.is_detached() {
                continue;
            }

            match state.as_ref() {
                Some(CachedSearcher::Handle(handle)) => {
                    if handle.is_evicted() {
                        drop(state);
                        self.remove_slot(&slot);
                        continue;
                    }
                    if handle.is_expired(self.inner.idle_timeout, self.inner.live_timeout) {
                        let handle = Arc::clone(handle);
                        drop(state);
                        self.remove_slot(&slot);
                        self.retire(&slot, Some(handle));
                        continue;
                    }

                    handle.in_use.fetch_add(1, Ordering::SeqCst);
                    handle.touch();
                    slot.last_used
                        .store(self.inner.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.lease(Arc::clone(handle)));
                }
                Some(CachedSearcher::Failed(_)) | None => {}
            }

            // Wait for room without holding the slot, then check nobody else
            // filled or dropped it meanwhile.
            drop(state);
            match self.reserve_view(&slot, cancel) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    let state = slot.state.lock();
                    if state.is_none() {
                        self.remove_slot(&slot);
                    }
                    drop(state);
                    return Err(error);
                }
            }
            let mut state = slot.state.lock();
            if slot.is_detached() || state.is_some() {
                self.inner.closer.budget.release();
                continue;
            }

            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            let opened = match &writer {
                Some(writer) => writer.open_view(),
                None => self.inner.opener.open(&metadata),
            }
            .map_err(|e| match e {
                e @ (ShardSearchError::Open { .. } | ShardSearchError::Inconsistent { .. }) => e,
                other => ShardSearchError::open(shard, other.to_string()),
            })
            .and_then(|view| Self::check_doc_count(&metadata, view));

            match opened {
                Ok(view) => {
                    let handle = Arc::new(SearcherHandle::new(key, metadata, view));
                    handle.in_use.store(1, Ordering::SeqCst);
                    debug!(
                        shard = %shard,
                        writer = ?key.writer,
                        docs = handle.view().num_docs(),
                        "opened searcher"
                    );
                    *state = Some(CachedSearcher::Handle(Arc::clone(&handle)));
                    return Ok(self.lease(handle));
                }
                Err(error) => {
                    self.inner.closer.budget.release();
                    self.inner
                        .counters
                        .open_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(shard = %shard, error = %error, "failed to open searcher");
                    *state = Some(CachedSearcher::Failed(error.clone()));
                    slot.detached.store(true, Ordering::SeqCst);
                    drop(state);
                    self.remove_slot(&slot);
                    return Err(error);
                }
            }
        }
    }

    /// Release a lease. Equivalent to dropping it.
    pub fn release(&self, lease: SearcherLease) {
        drop(lease);
    }

    /// Ask every cached searcher to pick up newly committed data.
    ///
    /// Expired entries are evicted first. Returns the number of searchers
    /// whose view changed.
    pub fn refresh(&self) -> usize {
        self.evict_expired();

        let mut refreshed = 0;
        for handle in self.cached_handles() {
            match handle.view().refresh() {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(e) => warn!(shard = %handle.shard_id(), error = %e, "failed to refresh searcher"),
            }
        }
        refreshed
    }

    /// Evict every entry. Handles still in use close when released.
    pub fn invalidate_all(&self) {
        let slots: Vec<_> = self.inner.slots.lock().drain().map(|(_, s)| s).collect();
        for slot in &slots {
            slot.detached.store(true, Ordering::SeqCst);
        }
        for slot in slots {
            self.retire(&slot, None);
        }
    }

    /// Evict every entry and wait for every scheduled close to finish.
    pub fn clear(&self) {
        self.invalidate_all();
        self.inner.closer.wait_idle();
    }

    /// Evict entries that exceeded their idle or live time.
    pub fn evict_expired(&self) {
        let expired: Vec<Arc<CacheSlot>> = {
            let mut slots = self.inner.slots.lock();
            let keys: Vec<CacheKey> = slots
                .iter()
                .filter(|(_, slot)| {
                    slot.state.try_lock().is_some_and(|state| match state.as_ref() {
                        Some(CachedSearcher::Handle(h)) => {
                            h.is_expired(self.inner.idle_timeout, self.inner.live_timeout)
                        }
                        _ => false,
                    })
                })
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|k| slots.remove(k)).collect()
        };

        for slot in expired {
            slot.detached.store(true, Ordering::SeqCst);
            debug!(shard = %slot.key.shard, "searcher expired");
            self.retire(&slot, None);
        }
    }

    /// Change the capacity. Shrinking evicts least recently used entries.
    pub fn set_max_open_shards(&self, max_open_shards: usize) {
        let max_open_shards = max_open_shards.max(1);
        if self.inner.max_open_shards.swap(max_open_shards, Ordering::SeqCst) == max_open_shards {
            return;
        }

        let victims = {
            let mut slots = self.inner.slots.lock();
            let mut victims = Vec::new();
            while slots.len() > max_open_shards {
                match Self::take_lru(&mut slots) {
                    Some(slot) => victims.push(slot),
                    None => break,
                }
            }
            victims
        };
        for slot in victims {
            self.retire(&slot, None);
        }
        self.inner.closer.budget.notify();
    }

    /// Current capacity.
    pub fn max_open_shards(&self) -> usize {
        self.inner.max_open_shards.load(Ordering::SeqCst)
    }

    /// Number of cached entries and the capacity.
    pub fn size_and_capacity(&self) -> (usize, usize) {
        (self.inner.slots.lock().len(), self.max_open_shards())
    }

    /// Number of views open, being opened, or waiting to be closed.
    pub fn open_views(&self) -> usize {
        self.inner.closer.budget.count()
    }

    /// Number of closes scheduled but not yet finished.
    pub fn outstanding_closes(&self) -> usize {
        self.inner.closer.outstanding()
    }

    /// Snapshot of cache counters.
    pub fn stats(&self) -> SearcherCacheStats {
        let (size, capacity) = self.size_and_capacity();
        let counters = &self.inner.counters;
        SearcherCacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            open_failures: counters.open_failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            closes: self.inner.closer.closes.load(Ordering::Relaxed),
            outstanding_closes: self.outstanding_closes(),
            open_views: self.open_views(),
            size,
            capacity,
        }
    }

    /// Handles currently in the cache.
    pub fn cached_handles(&self) -> Vec<Arc<SearcherHandle>> {
        let slots: Vec<_> = self.inner.slots.lock().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| match slot.state.lock().as_ref() {
                Some(CachedSearcher::Handle(h)) => Some(Arc::clone(h)),
                _ => None,
            })
            .collect()
    }

    fn lease(&self, handle: Arc<SearcherHandle>) -> SearcherLease {
        SearcherLease {
            handle,
            closer: Arc::clone(&self.inner.closer),
        }
    }

    /// Take a place for a new view, evicting an idle entry or waiting if
    /// every place is taken.
    ///
    /// Returns `false` without a place once another thread has filled or
    /// dropped `slot` meanwhile.
    fn reserve_view(&self, slot: &CacheSlot, cancel: &CancellationToken) -> Result<bool> {
        let budget = &self.inner.closer.budget;
        loop {
            let limit = self.max_open_shards();
            if budget.try_reserve(limit) {
                return Ok(true);
            }
            cancel.check()?;
            if slot.is_detached() || slot.state.try_lock().is_some_and(|state| state.is_some()) {
                return Ok(false);
            }

            // A close in flight frees a place soon; only evict when none is.
            if self.inner.closer.outstanding() == 0
                && budget.is_full(limit)
                && let Some(victim) = self.take_idle()
            {
                debug!(shard = %victim.key.shard, "evicting idle searcher to make room");
                self.retire(&victim, None);
                continue;
            }

            budget.wait(limit, self.inner.poll_interval);
        }
    }

    /// Remove the least recently used entry whose handle nobody leases.
    fn take_idle(&self) -> Option<Arc<CacheSlot>> {
        let mut slots = self.inner.slots.lock();
        let key = slots
            .values()
            .filter(|slot| {
                slot.state.try_lock().is_some_and(|state| {
                    matches!(state.as_ref(), Some(CachedSearcher::Handle(h)) if h.in_use() == 0)
                })
            })
            .min_by_key(|slot| slot.last_used.load(Ordering::Relaxed))
            .map(|slot| slot.key)?;
        let slot = slots.remove(&key)?;
        slot.detached.store(true, Ordering::SeqCst);
        Some(slot)
    }

    fn check_doc_count(
        metadata: &ShardMetadata,
        view: Box<dyn ShardReadView>,
    ) -> Result<Box<dyn ShardReadView>> {
        let visible = view.num_docs();
        if visible == metadata.document_count {
            return Ok(view);
        }

        let message = format!(
            "view has {visible} documents but metadata records {}",
            metadata.document_count
        );
        if metadata.status.is_terminal() {
            if let Err(e) = view.close() {
                warn!(shard = %metadata.id, error = %e, "failed to close inconsistent view");
            }
            return Err(ShardSearchError::inconsistent(metadata.id, message));
        }

        warn!(shard = %metadata.id, status = ?metadata.status, "{message}");
        Ok(view)
    }

    /// Find or create the slot for `key`, making room if the cache is full.
    fn slot_for(&self, key: CacheKey) -> Arc<CacheSlot> {
        let (slot, victims) = {
            let mut slots = self.inner.slots.lock();
            if let Some(slot) = slots.get(&key) {
                return Arc::clone(slot);
            }

            let capacity = self.max_open_shards();
            let mut victims = Vec::new();
            while slots.len() >= capacity {
                match Self::take_lru(&mut slots) {
                    Some(victim) => victims.push(victim),
                    None => break,
                }
            }

            let tick = self.inner.tick.fetch_add(1, Ordering::Relaxed);
            let slot = Arc::new(CacheSlot::new(key, tick));
            slots.insert(key, Arc::clone(&slot));
            (slot, victims)
        };

        for victim in victims {
            self.retire(&victim, None);
        }
        slot
    }

    /// Remove the least recently used slot, preferring ones not in use.
    fn take_lru(slots: &mut AHashMap<CacheKey, Arc<CacheSlot>>) -> Option<Arc<CacheSlot>> {
        // Rank: idle handles first, then busy ones, then slots being opened.
        let rank = |slot: &CacheSlot| match slot.state.try_lock() {
            Some(state) => match state.as_ref() {
                Some(CachedSearcher::Handle(h)) if h.in_use() == 0 => 0,
                Some(_) => 1,
                None => 2,
            },
            None => 2,
        };

        let key = slots
            .values()
            .min_by_key(|slot| (rank(slot), slot.last_used.load(Ordering::Relaxed)))
            .map(|slot| slot.key)?;
        let slot = slots.remove(&key)?;
        slot.detached.store(true, Ordering::SeqCst);
        Some(slot)
    }

    fn remove_slot(&self, slot: &Arc<CacheSlot>) {
        let mut slots = self.inner.slots.lock();
        if slots.get(&slot.key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&slot.key);
        }
        slot.detached.store(true, Ordering::SeqCst);
    }

    /// Evict entries of `key.shard` that were opened from a different writer.
    fn evict_stale_writers(&self, key: CacheKey) {
        let stale: Vec<Arc<CacheSlot>> = {
            let mut slots = self.inner.slots.lock();
            let keys: Vec<CacheKey> = slots
                .keys()
                .filter(|k| k.shard == key.shard && k.writer != key.writer)
                .copied()
                .collect();
            keys.iter().filter_map(|k| slots.remove(k)).collect()
        };

        for slot in stale {
            slot.detached.store(true, Ordering::SeqCst);
            debug!(shard = %key.shard, old_writer = ?slot.key.writer, "evicting searcher for replaced writer");
            self.retire(&slot, None);
        }
    }

    /// Mark a detached slot's handle evicted and close it if nobody uses it.
    fn retire(&self, slot: &CacheSlot, known: Option<Arc<SearcherHandle>>) {
        let handle = match known {
            Some(handle) => Some(handle),
            None => match slot.state.lock().as_ref() {
                Some(CachedSearcher::Handle(h)) => Some(Arc::clone(h)),
                _ => None,
            },
        };

        let Some(handle) = handle else {
            return;
        };
        if handle.evicted.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
        if handle.in_use() == 0 {
            self.inner.closer.schedule(handle);
        } else {
            debug!(
                shard = %handle.shard_id(),
                in_use = handle.in_use(),
                "searcher evicted while in use, deferring close"
            );
        }
    }
}

impl std::fmt::Debug for SearcherCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (size, capacity) = self.size_and_capacity();
        f.debug_struct("SearcherCache")
            .field("size", &size)
            .field("capacity", &capacity)
            .finish()
    }
}
