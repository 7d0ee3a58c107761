//! Fans one search out across its shards.
//!
//! Every search gets its own [`ShardSearchScheduler`], but all schedulers run
//! their shard tasks on one process-wide [`SearchWorkerPool`]. The pool bounds
//! the total number of threads, and each scheduler bounds how many of its own
//! shards are in flight, so many concurrent searches queue up instead of
//! oversubscribing the machine.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ShardSearchConfig;
use crate::error::{Result, ShardSearchError};
use crate::progress::ProgressTracker;
use crate::query::ShardQueryFactory;
use crate::shard::ShardId;
use crate::task::{PerShardSearchTask, SearchTask, ShardTaskOutcome, TaskContext};

/// Thread pools shared by every search in the process.
///
/// Shard tasks run on the shard pool. Each shard task hands its matching to
/// the match pool and drains the results itself, so a matcher blocked on a
/// full queue always has a running consumer.
#[derive(Clone)]
pub struct SearchWorkerPool {
    shard_pool: Arc<ThreadPool>,
    match_pool: Arc<ThreadPool>,
    shard_threads: usize,
    match_threads: usize,
}

impl SearchWorkerPool {
    /// Build the pools with the sizes from `config`.
    pub fn new(config: &ShardSearchConfig) -> Result<Self> {
        let shard_threads = config.max_threads.max(1);
        let match_threads = config.max_match_threads.max(1);

        let shard_pool = ThreadPoolBuilder::new()
            .num_threads(shard_threads)
            .thread_name(|i| format!("shard-search-{i}"))
            .build()
            .map_err(|e| ShardSearchError::internal(format!("Failed to create thread pool: {e}")))?;
        let match_pool = ThreadPoolBuilder::new()
            .num_threads(match_threads)
            .thread_name(|i| format!("shard-match-{i}"))
            .build()
            .map_err(|e| ShardSearchError::internal(format!("Failed to create thread pool: {e}")))?;

        Ok(Self {
            shard_pool: Arc::new(shard_pool),
            match_pool: Arc::new(match_pool),
            shard_threads,
            match_threads,
        })
    }

    /// Size of the shard task pool.
    pub fn shard_threads(&self) -> usize {
        self.shard_threads
    }

    /// Size of the matcher pool.
    pub fn match_threads(&self) -> usize {
        self.match_threads
    }

    /// The matcher pool, for building a [`TaskContext`].
    pub fn match_pool(&self) -> Arc<ThreadPool> {
        Arc::clone(&self.match_pool)
    }
}

impl std::fmt::Debug for SearchWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchWorkerPool")
            .field("shard_threads", &self.shard_threads)
            .field("match_threads", &self.match_threads)
            .finish()
    }
}

#[derive(Default)]
struct PendingShards {
    shards: VecDeque<ShardId>,
    query_factory: Option<Arc<ShardQueryFactory>>,
    stored_fields: Option<Arc<[String]>>,
    next_number: usize,
    scheduled: bool,
}

struct SchedulerInner {
    search_id: Uuid,
    pool: SearchWorkerPool,
    context: Arc<TaskContext>,
    pending: Mutex<PendingShards>,
    in_flight: Mutex<usize>,
    idle: Condvar,
    outcomes: Mutex<Vec<ShardTaskOutcome>>,
    started: Instant,
}

/// Runs the shard tasks of one search.
#[derive(Clone)]
pub struct ShardSearchScheduler {
    inner: Arc<SchedulerInner>,
}

impl ShardSearchScheduler {
    /// Create a scheduler for the search that owns `context`.
    pub fn new(search_id: Uuid, pool: SearchWorkerPool, context: Arc<TaskContext>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                search_id,
                pool,
                context,
                pending: Mutex::new(PendingShards::default()),
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
                outcomes: Mutex::new(Vec::new()),
                started: Instant::now(),
            }),
        }
    }

    /// Queue every shard and start up to `max_concurrent` of them.
    ///
    /// `shard_ids` must match the shard count of the search's tracker. An
    /// empty list signals completion straight away.
    pub fn schedule(
        &self,
        shard_ids: Vec<ShardId>,
        query_factory: Arc<ShardQueryFactory>,
        stored_fields: Arc<[String]>,
        max_concurrent: usize,
    ) -> Result<()> {
        let inner = &self.inner;
        let tracker = &inner.context.tracker;
        if shard_ids.len() != tracker.shard_count() {
            return Err(ShardSearchError::invalid_argument(format!(
                "expected {} shards, got {}",
                tracker.shard_count(),
                shard_ids.len()
            )));
        }

        {
            let mut pending = inner.pending.lock();
            if pending.scheduled {
                return Err(ShardSearchError::invalid_argument(
                    "search has already been scheduled",
                ));
            }
            pending.scheduled = true;
            pending.shards = shard_ids.into();
            pending.query_factory = Some(query_factory);
            pending.stored_fields = Some(stored_fields);
        }

        let max_concurrent = max_concurrent.max(1).min(tracker.shard_count());
        debug!(
            search_id = %inner.search_id,
            shards = tracker.shard_count(),
            max_concurrent,
            "scheduling search"
        );

        for _ in 0..max_concurrent {
            if !SchedulerInner::spawn_next(inner) {
                break;
            }
        }

        inner.check_completion();
        Ok(())
    }

    /// Id of the search.
    pub fn search_id(&self) -> Uuid {
        self.inner.search_id
    }

    /// Progress of the search.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.inner.context.tracker
    }

    /// True once cancelled or once every shard has completed.
    pub fn is_complete(&self) -> bool {
        self.inner.context.tracker.is_complete()
    }

    /// Number of shard tasks currently running.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.lock()
    }

    /// Outcomes of the shard tasks that have finished.
    pub fn outcomes(&self) -> Vec<ShardTaskOutcome> {
        self.inner.outcomes.lock().clone()
    }

    /// Cancel the search. Never blocks; running tasks wind down on their own.
    ///
    /// Has no effect once every shard has finished or completion has been
    /// signalled.
    pub fn cancel(&self) {
        let tracker = &self.inner.context.tracker;
        if tracker.cancel() {
            info!(
                search_id = %self.inner.search_id,
                completed = tracker.completed_shards(),
                shards = tracker.shard_count(),
                "search cancelled"
            );
        }
        self.inner.check_completion();
    }

    /// Wait until no shard task is running, or until `timeout` passes.
    ///
    /// Returns `true` if nothing is running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.inner.in_flight.lock();
        while *in_flight > 0 {
            if self
                .inner
                .idle
                .wait_until(&mut in_flight, deadline)
                .timed_out()
            {
                break;
            }
        }
        *in_flight == 0
    }
}

impl SchedulerInner {
    /// Take the next queued shard, unless the search is already complete.
    fn get_next(&self) -> Option<SearchTask> {
        if self.context.tracker.is_complete() {
            return None;
        }

        let mut pending = self.pending.lock();
        let shard = pending.shards.pop_front()?;
        pending.next_number += 1;

        Some(SearchTask {
            task_id: self.search_id,
            shard,
            query_factory: Arc::clone(pending.query_factory.as_ref()?),
            stored_fields: Arc::clone(pending.stored_fields.as_ref()?),
            shard_number: pending.next_number,
            shard_total: self.context.tracker.shard_count(),
        })
    }

    /// Start the next queued shard in a new slot. Returns `false` if none was left.
    fn spawn_next(inner: &Arc<Self>) -> bool {
        let Some(task) = inner.get_next() else {
            return false;
        };

        *inner.in_flight.lock() += 1;
        Self::spawn_task(inner, task);
        true
    }

    fn spawn_task(inner: &Arc<Self>, task: SearchTask) {
        let scheduler = Arc::clone(inner);
        inner.pool.shard_pool.spawn(move || {
            let shard = task.shard;
            let context = Arc::clone(&scheduler.context);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                PerShardSearchTask::new(task, context).run()
            }));

            match outcome {
                Ok(outcome) => scheduler.outcomes.lock().push(outcome),
                Err(_) => {
                    error!(search_id = %scheduler.search_id, shard = %shard, "shard task panicked");
                    scheduler
                        .context
                        .errors
                        .record(ShardSearchError::internal(format!(
                            "shard task for shard {shard} panicked"
                        )));
                }
            }

            scheduler.on_task_finished();
        });
    }

    fn on_task_finished(self: Arc<Self>) {
        self.check_completion();

        // The finished task's slot passes straight to the next queued shard.
        if let Some(task) = self.get_next() {
            Self::spawn_task(&self, task);
            return;
        }

        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Signal the result sink once the search is complete. Only the first
    /// caller after completion does anything.
    fn check_completion(&self) {
        let tracker = &self.context.tracker;
        if !tracker.try_signal_completion() {
            return;
        }

        let errors = self.context.errors.snapshot();
        let hits = tracker.hit_count();
        info!(
            search_id = %self.search_id,
            hits,
            errors = errors.len(),
            completed = tracker.completed_shards(),
            shards = tracker.shard_count(),
            cancelled = tracker.is_cancelled(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "search complete"
        );

        if errors.is_empty() {
            self.context.sink.on_complete(hits);
        } else {
            self.context.sink.on_error(errors);
        }
    }
}
