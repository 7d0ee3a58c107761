//! The unit of work for one shard of a search.
//!
//! A shard task acquires a searcher, compiles (or reuses) the query for the
//! shard's format version, then runs matching and extraction at the same time:
//! matching runs on the matcher pool and pushes ids into a bounded
//! [`DocIdHandoffQueue`], while the task's own thread drains the queue, reads
//! stored fields and forwards rows to the result sink.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use rayon::ThreadPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorSink, Result, ShardSearchError};
use crate::handoff::{DocIdHandoffQueue, DocIdToken};
use crate::progress::ProgressTracker;
use crate::query::{QueryModel, ShardQueryFactory};
use crate::result::{ResultRow, ResultSink, StoredFieldResolver};
use crate::searcher::{SearcherCache, SearcherHandle, SearcherLease};
use crate::shard::{DocCollector, ShardId};

/// Work description for one shard of one search.
#[derive(Debug, Clone)]
pub struct SearchTask {
    /// Id of the search this task belongs to.
    pub task_id: Uuid,

    /// Shard to search.
    pub shard: ShardId,

    /// Per-search query factory, shared by every task of the search.
    pub query_factory: Arc<ShardQueryFactory>,

    /// Stored fields to extract, in output order.
    pub stored_fields: Arc<[String]>,

    /// 1-based position of this shard in the search.
    pub shard_number: usize,

    /// Number of shards in the search.
    pub shard_total: usize,
}

/// Lifecycle of a shard task. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardTaskState {
    Pending,
    HandleAcquired,
    Matching,
    Draining,
    Done,
    Error,
}

impl ShardTaskState {
    /// Whether the task has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, ShardTaskState::Done | ShardTaskState::Error)
    }
}

/// Everything a shard task needs besides its [`SearchTask`].
///
/// One context is shared by all tasks of a search.
#[derive(Clone)]
pub struct TaskContext {
    pub cache: SearcherCache,
    pub resolver: Arc<dyn StoredFieldResolver>,
    pub sink: Arc<dyn ResultSink>,
    pub tracker: Arc<ProgressTracker>,
    pub errors: ErrorSink,
    pub match_pool: Arc<ThreadPool>,
    pub handoff_capacity: usize,
    pub poll_interval: Duration,
}

/// What a finished shard task reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardTaskOutcome {
    pub shard: ShardId,
    pub state: ShardTaskState,
    pub hits: u64,
    pub rows: u64,
    pub execution_time: Duration,
}

/// Counts the shard complete when dropped, whichever path the task took.
struct CompletionGuard<'a> {
    tracker: &'a ProgressTracker,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.tracker.complete_shard();
    }
}

/// Collector that feeds matched ids into the hand-off queue.
struct HandoffCollector<'a> {
    queue: &'a DocIdHandoffQueue,
    tracker: &'a ProgressTracker,
    doc_base: u32,
    hits: u64,
}

impl DocCollector for HandoffCollector<'_> {
    fn set_doc_base(&mut self, doc_base: u32) {
        self.doc_base = doc_base;
    }

    fn collect(&mut self, doc: u32) -> Result<()> {
        let cancel = self.tracker.cancellation();
        cancel.check()?;

        let blocked = self.queue.push(DocIdToken::Doc(self.doc_base + doc), cancel)?;
        if !blocked.is_zero() {
            self.tracker.record_pause(blocked);
        }
        self.tracker.add_hits(1);
        self.hits += 1;
        Ok(())
    }
}

/// Runs one [`SearchTask`] to a terminal state.
pub struct PerShardSearchTask {
    task: SearchTask,
    context: Arc<TaskContext>,
    state: ShardTaskState,
    hits: u64,
    rows: u64,
}

impl PerShardSearchTask {
    pub fn new(task: SearchTask, context: Arc<TaskContext>) -> Self {
        Self {
            task,
            context,
            state: ShardTaskState::Pending,
            hits: 0,
            rows: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ShardTaskState {
        self.state
    }

    /// The task being run.
    pub fn task(&self) -> &SearchTask {
        &self.task
    }

    /// Run the task. The shard is counted complete exactly once on return.
    pub fn run(mut self) -> ShardTaskOutcome {
        let started = Instant::now();
        let context = Arc::clone(&self.context);
        let _completion = CompletionGuard {
            tracker: &context.tracker,
        };

        debug!(
            task_id = %self.task.task_id,
            shard = %self.task.shard,
            "searching shard {}/{}",
            self.task.shard_number,
            self.task.shard_total
        );

        if context.tracker.is_cancelled() {
            self.state = ShardTaskState::Done;
        } else {
            match context
                .cache
                .acquire_cancellable(self.task.shard, context.tracker.cancellation())
            {
                Ok(lease) => {
                    self.state = ShardTaskState::HandleAcquired;
                    self.search(&lease);
                }
                Err(ShardSearchError::Terminated) => self.state = ShardTaskState::Done,
                Err(error) => self.fail(error),
            }
        }

        debug!(
            task_id = %self.task.task_id,
            shard = %self.task.shard,
            state = ?self.state,
            hits = self.hits,
            rows = self.rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "shard finished"
        );

        ShardTaskOutcome {
            shard: self.task.shard,
            state: self.state,
            hits: self.hits,
            rows: self.rows,
            execution_time: started.elapsed(),
        }
    }

    fn fail(&mut self, error: ShardSearchError) {
        warn!(task_id = %self.task.task_id, shard = %self.task.shard, %error, "shard failed");
        self.context.errors.record(error);
        self.state = ShardTaskState::Error;
    }

    fn search(&mut self, lease: &SearcherLease) {
        let version = lease.metadata().format_version;
        let Some(query) = self.task.query_factory.get_query(version) else {
            // Build failure is already recorded; the shard contributes nothing.
            self.state = ShardTaskState::Done;
            return;
        };

        self.state = ShardTaskState::Matching;
        let queue = Arc::new(DocIdHandoffQueue::new(
            self.context.handoff_capacity,
            self.context.poll_interval,
        ));
        let matcher = self.spawn_matcher(Arc::clone(lease.handle()), query, Arc::clone(&queue));

        self.state = ShardTaskState::Draining;
        let mut outcome = self.drain(lease.handle(), &queue, &matcher);

        // The lease must outlive the matcher, which reads through it.
        if outcome.is_none() {
            outcome = Some(matcher.recv().unwrap_or_else(|_| {
                Err(ShardSearchError::internal("matcher exited without reporting"))
            }));
        }

        match outcome {
            Some(Ok(hits)) => {
                self.hits = hits;
                self.state = ShardTaskState::Done;
            }
            Some(Err(ShardSearchError::Terminated)) | None => {
                self.state = ShardTaskState::Done;
            }
            Some(Err(error)) => self.fail(error),
        }
    }

    /// Start matching on the matcher pool. The receiver yields the hit count.
    fn spawn_matcher(
        &self,
        handle: Arc<SearcherHandle>,
        query: Arc<QueryModel>,
        queue: Arc<DocIdHandoffQueue>,
    ) -> Receiver<Result<u64>> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let tracker = Arc::clone(&self.context.tracker);
        let shard = self.task.shard;

        self.context.match_pool.spawn(move || {
            let mut collector = HandoffCollector {
                queue: &queue,
                tracker: &tracker,
                doc_base: 0,
                hits: 0,
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                handle.view().search(&query, &mut collector)
            }));
            let hits = collector.hits;

            let outcome = match result {
                Ok(Ok(())) => Ok(hits),
                Ok(Err(ShardSearchError::Terminated)) => Err(ShardSearchError::Terminated),
                Ok(Err(e @ ShardSearchError::Match { .. })) => Err(e),
                Ok(Err(e)) => Err(ShardSearchError::matching(shard, e.to_string())),
                Err(payload) => Err(ShardSearchError::matching(shard, panic_message(&*payload))),
            };

            // Ids already queued are still drained after a match error.
            if !outcome.as_ref().is_err_and(ShardSearchError::is_terminated) {
                let _ = queue.push(DocIdToken::End, tracker.cancellation());
            }
            let _ = done_tx.send(outcome);
        });

        done_rx
    }

    /// Extraction loop. Returns the matcher's outcome if it was picked up
    /// while draining.
    fn drain(
        &mut self,
        handle: &SearcherHandle,
        queue: &DocIdHandoffQueue,
        matcher: &Receiver<Result<u64>>,
    ) -> Option<Result<u64>> {
        let mut outcome = None;

        while !self.context.tracker.is_cancelled() {
            match queue.poll() {
                Some(DocIdToken::Doc(doc)) => self.extract(handle, doc),
                Some(DocIdToken::End) => break,
                None => {
                    if outcome.is_none() {
                        match matcher.try_recv() {
                            Ok(result) => outcome = Some(result),
                            Err(TryRecvError::Disconnected) => {
                                outcome = Some(Err(ShardSearchError::internal(
                                    "matcher exited without reporting",
                                )));
                            }
                            Err(TryRecvError::Empty) => {}
                        }
                    }
                    if outcome.is_some() && queue.is_empty() {
                        break;
                    }
                }
            }
        }

        outcome
    }

    fn extract(&mut self, handle: &SearcherHandle, doc: u32) {
        let fields = &self.task.stored_fields;
        match self
            .context
            .resolver
            .resolve_stored_fields(handle, doc, fields)
        {
            Ok(mut values) => {
                values.resize(fields.len(), None);
                if values.iter().all(Option::is_none) {
                    return;
                }
                self.context.sink.accept(ResultRow {
                    shard: self.task.shard,
                    doc,
                    values: values.into_boxed_slice(),
                });
                self.rows += 1;
            }
            Err(error) => {
                let error = match error {
                    e @ ShardSearchError::Extraction { .. } => e,
                    other => ShardSearchError::extraction(self.task.shard, doc, other.to_string()),
                };
                debug!(shard = %self.task.shard, doc, %error, "skipping document");
                self.context.errors.record(error);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("matcher panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("matcher panicked: {message}")
    } else {
        "matcher panicked".to_string()
    }
}
