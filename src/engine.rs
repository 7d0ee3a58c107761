//! The entry point for running searches.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::ShardSearchConfig;
use crate::error::{ErrorSink, Result, ShardSearchError};
use crate::progress::{ProgressTracker, SearchProgress};
use crate::query::{CompileContext, ExpressionCompiler, FieldSchema, ShardQueryFactory};
use crate::result::{ResultSink, StoredFieldResolver, ViewFieldResolver};
use crate::scheduler::{SearchWorkerPool, ShardSearchScheduler};
use crate::searcher::{SearcherCache, SearcherCacheStats};
use crate::shard::{ShardId, ShardMetadataStore, ShardOpener, WriterRegistry};
use crate::task::{ShardTaskOutcome, TaskContext};

/// The collaborators a search engine reads shards through.
#[derive(Clone)]
pub struct SearchBackend {
    pub metadata: Arc<dyn ShardMetadataStore>,
    pub writers: Arc<dyn WriterRegistry>,
    pub opener: Arc<dyn ShardOpener>,
    pub compiler: Arc<dyn ExpressionCompiler>,
    pub resolver: Arc<dyn StoredFieldResolver>,
    pub schema: Arc<FieldSchema>,
}

impl SearchBackend {
    /// Use one index for metadata, writers and opening, reading stored
    /// fields straight from the searcher's view.
    pub fn from_index<I>(
        index: Arc<I>,
        compiler: Arc<dyn ExpressionCompiler>,
        schema: FieldSchema,
    ) -> Self
    where
        I: ShardMetadataStore + WriterRegistry + ShardOpener + 'static,
    {
        Self {
            metadata: index.clone(),
            writers: index.clone(),
            opener: index,
            compiler,
            resolver: Arc::new(ViewFieldResolver),
            schema: Arc::new(schema),
        }
    }

    /// Replace the stored field resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn StoredFieldResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// One search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Shards to search.
    pub shard_ids: Vec<ShardId>,

    /// Expression to compile for each format version.
    pub expression: String,

    /// Stored fields to return for every hit, in output order.
    pub stored_fields: Vec<String>,

    /// Overrides the configured per-search concurrency cap.
    pub max_concurrency: Option<usize>,

    /// Instant relative time expressions resolve against. Defaults to now.
    pub time_basis: Option<DateTime<Utc>>,
}

impl SearchRequest {
    /// Create a request over `shard_ids`.
    pub fn new<S: Into<String>>(shard_ids: Vec<ShardId>, expression: S) -> Self {
        Self {
            shard_ids,
            expression: expression.into(),
            stored_fields: Vec::new(),
            max_concurrency: None,
            time_basis: None,
        }
    }

    /// Set the stored fields to return.
    pub fn with_stored_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stored_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-search concurrency cap.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Set the time basis.
    pub fn with_time_basis(mut self, time_basis: DateTime<Utc>) -> Self {
        self.time_basis = Some(time_basis);
        self
    }
}

/// Runs searches over many shards in parallel.
pub struct ShardSearchEngine {
    config: ShardSearchConfig,
    backend: SearchBackend,
    pool: SearchWorkerPool,
    cache: SearcherCache,
}

impl ShardSearchEngine {
    /// Create an engine. Fails if the configuration is invalid.
    pub fn new(config: ShardSearchConfig, backend: SearchBackend) -> Result<Self> {
        config.validate()?;

        let pool = SearchWorkerPool::new(&config)?;
        let cache = SearcherCache::new(
            &config,
            Arc::clone(&backend.metadata),
            Arc::clone(&backend.writers),
            Arc::clone(&backend.opener),
        )?;

        Ok(Self {
            config,
            backend,
            pool,
            cache,
        })
    }

    /// Start a search. Rows stream into `sink` as shards produce them.
    pub fn search(&self, request: SearchRequest, sink: Arc<dyn ResultSink>) -> Result<SearchHandle> {
        if request.stored_fields.is_empty() {
            return Err(ShardSearchError::invalid_argument(
                "at least one stored field must be requested",
            ));
        }

        let search_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let errors = ErrorSink::new();
        let tracker = Arc::new(ProgressTracker::new(request.shard_ids.len(), cancel.clone()));

        let query_factory = Arc::new(ShardQueryFactory::new(
            request.expression,
            CompileContext {
                schema: Arc::clone(&self.backend.schema),
                max_clause_count: self.config.max_boolean_clause_count,
                time_basis: request.time_basis.unwrap_or_else(Utc::now),
            },
            Arc::clone(&self.backend.compiler),
            errors.clone(),
            cancel,
        ));

        let context = Arc::new(TaskContext {
            cache: self.cache.clone(),
            resolver: Arc::clone(&self.backend.resolver),
            sink,
            tracker,
            errors: errors.clone(),
            match_pool: self.pool.match_pool(),
            handoff_capacity: self.config.handoff_queue_capacity,
            poll_interval: self.config.poll_interval,
        });

        debug!(
            %search_id,
            shards = request.shard_ids.len(),
            expression = query_factory.expression(),
            "starting search"
        );

        let scheduler = ShardSearchScheduler::new(search_id, self.pool.clone(), context);
        scheduler.schedule(
            request.shard_ids,
            query_factory,
            request.stored_fields.into(),
            request
                .max_concurrency
                .unwrap_or(self.config.max_threads_per_search),
        )?;

        Ok(SearchHandle { scheduler, errors })
    }

    /// Ask every cached searcher to pick up newly committed data.
    pub fn refresh(&self) -> usize {
        self.cache.refresh()
    }

    /// Close every cached searcher, waiting for the closes to finish.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached searchers and the cache capacity.
    pub fn size_and_capacity(&self) -> (usize, usize) {
        self.cache.size_and_capacity()
    }

    /// Change the searcher cache capacity.
    pub fn set_max_open_shards(&self, max_open_shards: usize) {
        self.cache.set_max_open_shards(max_open_shards);
    }

    /// Searcher cache counters.
    pub fn cache_stats(&self) -> SearcherCacheStats {
        self.cache.stats()
    }

    /// The searcher cache.
    pub fn cache(&self) -> &SearcherCache {
        &self.cache
    }

    /// The engine configuration.
    pub fn config(&self) -> &ShardSearchConfig {
        &self.config
    }
}

/// Handle onto a running search.
#[derive(Clone)]
pub struct SearchHandle {
    scheduler: ShardSearchScheduler,
    errors: ErrorSink,
}

impl SearchHandle {
    /// Id of the search.
    pub fn search_id(&self) -> Uuid {
        self.scheduler.search_id()
    }

    /// Block until the search has finished and every shard task has let go of
    /// its resources, logging progress every `poll_interval`.
    ///
    /// Returns `true` if every shard ran to completion, `false` if the search
    /// was cancelled.
    pub fn await_completion(&self, poll_interval: Duration) -> bool {
        let tracker = self.scheduler.tracker();
        loop {
            let idle = self.scheduler.wait_idle(poll_interval);
            if idle && tracker.completion_signalled() {
                break;
            }

            debug!(search_id = %self.search_id(), "{}", tracker.snapshot().info());
            if idle {
                thread::sleep(poll_interval);
            }
        }

        !tracker.is_cancelled() && tracker.completed_shards() == tracker.shard_count()
    }

    /// Hits counted so far. Final once the search is complete.
    pub fn hit_count(&self) -> u64 {
        self.scheduler.tracker().hit_count()
    }

    /// Cancel the search. Safe to call any number of times.
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    /// True once cancelled or once every shard has completed.
    pub fn is_complete(&self) -> bool {
        self.scheduler.is_complete()
    }

    /// Errors recorded so far.
    pub fn errors(&self) -> Vec<ShardSearchError> {
        self.errors.snapshot()
    }

    /// Progress snapshot.
    pub fn progress(&self) -> SearchProgress {
        self.scheduler.tracker().snapshot()
    }

    /// Outcomes of the shard tasks that have finished.
    pub fn outcomes(&self) -> Vec<ShardTaskOutcome> {
        self.scheduler.outcomes()
    }
}

impl std::fmt::Debug for SearchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchHandle")
            .field("search_id", &self.search_id())
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDocument, MemoryIndex, SimpleExpressionCompiler};
    use crate::result::{CollectingSink, Termination};
    use crate::shard::FormatVersion;

    fn engine() -> (Arc<MemoryIndex>, ShardSearchEngine) {
        let index = Arc::new(MemoryIndex::new());
        for id in 0..3 {
            index.create_shard(ShardId(id), FormatVersion(1));
            index.add_segment(
                ShardId(id),
                (0..4)
                    .map(|i| {
                        MemoryDocument::new()
                            .with("kind", if i % 2 == 0 { "even" } else { "odd" })
                            .with("n", i as i64)
                    })
                    .collect(),
            );
        }

        let backend = SearchBackend::from_index(
            index.clone(),
            Arc::new(SimpleExpressionCompiler::new()),
            FieldSchema::new().with_field("kind").with_field("n"),
        );
        let config = ShardSearchConfig::default().with_poll_interval(Duration::from_millis(10));
        (index, ShardSearchEngine::new(config, backend).unwrap())
    }

    #[test]
    fn test_search_filters_documents() {
        let (_, engine) = engine();
        let sink = CollectingSink::new();

        let handle = engine
            .search(
                SearchRequest::new((0..3).map(ShardId).collect(), "kind:even")
                    .with_stored_fields(["n"]),
                sink.clone(),
            )
            .unwrap();

        assert!(handle.await_completion(Duration::from_millis(10)));
        assert_eq!(handle.hit_count(), 6);
        assert_eq!(sink.row_count(), 6);
        assert_eq!(sink.terminations(), vec![Termination::Complete(6)]);
        assert!(handle.errors().is_empty());
        assert!(handle.is_complete());
    }

    #[test]
    fn test_empty_stored_fields_rejected() {
        let (_, engine) = engine();
        let err = engine
            .search(SearchRequest::new(vec![ShardId(0)], "*"), CollectingSink::new())
            .unwrap_err();
        assert!(matches!(err, ShardSearchError::InvalidArgument(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let index = Arc::new(MemoryIndex::new());
        let backend = SearchBackend::from_index(
            index,
            Arc::new(SimpleExpressionCompiler::new()),
            FieldSchema::new(),
        );
        let config = ShardSearchConfig::default().with_max_threads(0);
        assert!(ShardSearchEngine::new(config, backend).is_err());
    }

    #[test]
    fn test_deleted_shard_reports_open_error() {
        let (index, engine) = engine();
        index.set_status(ShardId(1), crate::shard::ShardStatus::Deleted);
        let sink = CollectingSink::new();

        let handle = engine
            .search(
                SearchRequest::new((0..3).map(ShardId).collect(), "*").with_stored_fields(["n"]),
                sink.clone(),
            )
            .unwrap();

        assert!(handle.await_completion(Duration::from_millis(10)));
        assert_eq!(handle.hit_count(), 8);
        let errors = handle.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].shard(), Some(ShardId(1)));
        assert!(matches!(
            sink.terminations().as_slice(),
            [Termination::Failed(errors)] if errors.len() == 1
        ));
    }

    #[test]
    fn test_cache_maintenance() {
        let (index, engine) = engine();
        let handle = engine
            .search(
                SearchRequest::new(vec![ShardId(0)], "*").with_stored_fields(["n"]),
                CollectingSink::new(),
            )
            .unwrap();
        handle.await_completion(Duration::from_millis(10));

        assert_eq!(engine.size_and_capacity(), (1, 2));
        index.add_segment(ShardId(0), vec![MemoryDocument::new().with("n", 7i64)]);
        assert_eq!(engine.refresh(), 1);

        engine.clear();
        assert_eq!(engine.size_and_capacity(), (0, 2));
        assert_eq!(engine.cache_stats().outstanding_closes, 0);
        assert_eq!(index.open_views(), 0);
    }
}
