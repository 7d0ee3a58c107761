mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use shardsearch::error::{Result, ShardSearchError};
use shardsearch::prelude::*;

use common::{FaultyIndex, TestResolver, WAIT, POLL};

#[test]
fn three_shards_stream_every_match() -> Result<()> {
    common::init_tracing();
    let index = common::memory_index(3, 10);
    let backend = SearchBackend::from_index(
        index.clone(),
        Arc::new(SimpleExpressionCompiler::new()),
        common::schema(),
    );
    let engine = ShardSearchEngine::new(common::config().with_handoff_queue_capacity(5), backend)?;

    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(common::shard_ids(0..3), "title:document*")
            .with_stored_fields(["title", "shard"]),
        sink.clone(),
    )?;

    assert!(search.await_completion(POLL));
    assert_eq!(search.hit_count(), 30);
    assert!(search.errors().is_empty());
    assert_eq!(sink.terminations(), vec![Termination::Complete(30)]);

    let rows = sink.rows();
    assert_eq!(rows.len(), 30);
    assert!(rows.iter().all(|row| row.len() == 2));
    for shard in 0..3u64 {
        // Rows of one shard arrive in match order.
        let docs: Vec<u32> = rows
            .iter()
            .filter(|row| row.shard == ShardId(shard))
            .map(|row| row.doc)
            .collect();
        assert_eq!(docs, (0..10).collect::<Vec<_>>());
        assert!(
            rows.iter()
                .filter(|row| row.shard == ShardId(shard))
                .all(|row| row.get(1) == Some(&FieldValue::Long(shard as i64)))
        );
    }

    let progress = search.progress();
    assert_eq!(progress.completed_shards, 3);
    assert!(!progress.cancelled);
    Ok(())
}

#[test]
fn open_failure_is_isolated_to_its_shard() -> Result<()> {
    let index = common::memory_index(4, 10);
    index.fail_next_open(ShardId(2), "simulated I/O failure");
    let backend = SearchBackend::from_index(
        index.clone(),
        Arc::new(SimpleExpressionCompiler::new()),
        common::schema(),
    );
    let engine = ShardSearchEngine::new(common::config(), backend)?;

    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(common::shard_ids(0..4), "*").with_stored_fields(["n"]),
        sink.clone(),
    )?;

    assert!(search.await_completion(POLL));
    assert_eq!(search.hit_count(), 30);
    assert_eq!(search.progress().completed_shards, 4);

    let errors = search.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ShardSearchError::Open { shard: ShardId(2), message } if message.contains("simulated I/O failure")
    ));
    assert_eq!(sink.terminations(), vec![Termination::Failed(errors)]);
    assert_eq!(sink.row_count(), 30);
    Ok(())
}

#[test]
fn cancel_after_first_shard_releases_everything() -> Result<()> {
    let faulty = FaultyIndex::new(common::memory_index(5, 40));
    let resolver = Arc::new(TestResolver::new().with_delay(Duration::from_millis(2)));
    let backend =
        common::faulty_backend(&faulty, SimpleExpressionCompiler::new(), resolver.clone());
    let engine = ShardSearchEngine::new(
        common::config()
            .with_max_open_shards(5)
            .with_handoff_queue_capacity(4),
        backend,
    )?;

    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(common::shard_ids(0..5), "*")
            .with_stored_fields(["title"])
            .with_max_concurrency(1),
        sink.clone(),
    )?;

    let deadline = Instant::now() + WAIT;
    while search.progress().completed_shards < 1 {
        assert!(Instant::now() < deadline, "first shard never finished");
        thread::sleep(Duration::from_millis(1));
    }
    search.cancel();

    assert!(!search.await_completion(POLL));
    let progress = search.progress();
    assert!(progress.cancelled);
    assert!(progress.completed_shards >= 1 && progress.completed_shards <= 5);
    assert!(search.hit_count() < 200);
    assert_eq!(sink.terminations().len(), 1);

    // Nothing is leased once the search has wound down.
    assert!(engine.cache().cached_handles().iter().all(|h| h.in_use() == 0));
    engine.clear();
    assert_eq!(faulty.live_views.load(Ordering::SeqCst), 0);
    assert_eq!(faulty.used_after_close.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn concurrent_searches_share_a_small_cache() -> Result<()> {
    common::init_tracing();
    for concurrency in [1, 2] {
        let faulty = FaultyIndex::new(common::memory_index(6, 25));
        let backend = common::faulty_backend(
            &faulty,
            SimpleExpressionCompiler::new(),
            Arc::new(TestResolver::new()),
        );
        let engine = Arc::new(ShardSearchEngine::new(
            common::config()
                .with_max_open_shards(2)
                .with_handoff_queue_capacity(3),
            backend,
        )?);

        let sinks = [CollectingSink::new(), CollectingSink::new()];
        let searches = [
            engine.search(
                SearchRequest::new(common::shard_ids(0..4), "*")
                    .with_stored_fields(["n"])
                    .with_max_concurrency(concurrency),
                sinks[0].clone(),
            )?,
            engine.search(
                SearchRequest::new(common::shard_ids(2..6), "*")
                    .with_stored_fields(["n"])
                    .with_max_concurrency(concurrency),
                sinks[1].clone(),
            )?,
        ];

        while !searches.iter().all(SearchHandle::is_complete) {
            let (size, capacity) = engine.size_and_capacity();
            assert!(size <= capacity);
            thread::sleep(Duration::from_millis(1));
        }
        for search in &searches {
            assert!(search.await_completion(POLL));
            assert_eq!(search.hit_count(), 100);
            assert!(search.errors().is_empty());
        }
        for sink in &sinks {
            assert_eq!(sink.row_count(), 100);
        }

        // Leased views and evicted views still waiting on their close both
        // count against the capacity.
        assert!(faulty.peak_live_views.load(Ordering::SeqCst) <= 2);
        assert!(engine.cache_stats().evictions > 0);
        assert_eq!(faulty.used_after_close.load(Ordering::SeqCst), 0);
        assert!(engine.cache().cached_handles().iter().all(|h| h.in_use() == 0));

        engine.clear();
        assert_eq!(faulty.live_views.load(Ordering::SeqCst), 0);
    }
    Ok(())
}

#[test]
fn build_failure_on_one_format_version() -> Result<()> {
    let index = Arc::new(MemoryIndex::new());
    for id in 0..4u64 {
        let version = if id < 2 { FormatVersion(1) } else { FormatVersion(2) };
        index.create_shard(ShardId(id), version);
        index.add_segment(ShardId(id), common::shard_docs(id, 10));
    }
    let backend = SearchBackend::from_index(
        index.clone(),
        Arc::new(SimpleExpressionCompiler::new().with_supported_versions(vec![FormatVersion(1)])),
        common::schema(),
    );
    let engine = ShardSearchEngine::new(common::config(), backend)?;

    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(common::shard_ids(0..4), "body:even").with_stored_fields(["n"]),
        sink.clone(),
    )?;

    assert!(search.await_completion(POLL));
    assert_eq!(search.hit_count(), 10);
    assert_eq!(search.progress().completed_shards, 4);

    let errors = search.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        ShardSearchError::QueryBuild {
            version: FormatVersion(2),
            ..
        }
    ));
    assert!(
        sink.rows()
            .iter()
            .all(|row| row.shard == ShardId(0) || row.shard == ShardId(1))
    );
    Ok(())
}

#[test]
fn unknown_field_fails_every_version_but_completes() -> Result<()> {
    let index = common::memory_index(3, 5);
    let backend = SearchBackend::from_index(
        index,
        Arc::new(SimpleExpressionCompiler::new()),
        common::schema(),
    );
    let engine = ShardSearchEngine::new(common::config(), backend)?;

    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(common::shard_ids(0..3), "author:someone").with_stored_fields(["n"]),
        sink.clone(),
    )?;

    assert!(search.await_completion(POLL));
    assert_eq!(search.hit_count(), 0);
    assert_eq!(search.errors().len(), 1);
    assert_eq!(sink.row_count(), 0);
    Ok(())
}

#[test]
fn empty_shard_list_completes_with_zero_hits() -> Result<()> {
    let backend = SearchBackend::from_index(
        Arc::new(MemoryIndex::new()),
        Arc::new(SimpleExpressionCompiler::new()),
        common::schema(),
    );
    let engine = ShardSearchEngine::new(common::config(), backend)?;

    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(Vec::new(), "*").with_stored_fields(["n"]),
        sink.clone(),
    )?;

    assert!(search.is_complete());
    assert!(search.await_completion(POLL));
    assert_eq!(sink.terminations(), vec![Termination::Complete(0)]);
    Ok(())
}

#[test]
fn live_writer_documents_are_searchable() -> Result<()> {
    let index = common::memory_index(1, 3);
    let writer = index.attach_writer(ShardId(0))?;
    writer.add_document(MemoryDocument::new().with("title", "fresh").with("n", 99i64));

    let backend = SearchBackend::from_index(
        index.clone(),
        Arc::new(SimpleExpressionCompiler::new()),
        common::schema(),
    );
    let engine = ShardSearchEngine::new(common::config(), backend)?;

    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(vec![ShardId(0)], "title:fresh").with_stored_fields(["n"]),
        sink.clone(),
    )?;
    assert!(search.await_completion(POLL));
    assert_eq!(search.hit_count(), 1);
    assert_eq!(sink.rows()[0].get(0), Some(&FieldValue::Long(99)));

    // A replacement writer gets its own cache entry.
    let replacement = index.attach_writer(ShardId(0))?;
    replacement.add_document(MemoryDocument::new().with("title", "fresh").with("n", 100i64));
    let sink = CollectingSink::new();
    let search = engine.search(
        SearchRequest::new(vec![ShardId(0)], "title:fresh").with_stored_fields(["n"]),
        sink.clone(),
    )?;
    assert!(search.await_completion(POLL));
    assert_eq!(search.hit_count(), 1);
    assert_eq!(sink.rows()[0].get(0), Some(&FieldValue::Long(100)));
    assert_eq!(engine.size_and_capacity().0, 1);
    Ok(())
}
