//! # shardsearch
//!
//! Runs one full-text query across many index shards at once and streams the
//! stored fields of every match into a single sink.
//!
//! ## Features
//!
//! - Bounded, shared worker pools with a per-search concurrency cap
//! - Backpressure between matching and stored-field extraction
//! - A small cache of warm per-shard searchers with idle/live expiry
//! - Per-format-version query compilation
//! - Partial-failure isolation: one broken shard never sinks a search
//! - Cooperative cancellation with guaranteed resource release
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shardsearch::prelude::*;
//!
//! let index = Arc::new(MemoryIndex::new());
//! for id in 0..3 {
//!     index.create_shard(ShardId(id), FormatVersion(1));
//!     index.add_segment(
//!         ShardId(id),
//!         vec![MemoryDocument::new().with("title", "hello").with("shard", id as i64)],
//!     );
//! }
//!
//! let backend = SearchBackend::from_index(
//!     index,
//!     Arc::new(SimpleExpressionCompiler::new()),
//!     FieldSchema::new().with_field("title").with_field("shard"),
//! );
//! let engine = ShardSearchEngine::new(ShardSearchConfig::default(), backend).unwrap();
//!
//! let sink = CollectingSink::new();
//! let search = engine
//!     .search(
//!         SearchRequest::new((0..3).map(ShardId).collect(), "title:hello")
//!             .with_stored_fields(["shard"]),
//!         sink.clone(),
//!     )
//!     .unwrap();
//!
//! assert!(search.await_completion(Duration::from_millis(50)));
//! assert_eq!(search.hit_count(), 3);
//! assert_eq!(sink.row_count(), 3);
//! ```

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod memory;
pub mod progress;
pub mod query;
pub mod result;
pub mod scheduler;
pub mod searcher;
pub mod shard;
pub mod task;

pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::config::ShardSearchConfig;
    pub use crate::engine::{SearchBackend, SearchHandle, SearchRequest, ShardSearchEngine};
    pub use crate::error::{Result, ShardSearchError};
    pub use crate::memory::{MemoryDocument, MemoryIndex, SimpleExpressionCompiler};
    pub use crate::progress::SearchProgress;
    pub use crate::query::{ExpressionCompiler, FieldSchema};
    pub use crate::result::{CollectingSink, FieldValue, ResultRow, ResultSink, Termination};
    pub use crate::shard::{FormatVersion, ShardId, ShardStatus};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
