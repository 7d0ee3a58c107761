//! Shard identity, metadata and the collaborator interfaces a search consumes.
//!
//! The engine never touches the on-disk index format itself. Everything it
//! needs to know about a shard comes through the traits in this module:
//!
//! - [`ShardMetadataStore`] reports status, document count and format version.
//! - [`WriterRegistry`] hands out the live writer of a shard, if one is open.
//! - [`ShardOpener`] opens a read view over committed, on-disk data.
//! - [`ShardReadView`] evaluates a compiled query and reads stored fields.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::QueryModel;
use crate::result::FieldValue;

/// Identifier of one index shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-disk layout version of a shard. Queries are compiled per version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatVersion(pub u32);

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identity of a live index writer.
///
/// A shard whose writer is replaced gets a new identity, so searchers opened
/// against the old writer are never handed out for the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriterId(pub u64);

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Lifecycle status of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    /// Accepting writes.
    Open,

    /// No further writes. The recorded document count is authoritative.
    Closed,

    /// Marked for deletion. Never searched.
    Deleted,

    /// Known to be damaged. Never searched.
    Corrupt,
}

impl ShardStatus {
    /// Whether the shard may be opened for searching.
    pub fn is_searchable(self) -> bool {
        matches!(self, ShardStatus::Open | ShardStatus::Closed)
    }

    /// Whether the shard will never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ShardStatus::Closed)
    }
}

/// Metadata describing a shard, owned by an external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMetadata {
    /// Shard identifier.
    pub id: ShardId,

    /// Current lifecycle status.
    pub status: ShardStatus,

    /// Number of documents the shard is known to hold.
    pub document_count: u64,

    /// Index format of the shard data.
    pub format_version: FormatVersion,

    /// Node that owns the shard.
    pub node: String,
}

impl ShardMetadata {
    /// Create metadata for an open shard with no documents.
    pub fn new(id: ShardId, format_version: FormatVersion) -> Self {
        Self {
            id,
            status: ShardStatus::Open,
            document_count: 0,
            format_version,
            node: "local".to_string(),
        }
    }
}

/// Receives matching documents from [`ShardReadView::search`].
///
/// Views made of several segments call [`set_doc_base`](Self::set_doc_base)
/// before each segment and then pass segment-local ordinals to
/// [`collect`](Self::collect). Returning an error stops matching; returning
/// [`ShardSearchError::Terminated`](crate::error::ShardSearchError::Terminated)
/// stops it cleanly.
pub trait DocCollector {
    /// Shard-level ordinal of the first document of the next segment.
    fn set_doc_base(&mut self, doc_base: u32);

    /// Collect a matching document by its segment-local ordinal.
    fn collect(&mut self, doc: u32) -> Result<()>;
}

/// An opened, point-in-time read view over a shard.
pub trait ShardReadView: Send + Sync + fmt::Debug {
    /// Number of documents visible through this view.
    fn num_docs(&self) -> u64;

    /// Run a compiled query, passing every match to the collector.
    fn search(&self, query: &QueryModel, collector: &mut dyn DocCollector) -> Result<()>;

    /// Read the named stored fields of one document. Fields that are absent
    /// or not stored come back as `None`, one slot per requested name.
    fn stored_fields(&self, doc: u32, field_names: &[String]) -> Result<Vec<Option<FieldValue>>>;

    /// Pick up newly committed data without a full reopen.
    ///
    /// Returns `true` if the view changed.
    fn refresh(&self) -> Result<bool>;

    /// Release the resources held by the view.
    fn close(&self) -> Result<()>;
}

/// A live writer that can expose not-yet-committed documents.
pub trait LiveWriter: Send + Sync {
    /// Identity of this writer.
    fn id(&self) -> WriterId;

    /// Open a near-real-time view including uncommitted documents.
    fn open_view(&self) -> Result<Box<dyn ShardReadView>>;
}

/// Source of authoritative shard metadata.
pub trait ShardMetadataStore: Send + Sync {
    /// Load the metadata of one shard.
    fn load_shard(&self, id: ShardId) -> Result<ShardMetadata>;
}

/// Registry of live writers.
pub trait WriterRegistry: Send + Sync {
    /// The writer currently attached to a shard, if any.
    fn live_writer_for(&self, id: ShardId) -> Option<Arc<dyn LiveWriter>>;
}

/// Opens read views over committed shard data.
pub trait ShardOpener: Send + Sync {
    /// Open a read view over the on-disk data of a shard.
    fn open(&self, shard: &ShardMetadata) -> Result<Box<dyn ShardReadView>>;
}
