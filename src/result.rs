//! Result rows and the sink that receives them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardSearchError};
use crate::searcher::SearcherHandle;
use crate::shard::ShardId;

/// A typed stored-field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
}

impl FieldValue {
    /// Text form of the value, as used by term matching.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Long(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
            FieldValue::Boolean(v) => v.to_string(),
            FieldValue::Date(v) => v.to_rfc3339(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Long(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

/// Stored values of one matched document, one slot per requested field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Shard the document came from.
    pub shard: ShardId,

    /// Shard-level ordinal of the document.
    pub doc: u32,

    /// Values in the order the fields were requested. Missing fields are `None`.
    pub values: Box<[Option<FieldValue>]>,
}

impl ResultRow {
    /// Value of the field at `index` in the requested field list.
    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    /// Number of slots in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no slots.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Receives the output of a search.
///
/// Rows from different shards arrive interleaved in no particular order.
/// Exactly one terminal call is made per search: `on_error` if any error was
/// recorded, `on_complete` otherwise.
///
/// A cancelled search terminates as soon as the cancellation is observed,
/// without waiting for running shards: `on_complete` carries the hits counted
/// so far, or `on_error` the errors recorded so far. Errors raised by shards
/// still winding down after that never reach the sink; they remain visible
/// through [`SearchHandle::errors`](crate::engine::SearchHandle::errors).
/// Cancelling after every shard has finished has no effect.
pub trait ResultSink: Send + Sync {
    /// Accept one row.
    fn accept(&self, row: ResultRow);

    /// The search finished without errors.
    fn on_complete(&self, total_hits: u64);

    /// The search finished with errors. Hits from healthy shards were still
    /// delivered through [`accept`](Self::accept).
    fn on_error(&self, errors: Vec<ShardSearchError>);
}

/// Reads stored fields for matched documents.
pub trait StoredFieldResolver: Send + Sync {
    /// Resolve `field_names` for document `doc` of the shard behind `handle`.
    fn resolve_stored_fields(
        &self,
        handle: &SearcherHandle,
        doc: u32,
        field_names: &[String],
    ) -> Result<Vec<Option<FieldValue>>>;
}

/// Resolver that reads straight from the searcher's read view.
#[derive(Debug, Default, Clone, Copy)]
pub struct ViewFieldResolver;

impl StoredFieldResolver for ViewFieldResolver {
    fn resolve_stored_fields(
        &self,
        handle: &SearcherHandle,
        doc: u32,
        field_names: &[String],
    ) -> Result<Vec<Option<FieldValue>>> {
        handle.view().stored_fields(doc, field_names)
    }
}

/// How a search ended, as seen by a [`CollectingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Complete(u64),
    Failed(Vec<ShardSearchError>),
}

#[derive(Debug, Default)]
struct CollectedState {
    rows: Vec<ResultRow>,
    terminations: Vec<Termination>,
}

/// A sink that buffers every row in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    state: Mutex<CollectedState>,
    terminated: Condvar,
}

impl CollectingSink {
    /// Create a new empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of the rows received so far.
    pub fn rows(&self) -> Vec<ResultRow> {
        self.state.lock().rows.clone()
    }

    /// Number of rows received so far.
    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Every terminal call received, in order. A well-behaved search makes one.
    pub fn terminations(&self) -> Vec<Termination> {
        self.state.lock().terminations.clone()
    }

    /// Block until a terminal call arrives or `timeout` passes.
    pub fn wait_for_termination(&self, timeout: Duration) -> Option<Termination> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.terminations.is_empty() {
            if self.terminated.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.terminations.first().cloned()
    }
}

impl ResultSink for CollectingSink {
    fn accept(&self, row: ResultRow) {
        self.state.lock().rows.push(row);
    }

    fn on_complete(&self, total_hits: u64) {
        self.state
            .lock()
            .terminations
            .push(Termination::Complete(total_hits));
        self.terminated.notify_all();
    }

    fn on_error(&self, errors: Vec<ShardSearchError>) {
        self.state.lock().terminations.push(Termination::Failed(errors));
        self.terminated.notify_all();
    }
}
