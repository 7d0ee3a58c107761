//! Compiled queries and the per-format-version query factory.
//!
//! A search carries a single expression, but the shards it touches may be
//! stored in different index formats. [`ShardQueryFactory`] compiles the
//! expression lazily, once per format version, and remembers failures so
//! every shard on a broken version short-circuits to zero hits.

use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{ErrorSink, Result, ShardSearchError};
use crate::result::FieldValue;
use crate::shard::FormatVersion;

/// A node of a compiled boolean query. No scoring is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryNode {
    /// Matches every document.
    All,

    /// Exact match of a field's text form.
    Term { field: String, value: String },

    /// Field text starts with a prefix.
    Prefix { field: String, prefix: String },

    /// Every clause matches.
    And(Vec<QueryNode>),

    /// At least one clause matches.
    Or(Vec<QueryNode>),

    /// The clause does not match.
    Not(Box<QueryNode>),
}

impl QueryNode {
    /// Number of leaf clauses in the tree.
    pub fn clause_count(&self) -> usize {
        match self {
            QueryNode::All | QueryNode::Term { .. } | QueryNode::Prefix { .. } => 1,
            QueryNode::And(clauses) | QueryNode::Or(clauses) => {
                clauses.iter().map(QueryNode::clause_count).sum()
            }
            QueryNode::Not(inner) => inner.clause_count(),
        }
    }

    /// Names of every field referenced by the tree.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            QueryNode::All => {}
            QueryNode::Term { field, .. } | QueryNode::Prefix { field, .. } => out.push(field),
            QueryNode::And(clauses) | QueryNode::Or(clauses) => {
                for clause in clauses {
                    clause.collect_fields(out);
                }
            }
            QueryNode::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Evaluate the tree against a document's field lookup.
    pub fn matches<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<&'a FieldValue>,
    {
        match self {
            QueryNode::All => true,
            QueryNode::Term { field, value } => {
                lookup(field).is_some_and(|v| v.as_text() == *value)
            }
            QueryNode::Prefix { field, prefix } => {
                lookup(field).is_some_and(|v| v.as_text().starts_with(prefix.as_str()))
            }
            QueryNode::And(clauses) => clauses.iter().all(|c| c.matches(lookup)),
            QueryNode::Or(clauses) => clauses.iter().any(|c| c.matches(lookup)),
            QueryNode::Not(inner) => !inner.matches(lookup),
        }
    }
}

/// A query compiled for one index format version.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryModel {
    /// Format version the query was built for.
    pub version: FormatVersion,

    /// Root of the query tree.
    pub root: QueryNode,

    /// Instant that relative time expressions were resolved against.
    pub time_basis: DateTime<Utc>,
}

/// Definition of one index field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub indexed: bool,
    pub stored: bool,
}

/// The fields an index knows about.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: AHashMap<String, FieldDefinition>,
}

impl FieldSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field that is both indexed and stored.
    pub fn with_field<S: Into<String>>(self, name: S) -> Self {
        self.with_definition(name, true, true)
    }

    /// Add a field with explicit flags.
    pub fn with_definition<S: Into<String>>(mut self, name: S, indexed: bool, stored: bool) -> Self {
        let name = name.into();
        self.fields.insert(
            name.clone(),
            FieldDefinition {
                name,
                indexed,
                stored,
            },
        );
        self
    }

    /// Look up a field.
    pub fn get(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Inputs shared by every compilation of one search's expression.
#[derive(Debug, Clone)]
pub struct CompileContext {
    pub schema: Arc<FieldSchema>,
    pub max_clause_count: usize,
    pub time_basis: DateTime<Utc>,
}

/// Compiles a search expression into a [`QueryModel`].
pub trait ExpressionCompiler: Send + Sync {
    /// Compile `expression` for shards stored in `version`.
    fn compile(
        &self,
        expression: &str,
        context: &CompileContext,
        version: FormatVersion,
    ) -> Result<QueryModel>;
}

type QueryCell = Arc<OnceLock<Option<Arc<QueryModel>>>>;

/// Lazily compiles and memoizes one search's query per format version.
///
/// Lives for the duration of one search. Versions are compiled independently,
/// so compiling for one version never waits on another.
pub struct ShardQueryFactory {
    expression: String,
    context: CompileContext,
    compiler: Arc<dyn ExpressionCompiler>,
    errors: ErrorSink,
    cancel: CancellationToken,
    queries: Mutex<AHashMap<FormatVersion, QueryCell>>,
}

impl ShardQueryFactory {
    /// Create a factory for one search.
    pub fn new(
        expression: impl Into<String>,
        context: CompileContext,
        compiler: Arc<dyn ExpressionCompiler>,
        errors: ErrorSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            expression: expression.into(),
            context,
            compiler,
            errors,
            cancel,
            queries: Mutex::new(AHashMap::new()),
        }
    }

    /// The expression this factory compiles.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The query for `version`, or `None` if it cannot be built.
    ///
    /// A build failure is recorded on the error sink once per version.
    pub fn get_query(&self, version: FormatVersion) -> Option<Arc<QueryModel>> {
        let cell = {
            let mut queries = self.queries.lock();
            Arc::clone(queries.entry(version).or_default())
        };

        cell.get_or_init(|| self.build(version)).clone()
    }

    /// Number of versions compiled so far, successful or not.
    pub fn compiled_versions(&self) -> usize {
        self.queries
            .lock()
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    fn build(&self, version: FormatVersion) -> Option<Arc<QueryModel>> {
        if self.cancel.is_cancelled() {
            return None;
        }

        match self
            .compiler
            .compile(&self.expression, &self.context, version)
        {
            Ok(query) if query.root.clause_count() > self.context.max_clause_count => {
                let error = ShardSearchError::query_build(
                    version,
                    format!(
                        "query has {} clauses, more than the limit of {}",
                        query.root.clause_count(),
                        self.context.max_clause_count
                    ),
                );
                warn!(%version, %error, "query rejected");
                self.errors.record(error);
                None
            }
            Ok(query) => {
                debug!(%version, clauses = query.root.clause_count(), "compiled query");
                Some(Arc::new(query))
            }
            Err(error) => {
                let error = match error {
                    e @ ShardSearchError::QueryBuild { .. } => e,
                    ShardSearchError::Terminated => return None,
                    other => ShardSearchError::query_build(version, other.to_string()),
                };
                warn!(%version, %error, "failed to build query");
                self.errors.record(error);
                None
            }
        }
    }
}

impl std::fmt::Debug for ShardQueryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardQueryFactory")
            .field("expression", &self.expression)
            .field("max_clause_count", &self.context.max_clause_count)
            .finish()
    }
}
