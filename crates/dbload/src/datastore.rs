//! Capabilities the load engine needs from a store.
//!
//! The engine never sees SQL or aggregation pipelines. It asks a
//! [`Datastore`] for sessions and drives them through the [`Session`]
//! operations; each backend translates those into its own statements.

use std::fmt::{self, Display};

use thiserror::Error;

use crate::model::{Article, Record, Table};
use crate::stage::StageKind;

/// Failure reported by a backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A row referenced an identifier the store doesn't know about, or the
    /// identifier was empty because no earlier stage recorded it.
    #[error("missing reference: {0}")]
    MissingReference(String),

    /// A lookup by identifier found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend has no equivalent of the requested operation.
    #[error("not supported by this backend: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Read queries measured by the query stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Query {
    /// Users joined with their articles and comments.
    Joins,
    /// Users filtered on name and id.
    Filters,
    /// The join, filtered on both users and comments.
    JoinsAndFilters,
}

impl Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Query::Joins => "join",
            Query::Filters => "filter",
            Query::JoinsAndFilters => "join and filters",
        };
        f.write_str(name)
    }
}

/// Schema-evolution probes run against the users table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemaChange {
    AddNullableColumn,
    AddColumnWithDefault,
    DropColumn,
}

/// Column added, and later dropped, by the default-value probe.
pub const DEFAULT_COLUMN: &str = "default_column";

/// Value of [`DEFAULT_COLUMN`] for existing rows.
pub const DEFAULT_COLUMN_VALUE: &str = "default text in new column";

/// A store the engine can populate and measure.
///
/// Implementations are shared by every worker of a stage, hence `Sync`.
/// Per-worker state lives in the [`Session`]s they hand out.
pub trait Datastore: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// The stages this backend runs, in execution order. A stage's index in
    /// this slice is its ordinal for the skip cutoff.
    fn catalog(&self) -> &'static [StageKind];

    /// Brings the store into a state where the catalog can run, e.g. by
    /// applying migrations or checking the connection.
    fn prepare(&self) -> Result<(), StoreError>;

    /// Removes everything the run created.
    ///
    /// Called on every exit path of a run, so it must succeed when there is
    /// nothing left to remove.
    fn teardown(&self) -> Result<(), StoreError>;

    /// Opens a session for one worker.
    fn connect(&self) -> Result<Box<dyn Session>, StoreError>;
}

/// One worker's connection to a [`Datastore`].
pub trait Session {
    /// Writes `record` into `table` and returns the identifier the store
    /// assigned to it.
    fn insert(&mut self, table: Table, record: &Record) -> Result<String, StoreError>;

    /// Called once per insert stage, on a fresh session, after every worker
    /// wrote its rows. Backends build their indexes here.
    fn finish_inserts(&mut self, _table: Table) -> Result<(), StoreError> {
        Ok(())
    }

    /// Fetches the user with identifier `id`.
    fn find_user(&mut self, id: &str) -> Result<(), StoreError>;

    /// Runs `query` and returns the number of rows it produced.
    fn query(&mut self, query: Query) -> Result<u64, StoreError>;

    /// Applies `change` to the users table and returns the number of rows the
    /// store reports as modified.
    fn evolve(&mut self, change: SchemaChange) -> Result<u64, StoreError>;

    /// Writes `rows` through the store's native bulk mechanism and returns the
    /// number of rows written.
    fn bulk_load(&mut self, rows: &mut dyn Iterator<Item = Article>) -> Result<u64, StoreError>;
}
