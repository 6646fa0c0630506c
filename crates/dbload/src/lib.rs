//! Partitioned load generator for relational and document stores.
//!
//! A run inserts synthetic users, articles and comments with a fixed number
//! of concurrent workers, then times reads, schema changes and a bulk load
//! against the same data. The engine ([`partition`], [`pool`],
//! [`correlation`], [`stage`], [`metrics`]) is independent of the store;
//! stores plug in through the [`Datastore`] trait.

pub mod backend;
pub mod config;
pub mod context;
pub mod correlation;
pub mod datastore;
pub mod error;
pub mod metrics;
pub mod model;
pub mod partition;
pub mod pool;
pub mod stage;

#[cfg(test)]
mod test;

pub use config::{Config, RunConfig};
pub use context::{RowCounts, RunContext};
pub use correlation::IdCorrelationStore;
pub use datastore::{Datastore, Session, StoreError};
pub use error::LoadError;
pub use metrics::MetricsAggregator;
pub use partition::{plan, Partition, RemainderPolicy};
pub use pool::{FailurePolicy, WorkerPool};
pub use stage::{StageKind, StageResult, StageRunner, Teardown};
