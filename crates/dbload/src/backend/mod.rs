//! The two stores the harness can load.

pub mod mongodb;
pub mod postgres;

use std::fmt::{self, Display};

use clap::ValueEnum;

use crate::config::BackendOptions;
use crate::datastore::{Datastore, StoreError};

pub use self::mongodb::MongoStore;
pub use self::postgres::PostgresStore;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "lowercase")]
pub enum BackendKind {
    /// Relational backend, see [`PostgresStore`].
    Postgres,
    /// Document backend, see [`MongoStore`].
    Mongodb,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => f.write_str("postgres"),
            BackendKind::Mongodb => f.write_str("mongodb"),
        }
    }
}

/// Creates the backend selected by `options`.
pub fn open(options: &BackendOptions) -> Result<Box<dyn Datastore>, StoreError> {
    Ok(match options.backend {
        BackendKind::Postgres => Box::new(PostgresStore::new(
            &options.postgres_url,
            options.migrate,
        )?),
        BackendKind::Mongodb => Box::new(MongoStore::new(&options.mongodb_uri, &options.database)?),
    })
}
