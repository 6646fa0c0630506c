use thiserror::Error;

use crate::datastore::StoreError;
use crate::model::Entity;
use crate::stage::StageKind;

/// An error that aborts a load run.
///
/// Every variant is fatal: the engine never retries. The only recovery is
/// the teardown that runs on every exit path of [`StageRunner::run`].
///
/// [`StageRunner::run`]: crate::stage::StageRunner::run
#[derive(Error, Debug)]
pub enum LoadError {
    /// The run was configured with values the engine can't work with, such as
    /// zero workers or a zero row count. Reported before any stage runs.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A write, read or schema change failed inside a stage.
    #[error("stage '{stage}' failed")]
    Backend {
        stage: StageKind,
        #[source]
        source: anyhow::Error,
    },

    /// A stage referenced an identifier that no earlier stage wrote.
    ///
    /// The engine doesn't look for these ahead of time. They surface when the
    /// store rejects the reference (a foreign key violation, or an empty
    /// identifier handed out by the correlation store).
    #[error("stage '{stage}' referenced a missing identifier: {message}")]
    ReferenceIntegrity { stage: StageKind, message: String },

    /// A correlation store position was written twice.
    #[error("{entity} at position {position} already has an identifier")]
    DuplicateIdentifier { entity: Entity, position: usize },

    /// A worker thread panicked.
    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),

    /// Connecting to the store or applying migrations failed.
    #[error("failed to prepare the datastore")]
    Setup(#[source] anyhow::Error),

    /// Rolling back migrations or dropping the dataset failed.
    #[error("failed to tear down the datastore")]
    Teardown(#[source] anyhow::Error),
}

impl LoadError {
    /// Attributes a store failure to `stage`.
    pub fn in_stage(stage: StageKind, error: StoreError) -> Self {
        match error {
            StoreError::MissingReference(message) => Self::ReferenceIntegrity { stage, message },
            error => Self::Backend {
                stage,
                source: error.into(),
            },
        }
    }

    /// The stage the error was raised in, if any.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            Self::Backend { stage, .. } | Self::ReferenceIntegrity { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_reference_integrity(&self) -> bool {
        matches!(self, Self::ReferenceIntegrity { .. })
    }
}
