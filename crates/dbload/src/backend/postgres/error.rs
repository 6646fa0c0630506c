use anyhow::anyhow;

use crate::datastore::StoreError;
use crate::model::Entity;

impl From<postgres::Error> for StoreError {
    fn from(value: postgres::Error) -> Self {
        use postgres::error::SqlState;

        if value.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
            let detail = value
                .as_db_error()
                .and_then(|e| e.detail())
                .map(str::to_owned)
                .unwrap_or_else(|| value.to_string());
            Self::MissingReference(detail)
        } else if value.is_closed() || value.code().is_none() {
            Self::Operation(anyhow!("failed to connect to postgres: {value}"))
        } else {
            Self::Operation(anyhow!(
                "postgres error: SqlState: {:?}: {value}",
                value.code()
            ))
        }
    }
}

/// Parses an identifier issued by an earlier insert stage.
///
/// Identifiers are the decimal row ids. Anything else, in particular the
/// empty identifier of a position that was never inserted, is a missing
/// reference.
pub(super) fn parse_reference(entity: Entity, id: &str) -> Result<i64, StoreError> {
    if id.is_empty() {
        return Err(StoreError::MissingReference(format!(
            "no {entity} identifier was recorded"
        )));
    }
    id.parse()
        .map_err(|e| StoreError::MissingReference(format!("{entity} id '{id}': {e}")))
}

/// Converts a sequence position into a row id.
pub(super) fn row_id(position: usize) -> Result<i64, StoreError> {
    i64::try_from(position)
        .map_err(|e| StoreError::Operation(anyhow!("position {position} out of range: {e}")))
}
