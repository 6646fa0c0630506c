//! Schema migrations of the relational backend.
//!
//! The forward migrations are the `V<n>__*.sql` files under `migrations/`,
//! embedded at compile time and applied one version at a time. Undoing them
//! is done with [`DOWN`], newest first, followed by dropping the history
//! table, so a reset leaves the database as it was before the first run.

use anyhow::anyhow;
use log::{debug, info};
use postgres::Client;
use refinery::Target;

use crate::datastore::StoreError;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("./migrations/");
}

/// Table in which refinery records applied migrations.
const HISTORY_TABLE: &str = "refinery_schema_history";

/// Statements undoing each migration, by version.
const DOWN: [(i64, &str); 4] = [
    (1, "DROP TABLE IF EXISTS users"),
    (2, "DROP TABLE IF EXISTS articles"),
    (3, "DROP TABLE IF EXISTS comments"),
    (
        4,
        "DROP TABLE IF EXISTS articles_simple; DROP TABLE IF EXISTS comments_simple",
    ),
];

/// Highest version among the embedded migrations.
#[cfg(test)]
fn latest_version() -> i64 {
    embedded::migrations::runner()
        .get_migrations()
        .iter()
        .map(|m| i64::from(m.version()))
        .max()
        .unwrap_or(0)
}

/// Version of the last applied migration, or 0 if none was applied.
pub fn applied_version(client: &mut Client) -> Result<i64, StoreError> {
    let exists: bool = client
        .query_one(
            format!("SELECT to_regclass('{HISTORY_TABLE}') IS NOT NULL").as_str(),
            &[],
        )?
        .get(0);
    if !exists {
        return Ok(0);
    }
    let version: i32 = client
        .query_one(
            format!("SELECT COALESCE(MAX(version), 0) FROM {HISTORY_TABLE}").as_str(),
            &[],
        )?
        .get(0);
    Ok(i64::from(version))
}

/// Applies the oldest pending migration and returns its version, or `None`
/// if every migration is already applied.
pub fn apply_next(client: &mut Client) -> Result<Option<i64>, StoreError> {
    let next = applied_version(client)? + 1;
    let runner = embedded::migrations::runner();
    let Some(migration) = runner
        .get_migrations()
        .iter()
        .find(|m| i64::from(m.version()) == next)
    else {
        debug!("no migration pending after V{}", next - 1);
        return Ok(None);
    };
    let name = migration.name().to_string();

    let target = u32::try_from(next).map_err(|e| anyhow!("invalid version {next}: {e}"))?;
    runner
        .set_target(Target::Version(target))
        .run(client)
        .map_err(|e| anyhow!("failed to apply migration V{next}__{name}: {e}"))?;

    info!("Applied migration V{next}__{name}");
    Ok(Some(next))
}

/// Applies every pending migration and returns the resulting version.
pub fn apply_all(client: &mut Client) -> Result<i64, StoreError> {
    let mut version = applied_version(client)?;
    while let Some(applied) = apply_next(client)? {
        version = applied;
    }
    Ok(version)
}

/// Undoes every migration, newest first, and forgets the migration history.
///
/// Does nothing if no migration was ever applied.
pub fn reset_all(client: &mut Client) -> Result<(), StoreError> {
    info!("Reset all migrations...");
    let mut sql = String::new();
    for (version, down) in DOWN.iter().rev() {
        debug!("undoing migration V{version}");
        sql.push_str(down);
        sql.push_str(";\n");
    }
    sql.push_str(&format!("DROP TABLE IF EXISTS {HISTORY_TABLE};"));
    client.batch_execute(&sql)?;
    Ok(())
}
