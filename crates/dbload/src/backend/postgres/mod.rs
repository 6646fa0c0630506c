//! Relational backend on top of the synchronous `postgres` client.
//!
//! Every worker gets its own connection. Row ids are the sequence positions
//! themselves, so the identifier recorded for a row is its position in
//! decimal.

mod error;
pub mod migrations;
mod statements;

use std::fmt::Write as _;
use std::io::Write as _;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use log::{debug, info};
use postgres::{Client, NoTls};

use self::error::{parse_reference, row_id};
use self::statements::{query_sql, schema_change_sql, PreparedStatements, COPY_ARTICLES};
use crate::datastore::{Datastore, Query, SchemaChange, Session, StoreError};
use crate::model::{Article, Entity, Record, Table};
use crate::stage::StageKind;

pub struct PostgresStore {
    config: postgres::Config,
    migrate: bool,
}

impl PostgresStore {
    /// Parses `url`. Nothing connects until [`Datastore::prepare`].
    pub fn new(url: &str, migrate: bool) -> Result<Self, StoreError> {
        let config = postgres::Config::from_str(url)
            .map_err(|e| anyhow!("error parsing postgres connection string: {e}"))?;
        Ok(Self { config, migrate })
    }

    fn client(&self) -> Result<Client, StoreError> {
        debug!("connecting to postgres without TLS");
        Ok(self.config.connect(NoTls)?)
    }
}

impl Datastore for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn catalog(&self) -> &'static [StageKind] {
        &StageKind::RELATIONAL
    }

    fn prepare(&self) -> Result<(), StoreError> {
        let mut client = self.client()?;
        let version = migrations::applied_version(&mut client)?;
        info!("Current migration version: {version}");
        if self.migrate {
            let version = migrations::apply_all(&mut client)?;
            info!("Schema is at migration version {version}");
        } else {
            info!("Not applying migrations");
        }
        Ok(())
    }

    fn teardown(&self) -> Result<(), StoreError> {
        let mut client = self.client()?;
        migrations::reset_all(&mut client)
    }

    fn connect(&self) -> Result<Box<dyn Session>, StoreError> {
        let mut client = self.client()?;
        let statements = PreparedStatements::new(&mut client)?;
        Ok(Box::new(PostgresSession { client, statements }))
    }
}

pub struct PostgresSession {
    client: Client,
    statements: PreparedStatements,
}

impl Session for PostgresSession {
    fn insert(&mut self, table: Table, record: &Record) -> Result<String, StoreError> {
        if table.entity() != record.entity() {
            return Err(StoreError::Operation(anyhow!(
                "table {table} doesn't hold {} rows",
                record.entity()
            )));
        }
        let statement = self.statements.insert(table);
        let id = row_id(record.position())?;

        match record {
            Record::User(user) => {
                self.client
                    .execute(statement, &[&id, &user.name, &user.description])?;
            }
            Record::Article(article) => {
                let author = parse_reference(Entity::User, &article.author_id)?;
                self.client
                    .execute(statement, &[&id, &author, &article.title, &article.text])?;
            }
            Record::Comment(comment) => {
                let author = parse_reference(Entity::User, &comment.author_id)?;
                let article = parse_reference(Entity::Article, &comment.article_id)?;
                self.client.execute(
                    statement,
                    &[&id, &author, &article, &comment.title, &comment.text],
                )?;
            }
        }
        Ok(id.to_string())
    }

    fn find_user(&mut self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::MissingReference(
                "no user identifier was recorded".to_string(),
            ));
        }
        let key: i64 = id
            .parse()
            .map_err(|_| StoreError::NotFound(format!("user '{id}'")))?;
        match self.client.query_opt(&self.statements.select_user, &[&key])? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("user {key}"))),
        }
    }

    fn query(&mut self, query: Query) -> Result<u64, StoreError> {
        let rows = self.client.query(query_sql(query), &[])?;
        Ok(rows.len() as u64)
    }

    fn evolve(&mut self, change: SchemaChange) -> Result<u64, StoreError> {
        Ok(self.client.execute(schema_change_sql(change), &[])?)
    }

    fn bulk_load(&mut self, rows: &mut dyn Iterator<Item = Article>) -> Result<u64, StoreError> {
        let mut transaction = self.client.transaction()?;
        let mut writer = transaction.copy_in(COPY_ARTICLES)?;

        let mut line = String::new();
        for article in rows {
            line.clear();
            copy_row(&mut line, &article)?;
            writer
                .write_all(line.as_bytes())
                .context("failed to stream COPY data")?;
        }

        let copied = writer.finish()?;
        transaction.commit()?;
        Ok(copied)
    }
}

/// Appends `article` to `out` as one line of `COPY ... FROM STDIN` text
/// format.
fn copy_row(out: &mut String, article: &Article) -> Result<(), StoreError> {
    let id = row_id(article.position)?;
    let author = parse_reference(Entity::User, &article.author_id)?;
    // Writing to a String can't fail.
    let _ = write!(out, "{id}\t{author}\t");
    escape_copy_text(out, &article.title);
    out.push('\t');
    escape_copy_text(out, article.text);
    out.push('\n');
    Ok(())
}

fn escape_copy_text(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}
