use anyhow::anyhow;
use postgres::{Client, Statement};

use crate::datastore::{Query, SchemaChange, StoreError};
use crate::model::Table;

const SELECT_USER: &str = "SELECT * FROM users WHERE id = $1";

const SELECT_WITH_JOINS: &str = r#"SELECT *
    FROM users
    JOIN articles ON articles.author_id = users.id
    JOIN comments ON comments.author_id = users.id
    LIMIT 10 OFFSET 1"#;

const SELECT_WITH_FILTERS: &str = r#"SELECT *
    FROM users
    WHERE name like '%name%' AND MOD(id, 2) = 0
    LIMIT 10 OFFSET 1"#;

const SELECT_WITH_JOINS_AND_FILTERS: &str = r#"SELECT *
    FROM users
    JOIN articles ON articles.author_id = users.id
    JOIN comments ON comments.author_id = users.id
    WHERE users.name like '%name%' AND MOD(users.id, 2) = 0
        AND comments.title like '%tit%' AND MOD(comments.author_id, 2) = 0
    LIMIT 10 OFFSET 1"#;

pub(super) const COPY_ARTICLES: &str = "COPY articles (id, author_id, title, text) FROM STDIN";

pub(super) fn query_sql(query: Query) -> &'static str {
    match query {
        Query::Joins => SELECT_WITH_JOINS,
        Query::Filters => SELECT_WITH_FILTERS,
        Query::JoinsAndFilters => SELECT_WITH_JOINS_AND_FILTERS,
    }
}

pub(super) fn schema_change_sql(change: SchemaChange) -> &'static str {
    match change {
        SchemaChange::AddNullableColumn => "ALTER TABLE users ADD COLUMN nullable_column TEXT",
        SchemaChange::AddColumnWithDefault => {
            "ALTER TABLE users ADD COLUMN default_column TEXT NOT NULL DEFAULT 'default text in new column'"
        }
        SchemaChange::DropColumn => "ALTER TABLE users DROP COLUMN default_column",
    }
}

fn insert_sql(table: Table) -> String {
    let columns = match table {
        Table::Users => "id, name, description",
        Table::Articles | Table::ArticlesSimple => "id, author_id, title, text",
        Table::Comments | Table::CommentsSimple => "id, author_id, article_id, title, text",
    };
    let params = (1..=columns.split(", ").count())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table} ({columns}) VALUES ({params})")
}

/// Statements a session runs once per row, prepared when it connects.
#[derive(Debug)]
pub(super) struct PreparedStatements {
    pub insert_user: Statement,
    pub insert_article: Statement,
    pub insert_article_simple: Statement,
    pub insert_comment: Statement,
    pub insert_comment_simple: Statement,
    pub select_user: Statement,
}

impl PreparedStatements {
    pub fn new(client: &mut Client) -> Result<Self, StoreError> {
        let mut prepare = |sql: &str| {
            client.prepare(sql).map_err(|e| {
                StoreError::Operation(anyhow!("failed to prepare statement `{sql}`: {e}"))
            })
        };

        Ok(PreparedStatements {
            insert_user: prepare(&insert_sql(Table::Users))?,
            insert_article: prepare(&insert_sql(Table::Articles))?,
            insert_article_simple: prepare(&insert_sql(Table::ArticlesSimple))?,
            insert_comment: prepare(&insert_sql(Table::Comments))?,
            insert_comment_simple: prepare(&insert_sql(Table::CommentsSimple))?,
            select_user: prepare(SELECT_USER)?,
        })
    }

    pub fn insert(&self, table: Table) -> &Statement {
        match table {
            Table::Users => &self.insert_user,
            Table::Articles => &self.insert_article,
            Table::ArticlesSimple => &self.insert_article_simple,
            Table::Comments => &self.insert_comment,
            Table::CommentsSimple => &self.insert_comment_simple,
        }
    }
}
