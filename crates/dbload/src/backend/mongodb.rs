//! Document backend on top of the synchronous MongoDB driver.
//!
//! Identifiers are the hex form of the `ObjectId`s the server assigns.
//! References are stored as `ObjectId`s so that `$lookup` can match them
//! against `_id`.

use anyhow::anyhow;
use log::{debug, info};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOptions, InsertManyOptions};
use mongodb::sync::{Client, Collection, Database};
use mongodb::IndexModel;

use crate::datastore::{
    Datastore, Query, SchemaChange, Session, StoreError, DEFAULT_COLUMN, DEFAULT_COLUMN_VALUE,
};
use crate::model::{Article, Entity, Record, Table};
use crate::stage::StageKind;

/// Documents sent per `insertMany` by the bulk-load probe.
const BULK_BATCH: usize = 10_000;

/// Body of the bulk-loaded articles.
const BULK_TEXT: &str = "text";

impl From<mongodb::error::Error> for StoreError {
    fn from(value: mongodb::error::Error) -> Self {
        Self::Operation(anyhow!("mongodb error: {value}"))
    }
}

pub struct MongoStore {
    client: Client,
    database: String,
}

impl MongoStore {
    pub fn new(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .map_err(|e| anyhow!("error parsing mongodb connection string: {e}"))?;
        Ok(Self {
            client,
            database: database.to_string(),
        })
    }

    fn database(&self) -> Database {
        self.client.database(&self.database)
    }
}

impl Datastore for MongoStore {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn catalog(&self) -> &'static [StageKind] {
        &StageKind::DOCUMENT
    }

    fn prepare(&self) -> Result<(), StoreError> {
        self.database().run_command(doc! { "ping": 1 }, None)?;
        info!("Connected to mongodb, using database '{}'", self.database);
        Ok(())
    }

    fn teardown(&self) -> Result<(), StoreError> {
        info!("Dropping database {}...", self.database);
        self.database().drop(None)?;
        Ok(())
    }

    fn connect(&self) -> Result<Box<dyn Session>, StoreError> {
        // The driver pools connections; a session is just a database handle.
        Ok(Box::new(MongoSession {
            database: self.database(),
        }))
    }
}

pub struct MongoSession {
    database: Database,
}

impl MongoSession {
    fn collection(&self, table: Table) -> Result<Collection<Document>, StoreError> {
        if !matches!(table, Table::Users | Table::Articles | Table::Comments) {
            return Err(StoreError::Unsupported(format!("collection {table}")));
        }
        Ok(self.database.collection(table.name()))
    }
}

fn object_id(entity: Entity, id: &str) -> Result<ObjectId, StoreError> {
    if id.is_empty() {
        return Err(StoreError::MissingReference(format!(
            "no {entity} identifier was recorded"
        )));
    }
    ObjectId::parse_str(id)
        .map_err(|e| StoreError::MissingReference(format!("{entity} id '{id}': {e}")))
}

fn article_document(article: &Article) -> Result<Document, StoreError> {
    Ok(doc! {
        "author_id": object_id(Entity::User, &article.author_id)?,
        "title": article.title.as_str(),
        "text": article.text,
    })
}

fn bulk_document(article: &Article) -> Result<Document, StoreError> {
    Ok(doc! {
        "author_id": object_id(Entity::User, &article.author_id)?,
        "title": article.title.as_str(),
        "text": BULK_TEXT,
    })
}

fn document(record: &Record) -> Result<Document, StoreError> {
    match record {
        Record::User(user) => Ok(doc! {
            "name": user.name.as_str(),
            "description": user.description.as_str(),
        }),
        Record::Article(article) => article_document(article),
        Record::Comment(comment) => Ok(doc! {
            "author_id": object_id(Entity::User, &comment.author_id)?,
            "article_id": object_id(Entity::Article, &comment.article_id)?,
            "title": comment.title.as_str(),
            "text": comment.text,
        }),
    }
}

/// Fields indexed once an insert stage has written `table`.
fn indexed_fields(table: Table) -> &'static [&'static str] {
    match table {
        Table::Users => &["_id"],
        Table::Articles => &["_id", "author_id"],
        Table::Comments => &["_id", "author_id", "article_id"],
        Table::ArticlesSimple | Table::CommentsSimple => &[],
    }
}

fn lookups() -> Vec<Document> {
    vec![
        doc! { "$lookup": {
            "from": "articles",
            "localField": "_id",
            "foreignField": "author_id",
            "as": "author",
        }},
        doc! { "$lookup": {
            "from": "comments",
            "localField": "_id",
            "foreignField": "author_id",
            "as": "comments",
        }},
    ]
}

fn count<T>(cursor: impl Iterator<Item = mongodb::error::Result<T>>) -> Result<u64, StoreError> {
    let mut rows = 0;
    for row in cursor {
        row?;
        rows += 1;
    }
    Ok(rows)
}

impl Session for MongoSession {
    fn insert(&mut self, table: Table, record: &Record) -> Result<String, StoreError> {
        let collection = self.collection(table)?;
        let result = collection.insert_one(document(record)?, None)?;
        result
            .inserted_id
            .as_object_id()
            .map(|id| id.to_hex())
            .ok_or_else(|| {
                StoreError::Operation(anyhow!(
                    "{table}: server returned a non-ObjectId identifier {}",
                    result.inserted_id
                ))
            })
    }

    fn finish_inserts(&mut self, table: Table) -> Result<(), StoreError> {
        let collection = self.collection(table)?;
        for field in indexed_fields(table) {
            debug!("creating index on {table}.{field}");
            let mut keys = Document::new();
            keys.insert(*field, 1);
            let index = IndexModel::builder().keys(keys).build();
            collection.create_index(index, None)?;
        }
        Ok(())
    }

    fn find_user(&mut self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::MissingReference(
                "no user identifier was recorded".to_string(),
            ));
        }
        let id = ObjectId::parse_str(id).map_err(|_| StoreError::NotFound(format!("user '{id}'")))?;
        match self.collection(Table::Users)?.find_one(doc! { "_id": id }, None)? {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("user {id}"))),
        }
    }

    fn query(&mut self, query: Query) -> Result<u64, StoreError> {
        let users = self.collection(Table::Users)?;
        match query {
            Query::Joins => {
                let mut pipeline = lookups();
                pipeline.push(doc! { "$limit": 10 });
                count(users.aggregate(pipeline, None)?)
            }
            Query::Filters => {
                let options = FindOptions::builder()
                    .sort(doc! { "name": 1 })
                    .skip(0_u64)
                    .limit(10_i64)
                    .build();
                let filter = doc! {
                    "name": { "$regex": "me_1" },
                    "description": { "$regex": "scr_1" },
                };
                count(users.find(filter, options)?)
            }
            Query::JoinsAndFilters => {
                let mut pipeline = lookups();
                pipeline.push(doc! { "$match": { "name": { "$regex": "me_1" } } });
                pipeline.push(doc! { "$limit": 10 });
                count(users.aggregate(pipeline, None)?)
            }
        }
    }

    fn evolve(&mut self, change: SchemaChange) -> Result<u64, StoreError> {
        let update = match change {
            SchemaChange::AddNullableColumn => doc! { "$set": { "nullable": null } },
            SchemaChange::AddColumnWithDefault => {
                doc! { "$set": { DEFAULT_COLUMN: DEFAULT_COLUMN_VALUE } }
            }
            SchemaChange::DropColumn => doc! { "$unset": { DEFAULT_COLUMN: "" } },
        };
        let result = self
            .collection(Table::Users)?
            .update_many(doc! {}, update, None)?;
        Ok(result.modified_count)
    }

    fn bulk_load(&mut self, rows: &mut dyn Iterator<Item = Article>) -> Result<u64, StoreError> {
        let articles = self.collection(Table::Articles)?;
        let mut written = 0;
        loop {
            let batch = (&mut *rows)
                .take(BULK_BATCH)
                .map(|article| bulk_document(&article))
                .collect::<Result<Vec<_>, _>>()?;
            if batch.is_empty() {
                return Ok(written);
            }
            let options = InsertManyOptions::builder().ordered(false).build();
            written += articles.insert_many(batch, options)?.inserted_ids.len() as u64;
        }
    }
}
