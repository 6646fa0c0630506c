//! Engine tests against an in-memory datastore.
//!
//! [`MemoryStore`] assigns opaque identifiers, checks references the way a
//! foreign key would and can be told to fail at a given row, so the whole
//! stage sequence runs without a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use pretty_assertions::assert_eq;

use crate::config::RunConfig;
use crate::datastore::{Datastore, Query, SchemaChange, Session, StoreError, DEFAULT_COLUMN};
use crate::error::LoadError;
use crate::model::{Article, Entity, Record, Table};
use crate::partition::{plan, RemainderPolicy};
use crate::pool::FailurePolicy;
use crate::stage::{read_user, StageKind, StageRunner, Teardown};

#[derive(Default)]
struct State {
    rows: HashMap<Table, HashMap<String, Record>>,
    columns: HashSet<&'static str>,
    indexed: Vec<Table>,
    bulk_rows: usize,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_id: AtomicUsize,
    prepared: AtomicUsize,
    teardowns: AtomicUsize,
    fail_insert: Mutex<Option<(Table, usize)>>,
    fail_prepare: AtomicBool,
    fail_teardown: AtomicBool,
}

pub(crate) struct MemoryStore {
    inner: Arc<Inner>,
    catalog: &'static [StageKind],
}

impl MemoryStore {
    pub fn relational() -> Self {
        Self {
            inner: Arc::default(),
            catalog: &StageKind::RELATIONAL,
        }
    }

    pub fn document() -> Self {
        Self {
            inner: Arc::default(),
            catalog: &StageKind::DOCUMENT,
        }
    }

    /// Makes the insert of `position` into `table` fail.
    pub fn fail_insert_at(&self, table: Table, position: usize) {
        *self.inner.fail_insert.lock().unwrap() = Some((table, position));
    }

    pub fn fail_prepare(&self) {
        self.inner.fail_prepare.store(true, Ordering::SeqCst);
    }

    pub fn fail_teardown(&self) {
        self.inner.fail_teardown.store(true, Ordering::SeqCst);
    }

    pub fn prepared(&self) -> usize {
        self.inner.prepared.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.inner.teardowns.load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: Table) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.rows.get(&table).map_or(0, HashMap::len)
    }

    pub fn indexed(&self) -> Vec<Table> {
        self.inner.state.lock().unwrap().indexed.clone()
    }

    pub fn bulk_rows(&self) -> usize {
        self.inner.state.lock().unwrap().bulk_rows
    }
}

impl Datastore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn catalog(&self) -> &'static [StageKind] {
        self.catalog
    }

    fn prepare(&self) -> Result<(), StoreError> {
        self.inner.prepared.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_prepare.load(Ordering::SeqCst) {
            return Err(anyhow!("migration failed").into());
        }
        Ok(())
    }

    fn teardown(&self) -> Result<(), StoreError> {
        self.inner.teardowns.fetch_add(1, Ordering::SeqCst);
        *self.inner.state.lock().unwrap() = State::default();
        if self.inner.fail_teardown.load(Ordering::SeqCst) {
            return Err(anyhow!("connection lost during teardown").into());
        }
        Ok(())
    }

    fn connect(&self) -> Result<Box<dyn Session>, StoreError> {
        Ok(Box::new(MemorySession {
            inner: self.inner.clone(),
        }))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
}

fn check_reference(state: &State, table: Table, entity: Entity, id: &str) -> Result<(), StoreError> {
    let known = state
        .rows
        .get(&table)
        .is_some_and(|rows| rows.contains_key(id));
    if known {
        Ok(())
    } else {
        Err(StoreError::MissingReference(format!("{entity} '{id}'")))
    }
}

impl Session for MemorySession {
    fn insert(&mut self, table: Table, record: &Record) -> Result<String, StoreError> {
        if *self.inner.fail_insert.lock().unwrap() == Some((table, record.position())) {
            return Err(anyhow!("injected failure at {table} {}", record.position()).into());
        }

        let mut state = self.inner.state.lock().unwrap();
        if table.has_references() {
            match record {
                Record::Article(article) => {
                    check_reference(&state, Table::Users, Entity::User, &article.author_id)?;
                }
                Record::Comment(comment) => {
                    check_reference(&state, Table::Users, Entity::User, &comment.author_id)?;
                    check_reference(&state, Table::Articles, Entity::Article, &comment.article_id)?;
                }
                Record::User(_) => {}
            }
        }

        let id = format!(
            "{}-{}",
            record.entity(),
            self.inner.next_id.fetch_add(1, Ordering::SeqCst)
        );
        state
            .rows
            .entry(table)
            .or_default()
            .insert(id.clone(), record.clone());
        Ok(id)
    }

    fn finish_inserts(&mut self, table: Table) -> Result<(), StoreError> {
        self.inner.state.lock().unwrap().indexed.push(table);
        Ok(())
    }

    fn find_user(&mut self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::MissingReference("empty user id".to_string()));
        }
        let state = self.inner.state.lock().unwrap();
        match state.rows.get(&Table::Users).and_then(|users| users.get(id)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("user '{id}'"))),
        }
    }

    fn query(&mut self, query: Query) -> Result<u64, StoreError> {
        let state = self.inner.state.lock().unwrap();
        let users = state.rows.get(&Table::Users);
        let matching = users.map_or(0, |users| match query {
            Query::Joins => users.len(),
            Query::Filters | Query::JoinsAndFilters => users
                .values()
                .filter(|user| matches!(user, Record::User(u) if u.name.contains("me_1")))
                .count(),
        });
        Ok(matching.min(10) as u64)
    }

    fn evolve(&mut self, change: SchemaChange) -> Result<u64, StoreError> {
        let mut state = self.inner.state.lock().unwrap();
        let changed = match change {
            SchemaChange::AddNullableColumn => state.columns.insert("nullable_column"),
            SchemaChange::AddColumnWithDefault => state.columns.insert(DEFAULT_COLUMN),
            SchemaChange::DropColumn => state.columns.remove(DEFAULT_COLUMN),
        };
        if !changed {
            return Err(anyhow!("{change:?} doesn't apply to the users table").into());
        }
        Ok(state.rows.get(&Table::Users).map_or(0, HashMap::len) as u64)
    }

    fn bulk_load(&mut self, rows: &mut dyn Iterator<Item = Article>) -> Result<u64, StoreError> {
        let mut state = self.inner.state.lock().unwrap();
        let mut written = 0;
        for article in rows {
            check_reference(&state, Table::Users, Entity::User, &article.author_id)?;
            written += 1;
        }
        state.bulk_rows += written;
        Ok(written as u64)
    }
}

fn config(rows: usize, workers: usize) -> RunConfig {
    RunConfig::new(rows, workers).unwrap()
}

#[test]
fn full_relational_run() {
    let store = MemoryStore::relational();
    let runner = StageRunner::new(&store, config(100, 10));
    let results = runner.run().unwrap();

    let stages: Vec<StageKind> = results.iter().map(|r| r.stage).collect();
    assert_eq!(stages, StageKind::RELATIONAL.to_vec());

    let rows: Vec<u64> = results.iter().map(|r| r.rows).collect();
    // Inserts, one read per worker, three queries capped at 10, three schema
    // changes touching every user, then the bulk load.
    assert_eq!(
        rows,
        vec![100, 100, 100, 100, 100, 10, 10, 10, 10, 100, 100, 100, 100]
    );

    assert!(results[5].mean_latency_ms.is_some());
    assert!(results
        .iter()
        .filter(|r| r.stage != StageKind::SelectUserById)
        .all(|r| r.mean_latency_ms.is_none()));

    assert_eq!(store.prepared(), 1);
    assert_eq!(store.teardowns(), 1);
    // Teardown dropped everything.
    assert_eq!(store.rows(Table::Users), 0);
}

#[test]
fn full_document_run() {
    let store = MemoryStore::document();
    let runner = StageRunner::new(&store, config(50, 5));
    let results = runner.run().unwrap();

    assert_eq!(results.len(), 11);
    assert_eq!(results[2].stage, StageKind::InsertComments);
    assert_eq!(results[10].rows, 50);
    assert_eq!(store.teardowns(), 1);
}

#[test]
fn identifiers_flow_between_stages() {
    let store = MemoryStore::relational();
    let runner = StageRunner::new(&store, config(2000, 8));

    runner.run_stage(StageKind::InsertUsers).unwrap();
    runner.run_stage(StageKind::InsertArticles).unwrap();
    assert_eq!(runner.context().users.len(), 2000);
    assert_eq!(runner.context().articles.len(), 2000);

    runner.run_stage(StageKind::InsertComments).unwrap();
    assert_eq!(store.rows(Table::Comments), 2000);
    // Article identifiers are released once comments are written.
    assert!(runner.context().articles.is_empty());
    assert_eq!(runner.context().users.len(), 2000);

    runner.run_stage(StageKind::BulkLoad).unwrap();
    assert_eq!(store.bulk_rows(), 2000);
    assert_eq!(
        store.indexed(),
        vec![Table::Users, Table::Articles, Table::Comments]
    );
}

#[test]
fn skipping_the_writer_stage_breaks_its_readers() {
    let store = MemoryStore::relational();
    let mut config = config(100, 4);
    config.skip_below = 1;

    let error = StageRunner::new(&store, config).run().unwrap_err();
    assert!(error.is_reference_integrity(), "{error}");
    assert_eq!(error.stage(), Some(StageKind::InsertArticles));
    assert_eq!(store.teardowns(), 1);
}

#[test]
fn reference_free_tables_run_without_writers() {
    let store = MemoryStore::relational();
    let mut config = config(100, 4);
    config.stages = vec![
        StageKind::InsertArticlesWithoutReferences,
        StageKind::InsertCommentsWithoutReferences,
    ];

    let results = StageRunner::new(&store, config).run().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.rows == 100));
}

#[test]
fn failing_stage_still_tears_down() {
    let store = MemoryStore::relational();
    store.fail_insert_at(Table::Comments, 42);

    let error = StageRunner::new(&store, config(100, 10)).run().unwrap_err();
    assert!(matches!(
        error,
        LoadError::Backend {
            stage: StageKind::InsertComments,
            ..
        }
    ));
    assert_eq!(store.teardowns(), 1);
}

#[test]
fn teardown_failure_does_not_mask_the_stage_error() {
    let store = MemoryStore::relational();
    store.fail_insert_at(Table::Users, 0);
    store.fail_teardown();

    let error = StageRunner::new(&store, config(10, 2)).run().unwrap_err();
    assert_eq!(error.stage(), Some(StageKind::InsertUsers));
}

#[test]
fn teardown_failure_after_success_is_reported() {
    let store = MemoryStore::relational();
    store.fail_teardown();
    let mut config = config(10, 2);
    config.stages = vec![StageKind::InsertUsers];

    let error = StageRunner::new(&store, config).run().unwrap_err();
    assert!(matches!(error, LoadError::Teardown(_)));
}

#[test]
fn failed_setup_still_tears_down() {
    let store = MemoryStore::relational();
    store.fail_prepare();

    let error = StageRunner::new(&store, config(10, 2)).run().unwrap_err();
    assert!(matches!(error, LoadError::Setup(_)));
    assert_eq!(store.prepared(), 1);
    assert_eq!(store.teardowns(), 1);
}

#[test]
fn teardown_is_idempotent() {
    let store = MemoryStore::relational();

    let guard = Teardown::new(&store);
    guard.run().unwrap();
    guard.run().unwrap();
    drop(guard);
    assert_eq!(store.teardowns(), 1);

    // The store itself also tolerates repeated teardowns.
    store.teardown().unwrap();
    store.teardown().unwrap();
    assert_eq!(store.teardowns(), 3);
}

#[test]
fn dropped_guard_tears_down() {
    let store = MemoryStore::relational();
    {
        let _guard = Teardown::new(&store);
    }
    assert_eq!(store.teardowns(), 1);
}

#[test]
fn read_every_inserted_user() {
    let store = MemoryStore::relational();
    let runner = StageRunner::new(&store, config(100, 10));

    let partitions = plan(100, 10, RemainderPolicy::LastPartition).unwrap();
    assert!(partitions.iter().all(|p| p.len() == 10));

    runner.run_stage(StageKind::InsertUsers).unwrap();
    let users = &runner.context().users;
    let mut session = store.connect().unwrap();

    for position in 0..100 {
        read_user(session.as_mut(), users, position).unwrap();
    }
    // Positions that were never inserted have no identifier.
    for position in [100, 101, 1000] {
        assert!(matches!(
            read_user(session.as_mut(), users, position),
            Err(StoreError::MissingReference(_))
        ));
    }
    assert!(matches!(
        session.find_user("user-999999"),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn reading_users_that_were_never_inserted() {
    let store = MemoryStore::relational();
    let mut config = config(100, 10);
    config.stages = vec![StageKind::SelectUserById];

    let error = StageRunner::new(&store, config).run().unwrap_err();
    assert!(error.is_reference_integrity(), "{error}");
    assert_eq!(error.stage(), Some(StageKind::SelectUserById));
    assert_eq!(store.teardowns(), 1);
}

#[test]
fn read_stage_samples_once_per_worker() {
    let store = MemoryStore::relational();
    let mut config = config(100, 10);
    config.seed = Some(7);
    let runner = StageRunner::new(&store, config);

    runner.run_stage(StageKind::InsertUsers).unwrap();
    let result = runner.run_stage(StageKind::SelectUserById).unwrap();

    assert_eq!(result.rows, 10);
    assert_eq!(
        runner
            .context()
            .metrics
            .samples(StageKind::SelectUserById)
            .len(),
        10
    );
    assert!(result.mean_latency_ms.is_some());
}

#[test]
fn dropped_remainder_is_never_written() {
    let store = MemoryStore::relational();
    let mut config = config(103, 10);
    config.remainder = RemainderPolicy::Drop;
    let runner = StageRunner::new(&store, config);

    let result = runner.run_stage(StageKind::InsertUsers).unwrap();
    assert_eq!(result.rows, 100);
    assert_eq!(runner.context().users.try_get(102), None);

    // Reads only draw from the written range.
    runner.run_stage(StageKind::SelectUserById).unwrap();
}

#[test]
fn drain_policy_reports_the_first_error() {
    let store = MemoryStore::relational();
    store.fail_insert_at(Table::Users, 5);
    let mut config = config(100, 10);
    config.on_error = FailurePolicy::Drain;
    let runner = StageRunner::new(&store, config);

    let error = runner.run_stage(StageKind::InsertUsers).unwrap_err();
    assert_eq!(error.stage(), Some(StageKind::InsertUsers));
    // Every other worker finished its range.
    assert_eq!(store.rows(Table::Users), 95);
}
