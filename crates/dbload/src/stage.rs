//! Stage catalog and the runner that sequences it.
//!
//! A run is a fixed sequence of stages. Each stage is planned into
//! partitions, fanned out over the [`WorkerPool`] and fully joined before the
//! next one starts, so a stage only ever reads identifiers that earlier
//! stages finished writing.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::correlation::IdCorrelationStore;
use crate::datastore::{Datastore, Query, SchemaChange, Session, StoreError};
use crate::error::LoadError;
use crate::model::{Article, Table};
use crate::partition::{plan, uncovered, Partition, RemainderPolicy};
use crate::pool::WorkerPool;

/// One named phase of a run.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[value(rename_all = "kebab-case")]
pub enum StageKind {
    InsertUsers,
    InsertArticles,
    InsertArticlesWithoutReferences,
    InsertComments,
    InsertCommentsWithoutReferences,
    SelectUserById,
    SelectWithJoins,
    SelectWithFilters,
    SelectWithJoinsAndFilters,
    AddNullableColumn,
    AddColumnWithDefault,
    DropColumn,
    BulkLoad,
}

/// What a stage does, independent of the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Insert(Table),
    ReadByKey,
    Query(Query),
    Evolve(SchemaChange),
    BulkLoad,
}

impl StageKind {
    /// Stages of the relational backend, in execution order.
    pub const RELATIONAL: [StageKind; 13] = [
        StageKind::InsertUsers,
        StageKind::InsertArticles,
        StageKind::InsertArticlesWithoutReferences,
        StageKind::InsertComments,
        StageKind::InsertCommentsWithoutReferences,
        StageKind::SelectUserById,
        StageKind::SelectWithJoins,
        StageKind::SelectWithFilters,
        StageKind::SelectWithJoinsAndFilters,
        StageKind::AddNullableColumn,
        StageKind::AddColumnWithDefault,
        StageKind::DropColumn,
        StageKind::BulkLoad,
    ];

    /// Stages of the document backend, which has no reference-free tables.
    pub const DOCUMENT: [StageKind; 11] = [
        StageKind::InsertUsers,
        StageKind::InsertArticles,
        StageKind::InsertComments,
        StageKind::SelectUserById,
        StageKind::SelectWithJoins,
        StageKind::SelectWithFilters,
        StageKind::SelectWithJoinsAndFilters,
        StageKind::AddNullableColumn,
        StageKind::AddColumnWithDefault,
        StageKind::DropColumn,
        StageKind::BulkLoad,
    ];

    /// Name used on the command line and in errors.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::InsertUsers => "insert-users",
            StageKind::InsertArticles => "insert-articles",
            StageKind::InsertArticlesWithoutReferences => "insert-articles-without-references",
            StageKind::InsertComments => "insert-comments",
            StageKind::InsertCommentsWithoutReferences => "insert-comments-without-references",
            StageKind::SelectUserById => "select-user-by-id",
            StageKind::SelectWithJoins => "select-with-joins",
            StageKind::SelectWithFilters => "select-with-filters",
            StageKind::SelectWithJoinsAndFilters => "select-with-joins-and-filters",
            StageKind::AddNullableColumn => "add-nullable-column",
            StageKind::AddColumnWithDefault => "add-column-with-default",
            StageKind::DropColumn => "drop-column",
            StageKind::BulkLoad => "bulk-load",
        }
    }

    /// Banner logged when the stage starts.
    pub fn title(&self) -> &'static str {
        match self {
            StageKind::InsertUsers => "INSERT",
            StageKind::InsertArticles => "INSERT ARTICLES",
            StageKind::InsertArticlesWithoutReferences => "INSERT ARTICLES WITHOUT REFERENCES",
            StageKind::InsertComments => "INSERT COMMENTS",
            StageKind::InsertCommentsWithoutReferences => "INSERT COMMENTS WITHOUT REFERENCES",
            StageKind::SelectUserById => "SELECT FROM ID",
            StageKind::SelectWithJoins => "SELECT ALL WITH JOIN",
            StageKind::SelectWithFilters => "SELECT WITH FILTER",
            StageKind::SelectWithJoinsAndFilters => "SELECT ALL WITH JOIN AND FILTERS",
            StageKind::AddNullableColumn => "ADD NULLABLE COLUMN",
            StageKind::AddColumnWithDefault => "ADD COLUMN WITH DEFAULT",
            StageKind::DropColumn => "DROP COLUMN",
            StageKind::BulkLoad => "BULK INSERT ARTICLES",
        }
    }

    fn operation(&self) -> Operation {
        match self {
            StageKind::InsertUsers => Operation::Insert(Table::Users),
            StageKind::InsertArticles => Operation::Insert(Table::Articles),
            StageKind::InsertArticlesWithoutReferences => Operation::Insert(Table::ArticlesSimple),
            StageKind::InsertComments => Operation::Insert(Table::Comments),
            StageKind::InsertCommentsWithoutReferences => Operation::Insert(Table::CommentsSimple),
            StageKind::SelectUserById => Operation::ReadByKey,
            StageKind::SelectWithJoins => Operation::Query(Query::Joins),
            StageKind::SelectWithFilters => Operation::Query(Query::Filters),
            StageKind::SelectWithJoinsAndFilters => Operation::Query(Query::JoinsAndFilters),
            StageKind::AddNullableColumn => Operation::Evolve(SchemaChange::AddNullableColumn),
            StageKind::AddColumnWithDefault => Operation::Evolve(SchemaChange::AddColumnWithDefault),
            StageKind::DropColumn => Operation::Evolve(SchemaChange::DropColumn),
            StageKind::BulkLoad => Operation::BulkLoad,
        }
    }
}

impl Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one executed stage. Only used for reporting.
#[derive(Clone, Debug, PartialEq)]
pub struct StageResult {
    pub stage: StageKind,
    /// Rows written, read or modified.
    pub rows: u64,
    pub elapsed: Duration,
    /// Mean per-worker latency, for stages that sample one.
    pub mean_latency_ms: Option<f64>,
}

impl StageResult {
    pub fn rows_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows as f64 / secs
        } else {
            0.0
        }
    }
}

/// Tears the datastore down exactly once.
///
/// [`Teardown::run`] can be called any number of times; only the first call
/// reaches the store. If it was never called the guard runs it on drop, so
/// an early return or a panic still cleans up.
pub struct Teardown<'a> {
    store: &'a dyn Datastore,
    done: AtomicBool,
}

impl<'a> Teardown<'a> {
    pub fn new(store: &'a dyn Datastore) -> Self {
        Self {
            store,
            done: AtomicBool::new(false),
        }
    }

    pub fn run(&self) -> Result<(), LoadError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Tearing down {} datastore...", self.store.name());
        self.store
            .teardown()
            .map_err(|e| LoadError::Teardown(e.into()))
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.run() {
            error!("{:#}", anyhow::Error::from(e));
        }
    }
}

/// Runs a backend's stage catalog against a [`RunContext`].
pub struct StageRunner<'a> {
    store: &'a dyn Datastore,
    context: RunContext,
    pool: WorkerPool,
}

impl<'a> StageRunner<'a> {
    pub fn new(store: &'a dyn Datastore, config: RunConfig) -> Self {
        Self {
            store,
            pool: WorkerPool::new(config.on_error),
            context: RunContext::new(config),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Prepares the store, runs every selected stage of its catalog in order
    /// and tears the store down.
    ///
    /// Stage `k` is skipped when the configured cutoff is greater than `k`.
    /// Teardown runs whether or not a stage failed; if both fail, the stage's
    /// error is returned and the teardown error is logged.
    pub fn run(&self) -> Result<Vec<StageResult>, LoadError> {
        let teardown = Teardown::new(self.store);
        let results = self.run_catalog();

        match (results, teardown.run()) {
            (Ok(results), Ok(())) => Ok(results),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_error)) => {
                error!("{:#}", anyhow::Error::from(teardown_error));
                Err(e)
            }
        }
    }

    fn run_catalog(&self) -> Result<Vec<StageResult>, LoadError> {
        info!("Preparing {} datastore", self.store.name());
        self.store
            .prepare()
            .map_err(|e| LoadError::Setup(e.into()))?;

        let mut results = Vec::new();
        for (ordinal, &kind) in self.store.catalog().iter().enumerate() {
            if !self.context.config.selects(ordinal, kind) {
                debug!("Skipping stage {ordinal} ({kind})");
                continue;
            }
            results.push(self.run_stage(kind)?);
        }
        Ok(results)
    }

    /// Runs a single stage, regardless of the cutoff.
    pub fn run_stage(&self, kind: StageKind) -> Result<StageResult, LoadError> {
        info!("========== {} ==========", kind.title());
        let start = Instant::now();

        let rows = match kind.operation() {
            Operation::Insert(table) => self.insert(kind, table)?,
            Operation::ReadByKey => self.read_by_key(kind)?,
            Operation::Query(query) => self.with_session(kind, |session| session.query(query))?,
            Operation::Evolve(change) => {
                self.with_session(kind, |session| session.evolve(change))?
            }
            Operation::BulkLoad => self.bulk_load(kind)?,
        };

        let result = StageResult {
            stage: kind,
            rows,
            elapsed: start.elapsed(),
            mean_latency_ms: self.context.metrics.mean(kind),
        };
        let verb = match kind.operation() {
            Operation::Insert(_) | Operation::BulkLoad => "Inserted",
            Operation::ReadByKey | Operation::Query(_) => "Selected",
            Operation::Evolve(_) => "Updated",
        };
        info!("{verb} {} rows in {:?}", result.rows, result.elapsed);
        if let Some(mean) = result.mean_latency_ms {
            info!("Mean latency {mean:.3} ms");
        }
        Ok(result)
    }

    fn connect(&self, kind: StageKind) -> Result<Box<dyn Session>, LoadError> {
        self.store
            .connect()
            .map_err(|e| LoadError::in_stage(kind, e))
    }

    fn with_session<F>(&self, kind: StageKind, op: F) -> Result<u64, LoadError>
    where
        F: FnOnce(&mut dyn Session) -> Result<u64, StoreError>,
    {
        let mut session = self.connect(kind)?;
        op(session.as_mut()).map_err(|e| LoadError::in_stage(kind, e))
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.context.config.progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{human_pos} / {human_len} [{wide_bar}] {percent:.2} % {per_sec:.2} {eta}",
        ) {
            progress.set_style(style.progress_chars("=>-"));
        }
        progress
    }

    fn insert(&self, kind: StageKind, table: Table) -> Result<u64, LoadError> {
        let ctx = &self.context;
        let workers = ctx.config.workers;
        let total = ctx.counts.for_table(table);
        let partitions = plan(total, workers, ctx.config.remainder)?;
        let excluded = uncovered(total, &partitions);
        if excluded > 0 {
            warn!("{excluded} rows of {table} don't divide evenly over {workers} workers and are not inserted");
        }
        info!("Insert {} {table} in progress...", total - excluded);
        info!("Use connection pool size = {workers}");

        // Only rows referenced by later stages are recorded.
        let ids: Option<&IdCorrelationStore> = match table {
            Table::Users => Some(&ctx.users),
            Table::Articles => Some(&ctx.articles),
            _ => None,
        };

        let progress = self.progress_bar(total - excluded);
        let report = self.pool.run(
            &partitions,
            |_: &Partition| self.connect(kind),
            |session: &mut Box<dyn Session>, position| {
                let record = ctx.record(table, position);
                let id = session
                    .insert(table, &record)
                    .map_err(|e| LoadError::in_stage(kind, e))?;
                if let Some(ids) = ids {
                    ids.put(position, id)?;
                }
                progress.inc(1);
                Ok(())
            },
        );
        progress.finish_and_clear();
        let report = report?;

        self.connect(kind)?
            .finish_inserts(table)
            .map_err(|e| LoadError::in_stage(kind, e))?;

        if table == Table::Comments {
            debug!("Releasing {} article identifiers", ctx.articles.len());
            ctx.articles.reset();
        }
        Ok(report.processed as u64)
    }

    /// One timed lookup per worker, of a user drawn at random from the
    /// inserted range.
    fn read_by_key(&self, kind: StageKind) -> Result<u64, LoadError> {
        let ctx = &self.context;
        let workers = ctx.config.workers;
        let key_space = ctx.user_key_space();
        if key_space == 0 {
            return Err(LoadError::InvalidConfiguration(format!(
                "{} users over {workers} workers leaves nothing to read",
                ctx.counts.users
            )));
        }
        info!("Select {workers} users by id in progress...");

        let seed = ctx.config.seed;
        let partitions = plan(workers, workers, RemainderPolicy::Drop)?;
        let report = self.pool.run(
            &partitions,
            |partition: &Partition| {
                let rng = match seed {
                    Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(partition.worker as u64)),
                    None => SmallRng::from_entropy(),
                };
                Ok((self.connect(kind)?, rng))
            },
            |(session, rng): &mut (Box<dyn Session>, SmallRng), _| {
                let position = rng.gen_range(0..key_space);
                let start = Instant::now();
                read_user(session.as_mut(), &ctx.users, position)
                    .map_err(|e| LoadError::in_stage(kind, e))?;
                ctx.metrics.record_elapsed(kind, start);
                Ok(())
            },
        )?;
        Ok(report.processed as u64)
    }

    fn bulk_load(&self, kind: StageKind) -> Result<u64, LoadError> {
        let ctx = &self.context;
        let count = ctx.counts.bulk;
        info!("Bulk insert {count} articles in progress...");

        let progress = self.progress_bar(count);
        let mut rows = (0..count).map(|n| {
            progress.inc(1);
            Article::bulk(n, count, ctx.users.get(Article::bulk_author_position(n)))
        });
        let written = self.with_session(kind, |session| session.bulk_load(&mut rows));
        progress.finish_and_clear();
        written
    }
}

/// Fetches the user inserted at `position`.
///
/// A position that was never inserted resolves to an empty identifier, which
/// the store rejects.
pub fn read_user(
    session: &mut dyn Session,
    users: &IdCorrelationStore,
    position: usize,
) -> Result<(), StoreError> {
    session.find_user(&users.get(position))
}
