//! State shared by the stages of one run.

use crate::config::RunConfig;
use crate::correlation::IdCorrelationStore;
use crate::metrics::MetricsAggregator;
use crate::model::{Article, Comment, Entity, Record, Table, User};
use crate::partition::{plan, uncovered};

/// Number of rows generated per entity kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowCounts {
    pub users: usize,
    pub articles: usize,
    pub comments: usize,
    /// Rows written by the bulk-load probe.
    pub bulk: usize,
}

impl RowCounts {
    /// Fixed counts used with `--large-preset`.
    pub const LARGE: RowCounts = RowCounts {
        users: 100_000,
        articles: 1_000_000,
        comments: 10_000_000,
        bulk: 1_000_000,
    };

    /// The same count for every kind.
    pub fn uniform(rows: usize) -> Self {
        Self {
            users: rows,
            articles: rows,
            comments: rows,
            bulk: rows,
        }
    }

    /// Rows written into `table` by its insert stage.
    pub fn for_table(&self, table: Table) -> usize {
        match table.entity() {
            Entity::User => self.users,
            Entity::Article => self.articles,
            Entity::Comment => self.comments,
        }
    }
}

/// Everything a stage reads or writes besides the store itself.
///
/// Owned by the [`StageRunner`](crate::stage::StageRunner) and lent to every
/// worker of every stage. The correlation stores are the only state workers
/// mutate concurrently.
#[derive(Debug)]
pub struct RunContext {
    pub config: RunConfig,
    pub counts: RowCounts,
    /// Identifiers of inserted users, kept for the whole run.
    pub users: IdCorrelationStore,
    /// Identifiers of inserted articles, reset once comments are written.
    pub articles: IdCorrelationStore,
    pub metrics: MetricsAggregator,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        let counts = config.row_counts();
        Self {
            users: IdCorrelationStore::with_capacity(Entity::User, counts.users),
            articles: IdCorrelationStore::new(Entity::Article),
            metrics: MetricsAggregator::new(config.workers),
            counts,
            config,
        }
    }

    /// Builds the row at `position` of `table`, resolving its references
    /// through the correlation stores.
    pub fn record(&self, table: Table, position: usize) -> Record {
        match table {
            Table::Users => Record::User(User::new(position)),
            Table::Articles => Record::Article(Article::new(
                position,
                self.users.get(Article::author_position(position)),
            )),
            Table::ArticlesSimple => Record::Article(Article::new(position, position.to_string())),
            Table::Comments => Record::Comment(Comment::new(
                position,
                self.users.get(Comment::author_position(position)),
                self.articles.get(Comment::article_position(position)),
            )),
            Table::CommentsSimple => Record::Comment(Comment::new(
                position,
                position.to_string(),
                position.to_string(),
            )),
        }
    }

    /// The user positions the insert stage writes, `[0, n)`.
    ///
    /// Smaller than the user count when the remainder policy leaves rows out.
    pub fn user_key_space(&self) -> usize {
        let users = self.counts.users;
        match plan(users, self.config.workers, self.config.remainder) {
            Ok(partitions) => users - uncovered(users, &partitions),
            Err(_) => 0,
        }
    }
}
