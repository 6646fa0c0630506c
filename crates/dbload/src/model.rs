//! Synthetic entities written by the insert stages.
//!
//! Every field value is derived from the entity's sequence position, so two
//! runs with the same row counts write the same data. References to other
//! entities are backend identifiers looked up in the correlation stores.

use std::fmt::{self, Display};

/// Body shared by every article and comment.
pub const LOREM_TEXT: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod \
tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud exercitation \
ullamco laboris nisi ut aliquip ex ea commodo consequat. Duis aute irure dolor in reprehenderit in \
voluptate velit esse cillum dolore eu fugiat nulla pariatur. Excepteur sint occaecat cupidatat non \
proident, sunt in culpa qui officia deserunt mollit anim id est laborum.";

/// Number of consecutive articles written by the same user.
pub const ARTICLES_PER_AUTHOR: usize = 100;

/// Number of consecutive comments sharing an author and an article.
pub const COMMENTS_PER_PARENT: usize = 1000;

/// Number of consecutive bulk-loaded articles written by the same user.
pub const BULK_ARTICLES_PER_AUTHOR: usize = 1000;

/// The kinds of entity the harness generates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Entity {
    User,
    Article,
    Comment,
}

impl Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::User => "user",
            Entity::Article => "article",
            Entity::Comment => "comment",
        };
        f.write_str(name)
    }
}

/// Destination of an insert stage.
///
/// The `*Simple` tables hold the same rows as their counterparts but without
/// foreign keys, so they measure raw insert cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Articles,
    ArticlesSimple,
    Comments,
    CommentsSimple,
}

impl Table {
    /// Name of the table or collection in the store.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Articles => "articles",
            Table::ArticlesSimple => "articles_simple",
            Table::Comments => "comments",
            Table::CommentsSimple => "comments_simple",
        }
    }

    pub fn entity(&self) -> Entity {
        match self {
            Table::Users => Entity::User,
            Table::Articles | Table::ArticlesSimple => Entity::Article,
            Table::Comments | Table::CommentsSimple => Entity::Comment,
        }
    }

    /// Whether rows of this table reference identifiers written by earlier
    /// stages.
    pub fn has_references(&self) -> bool {
        matches!(self, Table::Articles | Table::Comments)
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub position: usize,
    pub name: String,
    pub description: String,
}

impl User {
    pub fn new(position: usize) -> Self {
        Self {
            position,
            name: format!("name_{position}"),
            description: format!("descr_{position}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Article {
    pub position: usize,
    /// Identifier of the author, as issued by the store.
    pub author_id: String,
    pub title: String,
    pub text: &'static str,
}

impl Article {
    pub fn new(position: usize, author_id: String) -> Self {
        Self {
            position,
            author_id,
            title: format!("title_{position}"),
            text: LOREM_TEXT,
        }
    }

    /// The `n`th row of a bulk load of `count` articles.
    ///
    /// Bulk-loaded articles sit at positions `2 * count + n` so that they
    /// never collide with the rows of the article insert stage.
    pub fn bulk(n: usize, count: usize, author_id: String) -> Self {
        Self {
            position: 2 * count + n,
            author_id,
            title: format!("title_{n}"),
            text: LOREM_TEXT,
        }
    }

    /// Position of the user that wrote the article at `position`.
    pub fn author_position(position: usize) -> usize {
        position / ARTICLES_PER_AUTHOR
    }

    /// Position of the user that wrote the `n`th bulk-loaded article.
    pub fn bulk_author_position(n: usize) -> usize {
        n / BULK_ARTICLES_PER_AUTHOR
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comment {
    pub position: usize,
    pub author_id: String,
    pub article_id: String,
    pub title: String,
    pub text: &'static str,
}

impl Comment {
    pub fn new(position: usize, author_id: String, article_id: String) -> Self {
        Self {
            position,
            author_id,
            article_id,
            title: format!("title_{position}"),
            text: LOREM_TEXT,
        }
    }

    pub fn author_position(position: usize) -> usize {
        position / COMMENTS_PER_PARENT
    }

    pub fn article_position(position: usize) -> usize {
        position / COMMENTS_PER_PARENT
    }
}

/// A row ready to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    User(User),
    Article(Article),
    Comment(Comment),
}

impl Record {
    pub fn position(&self) -> usize {
        match self {
            Record::User(user) => user.position,
            Record::Article(article) => article.position,
            Record::Comment(comment) => comment.position,
        }
    }

    pub fn entity(&self) -> Entity {
        match self {
            Record::User(_) => Entity::User,
            Record::Article(_) => Entity::Article,
            Record::Comment(_) => Entity::Comment,
        }
    }
}
