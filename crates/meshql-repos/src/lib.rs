//! meshql-repos - envelope repositories and searchers for meshql.
//!
//! Every backend stores append-only envelope versions and answers
//! point-in-time reads with the same observable behaviour.
//!
//! # Supported Backends
//!
//! - **MongoDB** (feature: `mongodb`) - aggregation pipeline current view
//! - **PostgreSQL** (feature: `postgres`) - `DISTINCT ON` current view
//! - **MySQL** (feature: `mysql`) - window-function current view
//! - **SQLite** (feature: `sqlite`, default) - window-function current view
//!
//! # Example
//!
//! ```ignore
//! use meshql_repos::StorageFactory;
//!
//! let factory = StorageFactory::new();
//! let repo = factory.create_repository(&config.storage).await?;
//! let searcher = factory.create_searcher(&config.storage, Arc::new(BearerAuth)).await?;
//! ```

mod factory;

#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
mod sql;

#[cfg(feature = "mongodb")]
pub mod mongodb;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlite")]
pub mod sqlite;

// Public exports
pub use factory::{ConnectionCache, StorageFactory};

#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
pub use sql::{SqlDialect, SqlPredicateCompiler};

#[cfg(feature = "mongodb")]
pub use self::mongodb::{DocumentQueryCompiler, MongoRepository, MongoSearcher};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresRepository, PostgresSearcher};

#[cfg(feature = "mysql")]
pub use mysql::{MysqlRepository, MysqlSearcher};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteRepository, SqliteSearcher};

// Re-export core types for convenience
pub use meshql_core::traits::{QueryCompiler, Repository, Searcher};
