//! SQLite envelope repository and searcher.

use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool};

use meshql_core::error::{ErrorCode, MeshqlResult};

use crate::sql::{db_error, sql_backend, SqlDialect};

/// Open a pool. An in-memory database lives and dies with its one connection,
/// so such pools hold exactly one and never recycle it.
pub async fn connect(uri: &str) -> MeshqlResult<SqlitePool> {
    let in_memory = uri.contains(":memory:") || uri.contains("mode=memory");
    let options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    options
        .connect(uri)
        .await
        .map_err(db_error(ErrorCode::DbConnectionFailed, "Failed to connect to SQLite"))
}

sql_backend! {
    database: Sqlite,
    pool: SqlitePool,
    dialect: SqlDialect::Sqlite,
    label: "SQLite",
    repository: SqliteRepository,
    searcher: SqliteSearcher,
}
