//! PostgreSQL envelope repository and searcher.

use sqlx::{postgres::PgPoolOptions, PgPool, Postgres};

use meshql_core::error::{ErrorCode, MeshqlResult};

use crate::sql::{db_error, sql_backend, SqlDialect};

/// Open a pool against a PostgreSQL server.
pub async fn connect(uri: &str) -> MeshqlResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(uri)
        .await
        .map_err(db_error(ErrorCode::DbConnectionFailed, "Failed to connect to PostgreSQL"))
}

sql_backend! {
    database: Postgres,
    pool: PgPool,
    dialect: SqlDialect::Postgres,
    label: "PostgreSQL",
    repository: PostgresRepository,
    searcher: PostgresSearcher,
}
