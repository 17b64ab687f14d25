//! MySQL envelope repository and searcher.

use sqlx::{mysql::MySqlPoolOptions, MySql, MySqlPool};

use meshql_core::error::{ErrorCode, MeshqlResult};

use crate::sql::{db_error, sql_backend, SqlDialect};

/// Open a pool against a MySQL server.
pub async fn connect(uri: &str) -> MeshqlResult<MySqlPool> {
    MySqlPoolOptions::new()
        .max_connections(5)
        .connect(uri)
        .await
        .map_err(db_error(ErrorCode::DbConnectionFailed, "Failed to connect to MySQL"))
}

sql_backend! {
    database: MySql,
    pool: MySqlPool,
    dialect: SqlDialect::Mysql,
    label: "MySQL",
    repository: MysqlRepository,
    searcher: MysqlSearcher,
}
