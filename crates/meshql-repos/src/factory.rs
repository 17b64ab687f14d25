//! Builds repositories and searchers from configuration, sharing one
//! connection pool per distinct URI.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use meshql_core::auth::Auth;
use meshql_core::config::StorageConfig;
use meshql_core::error::{MeshqlError, MeshqlResult};
use meshql_core::traits::{Repository, Searcher};

/// A live pool or client, keyed by the URI it was opened with.
#[derive(Clone)]
enum Connection {
    #[cfg(feature = "mongodb")]
    Mongo(mongodb::Client),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
    #[cfg(feature = "mysql")]
    Mysql(sqlx::MySqlPool),
    #[cfg(feature = "sqlite")]
    Sqlite(sqlx::SqlitePool),
}

/// One pool per URI, opened lazily on first use and reused thereafter.
#[derive(Clone, Default)]
pub struct ConnectionCache {
    connections: Arc<Mutex<HashMap<String, Connection>>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct URIs with an open pool.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every pool and forget it.
    pub async fn close(&self) {
        let drained: Vec<Connection> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, c)| c).collect()
        };
        for connection in drained {
            match connection {
                #[cfg(feature = "mongodb")]
                Connection::Mongo(_) => {}
                #[cfg(feature = "postgres")]
                Connection::Postgres(pool) => pool.close().await,
                #[cfg(feature = "mysql")]
                Connection::Mysql(pool) => pool.close().await,
                #[cfg(feature = "sqlite")]
                Connection::Sqlite(pool) => pool.close().await,
            }
        }
    }

    /// The cached connection for `config`'s URI, opening it under the lock if absent.
    async fn connection(&self, config: &StorageConfig) -> MeshqlResult<Connection> {
        let uri = config.connection_uri()?;
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&uri) {
            return Ok(existing.clone());
        }

        tracing::info!(backend = config.backend(), "opening storage connection");
        let connection = open(config, &uri).await?;
        connections.insert(uri, connection.clone());
        Ok(connection)
    }
}

async fn open(config: &StorageConfig, uri: &str) -> MeshqlResult<Connection> {
    match config {
        #[cfg(feature = "mongodb")]
        StorageConfig::Mongo(c) => Ok(Connection::Mongo(
            crate::mongodb::connect(uri, c.direct_connection).await?,
        )),
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres(_) => Ok(Connection::Postgres(crate::postgres::connect(uri).await?)),
        #[cfg(feature = "mysql")]
        StorageConfig::Mysql(_) => Ok(Connection::Mysql(crate::mysql::connect(uri).await?)),
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite(_) => Ok(Connection::Sqlite(crate::sqlite::connect(uri).await?)),
        #[allow(unreachable_patterns)]
        other => {
            let _ = uri;
            Err(MeshqlError::UnsupportedBackend {
                backend: other.backend().to_string(),
            })
        }
    }
}

/// Creates repositories and searchers for configured storage.
#[derive(Clone, Default)]
pub struct StorageFactory {
    cache: ConnectionCache,
}

impl StorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing cache, e.g. between several services in one process.
    pub fn with_cache(cache: ConnectionCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Build a repository and run its schema step.
    pub async fn create_repository(
        &self,
        config: &StorageConfig,
    ) -> MeshqlResult<Arc<dyn Repository>> {
        config.validate()?;
        let table = config.table();
        let repository: Arc<dyn Repository> = match (self.cache.connection(config).await?, config) {
            #[cfg(feature = "mongodb")]
            (Connection::Mongo(client), StorageConfig::Mongo(c)) => {
                Arc::new(crate::mongodb::MongoRepository::new(client, &c.db, table)?)
            }
            #[cfg(feature = "postgres")]
            (Connection::Postgres(pool), _) => {
                Arc::new(crate::postgres::PostgresRepository::new(pool, table)?)
            }
            #[cfg(feature = "mysql")]
            (Connection::Mysql(pool), _) => Arc::new(crate::mysql::MysqlRepository::new(pool, table)?),
            #[cfg(feature = "sqlite")]
            (Connection::Sqlite(pool), _) => {
                Arc::new(crate::sqlite::SqliteRepository::new(pool, table)?)
            }
            #[allow(unreachable_patterns)]
            _ => {
                return Err(MeshqlError::Internal(format!(
                    "cached connection does not match backend '{}'",
                    config.backend()
                )))
            }
        };
        repository.initialize().await?;
        Ok(repository)
    }

    /// Build a searcher that authorizes results with `auth`.
    pub async fn create_searcher(
        &self,
        config: &StorageConfig,
        auth: Arc<dyn Auth>,
    ) -> MeshqlResult<Arc<dyn Searcher>> {
        config.validate()?;
        let table = config.table();
        let searcher: Arc<dyn Searcher> = match (self.cache.connection(config).await?, config) {
            #[cfg(feature = "mongodb")]
            (Connection::Mongo(client), StorageConfig::Mongo(c)) => Arc::new(
                crate::mongodb::MongoSearcher::new(&client, &c.db, table, auth)?,
            ),
            #[cfg(feature = "postgres")]
            (Connection::Postgres(pool), _) => {
                Arc::new(crate::postgres::PostgresSearcher::new(pool, table, auth)?)
            }
            #[cfg(feature = "mysql")]
            (Connection::Mysql(pool), _) => {
                Arc::new(crate::mysql::MysqlSearcher::new(pool, table, auth)?)
            }
            #[cfg(feature = "sqlite")]
            (Connection::Sqlite(pool), _) => {
                Arc::new(crate::sqlite::SqliteSearcher::new(pool, table, auth)?)
            }
            #[allow(unreachable_patterns)]
            _ => {
                return Err(MeshqlError::Internal(format!(
                    "cached connection does not match backend '{}'",
                    config.backend()
                )))
            }
        };
        Ok(searcher)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use meshql_core::auth::NoAuth;
    use meshql_core::config::SqliteConfig;

    fn sqlite(collection: &str) -> StorageConfig {
        StorageConfig::Sqlite(SqliteConfig {
            uri: "sqlite::memory:".to_string(),
            collection: collection.to_string(),
        })
    }

    #[tokio::test]
    async fn test_one_pool_per_uri() {
        let factory = StorageFactory::new();
        let repo = factory.create_repository(&sqlite("farm")).await.unwrap();
        let _searcher = factory
            .create_searcher(&sqlite("farm"), Arc::new(NoAuth))
            .await
            .unwrap();
        let _other = factory.create_repository(&sqlite("coop")).await.unwrap();

        assert_eq!(factory.cache().len().await, 1);
        assert!(repo.ready().await.unwrap());

        factory.cache().close().await;
        assert!(factory.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_table_rejected_before_connecting() {
        let factory = StorageFactory::new();
        let result = factory.create_repository(&sqlite("farm-table")).await;
        assert!(result.is_err());
        assert!(factory.cache().is_empty().await);
    }
}
