//! Configuration types for meshql services.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{MeshqlError, MeshqlResult};
use crate::template::QueryTemplate;

/// Environment variable overriding the configured storage URI.
pub const STORAGE_URI_ENV: &str = "MESHQL_STORAGE_URI";
/// Environment variable overriding the subgraph request timeout.
pub const SUBGRAPH_TIMEOUT_ENV: &str = "MESHQL_SUBGRAPH_TIMEOUT_SECS";

/// Storage backend selection, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Mongo(MongoConfig),
    Postgres(SqlServerConfig),
    Mysql(SqlServerConfig),
    Sqlite(SqliteConfig),
}

/// Document store connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoConfig {
    pub uri: String,
    pub db: String,
    pub collection: String,
    #[serde(default)]
    pub direct_connection: bool,
}

/// Networked relational server connection (Postgres or MySQL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlServerConfig {
    /// Full connection URI; takes precedence over the discrete fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub table: String,
}

/// Embedded SQLite database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// `sqlite:` URI or plain file path; `sqlite::memory:` for in-memory.
    pub uri: String,
    #[serde(alias = "table")]
    pub collection: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl StorageConfig {
    /// Backend name, matching the `type` tag.
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Mongo(_) => "mongo",
            Self::Postgres(_) => "postgres",
            Self::Mysql(_) => "mysql",
            Self::Sqlite(_) => "sqlite",
        }
    }

    /// Table or collection holding the envelopes.
    pub fn table(&self) -> &str {
        match self {
            Self::Mongo(c) => &c.collection,
            Self::Postgres(c) | Self::Mysql(c) => &c.table,
            Self::Sqlite(c) => &c.collection,
        }
    }

    /// The URI a connection pool is keyed by.
    pub fn connection_uri(&self) -> MeshqlResult<String> {
        match self {
            Self::Mongo(c) => Ok(c.uri.clone()),
            Self::Postgres(c) => c.connection_uri("postgres", 5432),
            Self::Mysql(c) => c.connection_uri("mysql", 3306),
            Self::Sqlite(c) => Ok(sqlite_uri(&c.uri)),
        }
    }

    /// Replace the connection URI, as done by the environment override.
    pub fn set_uri(&mut self, uri: impl Into<String>) {
        let uri = uri.into();
        match self {
            Self::Mongo(c) => c.uri = uri,
            Self::Postgres(c) | Self::Mysql(c) => c.uri = Some(uri),
            Self::Sqlite(c) => c.uri = uri,
        }
    }

    /// Check the table name and connection settings.
    pub fn validate(&self) -> MeshqlResult<()> {
        validate_identifier(self.table())?;
        if let Self::Mongo(c) = self {
            if c.db.is_empty() {
                return Err(MeshqlError::Configuration(
                    "mongo storage requires a db name".to_string(),
                ));
            }
        }
        self.connection_uri().map(|_| ())
    }
}

impl SqlServerConfig {
    fn connection_uri(&self, scheme: &str, default_port: u16) -> MeshqlResult<String> {
        if let Some(uri) = &self.uri {
            return Ok(uri.clone());
        }
        let port = self.port.unwrap_or(default_port);
        let mut url = url::Url::parse(&format!("{}://{}:{}/{}", scheme, self.host, port, self.db))
            .map_err(|e| MeshqlError::Configuration(format!("Invalid {} host: {}", scheme, e)))?;
        if !self.user.is_empty() {
            url.set_username(&self.user)
                .map_err(|_| MeshqlError::Configuration("Invalid database user".to_string()))?;
        }
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| MeshqlError::Configuration("Invalid database password".to_string()))?;
        }
        Ok(url.to_string())
    }
}

fn sqlite_uri(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{}?mode=rwc", path)
    }
}

/// Table and collection names are interpolated into DDL, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> MeshqlResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MeshqlError::Configuration(format!(
            "'{}' is not a valid table or collection name",
            name
        )))
    }
}

/// A named query bound to a singleton or vector root field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub name: String,
    /// Query template with `{{name}}` placeholders.
    pub query: String,
}

/// A cross-service join populated by a remote subgraph query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverConfig {
    /// Field the resolved object is attached under.
    pub name: String,
    /// Field of the parent payload holding the foreign key.
    #[serde(default = "default_id_field")]
    pub id: String,
    /// Query invoked on the remote service.
    pub query_name: String,
    /// Remote service GraphQL endpoint.
    pub url: String,
    /// Default selection set requested from the remote service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl ResolverConfig {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        query_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            query_name: query_name.into(),
            url: url.into(),
            fields: None,
        }
    }

    pub fn with_fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    /// Check the endpoint URL and query name, returning the parsed URL.
    pub fn validate(&self) -> MeshqlResult<url::Url> {
        if self.name.is_empty() || self.query_name.is_empty() {
            return Err(MeshqlError::Configuration(format!(
                "resolver '{}' needs both a name and a queryName",
                self.name
            )));
        }
        url::Url::parse(&self.url).map_err(|e| {
            MeshqlError::Configuration(format!(
                "resolver '{}' has an invalid url '{}': {}",
                self.name, self.url, e
            ))
        })
    }
}

/// Root query bindings and resolvers of one graphlette.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub singletons: Vec<QueryConfig>,
    pub vectors: Vec<QueryConfig>,
    pub resolvers: Vec<ResolverConfig>,
}

impl RootConfig {
    /// Reject duplicate names, malformed templates and invalid resolvers.
    pub fn validate(&self) -> MeshqlResult<()> {
        let mut names = HashSet::new();
        for q in self.singletons.iter().chain(&self.vectors) {
            if !names.insert(q.name.as_str()) {
                return Err(MeshqlError::Configuration(format!(
                    "query '{}' is defined more than once",
                    q.name
                )));
            }
            QueryTemplate::compile(q.query.as_str())?;
        }

        let mut resolvers = HashSet::new();
        for r in &self.resolvers {
            if !resolvers.insert(r.name.as_str()) {
                return Err(MeshqlError::Configuration(format!(
                    "resolver '{}' is defined more than once",
                    r.name
                )));
            }
            r.validate()?;
        }
        Ok(())
    }
}

/// Outbound subgraph client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubgraphConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SubgraphConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// Everything one meshql service needs: storage, root bindings and client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub graphlette: RootConfig,
    #[serde(default)]
    pub subgraph: SubgraphConfig,
}

impl ServiceConfig {
    /// Load from a TOML, JSON or YAML file, apply environment overrides and validate.
    pub fn from_file(path: impl AsRef<Path>) -> MeshqlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        let mut config: Self = match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| MeshqlError::Configuration(e.to_string()))?
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| MeshqlError::Configuration(e.to_string()))?,
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| MeshqlError::Configuration(e.to_string()))?,
            _ => {
                return Err(MeshqlError::Configuration(
                    "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
                ))
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MESHQL_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(uri) = lookup(STORAGE_URI_ENV) {
            self.storage.set_uri(uri);
        }
        if let Some(secs) = lookup(SUBGRAPH_TIMEOUT_ENV).and_then(|s| s.parse().ok()) {
            self.subgraph.timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> MeshqlResult<()> {
        self.storage.validate()?;
        self.graphlette.validate()
    }
}
