//! meshql-core - data model and seams shared by every meshql crate.
//!
//! An [`Envelope`] is one immutable version of an entity. Backends implement
//! [`Repository`] for append-only writes and point-in-time reads, and
//! [`Searcher`] for template-driven temporal queries. The [`Auth`] capability
//! decides which envelopes a caller may see.
//!
//! # Example
//!
//! ```ignore
//! use meshql_core::{Envelope, QueryTemplate, Repository, Searcher};
//!
//! let farm = repo.create(Envelope::from_value(json!({"name": "Red Barn"}))).await?;
//! let template = QueryTemplate::compile("id = '{{id}}'")?;
//! let found = searcher.find(&template, &params, &credentials, meshql_core::now()).await?;
//! ```

pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod template;
pub mod traits;

pub use auth::{Auth, BearerAuth, NoAuth, RequestContext};
pub use config::{
    MongoConfig, QueryConfig, ResolverConfig, RootConfig, ServiceConfig, SqlServerConfig,
    SqliteConfig, StorageConfig, SubgraphConfig,
};
pub use envelope::{
    from_millis, now, order_by_ids, tokens_permit, truncate_millis, Envelope, Params, Payload,
    Timestamp,
};
pub use error::{ErrorCode, MeshqlError, MeshqlResult};
pub use template::QueryTemplate;
pub use traits::{QueryCompiler, Repository, Searcher};
