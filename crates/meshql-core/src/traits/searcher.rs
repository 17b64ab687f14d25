//! Template-driven temporal search and per-backend query compilation.

use async_trait::async_trait;

use crate::envelope::{Envelope, Params, Timestamp};
use crate::error::MeshqlResult;
use crate::template::QueryTemplate;

/// Turns a query template plus parameters into a backend-native query.
pub trait QueryCompiler: Send + Sync {
    /// The native query representation (a filter document, a SQL fragment).
    type Query;

    /// Substitute `params` into `template` and parse the result.
    ///
    /// Fails with a template error when substitution or parsing fails.
    fn compile_query(&self, template: &QueryTemplate, params: &Params) -> MeshqlResult<Self::Query>;
}

/// Point-in-time search over the current view of a repository.
///
/// Both operations consider only versions with `created_at < at`, keep the
/// latest per id, drop delete markers, then apply the compiled predicate.
#[async_trait]
pub trait Searcher: Send + Sync {
    /// The newest matching entity, if the caller is authorized to read it.
    async fn find(
        &self,
        template: &QueryTemplate,
        params: &Params,
        credentials: &[String],
        at: Timestamp,
    ) -> MeshqlResult<Option<Envelope>>;

    /// Every matching entity the caller is authorized to read, newest first.
    async fn find_all(
        &self,
        template: &QueryTemplate,
        params: &Params,
        credentials: &[String],
        at: Timestamp,
    ) -> MeshqlResult<Vec<Envelope>>;
}
