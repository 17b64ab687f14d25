//! Field resolvers: how one foreign key becomes a nested object.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use url::Url;

use meshql_core::envelope::{now, Params, Timestamp};
use meshql_core::error::MeshqlResult;
use meshql_core::template::QueryTemplate;
use meshql_core::traits::Searcher;

use crate::dto::DtoFactory;
use crate::selection::Selection;
use crate::subgraph::{build_batch_query, build_query, SubgraphClient, BATCH_ALIAS_PREFIX};

/// The snapshot one root query resolves against, shared by every nested call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionContext {
    pub at: Timestamp,
    pub credentials: Vec<String>,
    /// Inbound `Authorization` header, forwarded verbatim to subgraphs.
    pub authorization: Option<String>,
}

impl ResolutionContext {
    pub fn new(at: Timestamp) -> Self {
        Self {
            at,
            credentials: Vec::new(),
            authorization: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Vec<String>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = Some(authorization.into());
        self
    }
}

impl Default for ResolutionContext {
    fn default() -> Self {
        Self::new(now())
    }
}

/// Text form of a foreign key, if the value can be one.
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Turns foreign keys into resolved objects (or null).
#[async_trait]
pub trait FieldResolver: Send + Sync {
    async fn resolve(
        &self,
        key: &str,
        selection: &Selection,
        ctx: &ResolutionContext,
    ) -> MeshqlResult<Value>;

    /// Resolve several keys, returning one value per key in order.
    async fn resolve_many(
        &self,
        keys: &[String],
        selection: &Selection,
        ctx: &ResolutionContext,
    ) -> MeshqlResult<Vec<Value>> {
        try_join_all(keys.iter().map(|key| self.resolve(key, selection, ctx))).await
    }
}

/// Resolves against a remote service's GraphQL endpoint.
pub struct SubgraphResolver {
    client: SubgraphClient,
    url: Url,
    query_name: String,
}

impl SubgraphResolver {
    pub fn new(client: SubgraphClient, url: Url, query_name: impl Into<String>) -> Self {
        Self {
            client,
            url,
            query_name: query_name.into(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn query_name(&self) -> &str {
        &self.query_name
    }
}

#[async_trait]
impl FieldResolver for SubgraphResolver {
    async fn resolve(
        &self,
        key: &str,
        selection: &Selection,
        ctx: &ResolutionContext,
    ) -> MeshqlResult<Value> {
        let query = build_query(&self.query_name, key, ctx.at, selection);
        tracing::debug!(url = %self.url, %query, "resolving from subgraph");
        self.client
            .call(&self.url, &query, &self.query_name, ctx.authorization.as_deref())
            .await
    }

    /// One aliased document for all keys instead of one request per key.
    /// A key the subgraph reports an error for resolves to null on its own.
    async fn resolve_many(
        &self,
        keys: &[String],
        selection: &Selection,
        ctx: &ResolutionContext,
    ) -> MeshqlResult<Vec<Value>> {
        match keys {
            [] => return Ok(Vec::new()),
            [key] => return Ok(vec![self.resolve(key, selection, ctx).await?]),
            _ => {}
        }

        let query = build_batch_query(&self.query_name, keys, ctx.at, selection);
        tracing::debug!(url = %self.url, count = keys.len(), "batch resolving from subgraph");
        let mut partial = self
            .client
            .execute_partial(&self.url, &query, ctx.authorization.as_deref())
            .await?;

        Ok((0..keys.len())
            .map(|i| {
                let alias = format!("{}{}", BATCH_ALIAS_PREFIX, i);
                if partial.failed(&alias) {
                    tracing::warn!(url = %self.url, key = %keys[i], "subgraph reported an error for key");
                    return Value::Null;
                }
                partial.data.get_mut(&alias).map(Value::take).unwrap_or(Value::Null)
            })
            .collect())
    }
}

/// Resolves against a searcher in the same process, optionally expanding the
/// found object's own resolvers with a nested factory.
pub struct LocalResolver {
    searcher: Arc<dyn Searcher>,
    template: QueryTemplate,
    param: String,
    nested: Option<Arc<DtoFactory>>,
}

impl LocalResolver {
    /// `template` receives the foreign key as the `id` parameter.
    pub fn new(searcher: Arc<dyn Searcher>, template: QueryTemplate) -> Self {
        Self {
            searcher,
            template,
            param: "id".to_string(),
            nested: None,
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }

    pub fn with_nested(mut self, factory: Arc<DtoFactory>) -> Self {
        self.nested = Some(factory);
        self
    }
}

#[async_trait]
impl FieldResolver for LocalResolver {
    async fn resolve(
        &self,
        key: &str,
        selection: &Selection,
        ctx: &ResolutionContext,
    ) -> MeshqlResult<Value> {
        let mut params = Params::new();
        params.insert(self.param.clone(), Value::String(key.to_string()));

        let found = self
            .searcher
            .find(&self.template, &params, &ctx.credentials, ctx.at)
            .await?;
        let Some(envelope) = found else {
            return Ok(Value::Null);
        };

        let mut payload = envelope.into_payload_with_id();
        if let Some(nested) = &self.nested {
            payload = nested.fill_one_with(payload, selection, ctx).await;
        }
        Ok(Value::Object(selection.project(payload)))
    }
}
