//! Query root of one graphlette: named singleton and vector queries over a
//! searcher, with results expanded by a DTO factory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::Span;

use meshql_core::auth::{Auth, RequestContext};
use meshql_core::config::{QueryConfig, RootConfig};
use meshql_core::envelope::{from_millis, now, Params, Payload, Timestamp};
use meshql_core::error::{MeshqlError, MeshqlResult};
use meshql_core::logging::graphlette_span;
use meshql_core::template::QueryTemplate;
use meshql_core::traits::Searcher;

use crate::dto::DtoFactory;
use crate::resolver::ResolutionContext;
use crate::selection::Selection;
use crate::subgraph::SubgraphClient;

/// Argument carrying the as-of timestamp in epoch milliseconds.
pub const AT_ARG: &str = "at";

/// Read the as-of timestamp from `args`, defaulting to now.
pub fn as_of(args: &Params) -> MeshqlResult<Timestamp> {
    let Some(value) = args.get(AT_ARG) else {
        return Ok(now());
    };
    let millis = match value {
        Value::Null => return Ok(now()),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    millis
        .map(from_millis)
        .ok_or_else(|| MeshqlError::validation(format!("'{}' must be epoch milliseconds, got {}", AT_ARG, value)))
}

/// Binds configured query names to a searcher and a DTO factory.
pub struct Root {
    searcher: Arc<dyn Searcher>,
    dto: Arc<DtoFactory>,
    auth: Arc<dyn Auth>,
    singletons: HashMap<String, QueryTemplate>,
    vectors: HashMap<String, QueryTemplate>,
    span: Span,
}

fn compile_all(
    queries: &[QueryConfig],
    seen: &mut HashSet<String>,
) -> MeshqlResult<HashMap<String, QueryTemplate>> {
    let mut compiled = HashMap::with_capacity(queries.len());
    for q in queries {
        if !seen.insert(q.name.clone()) {
            return Err(MeshqlError::Configuration(format!(
                "query '{}' is defined more than once",
                q.name
            )));
        }
        compiled.insert(q.name.clone(), QueryTemplate::compile(q.query.as_str())?);
    }
    Ok(compiled)
}

impl Root {
    /// Bind the singletons and vectors of `config`; its resolvers are ignored in
    /// favour of `dto`.
    pub fn new(
        searcher: Arc<dyn Searcher>,
        dto: Arc<DtoFactory>,
        auth: Arc<dyn Auth>,
        config: &RootConfig,
    ) -> MeshqlResult<Self> {
        let mut seen = HashSet::new();
        let singletons = compile_all(&config.singletons, &mut seen)?;
        let vectors = compile_all(&config.vectors, &mut seen)?;
        Ok(Self {
            searcher,
            dto,
            auth,
            singletons,
            vectors,
            span: graphlette_span("root"),
        })
    }

    /// Validate `config` and bind its resolvers to subgraphs reached through `client`.
    pub fn from_config(
        searcher: Arc<dyn Searcher>,
        auth: Arc<dyn Auth>,
        config: &RootConfig,
        client: &SubgraphClient,
    ) -> MeshqlResult<Self> {
        config.validate()?;
        let dto = DtoFactory::from_config(&config.resolvers, client)?;
        Self::new(searcher, Arc::new(dto), auth, config)
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn dto_factory(&self) -> &Arc<DtoFactory> {
        &self.dto
    }

    pub fn singleton_names(&self) -> impl Iterator<Item = &str> {
        self.singletons.keys().map(String::as_str)
    }

    pub fn vector_names(&self) -> impl Iterator<Item = &str> {
        self.vectors.keys().map(String::as_str)
    }

    /// The snapshot, credentials and forwarded header for one inbound request.
    pub fn context(&self, args: &Params, request: &RequestContext) -> MeshqlResult<ResolutionContext> {
        let mut ctx = ResolutionContext::new(as_of(args)?)
            .with_credentials(self.auth.get_auth_token(request));
        if let Some(authorization) = request.authorization() {
            ctx = ctx.with_authorization(authorization);
        }
        Ok(ctx)
    }

    /// Run singleton `name`: the first match at the as-of time, expanded.
    pub async fn singleton(
        &self,
        name: &str,
        args: &Params,
        request: &RequestContext,
        selection: &Selection,
    ) -> MeshqlResult<Option<Payload>> {
        let template = self
            .singletons
            .get(name)
            .ok_or_else(|| MeshqlError::unknown_query(name))?;
        let ctx = self.context(args, request)?;
        tracing::debug!(parent: &self.span, query = name, at = ctx.at.timestamp_millis(), "singleton");

        let Some(found) = self
            .searcher
            .find(template, args, &ctx.credentials, ctx.at)
            .await?
        else {
            return Ok(None);
        };
        let payload = found.into_payload_with_id();
        Ok(Some(self.dto.fill_one_with(payload, selection, &ctx).await))
    }

    /// Run vector `name`: every match at the as-of time, expanded, newest first.
    pub async fn vector(
        &self,
        name: &str,
        args: &Params,
        request: &RequestContext,
        selection: &Selection,
    ) -> MeshqlResult<Vec<Payload>> {
        let template = self
            .vectors
            .get(name)
            .ok_or_else(|| MeshqlError::unknown_query(name))?;
        let ctx = self.context(args, request)?;
        tracing::debug!(parent: &self.span, query = name, at = ctx.at.timestamp_millis(), "vector");

        let payloads = self
            .searcher
            .find_all(template, args, &ctx.credentials, ctx.at)
            .await?
            .into_iter()
            .map(|e| e.into_payload_with_id())
            .collect();
        Ok(self.dto.fill_many_with(payloads, selection, &ctx).await)
    }

    /// Dispatch `name` to whichever singleton or vector carries it.
    pub async fn query(
        &self,
        name: &str,
        args: &Params,
        request: &RequestContext,
        selection: &Selection,
    ) -> MeshqlResult<Value> {
        if self.singletons.contains_key(name) {
            let found = self.singleton(name, args, request, selection).await?;
            return Ok(found.map(Value::Object).unwrap_or(Value::Null));
        }
        if self.vectors.contains_key(name) {
            let found = self.vector(name, args, request, selection).await?;
            return Ok(Value::Array(found.into_iter().map(Value::Object).collect()));
        }
        Err(MeshqlError::unknown_query(name))
    }
}
