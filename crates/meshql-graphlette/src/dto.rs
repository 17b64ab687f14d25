//! Expands raw payloads into composite objects by resolving foreign keys.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::Span;

use meshql_core::config::ResolverConfig;
use meshql_core::envelope::Payload;
use meshql_core::error::{MeshqlError, MeshqlResult};
use meshql_core::logging::graphlette_span;

use crate::resolver::{key_text, FieldResolver, ResolutionContext, SubgraphResolver};
use crate::selection::Selection;
use crate::subgraph::SubgraphClient;

/// A resolver bound to the field it fills.
struct Binding {
    name: String,
    id_field: String,
    fields: Selection,
    resolver: Arc<dyn FieldResolver>,
}

/// Fills configured resolver fields of payloads, all against one snapshot.
pub struct DtoFactory {
    bindings: Vec<Binding>,
    span: Span,
}

impl Default for DtoFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DtoFactory {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            span: graphlette_span("dto"),
        }
    }

    /// Bind every configured resolver to a subgraph, validating each once.
    pub fn from_config(resolvers: &[ResolverConfig], client: &SubgraphClient) -> MeshqlResult<Self> {
        let mut factory = Self::new();
        for config in resolvers {
            let url = config.validate()?;
            let fields = match &config.fields {
                Some(fields) => Selection::parse(fields)?,
                None => Selection::new(),
            };
            let resolver = SubgraphResolver::new(client.clone(), url, config.query_name.as_str());
            factory = factory.with_resolver(&config.name, &config.id, fields, Arc::new(resolver))?;
        }
        Ok(factory)
    }

    /// Fill field `name` by resolving the key held in `id_field`.
    ///
    /// `fields` is the selection requested when the caller asks for none.
    pub fn with_resolver(
        mut self,
        name: impl Into<String>,
        id_field: impl Into<String>,
        fields: Selection,
        resolver: Arc<dyn FieldResolver>,
    ) -> MeshqlResult<Self> {
        let name = name.into();
        if self.bindings.iter().any(|b| b.name == name) {
            return Err(MeshqlError::Configuration(format!(
                "resolver '{}' is defined more than once",
                name
            )));
        }
        self.bindings.push(Binding {
            name,
            id_field: id_field.into(),
            fields,
            resolver,
        });
        Ok(self)
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn resolver_names(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// What to request for `binding`, or `None` when the caller did not select it.
    fn requested(binding: &Binding, selection: &Selection) -> Option<Selection> {
        if selection.is_empty() {
            return Some(binding.fields.clone());
        }
        selection.field(&binding.name).map(|field| {
            if field.selection.is_empty() {
                binding.fields.clone()
            } else {
                field.selection.clone()
            }
        })
    }

    /// Resolve every configured field present in `payload`.
    pub async fn fill_one(&self, payload: Payload, ctx: &ResolutionContext) -> Payload {
        self.fill_one_with(payload, &Selection::new(), ctx).await
    }

    /// Resolve the configured fields named in `selection` (all of them when it is empty).
    ///
    /// Resolvers run concurrently; a failed one leaves its field null.
    pub async fn fill_one_with(
        &self,
        mut payload: Payload,
        selection: &Selection,
        ctx: &ResolutionContext,
    ) -> Payload {
        let calls: Vec<_> = self
            .bindings
            .iter()
            .filter_map(|binding| {
                let requested = Self::requested(binding, selection)?;
                let key = payload.get(&binding.id_field).and_then(key_text)?;
                Some(async move {
                    let result = binding.resolver.resolve(&key, &requested, ctx).await;
                    (binding, result)
                })
            })
            .collect();

        for (binding, result) in join_all(calls).await {
            let value = result.unwrap_or_else(|e| {
                tracing::warn!(parent: &self.span, field = %binding.name, error = %e, "resolver failed");
                Value::Null
            });
            payload.insert(binding.name.clone(), value);
        }
        payload
    }

    /// Resolve every configured field across `payloads`.
    pub async fn fill_many(&self, payloads: Vec<Payload>, ctx: &ResolutionContext) -> Vec<Payload> {
        self.fill_many_with(payloads, &Selection::new(), ctx).await
    }

    /// Like [`fill_one_with`](Self::fill_one_with) for a list, issuing one
    /// batched call per resolver. Output order matches input order.
    pub async fn fill_many_with(
        &self,
        mut payloads: Vec<Payload>,
        selection: &Selection,
        ctx: &ResolutionContext,
    ) -> Vec<Payload> {
        let batches: Vec<_> = self
            .bindings
            .iter()
            .filter_map(|binding| {
                let requested = Self::requested(binding, selection)?;
                let (positions, keys): (Vec<usize>, Vec<String>) = payloads
                    .iter()
                    .enumerate()
                    .filter_map(|(i, p)| p.get(&binding.id_field).and_then(key_text).map(|k| (i, k)))
                    .unzip();
                if keys.is_empty() {
                    return None;
                }
                Some(async move {
                    let result = binding.resolver.resolve_many(&keys, &requested, ctx).await;
                    (binding, positions, result)
                })
            })
            .collect();

        for (binding, positions, result) in join_all(batches).await {
            let values = match result {
                Ok(values) if values.len() == positions.len() => values,
                Ok(values) => {
                    tracing::warn!(
                        parent: &self.span,
                        field = %binding.name,
                        expected = positions.len(),
                        got = values.len(),
                        "resolver returned the wrong number of values"
                    );
                    vec![Value::Null; positions.len()]
                }
                Err(e) => {
                    tracing::warn!(parent: &self.span, field = %binding.name, error = %e, "resolver failed");
                    vec![Value::Null; positions.len()]
                }
            };
            for (position, value) in positions.into_iter().zip(values) {
                payloads[position].insert(binding.name.clone(), value);
            }
        }
        payloads
    }
}

impl fmt::Debug for DtoFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.resolver_names().collect();
        f.debug_struct("DtoFactory").field("resolvers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshql_core::envelope::from_millis;
    use meshql_core::error::ErrorCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Echoes the key and selection back, counting calls.
    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FieldResolver for Echo {
        async fn resolve(
            &self,
            key: &str,
            selection: &Selection,
            ctx: &ResolutionContext,
        ) -> MeshqlResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"key": key, "fields": selection.to_string(), "at": ctx.at.timestamp_millis()}))
        }
    }

    struct Broken;

    #[async_trait]
    impl FieldResolver for Broken {
        async fn resolve(&self, _: &str, _: &Selection, _: &ResolutionContext) -> MeshqlResult<Value> {
            Err(MeshqlError::subgraph(ErrorCode::SubHttpStatus, "http://down", "503"))
        }
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn ctx() -> ResolutionContext {
        ResolutionContext::new(from_millis(300)).with_authorization("Bearer A")
    }

    #[tokio::test]
    async fn test_fill_one_attaches_resolved_fields() {
        let factory = DtoFactory::new()
            .with_resolver("farm", "farm_id", Selection::parse("name").unwrap(), Arc::new(Echo::default()))
            .unwrap()
            .with_resolver("owner", "owner_id", Selection::new(), Arc::new(Echo::default()))
            .unwrap();

        let filled = factory
            .fill_one(payload(json!({"name": "Coop A", "farm_id": "farm1"})), &ctx())
            .await;
        assert_eq!(
            Value::Object(filled),
            json!({
                "name": "Coop A",
                "farm_id": "farm1",
                "farm": {"key": "farm1", "fields": "name", "at": 300}
            })
        );
    }

    #[tokio::test]
    async fn test_failed_resolver_is_null_and_local() {
        let factory = DtoFactory::new()
            .with_resolver("farm", "farm_id", Selection::new(), Arc::new(Broken))
            .unwrap()
            .with_resolver("coop", "coop_id", Selection::new(), Arc::new(Echo::default()))
            .unwrap();

        let filled = factory
            .fill_one(payload(json!({"farm_id": "farm1", "coop_id": "coop1"})), &ctx())
            .await;
        assert!(filled["farm"].is_null());
        assert_eq!(filled["coop"]["key"], json!("coop1"));
    }

    #[tokio::test]
    async fn test_selection_limits_resolvers() {
        let farm = Arc::new(Echo::default());
        let coop = Arc::new(Echo::default());
        let factory = DtoFactory::new()
            .with_resolver("farm", "farm_id", Selection::parse("name").unwrap(), farm.clone())
            .unwrap()
            .with_resolver("coop", "coop_id", Selection::new(), coop.clone())
            .unwrap();

        let selection = Selection::parse("farm { name acres }").unwrap();
        let filled = factory
            .fill_one_with(payload(json!({"farm_id": "f", "coop_id": "c"})), &selection, &ctx())
            .await;
        assert_eq!(filled["farm"]["fields"], json!("name acres"));
        assert!(!filled.contains_key("coop"));
        assert_eq!(coop.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fill_many_preserves_order() {
        let factory = DtoFactory::new()
            .with_resolver("farm", "farm_id", Selection::new(), Arc::new(Echo::default()))
            .unwrap();

        let filled = factory
            .fill_many(
                vec![
                    payload(json!({"name": "first", "farm_id": "f1"})),
                    payload(json!({"name": "no farm"})),
                    payload(json!({"name": "third", "farm_id": "f3"})),
                ],
                &ctx(),
            )
            .await;
        assert_eq!(filled.len(), 3);
        assert_eq!(filled[0]["farm"]["key"], json!("f1"));
        assert!(!filled[1].contains_key("farm"));
        assert_eq!(filled[2]["farm"]["key"], json!("f3"));
    }

    #[tokio::test]
    async fn test_duplicate_resolver_rejected() {
        let result = DtoFactory::new()
            .with_resolver("farm", "farm_id", Selection::new(), Arc::new(Broken))
            .unwrap()
            .with_resolver("farm", "other_id", Selection::new(), Arc::new(Broken));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_from_config_forwards_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/farm/graph"))
            .and(header("authorization", "Bearer A"))
            .and(body_json(json!({ "query": r#"{getById(id: "farm1", at: 300) { name }}"# })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"getById": {"name": "Red Barn"}}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolvers = vec![ResolverConfig::new(
            "farm",
            "farm_id",
            "getById",
            format!("{}/farm/graph", server.uri()),
        )
        .with_fields("name")];
        let client = SubgraphClient::from_client(reqwest::Client::new());
        let factory = DtoFactory::from_config(&resolvers, &client).unwrap();
        assert_eq!(factory.resolver_names().collect::<Vec<_>>(), vec!["farm"]);

        let filled = factory
            .fill_one(payload(json!({"name": "Coop A", "farm_id": "farm1"})), &ctx())
            .await;
        assert_eq!(
            Value::Object(filled),
            json!({"name": "Coop A", "farm_id": "farm1", "farm": {"name": "Red Barn"}})
        );
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let resolvers = vec![ResolverConfig::new("farm", "farm_id", "getById", "not a url")];
        let client = SubgraphClient::from_client(reqwest::Client::new());
        assert!(DtoFactory::from_config(&resolvers, &client).is_err());
    }

    #[tokio::test]
    async fn test_from_config_without_fields_requests_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/farm/graph"))
            .and(body_json(json!({ "query": r#"{getById(id: "farm1", at: 300) { id }}"# })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"getById": {"id": "farm1"}}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolvers = vec![ResolverConfig::new(
            "farm",
            "farm_id",
            "getById",
            format!("{}/farm/graph", server.uri()),
        )];
        let client = SubgraphClient::from_client(reqwest::Client::new());
        let factory = DtoFactory::from_config(&resolvers, &client).unwrap();

        let filled = factory
            .fill_one(payload(json!({"farm_id": "farm1"})), &ctx())
            .await;
        assert_eq!(filled["farm"], json!({"id": "farm1"}));
    }

    #[tokio::test]
    async fn test_fill_many_keeps_keys_beside_a_failed_one() {
        let server = MockServer::start().await;
        let query = r#"{item_0: getById(id: "farm1", at: 300) { name } item_1: getById(id: "farm2", at: 300) { name }}"#;
        Mock::given(method("POST"))
            .and(path("/farm/graph"))
            .and(header("authorization", "Bearer A"))
            .and(body_json(json!({ "query": query })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"item_0": {"name": "Red Barn"}, "item_1": null},
                "errors": [{"message": "farm2 is restricted", "path": ["item_1"]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolvers = vec![ResolverConfig::new(
            "farm",
            "farm_id",
            "getById",
            format!("{}/farm/graph", server.uri()),
        )
        .with_fields("name")];
        let client = SubgraphClient::from_client(reqwest::Client::new());
        let factory = DtoFactory::from_config(&resolvers, &client).unwrap();

        let filled = factory
            .fill_many(
                vec![
                    payload(json!({"name": "Coop A", "farm_id": "farm1"})),
                    payload(json!({"name": "Coop B", "farm_id": "farm2"})),
                ],
                &ctx(),
            )
            .await;
        assert_eq!(filled[0]["farm"], json!({"name": "Red Barn"}));
        assert!(filled[1]["farm"].is_null());
        assert!(filled[1].contains_key("farm"));
    }
}
