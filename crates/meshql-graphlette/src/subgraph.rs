//! HTTP client for remote GraphQL subgraphs.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use meshql_core::config::SubgraphConfig;
use meshql_core::envelope::Timestamp;
use meshql_core::error::{ErrorCode, MeshqlError, MeshqlResult};

use crate::selection::Selection;

/// Alias prefix for the per-key fields of a batched query.
pub const BATCH_ALIAS_PREFIX: &str = "item_";

/// Selection sent when the caller and the resolver config name no fields.
pub const DEFAULT_SELECTION: &str = "id";

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

/// One entry of a response's `errors` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<Value>,
}

impl GraphqlError {
    /// The top-level response field the error belongs to, if it names one.
    pub fn root_field(&self) -> Option<&str> {
        self.path.first().and_then(Value::as_str)
    }
}

/// `data` of a response that may also carry field-level errors.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialData {
    pub data: Value,
    pub errors: Vec<GraphqlError>,
}

impl PartialData {
    /// Whether some error is attributed to the top-level field `name`.
    pub fn failed(&self, name: &str) -> bool {
        self.errors.iter().any(|e| e.root_field() == Some(name))
    }
}

fn invocation(query_name: &str, key: &str, at: Timestamp, selection: &Selection) -> String {
    let id = Value::String(key.to_string());
    let fields = if selection.is_empty() {
        DEFAULT_SELECTION.to_string()
    } else {
        selection.to_string()
    };
    format!("{}(id: {}, at: {}) {{ {} }}", query_name, id, at.timestamp_millis(), fields)
}

/// `{getById(id: "farm1", at: 300) { name }}`
pub fn build_query(query_name: &str, key: &str, at: Timestamp, selection: &Selection) -> String {
    format!("{{{}}}", invocation(query_name, key, at, selection))
}

/// One document resolving every key, each under the alias `item_<n>`.
pub fn build_batch_query(
    query_name: &str,
    keys: &[String],
    at: Timestamp,
    selection: &Selection,
) -> String {
    let calls: Vec<String> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            format!(
                "{}{}: {}",
                BATCH_ALIAS_PREFIX,
                i,
                invocation(query_name, key, at, selection)
            )
        })
        .collect();
    format!("{{{}}}", calls.join(" "))
}

/// Posts query documents to subgraph endpoints.
#[derive(Clone)]
pub struct SubgraphClient {
    client: Client,
}

impl SubgraphClient {
    /// Create a client whose calls fail instead of hanging past the configured timeouts.
    pub fn new(config: &SubgraphConfig) -> MeshqlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| {
                MeshqlError::Configuration(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// POST `query` and return the response's `data` object.
    ///
    /// Any entry in `errors` fails the whole call. The authorization header is
    /// forwarded unchanged when present.
    pub async fn execute(
        &self,
        url: &Url,
        query: &str,
        authorization: Option<&str>,
    ) -> MeshqlResult<Value> {
        let parsed = self.post(url, query, authorization).await?;
        if let Some(first) = parsed.errors.into_iter().next() {
            return Err(MeshqlError::subgraph(
                ErrorCode::SubGraphqlError,
                url.as_str(),
                first.message,
            ));
        }
        parsed.data.ok_or_else(|| {
            MeshqlError::subgraph(
                ErrorCode::SubInvalidResponse,
                url.as_str(),
                "Response carries neither data nor errors",
            )
        })
    }

    /// POST `query` and keep whatever `data` came back next to its errors.
    ///
    /// Errors whose path names a top-level field are returned for the caller to
    /// apply per field. The call fails when `data` is not an object or an error
    /// cannot be attributed to one field.
    pub async fn execute_partial(
        &self,
        url: &Url,
        query: &str,
        authorization: Option<&str>,
    ) -> MeshqlResult<PartialData> {
        let parsed = self.post(url, query, authorization).await?;
        if let Some(unattributed) = parsed.errors.iter().find(|e| e.root_field().is_none()) {
            return Err(MeshqlError::subgraph(
                ErrorCode::SubGraphqlError,
                url.as_str(),
                unattributed.message.clone(),
            ));
        }
        match parsed.data {
            Some(data @ Value::Object(_)) => Ok(PartialData {
                data,
                errors: parsed.errors,
            }),
            _ => Err(match parsed.errors.into_iter().next() {
                Some(first) => {
                    MeshqlError::subgraph(ErrorCode::SubGraphqlError, url.as_str(), first.message)
                }
                None => MeshqlError::subgraph(
                    ErrorCode::SubInvalidResponse,
                    url.as_str(),
                    "Response data is not an object",
                ),
            }),
        }
    }

    async fn post(
        &self,
        url: &Url,
        query: &str,
        authorization: Option<&str>,
    ) -> MeshqlResult<GraphqlResponse> {
        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&json!({ "query": query }));
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request.send().await.map_err(|e| MeshqlError::Subgraph {
            message: format!("Failed to call subgraph: {}", e),
            code: ErrorCode::SubConnectionFailed,
            url: Some(url.to_string()),
            source: Some(Box::new(e)),
        })?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(MeshqlError::subgraph(
                ErrorCode::SubHttpStatus,
                url.as_str(),
                format!("Subgraph returned {}: {}", status, error),
            ));
        }

        let body = response.text().await.map_err(|e| MeshqlError::Subgraph {
            message: format!("Failed to read subgraph response: {}", e),
            code: ErrorCode::SubConnectionFailed,
            url: Some(url.to_string()),
            source: Some(Box::new(e)),
        })?;
        serde_json::from_str(&body).map_err(|e| {
            MeshqlError::subgraph(
                ErrorCode::SubInvalidResponse,
                url.as_str(),
                format!("Failed to parse response: {}", e),
            )
        })
    }

    /// Run `query` and return `data.<query_name>`, null when the field is absent.
    pub async fn call(
        &self,
        url: &Url,
        query: &str,
        query_name: &str,
        authorization: Option<&str>,
    ) -> MeshqlResult<Value> {
        let mut data = self.execute(url, query, authorization).await?;
        Ok(data
            .get_mut(query_name)
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}
