//! MongoDB envelope repository and searcher.
//!
//! Each version is one document `{id, payload, created_at, deleted,
//! authorized_tokens}` with a driver-generated `_id`. The current view is an
//! aggregation: match on the cutoff, sort newest first, group by `id` keeping
//! the first document, then drop delete markers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use meshql_core::auth::Auth;
use meshql_core::config::validate_identifier;
use meshql_core::envelope::{
    from_millis, now, order_by_ids, Envelope, Params, Payload, Timestamp,
};
use meshql_core::error::{ErrorCode, MeshqlError, MeshqlResult};
use meshql_core::logging::storage_span;
use meshql_core::template::{escape_json_string, QueryTemplate};
use meshql_core::traits::{QueryCompiler, Repository, Searcher};

use mongodb::{
    bson::{doc, Bson, DateTime as BsonDateTime, Document},
    options::ClientOptions,
    Client, Collection, IndexModel,
};
use tracing::Span;

fn mongo_error(code: ErrorCode, context: &'static str) -> impl FnOnce(mongodb::error::Error) -> MeshqlError {
    move |e| MeshqlError::storage_from(code, format!("{}: {}", context, e), e)
}

/// Connect a client; `direct_connection` bypasses replica-set discovery.
pub async fn connect(uri: &str, direct_connection: bool) -> MeshqlResult<Client> {
    let mut options = ClientOptions::parse(uri)
        .await
        .map_err(mongo_error(ErrorCode::DbConnectionFailed, "Failed to parse MongoDB URL"))?;
    options.app_name = Some("meshql".to_string());
    if direct_connection {
        options.direct_connection = Some(true);
    }
    Client::with_options(options)
        .map_err(mongo_error(ErrorCode::DbConnectionFailed, "Failed to create MongoDB client"))
}

/// Compiles `{{name}}` templates into a BSON filter document.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentQueryCompiler;

impl QueryCompiler for DocumentQueryCompiler {
    type Query = Document;

    fn compile_query(&self, template: &QueryTemplate, params: &Params) -> MeshqlResult<Document> {
        let rendered = template.render_with(params, escape_json_string)?;
        let invalid = |reason: String| {
            MeshqlError::template(ErrorCode::TplInvalidQuery, reason, template.source())
        };
        match serde_json::from_str::<serde_json::Value>(&rendered) {
            Ok(serde_json::Value::Object(map)) => Ok(object_to_document(map)),
            Ok(other) => Err(invalid(format!("Query must be a JSON object, got {}", other))),
            Err(e) => Err(invalid(format!("Query is not valid JSON: {}", e))),
        }
    }
}

/// Stages producing the current view of each id at the cutoff.
fn current_view(cutoff: Document, filter: Option<Document>, limit_one: bool) -> Vec<Document> {
    let newest_first = doc! { "created_at": -1, "_id": -1 };
    let mut live = doc! { "deleted": false };
    if let Some(filter) = filter {
        live = doc! { "$and": [live, filter] };
    }

    let mut pipeline = vec![
        doc! { "$match": cutoff },
        doc! { "$sort": newest_first.clone() },
        doc! { "$group": { "_id": "$id", "doc": { "$first": "$$ROOT" } } },
        doc! { "$replaceRoot": { "newRoot": "$doc" } },
        doc! { "$match": live },
        doc! { "$sort": newest_first },
    ];
    if limit_one {
        pipeline.push(doc! { "$limit": 1 });
    }
    pipeline
}

fn read_cutoff(at: Timestamp, ids: Option<&[String]>) -> Document {
    let mut cutoff = doc! { "created_at": { "$lte": BsonDateTime::from_millis(at.timestamp_millis()) } };
    match ids {
        Some([id]) => {
            cutoff.insert("id", id.as_str());
        }
        Some(ids) => {
            cutoff.insert("id", doc! { "$in": ids.to_vec() });
        }
        None => {}
    }
    cutoff
}

async fn aggregate(
    collection: &Collection<Document>,
    pipeline: Vec<Document>,
) -> MeshqlResult<Vec<Envelope>> {
    let mut cursor = collection
        .aggregate(pipeline, None)
        .await
        .map_err(mongo_error(ErrorCode::DbOperationFailed, "Failed to aggregate"))?;

    let mut envelopes = Vec::new();
    while cursor
        .advance()
        .await
        .map_err(mongo_error(ErrorCode::DbOperationFailed, "Cursor error"))?
    {
        let doc = cursor
            .deserialize_current()
            .map_err(mongo_error(ErrorCode::DbCorruptRow, "Failed to deserialize"))?;
        envelopes.push(from_document(doc)?);
    }
    Ok(envelopes)
}

/// Append-only envelope storage in one MongoDB collection.
pub struct MongoRepository {
    client: Client,
    collection: Collection<Document>,
    span: Span,
}

impl MongoRepository {
    pub fn new(client: Client, db: &str, collection: &str) -> MeshqlResult<Self> {
        validate_identifier(collection)?;
        Ok(Self {
            collection: client.database(db).collection(collection),
            client,
            span: storage_span("mongo", collection),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Insert all documents in one multi-document transaction.
    ///
    /// Transactions need a replica set or sharded cluster.
    async fn insert_atomically(&self, docs: Vec<Document>) -> MeshqlResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(mongo_error(ErrorCode::DbTransactionFailed, "Failed to start session"))?;
        session
            .start_transaction(None)
            .await
            .map_err(mongo_error(ErrorCode::DbTransactionFailed, "Failed to start transaction"))?;

        if let Err(e) = self
            .collection
            .insert_many_with_session(docs, None, &mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            return Err(mongo_error(ErrorCode::DbTransactionFailed, "Failed to insert envelopes")(e));
        }

        session
            .commit_transaction()
            .await
            .map_err(mongo_error(ErrorCode::DbTransactionFailed, "Failed to commit transaction"))
    }
}

#[async_trait]
impl Repository for MongoRepository {
    async fn initialize(&self) -> MeshqlResult<()> {
        let index = IndexModel::builder()
            .keys(doc! { "id": 1, "created_at": -1 })
            .build();
        self.collection
            .create_index(index, None)
            .await
            .map_err(mongo_error(ErrorCode::DbSchemaFailed, "Failed to create index"))?;
        tracing::debug!(parent: &self.span, "indexes ready");
        Ok(())
    }

    async fn ready(&self) -> MeshqlResult<bool> {
        Ok(self
            .client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .is_ok())
    }

    async fn create(&self, envelope: Envelope) -> MeshqlResult<Envelope> {
        let envelope = envelope.stamped();
        self.collection
            .insert_one(to_document(&envelope), None)
            .await
            .map_err(mongo_error(ErrorCode::DbOperationFailed, "Failed to insert envelope"))?;
        tracing::debug!(parent: &self.span, id = envelope.id_str(), "created envelope");
        Ok(envelope)
    }

    async fn read(
        &self,
        id: &str,
        tokens: &[String],
        at: Timestamp,
    ) -> MeshqlResult<Option<Envelope>> {
        let ids = [id.to_string()];
        let pipeline = current_view(read_cutoff(at, Some(&ids[..])), None, false);
        let found = aggregate(&self.collection, pipeline).await?;
        Ok(found.into_iter().find(|e| e.is_visible_to(tokens)))
    }

    async fn list(&self, tokens: &[String], at: Timestamp) -> MeshqlResult<Vec<Envelope>> {
        let pipeline = current_view(read_cutoff(at, None), None, false);
        let mut found = aggregate(&self.collection, pipeline).await?;
        found.retain(|e| e.is_visible_to(tokens));
        Ok(found)
    }

    async fn remove(&self, id: &str, tokens: &[String]) -> MeshqlResult<bool> {
        let Some(live) = self.read(id, tokens, now()).await? else {
            return Ok(false);
        };
        let marker = Envelope::delete_marker(&live, now());
        self.collection
            .insert_one(to_document(&marker), None)
            .await
            .map_err(mongo_error(ErrorCode::DbOperationFailed, "Failed to insert delete marker"))?;
        tracing::debug!(parent: &self.span, id, "removed envelope");
        Ok(true)
    }

    async fn create_many(&self, envelopes: Vec<Envelope>) -> MeshqlResult<Vec<Envelope>> {
        let envelopes: Vec<Envelope> = envelopes.into_iter().map(Envelope::stamped).collect();
        self.insert_atomically(envelopes.iter().map(to_document).collect())
            .await?;
        tracing::debug!(parent: &self.span, count = envelopes.len(), "created envelopes");
        Ok(envelopes)
    }

    async fn read_many(
        &self,
        ids: &[String],
        tokens: &[String],
        at: Timestamp,
    ) -> MeshqlResult<Vec<Envelope>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let pipeline = current_view(read_cutoff(at, Some(ids)), None, false);
        let mut found = aggregate(&self.collection, pipeline).await?;
        found.retain(|e| e.is_visible_to(tokens));
        Ok(order_by_ids(ids, found))
    }

    async fn remove_many(
        &self,
        ids: &[String],
        tokens: &[String],
    ) -> MeshqlResult<HashMap<String, bool>> {
        let at = now();
        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }
        let live = self.read_many(&unique, tokens, at).await?;
        let markers: Vec<Document> = live
            .iter()
            .map(|e| to_document(&Envelope::delete_marker(e, at)))
            .collect();
        self.insert_atomically(markers).await?;

        Ok(ids
            .iter()
            .map(|id| (id.clone(), live.iter().any(|e| e.id_str() == id)))
            .collect())
    }
}

/// Template-driven point-in-time search over a MongoDB collection.
pub struct MongoSearcher {
    collection: Collection<Document>,
    compiler: DocumentQueryCompiler,
    auth: Arc<dyn Auth>,
    span: Span,
}

impl MongoSearcher {
    pub fn new(client: &Client, db: &str, collection: &str, auth: Arc<dyn Auth>) -> MeshqlResult<Self> {
        validate_identifier(collection)?;
        Ok(Self {
            collection: client.database(db).collection(collection),
            compiler: DocumentQueryCompiler,
            auth,
            span: storage_span("mongo", collection),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    async fn search(
        &self,
        template: &QueryTemplate,
        params: &Params,
        at: Timestamp,
        limit_one: bool,
    ) -> MeshqlResult<Vec<Envelope>> {
        let filter = self.compiler.compile_query(template, params)?;
        tracing::trace!(parent: &self.span, %filter, "search");
        let cutoff = doc! { "created_at": { "$lt": BsonDateTime::from_millis(at.timestamp_millis()) } };
        aggregate(&self.collection, current_view(cutoff, Some(filter), limit_one)).await
    }
}

#[async_trait]
impl Searcher for MongoSearcher {
    async fn find(
        &self,
        template: &QueryTemplate,
        params: &Params,
        credentials: &[String],
        at: Timestamp,
    ) -> MeshqlResult<Option<Envelope>> {
        let found = self.search(template, params, at, true).await?.into_iter().next();
        Ok(found.filter(|e| self.auth.is_authorized(credentials, e)))
    }

    async fn find_all(
        &self,
        template: &QueryTemplate,
        params: &Params,
        credentials: &[String],
        at: Timestamp,
    ) -> MeshqlResult<Vec<Envelope>> {
        let mut found = self.search(template, params, at, false).await?;
        found.retain(|e| self.auth.is_authorized(credentials, e));
        Ok(found)
    }
}

fn to_document(envelope: &Envelope) -> Document {
    doc! {
        "id": envelope.id_str(),
        "payload": object_to_document(envelope.payload.clone()),
        "created_at": BsonDateTime::from_millis(envelope.created_millis()),
        "deleted": envelope.deleted,
        "authorized_tokens": envelope.authorized_tokens.clone(),
    }
}

fn from_document(doc: Document) -> MeshqlResult<Envelope> {
    let corrupt = |e: mongodb::bson::document::ValueAccessError| {
        MeshqlError::storage_from(ErrorCode::DbCorruptRow, format!("Malformed envelope document: {}", e), e)
    };
    let id = doc.get_str("id").map_err(corrupt)?.to_string();
    let created_at = doc.get_datetime("created_at").map_err(corrupt)?.timestamp_millis();
    let payload: Payload = match doc.get("payload") {
        Some(Bson::Document(payload)) => payload
            .iter()
            .map(|(k, v)| (k.clone(), bson_to_json(v.clone())))
            .collect(),
        _ => Payload::new(),
    };
    let authorized_tokens = doc
        .get_array("authorized_tokens")
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(Envelope {
        id: Some(id),
        payload,
        created_at: Some(from_millis(created_at)),
        deleted: doc.get_bool("deleted").unwrap_or(false),
        authorized_tokens,
    })
}

fn object_to_document(map: serde_json::Map<String, serde_json::Value>) -> Document {
    map.into_iter().map(|(k, v)| (k, json_to_bson(v))).collect()
}

fn json_to_bson(value: serde_json::Value) -> Bson {
    match value {
        serde_json::Value::Null => Bson::Null,
        serde_json::Value::Bool(b) => Bson::Boolean(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else if let Some(f) = n.as_f64() {
                Bson::Double(f)
            } else {
                Bson::Null
            }
        }
        serde_json::Value::String(s) => Bson::String(s),
        serde_json::Value::Array(arr) => Bson::Array(arr.into_iter().map(json_to_bson).collect()),
        serde_json::Value::Object(obj) => Bson::Document(object_to_document(obj)),
    }
}

fn bson_to_json(value: Bson) -> serde_json::Value {
    match value {
        Bson::Null | Bson::Undefined => serde_json::Value::Null,
        Bson::Boolean(b) => serde_json::Value::Bool(b),
        Bson::Int32(i) => serde_json::Value::Number(i.into()),
        Bson::Int64(i) => serde_json::Value::Number(i.into()),
        Bson::Double(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Bson::String(s) => serde_json::Value::String(s),
        Bson::Array(arr) => serde_json::Value::Array(arr.into_iter().map(bson_to_json).collect()),
        Bson::Document(doc) => {
            serde_json::Value::Object(doc.into_iter().map(|(k, v)| (k, bson_to_json(v))).collect())
        }
        Bson::DateTime(dt) => serde_json::Value::Number(dt.timestamp_millis().into()),
        Bson::ObjectId(oid) => serde_json::Value::String(oid.to_hex()),
        _ => serde_json::Value::Null,
    }
}
