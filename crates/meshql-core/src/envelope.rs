//! The versioned envelope every backend stores and every searcher returns.
//!
//! A logical entity is the sequence of envelopes sharing one `id`, ordered by
//! `created_at`. Rows are never rewritten; deletion appends a marker version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arbitrary structured payload carried by an envelope.
pub type Payload = serde_json::Map<String, Value>;

/// Named parameters substituted into a query template.
pub type Params = serde_json::Map<String, Value>;

/// Point in time used for `created_at` and as-of cutoffs.
pub type Timestamp = DateTime<Utc>;

/// Current time at the millisecond precision every backend stores.
pub fn now() -> Timestamp {
    truncate_millis(Utc::now())
}

/// Drop sub-millisecond precision.
pub fn truncate_millis(ts: Timestamp) -> Timestamp {
    from_millis(ts.timestamp_millis())
}

/// Build a timestamp from epoch milliseconds, clamping out-of-range values.
pub fn from_millis(ms: i64) -> Timestamp {
    DateTime::from_timestamp_millis(ms).unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Whether a caller presenting `credentials` may see something guarded by `authorized`.
///
/// An empty guard list is readable by everyone.
pub fn tokens_permit(authorized: &[String], credentials: &[String]) -> bool {
    authorized.is_empty() || authorized.iter().any(|t| credentials.contains(t))
}

/// One immutable version of an entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical identifier shared by every version of the entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Entity payload.
    #[serde(default)]
    pub payload: Payload,
    /// When this version was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    /// Delete marker flag.
    #[serde(default)]
    pub deleted: bool,
    /// Credentials allowed to read this version; empty means public.
    #[serde(default)]
    pub authorized_tokens: Vec<String>,
}

impl Envelope {
    /// Create an envelope around a payload; id and timestamp are filled on create.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Build from a JSON value, using an empty payload for non-objects.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            _ => Self::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(truncate_millis(created_at));
        self
    }

    pub fn with_authorized_tokens(mut self, tokens: Vec<String>) -> Self {
        self.authorized_tokens = tokens;
        self
    }

    /// Fill generated fields: a v4 UUID id and `created_at = now` when absent.
    pub fn stamped(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(uuid::Uuid::new_v4().to_string());
        }
        self.created_at = Some(self.created_at.map(truncate_millis).unwrap_or_else(now));
        self
    }

    /// Tombstone superseding `previous`, written no earlier than `previous` itself.
    pub fn delete_marker(previous: &Envelope, at: Timestamp) -> Self {
        let at = match previous.created_at {
            Some(prev) if prev > at => prev,
            _ => truncate_millis(at),
        };
        Self {
            id: previous.id.clone(),
            payload: Payload::new(),
            created_at: Some(at),
            deleted: true,
            authorized_tokens: previous.authorized_tokens.clone(),
        }
    }

    /// The id, or the empty string for an unsaved envelope.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// `created_at` as epoch milliseconds (0 when unset).
    pub fn created_millis(&self) -> i64 {
        self.created_at.map(|t| t.timestamp_millis()).unwrap_or_default()
    }

    /// Repository-level token filter: an empty caller token list is unfiltered.
    pub fn is_visible_to(&self, tokens: &[String]) -> bool {
        tokens.is_empty() || tokens_permit(&self.authorized_tokens, tokens)
    }

    /// The payload with the envelope id copied in under `"id"`.
    pub fn into_payload_with_id(self) -> Payload {
        let mut payload = self.payload;
        if let Some(id) = self.id {
            payload.insert("id".to_string(), Value::String(id));
        }
        payload
    }
}

/// Reorder `found` to follow `ids`, dropping ids with no envelope.
pub fn order_by_ids(ids: &[String], found: Vec<Envelope>) -> Vec<Envelope> {
    let mut found = found;
    let mut ordered = Vec::with_capacity(found.len());
    for id in ids {
        if let Some(pos) = found.iter().position(|e| e.id_str() == id) {
            ordered.push(found.swap_remove(pos));
        }
    }
    ordered
}
