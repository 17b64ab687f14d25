//! Append-only envelope repository trait.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::envelope::{Envelope, Timestamp};
use crate::error::MeshqlResult;

/// Append-only storage of envelope versions.
///
/// Every backend implements this with identical observable behaviour. Reads
/// resolve the latest version per id with `created_at <= at`, breaking
/// timestamp ties by insertion order, and treat a delete marker as absence.
/// `tokens` filters by [`Envelope::is_visible_to`].
#[async_trait]
pub trait Repository: Send + Sync {
    /// Create the table/collection and indexes if absent. Idempotent.
    async fn initialize(&self) -> MeshqlResult<()>;

    /// Liveness ping against the backend.
    async fn ready(&self) -> MeshqlResult<bool>;

    /// Insert a new version, filling a generated id and `created_at` when absent.
    async fn create(&self, envelope: Envelope) -> MeshqlResult<Envelope>;

    /// The current version of `id` as of `at`, if live and visible.
    async fn read(&self, id: &str, tokens: &[String], at: Timestamp)
        -> MeshqlResult<Option<Envelope>>;

    /// The current version of every live, visible id as of `at`.
    async fn list(&self, tokens: &[String], at: Timestamp) -> MeshqlResult<Vec<Envelope>>;

    /// Append a delete marker. Returns whether a live, visible version existed.
    async fn remove(&self, id: &str, tokens: &[String]) -> MeshqlResult<bool>;

    /// Insert every envelope in one transaction, returning them in input order.
    async fn create_many(&self, envelopes: Vec<Envelope>) -> MeshqlResult<Vec<Envelope>>;

    /// Current versions for `ids`, in input order, skipping absent ones.
    async fn read_many(
        &self,
        ids: &[String],
        tokens: &[String],
        at: Timestamp,
    ) -> MeshqlResult<Vec<Envelope>>;

    /// Remove each id in one transaction, keyed by id.
    async fn remove_many(
        &self,
        ids: &[String],
        tokens: &[String],
    ) -> MeshqlResult<HashMap<String, bool>>;
}
