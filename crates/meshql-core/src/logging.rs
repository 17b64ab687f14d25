//! Tracing setup for host binaries and per-component spans.
//!
//! Components never reach for a global logger; each takes a [`tracing::Span`]
//! at construction and records its events inside it.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default directive used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "info,meshql=debug";

/// Load `.env`, then install a formatted subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init(default_directive: &str) {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}

/// Span for a storage component bound to one table or collection.
pub fn storage_span(backend: &'static str, table: &str) -> tracing::Span {
    tracing::info_span!("meshql_storage", backend, table)
}

/// Span for a graphlette query root or DTO factory.
pub fn graphlette_span(name: &str) -> tracing::Span {
    tracing::info_span!("meshql_graphlette", name)
}
