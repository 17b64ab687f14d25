//! MongoDB backend tests.
//!
//! These tests require a running MongoDB replica set (bulk operations use
//! multi-document transactions). Set MONGO_URL environment variable to run them.
//!
//! Example:
//! ```bash
//! MONGO_URL="mongodb://localhost:27017/?replicaSet=rs0" \
//!     cargo test -p meshql-repos --features mongodb -- --ignored
//! ```

#![cfg(feature = "mongodb")]

mod common;

use std::sync::Arc;

use common::Fixture;
use meshql_core::auth::BearerAuth;
use meshql_core::config::{MongoConfig, StorageConfig};
use meshql_core::template::QueryTemplate;
use meshql_repos::StorageFactory;

fn get_test_url() -> Option<String> {
    std::env::var("MONGO_URL").ok()
}

async fn fixture(url: String) -> Fixture {
    let storage = StorageConfig::Mongo(MongoConfig {
        uri: url,
        db: "meshql_test".to_string(),
        collection: "certification".to_string(),
        direct_connection: false,
    });
    let factory = StorageFactory::new();
    Fixture {
        repo: factory.create_repository(&storage).await.unwrap(),
        searcher: factory
            .create_searcher(&storage, Arc::new(BearerAuth))
            .await
            .unwrap(),
        by_id: QueryTemplate::compile(r#"{"id": "{{id}}"}"#).unwrap(),
        by_name: QueryTemplate::compile(r#"{"payload.name": "{{name}}"}"#).unwrap(),
    }
}

#[tokio::test]
#[ignore] // Requires a MongoDB replica set
async fn test_certification_suite() {
    let Some(url) = get_test_url() else {
        return;
    };
    let f = fixture(url).await;
    common::certify(&f, r#"{"id": "{{id}}""#).await;
}
