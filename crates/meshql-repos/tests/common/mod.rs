//! Behaviour every backend must share, run against each one by its own test file.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use serde_json::{json, Value};

use meshql_core::envelope::{now, Envelope, Params, Timestamp};
use meshql_core::template::QueryTemplate;
use meshql_core::traits::{Repository, Searcher};

pub struct Fixture {
    pub repo: Arc<dyn Repository>,
    pub searcher: Arc<dyn Searcher>,
    /// Matches on the envelope id, parameter `id`.
    pub by_id: QueryTemplate,
    /// Matches on `payload.name`, parameter `name`.
    pub by_name: QueryTemplate,
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// An id no other test run uses, for backends whose data outlives the test.
pub fn unique(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}-{}", prefix, now().timestamp_millis(), n)
}

pub fn params(value: Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

fn tokens(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

fn version(id: &str, name: &str, at: Timestamp) -> Envelope {
    Envelope::from_value(json!({ "name": name }))
        .with_id(id)
        .with_created_at(at)
}

fn base() -> Timestamp {
    now() - Duration::seconds(60)
}

pub async fn round_trip(f: &Fixture) {
    let created = f
        .repo
        .create(Envelope::from_value(json!({"name": "Red Barn", "acres": 40})))
        .await
        .unwrap();
    let id = created.id.clone().unwrap();
    assert!(created.created_at.is_some());

    let read = f.repo.read(&id, &[], now()).await.unwrap().unwrap();
    assert_eq!(read.payload, created.payload);
    assert_eq!(read.created_at, created.created_at);
    assert!(!read.deleted);
}

pub async fn append_only_history(f: &Fixture) {
    let id = unique("hist");
    let t = base();
    f.repo.create(version(&id, "first", t)).await.unwrap();
    f.repo
        .create(version(&id, "second", t + Duration::milliseconds(10)))
        .await
        .unwrap();

    let listed: Vec<Envelope> = f
        .repo
        .list(&[], now())
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.id_str() == id)
        .collect();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].payload["name"], json!("second"));

    let earlier = f
        .repo
        .read(&id, &[], t + Duration::milliseconds(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(earlier.payload["name"], json!("first"));
}

pub async fn temporal_correctness(f: &Fixture) {
    let id = unique("temporal");
    let t1 = base();
    let t2 = t1 + Duration::milliseconds(100);
    let t3 = t1 + Duration::milliseconds(200);
    for (name, at) in [("v1", t1), ("v2", t2), ("v3", t3)] {
        f.repo.create(version(&id, name, at)).await.unwrap();
    }
    let p = params(json!({ "id": id }));

    let between = f
        .searcher
        .find(&f.by_id, &p, &[], t2 + Duration::milliseconds(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(between.payload["name"], json!("v2"));

    // The cutoff is strict: a search at exactly t2 still sees v1.
    let at_t2 = f.searcher.find(&f.by_id, &p, &[], t2).await.unwrap().unwrap();
    assert_eq!(at_t2.payload["name"], json!("v1"));

    assert!(f.searcher.find(&f.by_id, &p, &[], t1).await.unwrap().is_none());

    let latest = f.searcher.find(&f.by_id, &p, &[], now()).await.unwrap().unwrap();
    assert_eq!(latest.payload["name"], json!("v3"));
}

pub async fn soft_delete(f: &Fixture) {
    let id = unique("deleted");
    let t = base();
    f.repo.create(version(&id, "doomed", t)).await.unwrap();

    assert!(f.repo.remove(&id, &[]).await.unwrap());
    assert!(f.repo.read(&id, &[], now()).await.unwrap().is_none());
    assert!(!f.repo.remove(&id, &[]).await.unwrap());

    let p = params(json!({ "id": id }));
    assert!(f.searcher.find(&f.by_id, &p, &[], now()).await.unwrap().is_none());

    let before = f
        .searcher
        .find(&f.by_id, &p, &[], t + Duration::milliseconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.payload["name"], json!("doomed"));
}

pub async fn remove_absent_id(f: &Fixture) {
    assert!(!f.repo.remove(&unique("never"), &[]).await.unwrap());
}

pub async fn find_all_dedups(f: &Fixture) {
    let name = unique("dup");
    let a = unique("a");
    let b = unique("b");
    let t = base();
    for (i, id) in [&a, &b, &a, &b, &a].into_iter().enumerate() {
        let mut env = version(id, &name, t + Duration::milliseconds(i as i64 * 10));
        env.payload.insert("rev".to_string(), json!(i));
        f.repo.create(env).await.unwrap();
    }

    let found = f
        .searcher
        .find_all(&f.by_name, &params(json!({ "name": name })), &[], now())
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    // Newest first.
    assert_eq!(found[0].id_str(), a);
    assert_eq!(found[0].payload["rev"], json!(4));
    assert_eq!(found[1].id_str(), b);
    assert_eq!(found[1].payload["rev"], json!(3));
}

pub async fn stale_versions_do_not_match(f: &Fixture) {
    let id = unique("renamed");
    let old = unique("old-name");
    let t = base();
    f.repo.create(version(&id, &old, t)).await.unwrap();
    f.repo
        .create(version(&id, "new-name", t + Duration::milliseconds(10)))
        .await
        .unwrap();

    let p = params(json!({ "name": old }));
    assert!(f.searcher.find(&f.by_name, &p, &[], now()).await.unwrap().is_none());
    assert!(f.searcher.find_all(&f.by_name, &p, &[], now()).await.unwrap().is_empty());
    assert!(f
        .searcher
        .find(&f.by_name, &p, &[], t + Duration::milliseconds(5))
        .await
        .unwrap()
        .is_some());
}

pub async fn authorization_filtering(f: &Fixture) {
    let name = unique("guarded");
    let guarded = unique("g");
    let public = unique("p");
    let t = base();
    f.repo
        .create(version(&guarded, &name, t).with_authorized_tokens(tokens(&["A"])))
        .await
        .unwrap();
    f.repo.create(version(&public, &name, t)).await.unwrap();

    let by_id = |id: &str| params(json!({ "id": id }));
    let a = tokens(&["A"]);
    let b = tokens(&["B"]);

    assert!(f.searcher.find(&f.by_id, &by_id(&guarded), &a, now()).await.unwrap().is_some());
    assert!(f.searcher.find(&f.by_id, &by_id(&guarded), &b, now()).await.unwrap().is_none());
    assert!(f.searcher.find(&f.by_id, &by_id(&public), &b, now()).await.unwrap().is_some());

    let p = params(json!({ "name": name }));
    let for_a = f.searcher.find_all(&f.by_name, &p, &a, now()).await.unwrap();
    assert_eq!(for_a.len(), 2);
    let for_b = f.searcher.find_all(&f.by_name, &p, &b, now()).await.unwrap();
    assert_eq!(for_b.len(), 1);
    assert_eq!(for_b[0].id_str(), public);

    // Repository reads: no tokens means unfiltered.
    assert!(f.repo.read(&guarded, &[], now()).await.unwrap().is_some());
    assert!(f.repo.read(&guarded, &b, now()).await.unwrap().is_none());
    assert!(!f.repo.remove(&guarded, &b).await.unwrap());
}

pub async fn bulk_operations(f: &Fixture) {
    let ids = vec![unique("bulk"), unique("bulk"), unique("bulk")];
    let created = f
        .repo
        .create_many(
            ids.iter()
                .map(|id| Envelope::from_value(json!({ "name": id })).with_id(id.as_str()))
                .collect(),
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 3);

    let wanted = vec![ids[2].clone(), unique("missing"), ids[0].clone()];
    let read = f.repo.read_many(&wanted, &[], now()).await.unwrap();
    let read_ids: Vec<&str> = read.iter().map(|e| e.id_str()).collect();
    assert_eq!(read_ids, vec![ids[2].as_str(), ids[0].as_str()]);

    let to_remove = vec![ids[0].clone(), unique("missing")];
    let removed = f.repo.remove_many(&to_remove, &[]).await.unwrap();
    assert!(removed[&to_remove[0]]);
    assert!(!removed[&to_remove[1]]);

    let remaining = f.repo.read_many(&ids, &[], now()).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(f.repo.read_many(&[], &[], now()).await.unwrap().is_empty());
}

/// A repeated id in one `remove_many` call reports the first outcome and
/// writes a single marker.
pub async fn remove_many_repeated_id(f: &Fixture) {
    let id = unique("repeat");
    f.repo.create(version(&id, "Red Barn", base())).await.unwrap();

    let removed = f
        .repo
        .remove_many(&[id.clone(), id.clone()], &[])
        .await
        .unwrap();
    assert_eq!(removed.len(), 1);
    assert!(removed[&id]);
    assert!(f.repo.read(&id, &[], now()).await.unwrap().is_none());

    // Already gone, so a second call finds nothing live.
    let again = f.repo.remove_many(&[id.clone()], &[]).await.unwrap();
    assert!(!again[&id]);
}

/// Each envelope in a batch gets its own id and creation time.
pub async fn create_many_stamps_each(f: &Fixture) {
    let created = f
        .repo
        .create_many(vec![
            Envelope::from_value(json!({"name": "first"})),
            Envelope::from_value(json!({"name": "second"})),
            Envelope::from_value(json!({"name": "third"})),
        ])
        .await
        .unwrap();
    assert_eq!(created.len(), 3);

    let ids: Vec<String> = created.iter().map(|e| e.id.clone().unwrap()).collect();
    assert!(ids.iter().all(|id| !id.is_empty()));
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert_ne!(ids[0], ids[2]);

    for envelope in &created {
        assert!(envelope.created_at.is_some());
        let read = f
            .repo
            .read(envelope.id_str(), &[], now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.created_millis(), envelope.created_millis());
        assert_eq!(read.payload, envelope.payload);
    }
}

pub async fn timestamp_ties_favor_last_insert(f: &Fixture) {
    let id = unique("tie");
    let t = base();
    f.repo.create(version(&id, "inserted-first", t)).await.unwrap();
    f.repo.create(version(&id, "inserted-second", t)).await.unwrap();

    let read = f.repo.read(&id, &[], now()).await.unwrap().unwrap();
    assert_eq!(read.payload["name"], json!("inserted-second"));
    let found = f
        .searcher
        .find(&f.by_id, &params(json!({ "id": id })), &[], now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.payload["name"], json!("inserted-second"));
}

pub async fn template_errors_surface(f: &Fixture, broken: &str) {
    let template = QueryTemplate::compile(broken).unwrap();
    let err = f
        .searcher
        .find(&template, &params(json!({ "id": "x" })), &[], now())
        .await
        .unwrap_err();
    assert!(err.is_template_error());

    let missing = f
        .searcher
        .find_all(&f.by_id, &Params::new(), &[], now())
        .await
        .unwrap_err();
    assert!(missing.is_template_error());
}

pub async fn initialize_is_idempotent(f: &Fixture) {
    f.repo.initialize().await.unwrap();
    f.repo.initialize().await.unwrap();
    assert!(f.repo.ready().await.unwrap());
}

/// Run the whole suite against one fixture.
pub async fn certify(f: &Fixture, broken_template: &str) {
    initialize_is_idempotent(f).await;
    round_trip(f).await;
    append_only_history(f).await;
    temporal_correctness(f).await;
    soft_delete(f).await;
    remove_absent_id(f).await;
    find_all_dedups(f).await;
    stale_versions_do_not_match(f).await;
    authorization_filtering(f).await;
    bulk_operations(f).await;
    remove_many_repeated_id(f).await;
    create_many_stamps_each(f).await;
    timestamp_ties_favor_last_insert(f).await;
    template_errors_surface(f, broken_template).await;
}
