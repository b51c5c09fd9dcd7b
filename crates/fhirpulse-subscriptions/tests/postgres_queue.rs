//! PostgreSQL delivery queue and audit trail.
//!
//! These tests need a running PostgreSQL and are ignored by default:
//! `DATABASE_URL=postgres://postgres@localhost/fhirpulse_test cargo test -p fhirpulse-subscriptions --test postgres_queue -- --ignored`
//!
//! Each test works in its own schema, dropped at the end.

use std::time::Duration;

use serde_json::json;
use sqlx_postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use time::OffsetDateTime;

use fhirpulse_core::{ChangeAction, ChangeEvent, ResourceScope, generate_id};
use fhirpulse_subscriptions::{
    AuditRecord, AuditTrail, DeliveryJob, DeliveryQueue, PgDeliveryStore, SubscriptionError,
};

const LEASE: Duration = Duration::from_secs(30);

struct TestDb {
    admin: PgPool,
    pool: PgPool,
    schema: String,
}

impl TestDb {
    async fn new() -> Self {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://postgres@localhost/fhirpulse_test".to_string());
        let options: PgConnectOptions = url.parse().expect("valid DATABASE_URL");
        let schema = format!("fhirpulse_test_{}", generate_id().replace('-', "_"));

        let admin = PgPool::connect_with(options.clone()).await.unwrap();
        let create = format!("CREATE SCHEMA {schema}");
        sqlx_core::query::query(&create).execute(&admin).await.unwrap();

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options.options([("search_path", schema.as_str())]))
            .await
            .unwrap();
        Self {
            admin,
            pool,
            schema,
        }
    }

    fn store(&self) -> PgDeliveryStore {
        PgDeliveryStore::new(self.pool.clone())
    }

    async fn job_state(&self, job_id: &str) -> (String, i32, Option<String>) {
        sqlx_core::query_as::query_as(
            "SELECT status, attempt, last_error FROM subscription_delivery_job WHERE id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .unwrap()
    }

    async fn drop_schema(self) {
        self.pool.close().await;
        let drop = format!("DROP SCHEMA {} CASCADE", self.schema);
        sqlx_core::query::query(&drop)
            .execute(&self.admin)
            .await
            .unwrap();
    }
}

fn job(subscription_id: &str) -> DeliveryJob {
    let event = ChangeEvent::new(
        ChangeAction::Create,
        "Patient",
        generate_id(),
        ResourceScope::new("t1", None),
        json!({ "resourceType": "Patient" }),
    );
    DeliveryJob::new(subscription_id, event)
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn claim_complete_retry_abandon() {
    let db = TestDb::new().await;
    let store = db.store();
    let first = job("s1");
    let second = job("s1");
    store.enqueue(first.clone()).await.unwrap();
    store.enqueue(second.clone()).await.unwrap();
    assert_eq!(store.depth().await.unwrap(), 2);

    let claimed = store.claim(10, LEASE).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].event, first.event);
    assert!(store.claim(10, LEASE).await.unwrap().is_empty());

    store.complete(&first.id).await.unwrap();
    assert_eq!(db.job_state(&first.id).await.0, "delivered");
    assert!(matches!(
        store.complete(&first.id).await,
        Err(SubscriptionError::JobNotFound(_))
    ));

    store
        .retry(&second.id, Duration::ZERO, "HTTP 429")
        .await
        .unwrap();
    let (status, attempt, last_error) = db.job_state(&second.id).await;
    assert_eq!((status.as_str(), attempt), ("queued", 2));
    assert_eq!(last_error.as_deref(), Some("HTTP 429"));

    let again = store.claim(10, LEASE).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempt, 2);

    store.abandon(&second.id, "gave up").await.unwrap();
    let (status, _, last_error) = db.job_state(&second.id).await;
    assert_eq!(status, "abandoned");
    assert_eq!(last_error.as_deref(), Some("gave up"));
    assert_eq!(store.depth().await.unwrap(), 0);

    db.drop_schema().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn retry_delay_and_lease_expiry() {
    let db = TestDb::new().await;
    let store = db.store();
    let delayed = job("s1");
    store.enqueue(delayed.clone()).await.unwrap();
    store.claim(1, LEASE).await.unwrap();
    store
        .retry(&delayed.id, Duration::from_secs(60), "timeout")
        .await
        .unwrap();
    assert!(store.claim(10, LEASE).await.unwrap().is_empty());

    let leased = job("s2");
    store.enqueue(leased.clone()).await.unwrap();
    let claimed = store
        .claim(10, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let reclaimed = store.claim(10, LEASE).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, leased.id);
    assert_eq!(reclaimed[0].attempt, 1);

    db.drop_schema().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn undecodable_rows_are_abandoned_without_blocking_the_batch() {
    let db = TestDb::new().await;
    let store = db.store();
    store.ensure_tables().await.unwrap();

    sqlx_core::query::query(
        "INSERT INTO subscription_delivery_job (id, subscription_id, event) VALUES ($1, $2, $3)",
    )
    .bind("broken")
    .bind("s1")
    .bind(json!({ "not": "an event" }))
    .execute(&db.pool)
    .await
    .unwrap();
    let good = job("s1");
    store.enqueue(good.clone()).await.unwrap();

    let claimed = store.claim(10, LEASE).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, good.id);

    let (status, _, last_error) = db.job_state("broken").await;
    assert_eq!(status, "abandoned");
    assert!(last_error.unwrap().starts_with("undecodable event"));
    assert!(store.claim(10, LEASE).await.unwrap().is_empty());

    db.drop_schema().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn bounded_store_rejects_when_full() {
    let db = TestDb::new().await;
    let store = db.store().with_capacity(1);
    store.enqueue(job("s1")).await.unwrap();
    let err = store.enqueue(job("s1")).await.unwrap_err();
    assert!(matches!(err, SubscriptionError::QueueFull(1)));

    db.drop_schema().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn finished_rows_are_pruned_after_retention() {
    let db = TestDb::new().await;
    let kept = db.store();
    let done = job("s1");
    let pending = job("s1");
    kept.enqueue(done.clone()).await.unwrap();
    kept.claim(1, LEASE).await.unwrap();
    kept.complete(&done.id).await.unwrap();
    kept.enqueue(pending.clone()).await.unwrap();

    assert_eq!(kept.prune_finished().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let pruning = db.store().with_retention(Duration::ZERO);
    assert_eq!(pruning.prune_finished().await.unwrap(), 1);
    assert_eq!(db.job_state(&pending.id).await.0, "queued");

    db.drop_schema().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn audit_records_are_listed_oldest_first() {
    let db = TestDb::new().await;
    let store = db.store();
    let base = OffsetDateTime::now_utc();

    for (offset, outcome) in [(2, "4"), (1, "0")] {
        let record = AuditRecord {
            id: generate_id(),
            subscription_id: "s1".into(),
            tenant_id: "t1".into(),
            compartment: None,
            entity: "Patient/p1".into(),
            channel: "webhook".into(),
            outcome: outcome.into(),
            outcome_desc: format!("outcome {outcome}"),
            http_status: Some(200),
            attempt: 1,
            recorded_at: base + time::Duration::seconds(offset),
        };
        store.append(record).await.unwrap();
    }

    let records = store.list_for_subscription("s1").await.unwrap();
    let outcomes: Vec<_> = records.iter().map(|r| r.outcome.as_str()).collect();
    assert_eq!(outcomes, vec!["0", "4"]);
    assert_eq!(records[0].http_status, Some(200));
    assert!(store.list_for_subscription("other").await.unwrap().is_empty());

    db.drop_schema().await;
}
