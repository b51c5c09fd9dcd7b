use std::sync::Arc;

use async_trait::async_trait;
use fhirpulse_core::{
    ChangeAction, ChangeDetector, ChangeEvent, CommitHook, CommitHookRegistry, HookError,
};
use fhirpulse_db_memory::InMemoryStorage;
use fhirpulse_storage::{EventedStorage, FhirStorage, StorageError};
use serde_json::json;
use tokio::sync::Mutex;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ChangeEvent>>,
}

#[async_trait]
impl CommitHook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_commit(&self, event: &ChangeEvent) -> Result<(), HookError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct Rejecting;

#[async_trait]
impl CommitHook for Rejecting {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn on_commit(&self, _event: &ChangeEvent) -> Result<(), HookError> {
        Err(HookError::execution("queue is full"))
    }
}

async fn evented_with(hook: Arc<dyn CommitHook>) -> EventedStorage<InMemoryStorage> {
    let hooks = Arc::new(CommitHookRegistry::new());
    hooks.register(hook).await;
    EventedStorage::new(InMemoryStorage::new(), ChangeDetector::new(hooks))
}

#[tokio::test]
async fn every_mutation_produces_one_event() -> anyhow::Result<()> {
    let recorder = Arc::new(Recorder::default());
    let storage = evented_with(recorder.clone()).await;

    let created = storage
        .create(&json!({
            "resourceType": "Patient",
            "meta": { "tenant": "t1", "compartment": { "reference": "Organization/o1" } }
        }))
        .await?;
    let mut changed = created.resource.clone();
    changed["active"] = json!(true);
    storage.update(&changed, None).await?;
    storage.read("Patient", &created.id).await?;
    storage.delete("Patient", &created.id).await?;

    let events = recorder.events.lock().await;
    let actions: Vec<_> = events.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![ChangeAction::Create, ChangeAction::Update, ChangeAction::Delete]
    );
    assert!(events.iter().all(|e| e.resource_id == created.id));
    assert!(events.iter().all(|e| e.tenant_id == "t1"));
    assert_eq!(events[0].compartment.as_deref(), Some("Organization/o1"));
    assert_eq!(events[1].snapshot["active"], true);
    Ok(())
}

#[tokio::test]
async fn failed_mutation_produces_no_event() {
    let recorder = Arc::new(Recorder::default());
    let storage = evented_with(recorder.clone()).await;

    let err = storage.delete("Patient", "missing").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(recorder.events.lock().await.is_empty());
}

#[tokio::test]
async fn hook_failure_surfaces_after_commit() {
    let storage = evented_with(Arc::new(Rejecting)).await;

    let err = storage
        .create(&json!({ "resourceType": "Patient", "id": "p1" }))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ChangeNotification { .. }));

    // The write itself is committed
    assert!(storage.read("Patient", "p1").await.unwrap().is_some());
}
