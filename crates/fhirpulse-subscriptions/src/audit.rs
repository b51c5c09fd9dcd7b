//! Delivery audit trail.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::SubscriptionResult;
use crate::types::AuditRecord;

/// Append-only record of delivery outcomes.
#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn append(&self, record: AuditRecord) -> SubscriptionResult<()>;

    /// Records for a subscription, oldest first.
    async fn list_for_subscription(
        &self,
        subscription_id: &str,
    ) -> SubscriptionResult<Vec<AuditRecord>>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditTrail {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn append(&self, record: AuditRecord) -> SubscriptionResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn list_for_subscription(
        &self,
        subscription_id: &str,
    ) -> SubscriptionResult<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}
