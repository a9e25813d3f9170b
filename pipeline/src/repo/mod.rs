//! Persistence store: append-mostly tables for heartbeats, rules and
//! notifications.
//!
//! The traits are the seam between the pipeline and Postgres; the engine
//! and the orchestration service only ever see `Arc<dyn ...>`.

mod heartbeats;
mod notifications;
mod rules;

pub use heartbeats::PgHeartbeats;
pub use notifications::PgNotifications;
pub use rules::PgRules;

use crate::errors::Result;
use crate::model::{Heartbeat, HeartbeatFilter, Notification, NotificationRule, RuleInput};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    /// Inserts the heartbeat unless a row for the same job already exists,
    /// returning whichever row is stored.
    async fn insert(&self, heartbeat: &Heartbeat) -> Result<Heartbeat>;

    /// Newest first by `received_at`, capped at the filter's limit.
    async fn find_by_device(
        &self,
        device_sn: &str,
        filter: &HeartbeatFilter,
    ) -> Result<Vec<Heartbeat>>;

    async fn find_latest(&self, device_sn: &str) -> Result<Option<Heartbeat>>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create(&self, user_id: Uuid, input: &RuleInput) -> Result<NotificationRule>;

    /// Replaces scope and condition. `None` when the rule is absent or not owned.
    async fn update(
        &self,
        user_id: Uuid,
        rule_id: Uuid,
        input: &RuleInput,
    ) -> Result<Option<NotificationRule>>;

    async fn delete(&self, user_id: Uuid, rule_id: Uuid) -> Result<bool>;

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<NotificationRule>>;

    /// Rules scoped to `device_sn` or unscoped, limited to owners of the device.
    async fn rules_for_device(&self, device_sn: &str) -> Result<Vec<NotificationRule>>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert(&self, notification: &Notification) -> Result<()>;

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Notification>>;
}
