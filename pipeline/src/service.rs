use crate::engine::RuleEngine;
use crate::errors::Result;
use crate::model::{Heartbeat, HeartbeatFilter, HeartbeatPayload};
use crate::repo::HeartbeatRepository;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-job unit of work: stamp, persist, evaluate.
#[derive(Clone)]
pub struct HeartbeatService {
    heartbeats: Arc<dyn HeartbeatRepository>,
    engine: RuleEngine,
}

impl HeartbeatService {
    pub fn new(heartbeats: Arc<dyn HeartbeatRepository>, engine: RuleEngine) -> Self {
        Self { heartbeats, engine }
    }

    /// Only a failure to persist is returned (and so retried by the queue).
    /// Rule evaluation runs best effort once the row is stored.
    pub async fn process_heartbeat(
        &self,
        job_id: Uuid,
        payload: HeartbeatPayload,
    ) -> Result<Heartbeat> {
        let stamped = Heartbeat::stamp(job_id, payload, Utc::now());
        let stored = self.heartbeats.insert(&stamped).await?;
        if stored.id != stamped.id {
            debug!(job_id = %job_id, "Heartbeat already stored by an earlier attempt");
        }

        match self.engine.check_rules(&stored).await {
            Ok(fired) if !fired.is_empty() => {
                debug!(
                    device_sn = %stored.device_sn,
                    notifications = fired.len(),
                    "Rules fired"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    device_sn = %stored.device_sn,
                    error = %e,
                    "Rule evaluation failed; alerts for this heartbeat are dropped"
                );
            }
        }

        Ok(stored)
    }

    pub async fn get_heartbeats(
        &self,
        device_sn: &str,
        filter: &HeartbeatFilter,
    ) -> Result<Vec<Heartbeat>> {
        self.heartbeats.find_by_device(device_sn, filter).await
    }

    pub async fn get_latest_heartbeat(&self, device_sn: &str) -> Result<Option<Heartbeat>> {
        self.heartbeats.find_latest(device_sn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Condition;
    use crate::repo::RuleRepository;
    use crate::testing::{payload, rule, MemoryStore, RecordingPublisher};

    fn service(store: &Arc<MemoryStore>, publisher: &Arc<RecordingPublisher>) -> HeartbeatService {
        let engine = RuleEngine::new(store.clone(), store.clone(), publisher.clone());
        HeartbeatService::new(store.clone(), engine)
    }

    fn cpu_over_80() -> Condition {
        Condition {
            metric: "cpu_usage".to_string(),
            operator: ">".to_string(),
            value: 80.0,
        }
    }

    #[tokio::test]
    async fn test_matching_heartbeat_end_to_end() {
        let store = Arc::new(MemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let user = Uuid::new_v4();
        store.own_device("000000000001", user);
        let r = store.add_rule(rule(user, None, cpu_over_80()));

        let before = Utc::now();
        let stored = service(&store, &publisher)
            .process_heartbeat(Uuid::new_v4(), payload("000000000001", 95.0))
            .await
            .unwrap();

        assert!(stored.received_at >= before);
        assert_eq!(store.heartbeats().len(), 1);

        let log = store.notifications();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].triggered_value, 95.0);
        assert_eq!(log[0].rule_id, r.id);
        assert_eq!(log[0].user_id, user);

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, user);
        assert_eq!(events[0].1.value, 95.0);
        assert_eq!(events[0].1.threshold, 80.0);
    }

    #[tokio::test]
    async fn test_deleted_rule_no_longer_fires() {
        let store = Arc::new(MemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let user = Uuid::new_v4();
        store.own_device("000000000001", user);
        let r = store.add_rule(rule(user, None, cpu_over_80()));

        assert!(RuleRepository::delete(store.as_ref(), user, r.id).await.unwrap());

        service(&store, &publisher)
            .process_heartbeat(Uuid::new_v4(), payload("000000000001", 95.0))
            .await
            .unwrap();
        assert!(store.notifications().iter().all(|n| n.rule_id != r.id));
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_retry_of_same_job_does_not_duplicate_row() {
        let store = Arc::new(MemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let svc = service(&store, &publisher);
        let job_id = Uuid::new_v4();

        let first = svc
            .process_heartbeat(job_id, payload("sn", 10.0))
            .await
            .unwrap();
        let second = svc
            .process_heartbeat(job_id, payload("sn", 10.0))
            .await
            .unwrap();

        assert_eq!(store.heartbeats().len(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.received_at, second.received_at);
    }

    #[tokio::test]
    async fn test_persist_failure_is_returned() {
        let store = Arc::new(MemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        store.fail_heartbeat_inserts(true);

        let res = service(&store, &publisher)
            .process_heartbeat(Uuid::new_v4(), payload("sn", 95.0))
            .await;
        assert!(res.is_err());
        assert!(store.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_evaluation_failure_keeps_heartbeat() {
        let store = Arc::new(MemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        store.fail_rule_loads(true);

        let res = service(&store, &publisher)
            .process_heartbeat(Uuid::new_v4(), payload("sn", 95.0))
            .await;
        assert!(res.is_ok());
        assert_eq!(store.heartbeats().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_is_max_received_at() {
        let store = Arc::new(MemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let svc = service(&store, &publisher);

        for cpu in [10.0, 20.0, 30.0] {
            svc.process_heartbeat(Uuid::new_v4(), payload("sn", cpu))
                .await
                .unwrap();
        }
        svc.process_heartbeat(Uuid::new_v4(), payload("other", 99.0))
            .await
            .unwrap();

        let all = svc
            .get_heartbeats("sn", &HeartbeatFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let max = all.iter().map(|h| h.received_at).max().unwrap();

        let latest = svc.get_latest_heartbeat("sn").await.unwrap().unwrap();
        assert_eq!(latest.received_at, max);
        let again = svc.get_latest_heartbeat("sn").await.unwrap().unwrap();
        assert_eq!(latest.id, again.id);

        assert!(svc.get_latest_heartbeat("missing").await.unwrap().is_none());
    }
}
