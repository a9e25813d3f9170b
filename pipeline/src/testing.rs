//! In-memory stand-ins for the store, queue and publisher, used by unit tests.

use crate::errors::{Error, Result};
use crate::model::{
    Condition, FailedJob, Heartbeat, HeartbeatFilter, HeartbeatPayload, Notification,
    NotificationRule, RealtimeEvent, RuleInput,
};
use crate::queue::{Job, JobQueue, RetryPolicy};
use crate::realtime::Publisher;
use crate::repo::{HeartbeatRepository, NotificationRepository, RuleRepository};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

fn unavailable() -> Error {
    Error::Database(sqlx::Error::PoolTimedOut)
}

pub fn boot_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn payload(device_sn: &str, cpu_usage: f64) -> HeartbeatPayload {
    HeartbeatPayload {
        device_sn: device_sn.to_string(),
        cpu_usage,
        ram_usage: 40.0,
        disk_free: 50.0,
        temperature: 30.0,
        latency: 10.0,
        connectivity: 1,
        boot_time: boot_time(),
    }
}

pub fn heartbeat(device_sn: &str, cpu_usage: f64) -> Heartbeat {
    Heartbeat::stamp(Uuid::new_v4(), payload(device_sn, cpu_usage), Utc::now())
}

pub fn rule(user_id: Uuid, device_sn: Option<&str>, condition: Condition) -> NotificationRule {
    NotificationRule {
        id: Uuid::new_v4(),
        user_id,
        device_sn: device_sn.map(str::to_string),
        condition,
        created_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    heartbeats: Mutex<Vec<Heartbeat>>,
    rules: Mutex<Vec<NotificationRule>>,
    devices: Mutex<HashSet<(String, Uuid)>>,
    notifications: Mutex<Vec<Notification>>,
    fail_heartbeat_inserts: AtomicBool,
    heartbeat_insert_delay: Mutex<Duration>,
    fail_rule_loads: AtomicBool,
    fail_notification_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn own_device(&self, sn: &str, user_id: Uuid) {
        self.devices.lock().unwrap().insert((sn.to_string(), user_id));
    }

    pub fn add_rule(&self, rule: NotificationRule) -> NotificationRule {
        self.rules.lock().unwrap().push(rule.clone());
        rule
    }

    pub fn replace_condition(&self, rule_id: Uuid, condition: Condition) {
        for r in self.rules.lock().unwrap().iter_mut() {
            if r.id == rule_id {
                r.condition = condition.clone();
            }
        }
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.heartbeats.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn fail_heartbeat_inserts(&self, fail: bool) {
        self.fail_heartbeat_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn delay_heartbeat_inserts(&self, delay: Duration) {
        *self.heartbeat_insert_delay.lock().unwrap() = delay;
    }

    pub fn fail_rule_loads(&self, fail: bool) {
        self.fail_rule_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_notification_inserts(&self, fail: bool) {
        self.fail_notification_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HeartbeatRepository for MemoryStore {
    async fn insert(&self, heartbeat: &Heartbeat) -> Result<Heartbeat> {
        let delay = *self.heartbeat_insert_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_heartbeat_inserts.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut rows = self.heartbeats.lock().unwrap();
        if let Some(existing) = rows.iter().find(|h| h.job_id == heartbeat.job_id) {
            return Ok(existing.clone());
        }
        rows.push(heartbeat.clone());
        Ok(heartbeat.clone())
    }

    async fn find_by_device(
        &self,
        device_sn: &str,
        filter: &HeartbeatFilter,
    ) -> Result<Vec<Heartbeat>> {
        let mut rows: Vec<Heartbeat> = self
            .heartbeats
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.device_sn == device_sn)
            .filter(|h| filter.start.map_or(true, |s| h.received_at >= s))
            .filter(|h| filter.end.map_or(true, |e| h.received_at <= e))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.id.cmp(&a.id)));
        rows.truncate(filter.effective_limit() as usize);
        Ok(rows)
    }

    async fn find_latest(&self, device_sn: &str) -> Result<Option<Heartbeat>> {
        let rows = self
            .find_by_device(device_sn, &HeartbeatFilter::default())
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn create(&self, user_id: Uuid, input: &RuleInput) -> Result<NotificationRule> {
        let r = NotificationRule {
            id: Uuid::new_v4(),
            user_id,
            device_sn: input.device_sn.clone(),
            condition: input.condition.clone(),
            created_at: Utc::now(),
        };
        Ok(self.add_rule(r))
    }

    async fn update(
        &self,
        user_id: Uuid,
        rule_id: Uuid,
        input: &RuleInput,
    ) -> Result<Option<NotificationRule>> {
        let mut rules = self.rules.lock().unwrap();
        let found = rules
            .iter_mut()
            .find(|r| r.id == rule_id && r.user_id == user_id)
            .map(|r| {
                r.device_sn = input.device_sn.clone();
                r.condition = input.condition.clone();
                r.clone()
            });
        Ok(found)
    }

    async fn delete(&self, user_id: Uuid, rule_id: Uuid) -> Result<bool> {
        let mut rules = self.rules.lock().unwrap();
        let before = rules.len();
        rules.retain(|r| !(r.id == rule_id && r.user_id == user_id));
        Ok(rules.len() < before)
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<NotificationRule>> {
        let mut rules: Vec<NotificationRule> = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }

    async fn rules_for_device(&self, device_sn: &str) -> Result<Vec<NotificationRule>> {
        if self.fail_rule_loads.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let devices = self.devices.lock().unwrap();
        let rules = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.device_sn.as_deref().map_or(true, |sn| sn == device_sn))
            .filter(|r| devices.contains(&(device_sn.to_string(), r.user_id)))
            .cloned()
            .collect();
        Ok(rules)
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        if self.fail_notification_inserts.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Notification>> {
        let mut rows: Vec<Notification> = self
            .notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}

/// Records every publish; optionally fails them all.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(Uuid, RealtimeEvent)>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<(Uuid, RealtimeEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, user_id: Uuid, event: &RealtimeEvent) -> Result<usize> {
        self.events.lock().unwrap().push((user_id, event.clone()));
        if self.fail {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "socket closed",
            )));
        }
        Ok(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Failed,
}

struct MemJob {
    id: Uuid,
    payload: HeartbeatPayload,
    attempts: u32,
    state: JobState,
    last_error: Option<String>,
}

/// Queue that hands out due jobs immediately and records scheduling decisions.
pub struct MemoryQueue {
    policy: RetryPolicy,
    jobs: Mutex<Vec<MemJob>>,
    retries: Mutex<Vec<(Uuid, Duration)>>,
    renewals: Mutex<Vec<Uuid>>,
    completed: Mutex<Vec<Uuid>>,
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            jobs: Mutex::new(Vec::new()),
            retries: Mutex::new(Vec::new()),
            renewals: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn retries(&self) -> Vec<(Uuid, Duration)> {
        self.retries.lock().unwrap().clone()
    }

    pub fn lease_renewals(&self, id: Uuid) -> usize {
        self.renewals.lock().unwrap().iter().filter(|r| **r == id).count()
    }

    pub fn completed(&self) -> Vec<Uuid> {
        self.completed.lock().unwrap().clone()
    }

    pub fn state(&self, id: Uuid) -> Option<JobState> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .map(|j| j.state)
    }

    pub fn attempts(&self, id: Uuid) -> Option<u32> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .map(|j| j.attempts)
    }

    /// Makes the job claimable again with `attempts` already spent, the way a
    /// job looks once the lease of a dead worker expires.
    pub fn stall(&self, id: Uuid, attempts: u32) {
        for j in self.jobs.lock().unwrap().iter_mut() {
            if j.id == id {
                j.state = JobState::Waiting;
                j.attempts = attempts;
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, payload: &HeartbeatPayload) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.jobs.lock().unwrap().push(MemJob {
            id,
            payload: payload.clone(),
            attempts: 0,
            state: JobState::Waiting,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim_next(&self, _lease: Duration) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.iter_mut().find(|j| j.state == JobState::Waiting) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts += 1;
        Ok(Some(Job {
            id: job.id,
            payload: job.payload.clone(),
            attempt: job.attempts,
            policy: self.policy,
        }))
    }

    async fn extend_lease(&self, id: Uuid, _lease: Duration) -> Result<()> {
        self.renewals.lock().unwrap().push(id);
        Ok(())
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        self.jobs.lock().unwrap().retain(|j| j.id != id);
        self.completed.lock().unwrap().push(id);
        Ok(())
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<()> {
        for j in self.jobs.lock().unwrap().iter_mut() {
            if j.id == id {
                j.state = JobState::Waiting;
                j.last_error = Some(error.to_string());
            }
        }
        self.retries.lock().unwrap().push((id, delay));
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        for j in self.jobs.lock().unwrap().iter_mut() {
            if j.id == id {
                j.state = JobState::Failed;
                j.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn failed(&self, limit: i64) -> Result<Vec<FailedJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .take(limit.max(0) as usize)
            .map(|j| FailedJob {
                id: j.id,
                payload: j.payload.clone(),
                attempts: j.attempts as i32,
                last_error: j.last_error.clone(),
                created_at: Utc::now(),
                failed_at: Some(Utc::now()),
            })
            .collect())
    }
}
