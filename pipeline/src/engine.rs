//! Threshold rule evaluation.
//!
//! Each persisted heartbeat is checked against every rule that applies to its
//! device. Every matching rule fires, on every heartbeat: there is no
//! de-duplication or hysteresis.

use crate::errors::Result;
use crate::metrics::{NOTIFICATIONS_PERSISTED, RULE_MATCHES_TOTAL};
use crate::model::{Condition, Heartbeat, Notification, NotificationRule, Operator, RealtimeEvent};
use crate::realtime::Publisher;
use crate::repo::{NotificationRepository, RuleRepository};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// True when the heartbeat's metric satisfies the condition. Unknown metric
/// names and unsupported operators never match.
pub fn evaluate_rule(heartbeat: &Heartbeat, condition: &Condition) -> bool {
    let Some(current) = heartbeat.metric_value(&condition.metric) else {
        return false;
    };
    match condition.operator.parse::<Operator>() {
        Ok(op) => op.compare(current, condition.value),
        Err(_) => false,
    }
}

pub fn alert_message(heartbeat: &Heartbeat, condition: &Condition, current: f64) -> String {
    format!(
        "Alert: {} on device {}. Current value: {}",
        condition, heartbeat.device_sn, current
    )
}

#[derive(Clone)]
pub struct RuleEngine {
    rules: Arc<dyn RuleRepository>,
    notifications: Arc<dyn NotificationRepository>,
    publisher: Arc<dyn Publisher>,
}

impl RuleEngine {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        notifications: Arc<dyn NotificationRepository>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            rules,
            notifications,
            publisher,
        }
    }

    /// Evaluates all applicable rules in order and fires the matching ones.
    ///
    /// Only a failure to load the rules is returned; a failure while firing
    /// one rule is logged and the remaining rules are still evaluated.
    pub async fn check_rules(&self, heartbeat: &Heartbeat) -> Result<Vec<Notification>> {
        let rules = self.rules.rules_for_device(&heartbeat.device_sn).await?;
        debug!(
            device_sn = %heartbeat.device_sn,
            rules = rules.len(),
            "Evaluating rules"
        );

        let mut fired = Vec::new();
        for rule in &rules {
            if !evaluate_rule(heartbeat, &rule.condition) {
                continue;
            }
            RULE_MATCHES_TOTAL.inc();
            match self.trigger_notification(heartbeat, rule).await {
                Ok(notification) => fired.push(notification),
                Err(e) => error!(
                    rule_id = %rule.id,
                    device_sn = %heartbeat.device_sn,
                    error = %e,
                    "Failed to persist notification"
                ),
            }
        }
        Ok(fired)
    }

    /// Publishes the real-time event and persists the alert log entry.
    ///
    /// The two side effects are independent: a publish failure is logged and
    /// does not prevent the notification row from being written.
    pub async fn trigger_notification(
        &self,
        heartbeat: &Heartbeat,
        rule: &NotificationRule,
    ) -> Result<Notification> {
        let condition = rule.condition.clone();
        let current = heartbeat
            .metric_value(&condition.metric)
            .unwrap_or(f64::NAN);
        let message = alert_message(heartbeat, &condition, current);
        let now = Utc::now();

        let event = RealtimeEvent {
            user_id: rule.user_id,
            device_sn: heartbeat.device_sn.clone(),
            message: message.clone(),
            timestamp: now,
            metric: condition.metric.clone(),
            value: current,
            threshold: condition.value,
        };
        if let Err(e) = self.publisher.publish(rule.user_id, &event).await {
            warn!(
                user_id = %rule.user_id,
                rule_id = %rule.id,
                error = %e,
                "Real-time publish failed"
            );
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: rule.user_id,
            rule_id: rule.id,
            device_sn: heartbeat.device_sn.clone(),
            message,
            triggered_value: current,
            rule_condition: condition,
            created_at: now,
        };
        self.notifications.insert(&notification).await?;
        NOTIFICATIONS_PERSISTED.inc();
        Ok(notification)
    }
}
