use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Heartbeat as submitted by a device, before the server stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub device_sn: String,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_free: f64,
    pub temperature: f64,
    pub latency: f64,
    pub connectivity: i16,
    pub boot_time: DateTime<Utc>,
}

/// Persisted heartbeat. `job_id` ties the row to the queue job that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Heartbeat {
    pub id: Uuid,
    pub job_id: Uuid,
    pub device_sn: String,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_free: f64,
    pub temperature: f64,
    pub latency: f64,
    pub connectivity: i16,
    pub boot_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Heartbeat {
    pub fn stamp(job_id: Uuid, payload: HeartbeatPayload, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            device_sn: payload.device_sn,
            cpu_usage: payload.cpu_usage,
            ram_usage: payload.ram_usage,
            disk_free: payload.disk_free,
            temperature: payload.temperature,
            latency: payload.latency,
            connectivity: payload.connectivity,
            boot_time: payload.boot_time,
            received_at,
        }
    }

    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::CpuUsage => self.cpu_usage,
            Metric::RamUsage => self.ram_usage,
            Metric::DiskFree => self.disk_free,
            Metric::Temperature => self.temperature,
            Metric::Latency => self.latency,
            Metric::Connectivity => f64::from(self.connectivity),
        }
    }

    /// Looks a metric up by its field name; unknown names yield `None`.
    pub fn metric_value(&self, name: &str) -> Option<f64> {
        name.parse::<Metric>().ok().map(|m| self.metric(m))
    }
}

/// Numeric heartbeat fields a rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    CpuUsage,
    RamUsage,
    DiskFree,
    Temperature,
    Latency,
    Connectivity,
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu_usage" => Ok(Metric::CpuUsage),
            "ram_usage" => Ok(Metric::RamUsage),
            "disk_free" => Ok(Metric::DiskFree),
            "temperature" => Ok(Metric::Temperature),
            "latency" => Ok(Metric::Latency),
            "connectivity" => Ok(Metric::Connectivity),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
}

impl Operator {
    pub fn compare(self, current: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => current > threshold,
            Operator::Lt => current < threshold,
            Operator::Eq => current == threshold,
            Operator::Gte => current >= threshold,
            Operator::Lte => current <= threshold,
        }
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(Operator::Gt),
            "<" => Ok(Operator::Lt),
            "=" => Ok(Operator::Eq),
            ">=" => Ok(Operator::Gte),
            "<=" => Ok(Operator::Lte),
            other => Err(format!("unsupported operator '{}'", other)),
        }
    }
}

/// Threshold condition as stored. Metric and operator stay strings so that a
/// frozen copy reproduces exactly what the owner configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub metric: String,
    pub operator: String,
    pub value: f64,
}

impl Condition {
    /// Rejects conditions the engine could never match.
    pub fn check(&self) -> Result<(), String> {
        self.metric.parse::<Metric>()?;
        self.operator.parse::<Operator>()?;
        if !self.value.is_finite() {
            return Err("threshold value must be a finite number".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.operator, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_sn: Option<String>,
    #[sqlx(json)]
    pub condition: Condition,
    pub created_at: DateTime<Utc>,
}

/// Body of rule create/replace requests.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleInput {
    #[serde(default)]
    pub device_sn: Option<String>,
    pub condition: Condition,
}

/// Alert log entry. `rule_condition` is a snapshot taken when the rule fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub rule_id: Uuid,
    pub device_sn: String,
    pub message: String,
    pub triggered_value: f64,
    #[sqlx(json)]
    pub rule_condition: Condition,
    pub created_at: DateTime<Utc>,
}

/// Payload pushed to connected clients when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub user_id: Uuid,
    pub device_sn: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub metric: Option<String>,
}

pub const DEFAULT_HEARTBEAT_LIMIT: i64 = 1000;

impl HeartbeatFilter {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_HEARTBEAT_LIMIT)
            .clamp(1, DEFAULT_HEARTBEAT_LIMIT)
    }
}

/// Failed queue job as exposed for inspection.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailedJob {
    pub id: Uuid,
    #[sqlx(json)]
    pub payload: HeartbeatPayload,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
}
