use crate::errors::{Error, Result};
use crate::model::HeartbeatPayload;

const PERCENT_MIN: f64 = 0.0;
const PERCENT_MAX: f64 = 100.0;
const TEMP_MIN: f64 = -40.0;
const TEMP_MAX: f64 = 150.0;
const LATENCY_MIN: f64 = 0.0;

/// Validates a heartbeat at the gateway, before it is queued
pub fn validate(heartbeat: &HeartbeatPayload) -> Result<()> {
    if heartbeat.device_sn.trim().is_empty() {
        return Err(Error::Validation("Device SN cannot be empty".to_string()));
    }

    check_percent("CPU usage", heartbeat.cpu_usage)?;
    check_percent("RAM usage", heartbeat.ram_usage)?;
    check_percent("Disk free", heartbeat.disk_free)?;

    if !(TEMP_MIN..=TEMP_MAX).contains(&heartbeat.temperature) {
        return Err(Error::Validation(format!(
            "Temperature {} out of range [{}, {}]",
            heartbeat.temperature, TEMP_MIN, TEMP_MAX
        )));
    }

    if !heartbeat.latency.is_finite() || heartbeat.latency < LATENCY_MIN {
        return Err(Error::Validation(format!(
            "Latency {} must be a non-negative number",
            heartbeat.latency
        )));
    }

    if heartbeat.connectivity != 0 && heartbeat.connectivity != 1 {
        return Err(Error::Validation(format!(
            "Connectivity {} must be 0 or 1",
            heartbeat.connectivity
        )));
    }

    Ok(())
}

fn check_percent(name: &str, value: f64) -> Result<()> {
    if !(PERCENT_MIN..=PERCENT_MAX).contains(&value) {
        return Err(Error::Validation(format!(
            "{} {} out of range [{}, {}]",
            name, value, PERCENT_MIN, PERCENT_MAX
        )));
    }
    Ok(())
}
