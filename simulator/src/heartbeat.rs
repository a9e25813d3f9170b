use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_sn: String,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_free: f64,
    pub temperature: f64,
    pub latency: f64,
    pub connectivity: i16,
    pub boot_time: DateTime<Utc>,
}

/// Twelve-digit serial numbers, one per simulated device.
pub fn serial_numbers(rng: &mut impl Rng, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| format!("{:012}", rng.gen_range(100_000_000_000u64..1_000_000_000_000)))
        .collect()
}

pub fn generate(rng: &mut impl Rng, device_sn: String, spike_ratio: f64) -> Heartbeat {
    let cpu_usage = if rng.gen_bool(spike_ratio) {
        rng.gen_range(90.0..=100.0) // deliberate spike so threshold rules fire
    } else {
        rng.gen_range(0.0..90.0)
    };

    Heartbeat {
        device_sn,
        cpu_usage: round2(cpu_usage),
        ram_usage: round2(rng.gen_range(0.0..=100.0)),
        disk_free: round2(rng.gen_range(0.0..=100.0)),
        temperature: round2(rng.gen_range(20.0..=80.0)),
        latency: f64::from(rng.gen_range(10u32..=200)),
        connectivity: if rng.gen_bool(0.5) { 1 } else { 0 },
        boot_time: Utc::now(),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
