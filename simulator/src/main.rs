mod heartbeat;

use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes randomized device heartbeats over MQTT.
#[derive(Debug, Parser)]
#[command(name = "heartbeat-simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Topic prefix; each device publishes to `<prefix>/<sn>`
    #[arg(long, env = "TOPIC_PREFIX", default_value = "heartbeats")]
    topic_prefix: String,

    /// Number of simulated devices (ignored when --serials is given)
    #[arg(long, env = "DEVICES", default_value_t = 3)]
    devices: usize,

    /// Fixed serial numbers to simulate, comma separated
    #[arg(long, env = "SERIALS", value_delimiter = ',')]
    serials: Vec<String>,

    /// Milliseconds between heartbeats of one device
    #[arg(long, env = "INTERVAL_MS", default_value_t = 5000)]
    interval_ms: u64,

    /// Share of heartbeats reporting a CPU spike
    #[arg(long, env = "SPIKE_RATIO", default_value_t = 0.1)]
    spike_ratio: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let spike_ratio = args.spike_ratio.clamp(0.0, 1.0);

    let mut rng = rand::thread_rng();
    let serials = if args.serials.is_empty() {
        heartbeat::serial_numbers(&mut rng, args.devices)
    } else {
        args.serials.clone()
    };

    info!("Starting heartbeat simulator");
    info!(
        "Broker: {}:{}, devices: {}, interval: {}ms",
        args.broker,
        args.port,
        serials.len(),
        args.interval_ms
    );
    info!("Serial numbers: {}", serials.join(", "));

    let client_id = format!("sim-{}", rand::random::<u32>());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping after {} heartbeats", sent);
                break;
            }
        }

        for sn in &serials {
            let hb = heartbeat::generate(&mut rng, sn.clone(), spike_ratio);
            let payload = match serde_json::to_vec(&hb) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize heartbeat: {}", e);
                    continue;
                }
            };

            let topic = format!("{}/{}", args.topic_prefix, sn);
            match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to publish heartbeat for {}: {}", sn, e),
            }
        }

        if sent % 100 < serials.len() as u64 {
            info!("Published {} heartbeats", sent);
        }
    }
}
