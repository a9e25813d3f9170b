use crate::errors::{Error, Result};
use crate::gateway::submit_heartbeat;
use crate::model::HeartbeatPayload;
use crate::queue::JobQueue;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// MQTT side of the submission gateway: every publish on `topic` is
/// validated and enqueued.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    topic: String,
    queue: Arc<dyn JobQueue>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", topic);

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    if let Err(e) = process_message_with_retry(&publish.payload, queue.as_ref()).await
                    {
                        error!("Dropping heartbeat from {}: {}", publish.topic, e);
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Process a message with exponential backoff retry
async fn process_message_with_retry(payload: &[u8], queue: &dyn JobQueue) -> Result<Uuid> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_message(payload, queue).await {
            Ok(job_id) => {
                if attempt > 1 {
                    info!("Message enqueued successfully on attempt {}", attempt);
                }
                return Ok(job_id);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(e);
                }

                if !e.is_transient() {
                    warn!("Non-retryable error: {}", e);
                    return Err(e);
                }

                warn!(
                    "Enqueue failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

async fn process_message(payload: &[u8], queue: &dyn JobQueue) -> Result<Uuid> {
    let heartbeat = serde_json::from_slice::<HeartbeatPayload>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    submit_heartbeat(queue, &heartbeat).await
}
