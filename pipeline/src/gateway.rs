use crate::errors::Result;
use crate::metrics::{HEARTBEATS_RECEIVED_TOTAL, HEARTBEATS_REJECTED_TOTAL, JOBS_ENQUEUED_TOTAL};
use crate::model::HeartbeatPayload;
use crate::queue::JobQueue;
use crate::validate::validate;
use tracing::debug;
use uuid::Uuid;

/// Validates and enqueues a heartbeat, returning as soon as the job is stored.
pub async fn submit_heartbeat(queue: &dyn JobQueue, payload: &HeartbeatPayload) -> Result<Uuid> {
    HEARTBEATS_RECEIVED_TOTAL.inc();
    if let Err(e) = validate(payload) {
        HEARTBEATS_REJECTED_TOTAL.inc();
        return Err(e);
    }

    let job_id = queue.enqueue(payload).await?;
    JOBS_ENQUEUED_TOTAL.inc();
    debug!(job_id = %job_id, device_sn = %payload.device_sn, "Heartbeat queued");
    Ok(job_id)
}
