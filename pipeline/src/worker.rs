use crate::errors::Result;
use crate::metrics::{
    JOBS_COMPLETED_TOTAL, JOBS_FAILED_TOTAL, JOBS_RETRIED_TOTAL, PROCESSING_LATENCY_SECONDS,
};
use crate::model::{Heartbeat, HeartbeatPayload};
use crate::queue::{Job, JobQueue};
use crate::service::HeartbeatService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to a job after one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retrying(Duration),
    Failed,
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    service: HeartbeatService,
    poll: Duration,
    lease: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        service: HeartbeatService,
        poll: Duration,
        lease: Duration,
    ) -> Self {
        Self {
            queue,
            service,
            poll,
            lease,
        }
    }

    /// Spawns `concurrency` workers that run until `shutdown` flips to true.
    pub fn spawn(self, concurrency: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            "Starting {} heartbeat workers, poll={}ms",
            concurrency,
            self.poll.as_millis()
        );
        (0..concurrency)
            .map(|n| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(n, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(&self, n: usize, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Drain everything that is due before waiting again.
                    loop {
                        match self.run_once().await {
                            Ok(Some(_)) => continue,
                            Ok(None) => break,
                            Err(e) => {
                                error!(worker = n, error = %e, "Queue poll failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(worker = n, "Worker stopped");
    }

    /// Claims and processes at most one job.
    pub async fn run_once(&self) -> Result<Option<Outcome>> {
        let Some(job) = self.queue.claim_next(self.lease).await? else {
            return Ok(None);
        };
        let outcome = self.handle(job).await?;
        Ok(Some(outcome))
    }

    async fn handle(&self, job: Job) -> Result<Outcome> {
        // Reclaimed after a worker died holding its last attempt.
        if job.attempt > job.policy.max_attempts {
            warn!(job_id = %job.id, attempt = job.attempt, "Stalled job exceeded its attempts");
            self.queue.fail(job.id, "attempts exhausted after stall").await?;
            JOBS_FAILED_TOTAL.inc();
            return Ok(Outcome::Failed);
        }

        let start = Instant::now();
        let device_sn = job.payload.device_sn.clone();

        match self.process_holding_lease(job.id, job.payload).await {
            Ok(_) => {
                PROCESSING_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                self.queue.complete(job.id).await?;
                JOBS_COMPLETED_TOTAL.inc();
                debug!(job_id = %job.id, device_sn = %device_sn, attempt = job.attempt, "Job completed");
                Ok(Outcome::Completed)
            }
            Err(e) if job.policy.is_exhausted(job.attempt) => {
                error!(
                    job_id = %job.id,
                    device_sn = %device_sn,
                    attempt = job.attempt,
                    error = %e,
                    "Job failed permanently"
                );
                self.queue.fail(job.id, &e.to_string()).await?;
                JOBS_FAILED_TOTAL.inc();
                Ok(Outcome::Failed)
            }
            Err(e) => {
                let delay = job.policy.delay_for(job.attempt);
                warn!(
                    job_id = %job.id,
                    device_sn = %device_sn,
                    "Job failed (attempt {}/{}): {}. Retrying in {}ms",
                    job.attempt,
                    job.policy.max_attempts,
                    e,
                    delay.as_millis()
                );
                self.queue.retry(job.id, delay, &e.to_string()).await?;
                JOBS_RETRIED_TOTAL.inc();
                Ok(Outcome::Retrying(delay))
            }
        }
    }

    /// Runs the job, renewing its lease every half lease until it returns.
    async fn process_holding_lease(
        &self,
        job_id: Uuid,
        payload: HeartbeatPayload,
    ) -> Result<Heartbeat> {
        let work = self.service.process_heartbeat(job_id, payload);
        tokio::pin!(work);

        let period = (self.lease / 2).max(Duration::from_millis(10));
        let mut renew = interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renew.tick() => {
                    if let Err(e) = self.queue.extend_lease(job_id, self.lease).await {
                        warn!(job_id = %job_id, error = %e, "Failed to renew job lease");
                    }
                }
            }
        }
    }
}
