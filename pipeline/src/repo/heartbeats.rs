use super::HeartbeatRepository;
use crate::errors::Result;
use crate::model::{Heartbeat, HeartbeatFilter};
use async_trait::async_trait;
use sqlx::PgPool;

const COLUMNS: &str = "id, job_id, device_sn, cpu_usage, ram_usage, disk_free, \
     temperature, latency, connectivity, boot_time, received_at";

#[derive(Debug, Clone)]
pub struct PgHeartbeats {
    pool: PgPool,
}

impl PgHeartbeats {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HeartbeatRepository for PgHeartbeats {
    async fn insert(&self, hb: &Heartbeat) -> Result<Heartbeat> {
        let query = format!(
            "INSERT INTO heartbeats ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (job_id) DO NOTHING \
             RETURNING {COLUMNS}"
        );

        let inserted = sqlx::query_as::<_, Heartbeat>(&query)
            .bind(hb.id)
            .bind(hb.job_id)
            .bind(&hb.device_sn)
            .bind(hb.cpu_usage)
            .bind(hb.ram_usage)
            .bind(hb.disk_free)
            .bind(hb.temperature)
            .bind(hb.latency)
            .bind(hb.connectivity)
            .bind(hb.boot_time)
            .bind(hb.received_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok(row);
        }

        // An earlier attempt of the same job already stored it.
        let query = format!("SELECT {COLUMNS} FROM heartbeats WHERE job_id = $1");
        let existing = sqlx::query_as::<_, Heartbeat>(&query)
            .bind(hb.job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(existing)
    }

    async fn find_by_device(
        &self,
        device_sn: &str,
        filter: &HeartbeatFilter,
    ) -> Result<Vec<Heartbeat>> {
        let mut conditions = vec!["device_sn = $1".to_string()];
        let mut next_param = 2;

        if filter.start.is_some() {
            conditions.push(format!("received_at >= ${}", next_param));
            next_param += 1;
        }
        if filter.end.is_some() {
            conditions.push(format!("received_at <= ${}", next_param));
            next_param += 1;
        }

        let query = format!(
            "SELECT {COLUMNS} FROM heartbeats \
             WHERE {} \
             ORDER BY received_at DESC, id DESC \
             LIMIT ${}",
            conditions.join(" AND "),
            next_param
        );

        let mut query_builder = sqlx::query_as::<_, Heartbeat>(&query).bind(device_sn);
        if let Some(start) = filter.start {
            query_builder = query_builder.bind(start);
        }
        if let Some(end) = filter.end {
            query_builder = query_builder.bind(end);
        }

        let rows = query_builder
            .bind(filter.effective_limit())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find_latest(&self, device_sn: &str) -> Result<Option<Heartbeat>> {
        let query = format!(
            "SELECT {COLUMNS} FROM heartbeats \
             WHERE device_sn = $1 \
             ORDER BY received_at DESC, id DESC \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, Heartbeat>(&query)
            .bind(device_sn)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}
