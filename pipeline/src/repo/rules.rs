use super::RuleRepository;
use crate::errors::Result;
use crate::model::{NotificationRule, RuleInput};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

const COLUMNS: &str = "id, user_id, device_sn, condition, created_at";

#[derive(Debug, Clone)]
pub struct PgRules {
    pool: PgPool,
}

impl PgRules {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleRepository for PgRules {
    async fn create(&self, user_id: Uuid, input: &RuleInput) -> Result<NotificationRule> {
        let query = format!(
            "INSERT INTO notification_rules ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        let rule = sqlx::query_as::<_, NotificationRule>(&query)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(&input.device_sn)
            .bind(Json(&input.condition))
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(rule)
    }

    async fn update(
        &self,
        user_id: Uuid,
        rule_id: Uuid,
        input: &RuleInput,
    ) -> Result<Option<NotificationRule>> {
        let query = format!(
            "UPDATE notification_rules \
             SET device_sn = $3, condition = $4 \
             WHERE id = $1 AND user_id = $2 \
             RETURNING {COLUMNS}"
        );
        let rule = sqlx::query_as::<_, NotificationRule>(&query)
            .bind(rule_id)
            .bind(user_id)
            .bind(&input.device_sn)
            .bind(Json(&input.condition))
            .fetch_optional(&self.pool)
            .await?;
        Ok(rule)
    }

    async fn delete(&self, user_id: Uuid, rule_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_rules WHERE id = $1 AND user_id = $2")
            .bind(rule_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<NotificationRule>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_rules \
             WHERE user_id = $1 \
             ORDER BY created_at DESC"
        );
        let rules = sqlx::query_as::<_, NotificationRule>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rules)
    }

    async fn rules_for_device(&self, device_sn: &str) -> Result<Vec<NotificationRule>> {
        let rules = sqlx::query_as::<_, NotificationRule>(
            r#"
            SELECT r.id, r.user_id, r.device_sn, r.condition, r.created_at
            FROM notification_rules r
            WHERE (r.device_sn = $1 OR r.device_sn IS NULL)
              AND EXISTS (
                  SELECT 1 FROM devices d
                  WHERE d.sn = $1 AND d.user_id = r.user_id)
            ORDER BY r.created_at ASC
            "#,
        )
        .bind(device_sn)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }
}
