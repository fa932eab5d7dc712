//! Postgres 版入站去重日志（sqlx）
//!
//! `mq_consume_log` 表以 `msg_id` 唯一约束承载幂等判定：
//! `ON CONFLICT DO NOTHING` 后零行写入即视为并发重复，
//! 归一为 `DuplicateMessage` 软信号。
//!
use async_trait::async_trait;
use dispatch_domain::dedup::{ConsumeRecord, DedupLog};
use dispatch_domain::error::{DispatchError, DispatchResult};
use sqlx::postgres::PgPool;

pub struct PgDedupLog {
    pool: PgPool,
}

impl PgDedupLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupLog for PgDedupLog {
    async fn has_been_consumed(&self, msg_id: &str) -> DispatchResult<bool> {
        let consumed: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM mq_consume_log WHERE msg_id = $1)")
                .bind(msg_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(consumed)
    }

    async fn record_consumed(&self, record: ConsumeRecord) -> DispatchResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO mq_consume_log
                (msg_id, mq_log_id, body, queue_name, exchange_name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (msg_id) DO NOTHING
            "#,
        )
        .bind(record.msg_id())
        .bind(record.mq_log_id() as i64)
        .bind(record.body())
        .bind(record.queue_name())
        .bind(record.exchange_name())
        .bind(record.created_at())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::duplicate_message(record.msg_id()));
        }
        Ok(())
    }
}
