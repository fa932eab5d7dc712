//! Postgres 版出站任务存储（sqlx）
//!
//! 行结构见 `schema.sql` 的 `outbox_task` 表：
//! - `insert_with` 接受调用方的执行器，业务事务内传入事务句柄即可保证
//!   出站行与业务变更原子提交；
//! - 行本身不可变，投递记录仅回写 `delivered_at`/`last_error` 两列；
//! - `fetch_pending` 按主键序返回未投递行（投递顺序仍是尽力而为）。
//!
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_domain::error::DispatchResult;
use dispatch_domain::outbox::{OutboxStore, OutboxTask};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 以任意执行器插入（业务事务内应传入 `&mut *tx`）
    pub async fn insert_with<'e, E>(&self, executor: E, task: &OutboxTask) -> DispatchResult<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO outbox_task
                (task_name, service_path, func_name, task_code, param, code,
                 queue_name, exchange_name, exchange_type, router_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.task_name())
        .bind(task.service_path())
        .bind(task.func_name())
        .bind(task.task_code())
        .bind(task.param())
        .bind(task.code())
        .bind(task.queue_name())
        .bind(task.exchange_name())
        .bind(task.exchange_type())
        .bind(task.router_key())
        .bind(task.created_at())
        .execute(executor)
        .await?;
        Ok(())
    }

    fn row_to_task(row: &PgRow) -> DispatchResult<OutboxTask> {
        Ok(OutboxTask::builder()
            .id(row.try_get::<i64, _>("id")?)
            .task_name(row.try_get::<String, _>("task_name")?)
            .service_path(row.try_get::<String, _>("service_path")?)
            .func_name(row.try_get::<String, _>("func_name")?)
            .task_code(row.try_get::<String, _>("task_code")?)
            .param(row.try_get::<String, _>("param")?)
            .code(row.try_get::<String, _>("code")?)
            .queue_name(row.try_get::<String, _>("queue_name")?)
            .exchange_name(row.try_get::<String, _>("exchange_name")?)
            .exchange_type(row.try_get::<String, _>("exchange_type")?)
            .router_key(row.try_get::<String, _>("router_key")?)
            .created_at(row.try_get::<DateTime<Utc>, _>("created_at")?)
            .build())
    }

    fn ids(tasks: &[&OutboxTask]) -> Vec<i64> {
        tasks.iter().filter_map(|t| t.id()).collect()
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, task: &OutboxTask) -> DispatchResult<()> {
        self.insert_with(&self.pool, task).await
    }

    async fn fetch_pending(&self, limit: usize) -> DispatchResult<Vec<OutboxTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_name, service_path, func_name, task_code, param, code,
                   queue_name, exchange_name, exchange_type, router_key, created_at
            FROM outbox_task
            WHERE delivered_at IS NULL
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn mark_delivered(&self, tasks: &[&OutboxTask]) -> DispatchResult<()> {
        let ids = Self::ids(tasks);
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox_task SET delivered_at = NOW() WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, tasks: &[&OutboxTask], reason: &str) -> DispatchResult<()> {
        let ids = Self::ids(tasks);
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox_task SET last_error = $2 WHERE id = ANY($1)")
            .bind(&ids)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
