//! 出站任务（Outbox）模型与存储协议
//!
//! 出站工作以本地行的形式与触发它的业务变更写入同一事务，
//! 行代表"至少一次"的投递意图：
//! - 行一经写入不可变，投递记录（delivered/last_error）除外；
//! - 调度器可能对同一行投递多于一次，最终处理方必须幂等或依赖去重日志；
//! - 路由字段（queue/exchange/router_key）为空时目标为 HTTP 服务。
//!
use crate::error::{DispatchError, DispatchResult};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// 出站任务行
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct OutboxTask {
    /// 存储层在持久化后赋值
    id: Option<i64>,
    /// 人类可读的任务名称
    #[builder(into)]
    task_name: String,
    /// 投递时定位处理方的服务段
    #[builder(into)]
    service_path: String,
    /// 投递时定位处理方的方法段
    #[builder(into)]
    func_name: String,
    /// 逻辑任务族编码
    #[builder(into)]
    task_code: String,
    /// 序列化后的信封（不透明负载）
    #[builder(into)]
    param: String,
    /// 可选路由判别值（如地区）
    #[builder(into, default)]
    code: String,
    #[builder(into, default)]
    queue_name: String,
    #[builder(into, default)]
    exchange_name: String,
    #[builder(into, default)]
    exchange_type: String,
    #[builder(into, default)]
    router_key: String,
    created_at: DateTime<Utc>,
}

impl OutboxTask {
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    pub fn task_code(&self) -> &str {
        &self.task_code
    }

    pub fn param(&self) -> &str {
        &self.param
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_type(&self) -> &str {
        &self.exchange_type
    }

    pub fn router_key(&self) -> &str {
        &self.router_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 任一代理路由字段非空即视为代理目标，否则为 HTTP 目标
    pub fn is_broker_target(&self) -> bool {
        !self.queue_name.is_empty()
            || !self.exchange_name.is_empty()
            || !self.router_key.is_empty()
    }

    pub(crate) fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

/// 出站任务存储：事务内落盘、待投递拉取与投递记录
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 插入一行出站任务。
    /// 必须与触发它的业务变更处于同一事务；插入失败是整个业务操作的硬失败。
    async fn insert(&self, task: &OutboxTask) -> DispatchResult<()>;

    /// 拉取待投递的行（最多 `limit` 条）
    async fn fetch_pending(&self, limit: usize) -> DispatchResult<Vec<OutboxTask>>;

    /// 将行标记为已成功投递
    async fn mark_delivered(&self, tasks: &[&OutboxTask]) -> DispatchResult<()>;

    /// 将行标记为投递失败（保留原因供重试与审计）
    async fn mark_failed(&self, tasks: &[&OutboxTask], reason: &str) -> DispatchResult<()>;
}

#[derive(Debug)]
struct InMemoryRow {
    task: OutboxTask,
    delivered: bool,
    last_error: Option<String>,
}

/// 内存版出站存储
///
/// 典型用途：测试环境与本地开发；不提供跨事务原子性。
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<InMemoryRow>>,
    /// 置为 `Some` 可模拟插入失败（验证业务事务整体回滚的调用约定）
    pub fail_inserts: Mutex<Option<String>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered_count(&self) -> usize {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.delivered)
            .count()
    }

    pub fn failed_reasons(&self) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.last_error.clone())
            .collect()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, task: &OutboxTask) -> DispatchResult<()> {
        if let Some(reason) = self.fail_inserts.lock().unwrap().clone() {
            return Err(DispatchError::Outbox { reason });
        }
        let mut rows = self.rows.lock().unwrap();
        let id = rows.len() as i64 + 1;
        rows.push(InMemoryRow {
            task: task.clone().with_id(id),
            delivered: false,
            last_error: None,
        });
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> DispatchResult<Vec<OutboxTask>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.delivered)
            .take(limit)
            .map(|r| r.task.clone())
            .collect())
    }

    async fn mark_delivered(&self, tasks: &[&OutboxTask]) -> DispatchResult<()> {
        let ids: Vec<i64> = tasks.iter().filter_map(|t| t.id()).collect();
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            if row.task.id().is_some_and(|id| ids.contains(&id)) {
                row.delivered = true;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, tasks: &[&OutboxTask], reason: &str) -> DispatchResult<()> {
        let ids: Vec<i64> = tasks.iter().filter_map(|t| t.id()).collect();
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            if row.task.id().is_some_and(|id| ids.contains(&id)) {
                row.last_error = Some(reason.to_string());
            }
        }
        Ok(())
    }
}
