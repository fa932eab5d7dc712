//! 调度器（Dispatcher）
//!
//! 读取出站行并按路由字段选择投递通道：
//! - 路由字段为空 ⇒ 同步 HTTP：以信封 JSON 为请求体调用
//!   `service_path` 解析出的下游地址，应用层非成功码上抛为
//!   [`DispatchError::Downstream`]（保留下游 `msg` 供诊断）；
//! - 路由字段非空 ⇒ 消息代理：queue/exchange/router_key 必须齐备，
//!   否则 [`DispatchError::RoutingConfig`]，齐备则发布。
//!
//! 本层不内建退避/重试；重试策略由外部调度（重读未投递行）承担。
//!
use crate::error::{DispatchError, DispatchResult};
use crate::outbox::OutboxTask;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// 下游 HTTP 响应的标准形态 `{code, msg, data}`
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamReply {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

/// 下游应用层成功码
pub const DOWNSTREAM_SUCCESS: i64 = 0;

impl DownstreamReply {
    /// 非成功码转为带下游消息的典型错误
    pub fn into_result(self) -> DispatchResult<Value> {
        if self.code == DOWNSTREAM_SUCCESS {
            Ok(self.data)
        } else {
            Err(DispatchError::Downstream {
                code: self.code,
                msg: self.msg,
            })
        }
    }
}

/// 同步 HTTP 投递通道
#[async_trait]
pub trait HttpDelivery: Send + Sync {
    /// POST 信封 JSON 至 `service_path` 解析出的地址 + `func_name`，
    /// 返回下游 `data`
    async fn post(&self, service_path: &str, func_name: &str, body: &Value)
    -> DispatchResult<Value>;
}

/// 消息代理发布通道
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(
        &self,
        body: &Value,
        exchange: &str,
        exchange_type: &str,
        queue: &str,
        routing_key: &str,
    ) -> DispatchResult<()>;
}

/// 出站行投递器
pub struct Dispatcher {
    http: Arc<dyn HttpDelivery>,
    broker: Arc<dyn BrokerPublisher>,
}

impl Dispatcher {
    pub fn new(http: Arc<dyn HttpDelivery>, broker: Arc<dyn BrokerPublisher>) -> Self {
        Self { http, broker }
    }

    /// 投递一行出站任务，失败以典型错误上抛（不在此层重试）
    pub async fn deliver(&self, task: &OutboxTask) -> DispatchResult<()> {
        let body: Value = serde_json::from_str(task.param())?;

        if task.is_broker_target() {
            self.validate_routing(task)?;
            self.broker
                .publish(
                    &body,
                    task.exchange_name(),
                    task.exchange_type(),
                    task.queue_name(),
                    task.router_key(),
                )
                .await
        } else {
            self.http
                .post(task.service_path(), task.func_name(), &body)
                .await
                .map(|_| ())
        }
    }

    fn validate_routing(&self, task: &OutboxTask) -> DispatchResult<()> {
        let mut empty = Vec::new();
        if task.queue_name().is_empty() {
            empty.push("queue_name");
        }
        if task.exchange_name().is_empty() {
            empty.push("exchange_name");
        }
        if task.router_key().is_empty() {
            empty.push("router_key");
        }
        if empty.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::routing_config(format!(
                "task {} missing {}",
                task.task_code(),
                empty.join(", ")
            )))
        }
    }
}
