//! 任务信封构建器（TaskBuilder）
//!
//! 将一次出站用例组装为标准信封并落入出站存储：
//! - 校验处理方定位、负载、队列/服务标识、任务名称与任务族编码的存在性；
//! - 生成全新分布式标识并拼出 `msgId = 前缀 + 标识`，盖上 `requestAt`；
//! - 按用例选择的展开模式包裹负载，序列化为出站行的 `param`；
//! - `submit` 必须在触发它的业务事务内调用，插入失败原样上抛。
//!
use crate::envelope::{DEFAULT_LANGUAGE, MessageEnvelope, OperateType, WrapMode};
use crate::error::{DispatchError, DispatchResult};
use crate::id_generator::IdGenerator;
use crate::outbox::{OutboxStore, OutboxTask};
use bon::Builder;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// 默认 `msgId` 前缀
pub const DEFAULT_MSG_PREFIX: &str = "MSG";

/// 一次出站用例的描述：投递目标路由与负载
#[derive(Debug, Clone, Builder)]
pub struct TaskData {
    /// 人类可读的任务名称
    #[builder(into)]
    task_name: String,
    /// 处理方定位：服务段
    #[builder(into)]
    service_path: String,
    /// 处理方定位：方法段
    #[builder(into)]
    func_name: String,
    /// 逻辑任务族编码
    #[builder(into)]
    task_code: String,
    /// 业务负载
    payload: Value,
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
    #[builder(default)]
    wrap_mode: WrapMode,
    #[builder(default = OperateType::Create)]
    operate_type: OperateType,
}

impl TaskData {
    /// 必填字段的存在性校验，缺失时给出完整清单
    fn validate(&self) -> DispatchResult<()> {
        let mut missing = Vec::new();
        if self.task_name.is_empty() {
            missing.push("task_name");
        }
        if self.service_path.is_empty() && self.queue_name.is_empty() {
            missing.push("service_path or queue_name");
        }
        if self.func_name.is_empty() {
            missing.push("func_name");
        }
        if self.task_code.is_empty() {
            missing.push("task_code");
        }
        if self.payload.is_null() {
            missing.push("payload");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::missing_parameters(missing.join(", ")))
        }
    }
}

/// 任务信封构建器：生成标识、组装信封并写入出站存储
pub struct TaskBuilder {
    ids: Arc<IdGenerator>,
    store: Arc<dyn OutboxStore>,
    msg_prefix: String,
    language: String,
}

impl TaskBuilder {
    pub fn new(ids: Arc<IdGenerator>, store: Arc<dyn OutboxStore>) -> Self {
        Self {
            ids,
            store,
            msg_prefix: DEFAULT_MSG_PREFIX.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }

    pub fn with_msg_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.msg_prefix = prefix.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// 组装信封（生成全新 `msgId` 并盖上当前时间）
    pub async fn build_envelope(&self, data: &TaskData) -> DispatchResult<MessageEnvelope> {
        data.validate()?;
        let msg_id = self.ids.next_prefixed(&self.msg_prefix).await?;
        let mut envelope = MessageEnvelope::new(msg_id, data.payload.clone(), data.operate_type);
        envelope.language = self.language.clone();
        Ok(envelope)
    }

    /// 校验 → 组装信封 → 构造出站行（不落盘），供需要手工控制事务的调用方使用
    pub async fn prepare(&self, data: &TaskData) -> DispatchResult<OutboxTask> {
        let envelope = self.build_envelope(data).await?;
        let param = serde_json::to_string(&envelope.wrap(data.wrap_mode)?)?;

        Ok(OutboxTask::builder()
            .task_name(data.task_name.clone())
            .service_path(data.service_path.clone())
            .func_name(data.func_name.clone())
            .task_code(data.task_code.clone())
            .param(param)
            .code(data.code.clone())
            .queue_name(data.queue_name.clone())
            .exchange_name(data.exchange_name.clone())
            .exchange_type(data.exchange_type.clone())
            .router_key(data.router_key.clone())
            .created_at(Utc::now())
            .build())
    }

    /// 校验 → 组装信封 → 写入出站存储。
    /// 调用方负责保证本调用与业务变更处于同一事务。
    pub async fn submit(&self, data: TaskData) -> DispatchResult<OutboxTask> {
        let task = self.prepare(&data).await?;
        self.store.insert(&task).await?;
        Ok(task)
    }
}
