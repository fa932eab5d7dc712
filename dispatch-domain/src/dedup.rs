//! 入站去重日志（DedupLog）
//!
//! 记录已处理的入站消息标识，使同一消息的重复投递成为 no-op。
//! 代理客户端本身不感知去重，任何消费方必须显式按
//! "检查 → 处理 → 记录" 的约定在处理器外层套用本日志：
//! - 已存在的 `msg_id` 以 [`DispatchError::DuplicateMessage`] 软信号短路，
//!   而非静默成功，也非失败；
//! - 并发插入触发唯一性冲突时同样视为已消费。
//!
use crate::error::{DispatchError, DispatchResult};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// 一条已消费记录
#[derive(Debug, Clone, Builder)]
pub struct ConsumeRecord {
    /// 入站消息标识（唯一）
    #[builder(into)]
    msg_id: String,
    /// 关联的内部记录标识
    #[builder(default)]
    mq_log_id: u64,
    /// 消息原文（供审计）
    #[builder(into, default)]
    body: String,
    #[builder(into, default)]
    queue_name: String,
    #[builder(into, default)]
    exchange_name: String,
    created_at: DateTime<Utc>,
}

impl ConsumeRecord {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn mq_log_id(&self) -> u64 {
        self.mq_log_id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// 入站去重日志协议
#[async_trait]
pub trait DedupLog: Send + Sync {
    /// `msg_id` 是否已被消费
    async fn has_been_consumed(&self, msg_id: &str) -> DispatchResult<bool>;

    /// 记录一条已消费消息；`msg_id` 已存在时返回
    /// [`DispatchError::DuplicateMessage`]（软信号，调用方应短路而非失败）
    async fn record_consumed(&self, record: ConsumeRecord) -> DispatchResult<()>;
}

/// 消费守卫：已消费则以软信号短路，否则执行处理并记录。
/// 处理成功但记录时发现并发冲突，同样归一为软信号。
pub async fn consume_once<F, Fut, T>(
    log: &dyn DedupLog,
    record: ConsumeRecord,
    process: F,
) -> DispatchResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = DispatchResult<T>>,
{
    if log.has_been_consumed(record.msg_id()).await? {
        return Err(DispatchError::duplicate_message(record.msg_id()));
    }
    let value = process().await?;
    log.record_consumed(record).await?;
    Ok(value)
}

/// 内存版去重日志，典型用途：测试环境与本地开发
#[derive(Debug, Default)]
pub struct InMemoryDedupLog {
    records: Mutex<HashMap<String, ConsumeRecord>>,
}

impl InMemoryDedupLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl DedupLog for InMemoryDedupLog {
    async fn has_been_consumed(&self, msg_id: &str) -> DispatchResult<bool> {
        Ok(self.records.lock().unwrap().contains_key(msg_id))
    }

    async fn record_consumed(&self, record: ConsumeRecord) -> DispatchResult<()> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(record.msg_id()) {
            return Err(DispatchError::duplicate_message(record.msg_id()));
        }
        records.insert(record.msg_id().to_string(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(msg_id: &str) -> ConsumeRecord {
        ConsumeRecord::builder()
            .msg_id(msg_id)
            .mq_log_id(42)
            .body(r#"{"msgId":"MSG1"}"#)
            .queue_name("return.queue")
            .created_at(Utc::now())
            .build()
    }

    #[tokio::test]
    async fn second_record_is_a_duplicate_signal() {
        let log = InMemoryDedupLog::new();
        log.record_consumed(record("MSG1")).await.unwrap();

        let err = log.record_consumed(record("MSG1")).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn consume_once_applies_the_side_effect_exactly_once() {
        let log = InMemoryDedupLog::new();
        let applied = Arc::new(AtomicUsize::new(0));

        for attempt in 0..2 {
            let applied = applied.clone();
            let result = consume_once(&log, record("MSG1"), || async move {
                applied.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await;

            if attempt == 0 {
                assert!(result.is_ok());
            } else {
                assert!(result.unwrap_err().is_duplicate());
            }
        }
        assert_eq!(applied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_processing_leaves_no_record() {
        let log = InMemoryDedupLog::new();
        let result: DispatchResult<()> = consume_once(&log, record("MSG1"), || async {
            Err(DispatchError::Consumer {
                handler: "return-inbound".into(),
                reason: "downstream offline".into(),
            })
        })
        .await;

        assert!(result.is_err());
        assert!(!log.has_been_consumed("MSG1").await.unwrap());
    }
}
