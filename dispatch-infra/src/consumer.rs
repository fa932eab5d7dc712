//! 幂等消费适配器
//!
//! 代理客户端本身不感知去重；本适配器把"检查 → 处理 → 记录"的约定
//! 套在任意 `ConsumeHandler` 外层：
//! - 负载解析出信封 `msgId`，已消费则直接确认（no-op，不再触发副作用）；
//! - 处理成功后写入去重日志，并发唯一性冲突同样视为已消费；
//! - 无法解析 `msgId` 的消息不做去重，原样交给内层处理器。
//!
use crate::broker::ConsumeHandler;
use async_trait::async_trait;
use chrono::Utc;
use dispatch_domain::dedup::{ConsumeRecord, DedupLog};
use dispatch_domain::envelope::MessageEnvelope;
use std::sync::Arc;

pub struct DedupingHandler {
    log: Arc<dyn DedupLog>,
    inner: Arc<dyn ConsumeHandler>,
    queue_name: String,
}

impl DedupingHandler {
    pub fn new(
        log: Arc<dyn DedupLog>,
        inner: Arc<dyn ConsumeHandler>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            log,
            inner,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl ConsumeHandler for DedupingHandler {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<bool> {
        let Ok(envelope) = serde_json::from_slice::<MessageEnvelope>(payload) else {
            return self.inner.handle(payload).await;
        };

        if self.log.has_been_consumed(&envelope.msg_id).await? {
            tracing::debug!(msg_id = %envelope.msg_id, "duplicate delivery, acking without effect");
            return Ok(true);
        }

        let acked = self.inner.handle(payload).await?;
        if !acked {
            return Ok(false);
        }

        let record = ConsumeRecord::builder()
            .msg_id(envelope.msg_id.clone())
            .body(String::from_utf8_lossy(payload).into_owned())
            .queue_name(self.queue_name.clone())
            .created_at(Utc::now())
            .build();
        match self.log.record_consumed(record).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_duplicate() => {
                // 并发消费者抢先记录，效果等同已消费
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_domain::dedup::InMemoryDedupLog;
    use dispatch_domain::envelope::OperateType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        applied: AtomicUsize,
    }

    #[async_trait]
    impl ConsumeHandler for CountingHandler {
        async fn handle(&self, _payload: &[u8]) -> anyhow::Result<bool> {
            self.applied.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }
    }

    fn payload(msg_id: &str) -> Vec<u8> {
        let envelope = MessageEnvelope::new(
            msg_id,
            serde_json::json!({"orderNo": "ORD-0001"}),
            OperateType::Create,
        );
        serde_json::to_vec(&envelope).unwrap()
    }

    #[tokio::test]
    async fn repeated_delivery_applies_the_effect_once() {
        let inner = Arc::new(CountingHandler {
            applied: AtomicUsize::new(0),
        });
        let handler = DedupingHandler::new(
            Arc::new(InMemoryDedupLog::new()),
            inner.clone(),
            "return.queue",
        );

        let body = payload("MSG100");
        assert!(handler.handle(&body).await.unwrap());
        assert!(handler.handle(&body).await.unwrap());
        assert!(handler.handle(&body).await.unwrap());

        assert_eq!(inner.applied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn non_envelope_payloads_bypass_dedup() {
        let inner = Arc::new(CountingHandler {
            applied: AtomicUsize::new(0),
        });
        let handler = DedupingHandler::new(
            Arc::new(InMemoryDedupLog::new()),
            inner.clone(),
            "return.queue",
        );

        let body = br#"{"free":"form"}"#;
        assert!(handler.handle(body).await.unwrap());
        assert!(handler.handle(body).await.unwrap());
        assert_eq!(inner.applied.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn nacked_processing_is_not_recorded() {
        struct Rejecting;
        #[async_trait]
        impl ConsumeHandler for Rejecting {
            async fn handle(&self, _payload: &[u8]) -> anyhow::Result<bool> {
                Ok(false)
            }
        }

        let log = Arc::new(InMemoryDedupLog::new());
        let handler = DedupingHandler::new(log.clone(), Arc::new(Rejecting), "q");
        assert!(!handler.handle(&payload("MSG200")).await.unwrap());
        assert!(!log.has_been_consumed("MSG200").await.unwrap());
    }
}
