//! 投递引擎（DispatchEngine）
//!
//! 编排"拉取出站行 → 投递 → 标记"的长驻任务：
//! - 周期从出站存储拉取待投递行，逐行经调度器投递；
//! - 成功批量标记 delivered，失败批量标记 failed（保留原因）；
//! - 提供关闭与等待的 `EngineHandle`。
//!
//! 引擎只是外部化的重试载体：失败行留在存储中等待下一轮重读，
//! 不在行内做退避计算。
//!
use crate::dispatcher::Dispatcher;
use crate::outbox::{OutboxStore, OutboxTask};
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// DispatchEngine：
/// - 周期性从 OutboxStore 拉取待投递行
/// - 经 Dispatcher 投递（HTTP 或消息代理），并回写投递记录
#[derive(Builder)]
pub struct DispatchEngine {
    outbox: Arc<dyn OutboxStore>,
    dispatcher: Arc<Dispatcher>,
    #[builder(default)]
    config: EngineConfig,
}

impl DispatchEngine {
    /// 启动投递引擎，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> EngineHandle {
        let token = CancellationToken::new();

        let engine = self.clone();
        let interval = self.config.poll_interval;
        let task = Self::spawn_periodic(token.clone(), interval, move || {
            let engine = engine.clone();
            async move {
                if let Err(err) = engine.drain_once().await {
                    tracing::warn!(error = %err, "outbox poll failed");
                }
            }
        });

        EngineHandle {
            token,
            tasks: vec![task],
        }
    }

    /// 执行一轮"拉取 → 投递 → 标记"；供引擎周期调用，也可由外部调度直接驱动
    pub async fn drain_once(&self) -> crate::error::DispatchResult<usize> {
        let pending = self.outbox.fetch_pending(self.config.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut delivered: Vec<&OutboxTask> = Vec::new();
        let mut failed: Vec<(&OutboxTask, String)> = Vec::new();

        for task in &pending {
            match self.dispatcher.deliver(task).await {
                Ok(()) => delivered.push(task),
                Err(err) => {
                    tracing::warn!(
                        task_code = task.task_code(),
                        error = %err,
                        "delivery failed, row stays pending"
                    );
                    failed.push((task, err.to_string()));
                }
            }
        }

        if !delivered.is_empty() {
            self.outbox.mark_delivered(&delivered).await?;
        }
        for (task, reason) in &failed {
            self.outbox.mark_failed(&[*task], reason).await?;
        }

        Ok(delivered.len())
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }
}

/// 投递引擎配置
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Outbox 轮询间隔
    pub poll_interval: Duration,
    /// 单轮拉取的行数上限
    pub batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

/// 引擎运行句柄：用于优雅关闭与等待任务结束
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{BrokerPublisher, HttpDelivery};
    use crate::error::{DispatchError, DispatchResult};
    use crate::outbox::InMemoryOutboxStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHttp {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpDelivery for FlakyHttp {
        async fn post(
            &self,
            service_path: &str,
            _func_name: &str,
            _body: &Value,
        ) -> DispatchResult<Value> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if service_path == "erp" {
                Err(DispatchError::Downstream {
                    code: 500,
                    msg: "erp offline".into(),
                })
            } else {
                Ok(Value::Null)
            }
        }
    }

    struct NoopBroker;

    #[async_trait]
    impl BrokerPublisher for NoopBroker {
        async fn publish(
            &self,
            _body: &Value,
            _exchange: &str,
            _exchange_type: &str,
            _queue: &str,
            _routing_key: &str,
        ) -> DispatchResult<()> {
            Ok(())
        }
    }

    fn task(service: &str) -> OutboxTask {
        OutboxTask::builder()
            .task_name("t")
            .service_path(service)
            .func_name("/notify")
            .task_code("NOTIFY")
            .param(r#"{"msgId":"MSG1","data":{}}"#)
            .created_at(Utc::now())
            .build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_delivers_and_records_failures() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.insert(&task("warehouse")).await.unwrap();
        store.insert(&task("erp")).await.unwrap();
        store.insert(&task("outbound")).await.unwrap();

        let http = Arc::new(FlakyHttp {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(http.clone(), Arc::new(NoopBroker)));
        let engine = Arc::new(
            DispatchEngine::builder()
                .outbox(store.clone())
                .dispatcher(dispatcher)
                .config(EngineConfig {
                    poll_interval: Duration::from_millis(50),
                    batch_size: 10,
                })
                .build(),
        );

        let handle = engine.start();
        // 条件轮询，避免固定 sleep 的脆弱性
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.delivered_count() == 2 && !store.failed_reasons().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(store.delivered_count(), 2);
        let reasons = store.failed_reasons();
        assert!(reasons.iter().any(|r| r.contains("erp offline")));
        // 失败行保持待投递，等待下一轮
        assert_eq!(store.fetch_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_once_reports_delivered_count() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.insert(&task("warehouse")).await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(FlakyHttp {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(NoopBroker),
        ));
        let engine = DispatchEngine::builder()
            .outbox(store.clone())
            .dispatcher(dispatcher)
            .build();

        assert_eq!(engine.drain_once().await.unwrap(), 1);
        assert_eq!(engine.drain_once().await.unwrap(), 0);
    }
}
