//! AMQP 0-9-1 消息代理客户端（lapin）
//!
//! 连接与信道均为惰性建立并缓存复用，发现已关闭时重建：
//! - 声明交换机/队列/绑定、持久化发布、单条拉取与阻塞消费；
//! - 基于临时回复队列与 correlation id 的请求/应答（RPC）；
//! - 死信交换机与 `<queue>_dead_letter` 队列的统一装配；
//! - `close` 幂等，可在任意清理路径重复调用。
//!
//! 单个客户端实例的连接/信道为进程级共享状态；跨线程并发使用由内部
//! 互斥保护，但消费循环应按"每队列一个工作者"的模型运行。
//!
use async_trait::async_trait;
use dispatch_domain::dispatcher::BrokerPublisher;
use dispatch_domain::error::{DispatchError, DispatchResult};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// 回复队列的轮询间隔
const RPC_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// AMQP 正常关闭码
const REPLY_SUCCESS: u16 = 200;

/// 队列声明结果：名称、消息数、消费者数
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// 消费处理器：返回 `Ok(true)` 确认消息，其余情况重新入队
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<bool>;
}

/// RPC 服务端处理器：返回的 JSON 将作为应答发布到 `reply_to` 队列
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<Value>;
}

/// AMQP 客户端
pub struct BrokerClient {
    uri: String,
    conn: Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,
}

impl BrokerClient {
    /// 仅记录地址，连接推迟到首次使用
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            conn: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    /// 取缓存信道；信道或连接已关闭时重建
    pub async fn channel(&self) -> DispatchResult<Channel> {
        let mut channel = self.channel.lock().await;
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }
        let fresh = self.create_channel().await?;
        *channel = Some(fresh.clone());
        Ok(fresh)
    }

    /// 绕过缓存强制开新信道（不替换缓存信道）
    pub async fn fresh_channel(&self) -> DispatchResult<Channel> {
        self.create_channel().await
    }

    async fn create_channel(&self) -> DispatchResult<Channel> {
        let mut conn = self.conn.lock().await;
        let connected = conn.as_ref().is_some_and(|c| c.status().connected());
        if !connected {
            let fresh = Connection::connect(&self.uri, ConnectionProperties::default())
                .await
                .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
            *conn = Some(fresh);
        }
        conn.as_ref()
            .expect("connection was just established")
            .create_channel()
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        auto_delete: bool,
    ) -> DispatchResult<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))
    }

    pub async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> DispatchResult<QueueInfo> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    exclusive,
                    auto_delete,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> DispatchResult<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))
    }

    /// 发布一条消息，默认持久化（调用方已设置投递模式时保留原值）；
    /// 代理侧报告失败转为 `Publish` 错误
    pub async fn publish(
        &self,
        body: &Value,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
    ) -> DispatchResult<()> {
        let payload = encode_body(body)?;
        let channel = self.channel().await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                persistent_by_default(properties),
            )
            .await
            .map_err(|e| publish_error(exchange, routing_key, e))?
            .await
            .map_err(|e| publish_error(exchange, routing_key, e))?;
        Ok(())
    }

    /// 单条非阻塞拉取；返回是否取到消息。
    /// `auto_ack` 为 `false` 时按处理结果确认或重新入队。
    pub async fn get(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: &dyn ConsumeHandler,
    ) -> DispatchResult<bool> {
        let channel = self.channel().await?;
        let message = channel
            .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))?;

        let Some(message) = message else {
            return Ok(false);
        };
        let delivery = message.delivery;
        let outcome = handler.handle(&delivery.data).await;
        if !auto_ack {
            settle(&delivery, &outcome).await?;
        }
        Ok(true)
    }

    /// 阻塞消费循环：`Ok(true)` 确认，其余情况 nack 并重新入队；
    /// 消费者流结束（连接关闭）后返回。
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
        handler: Arc<dyn ConsumeHandler>,
    ) -> DispatchResult<()> {
        let channel = self.channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(|e| DispatchError::broker_connection(e.to_string()))?;
            let outcome = handler.handle(&delivery.data).await;
            if let Err(err) = &outcome {
                tracing::warn!(queue, error = %err, "consume handler failed, requeueing");
            }
            settle(&delivery, &outcome).await?;
        }
        Ok(())
    }

    /// 请求/应答：临时独占回复队列 + correlation id 过滤，超时报
    /// `RpcTimeout`
    pub async fn rpc_request(
        &self,
        body: &Value,
        queue: &str,
        timeout: Duration,
    ) -> DispatchResult<Value> {
        let channel = self.channel().await?;
        let reply_queue = self
            .declare_queue("", false, true, true, FieldTable::default())
            .await?;
        let correlation_id = correlation_id();

        let properties = BasicProperties::default()
            .with_reply_to(reply_queue.name.as_str().into())
            .with_correlation_id(correlation_id.as_str().into());
        self.publish(body, "", queue, properties).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(DispatchError::RpcTimeout {
                    queue: queue.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let message = channel
                .basic_get(&reply_queue.name, BasicGetOptions { no_ack: true })
                .await
                .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
            match message {
                Some(message)
                    if message
                        .delivery
                        .properties
                        .correlation_id()
                        .as_ref()
                        .is_some_and(|id| id.as_str() == correlation_id) =>
                {
                    return Ok(serde_json::from_slice(&message.delivery.data)?);
                }
                // 相关性不匹配的残留应答直接丢弃
                Some(_) => continue,
                None => tokio::time::sleep(RPC_POLL_INTERVAL).await,
            }
        }
    }

    /// RPC 服务端：持久队列、prefetch 1，应答发布到 `reply_to` 并回写
    /// 原 correlation id；处理失败 nack（不重新入队，走死信配置）
    pub async fn rpc_server(&self, queue: &str, handler: Arc<dyn RpcHandler>) -> DispatchResult<()> {
        let channel = self.channel().await?;
        self.declare_queue(queue, true, false, false, FieldTable::default())
            .await?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
        let mut consumer = channel
            .basic_consume(
                queue,
                "rpc-server",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(|e| DispatchError::broker_connection(e.to_string()))?;
            match handler.handle(&delivery.data).await {
                Ok(response) => {
                    if let (Some(reply_to), Some(correlation_id)) = (
                        delivery.properties.reply_to().as_ref(),
                        delivery.properties.correlation_id().as_ref(),
                    ) {
                        let properties = BasicProperties::default()
                            .with_correlation_id(correlation_id.clone());
                        self.publish(&response, "", reply_to.as_str(), properties)
                            .await?;
                    }
                    delivery
                        .ack(BasicAckOptions::default())
                        .await
                        .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
                }
                Err(err) => {
                    tracing::warn!(queue, error = %err, "rpc handler failed, nacking");
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await
                        .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    /// 装配死信链路：声明直连死信交换机与 `<queue>_dead_letter` 队列并绑定，
    /// 再以 x-dead-letter-*、x-message-ttl、x-max-length 参数声明主队列。
    /// 过期、超容或被 nack（不重新入队）的消息将落入死信队列而非丢失。
    pub async fn setup_dead_letter_queue(
        &self,
        queue: &str,
        dlx_exchange: &str,
        dlx_routing_key: &str,
        message_ttl_ms: Option<i32>,
        max_length: Option<i32>,
    ) -> DispatchResult<String> {
        self.declare_exchange(dlx_exchange, "direct", true, false)
            .await?;
        let dead_letter_queue = dead_letter_queue_name(queue);
        self.declare_queue(&dead_letter_queue, true, false, false, FieldTable::default())
            .await?;
        self.bind_queue(&dead_letter_queue, dlx_exchange, dlx_routing_key)
            .await?;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx_exchange.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlx_routing_key.into()),
        );
        if let Some(ttl) = message_ttl_ms {
            args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl));
        }
        if let Some(max) = max_length {
            args.insert("x-max-length".into(), AMQPValue::LongInt(max));
        }
        self.declare_queue(queue, true, false, false, args).await?;
        Ok(dead_letter_queue)
    }

    /// 确保队列存在：先被动声明探查，仅在不存在时以默认参数创建。
    /// 带死信/TTL 参数装配过的队列不会被带默认参数重复声明
    /// （参数不一致的重复声明是信道级错误 406）。
    pub async fn ensure_queue(&self, queue: &str) -> DispatchResult<()> {
        if self.message_count(queue).await.is_ok() {
            return Ok(());
        }
        // 被动声明失败已关闭信道，channel() 会重建
        self.declare_queue(queue, true, false, false, FieldTable::default())
            .await?;
        Ok(())
    }

    /// 被动探查队列消息数；队列不存在时报错而非将其创建出来
    pub async fn message_count(&self, queue: &str) -> DispatchResult<u32> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string()))?;
        Ok(queue.message_count())
    }

    /// 幂等关闭：先信道后连接，重复调用与已断开均安全
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(err) = channel.close(REPLY_SUCCESS, "closing").await {
                tracing::debug!(error = %err, "channel close");
            }
        }
        if let Some(conn) = self.conn.lock().await.take() {
            if let Err(err) = conn.close(REPLY_SUCCESS, "closing").await {
                tracing::debug!(error = %err, "connection close");
            }
        }
    }
}

/// 调度器的代理发布通道：确保交换机/队列/绑定存在后持久化发布
#[async_trait]
impl BrokerPublisher for BrokerClient {
    async fn publish(
        &self,
        body: &Value,
        exchange: &str,
        exchange_type: &str,
        queue: &str,
        routing_key: &str,
    ) -> DispatchResult<()> {
        self.declare_exchange(exchange, exchange_type, true, false)
            .await?;
        self.ensure_queue(queue).await?;
        self.bind_queue(queue, exchange, routing_key).await?;
        BrokerClient::publish(self, body, exchange, routing_key, BasicProperties::default())
            .await
    }
}

async fn settle(delivery: &lapin::message::Delivery, outcome: &anyhow::Result<bool>) -> DispatchResult<()> {
    match outcome {
        Ok(true) => delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string())),
        _ => delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| DispatchError::broker_connection(e.to_string())),
    }
}

/// 未指定投递模式时补为持久化（2）；调用方显式设置的模式保持不变
fn persistent_by_default(properties: BasicProperties) -> BasicProperties {
    if properties.delivery_mode().is_some() {
        properties
    } else {
        properties.with_delivery_mode(2)
    }
}

/// 非字符串负载序列化为 JSON 字节；字符串负载按原文发送
fn encode_body(body: &Value) -> DispatchResult<Vec<u8>> {
    match body {
        Value::String(s) => Ok(s.clone().into_bytes()),
        other => Ok(serde_json::to_vec(other)?),
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" | "" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}_dead_letter")
}

fn correlation_id() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).expect("hex digit"))
        .collect()
}

fn publish_error(exchange: &str, routing_key: &str, err: lapin::Error) -> DispatchError {
    DispatchError::Publish {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_queue_name_is_derived_from_primary() {
        assert_eq!(
            dead_letter_queue_name("return.queue"),
            "return.queue_dead_letter"
        );
    }

    #[test]
    fn exchange_kind_defaults_to_direct() {
        assert_eq!(exchange_kind(""), ExchangeKind::Direct);
        assert_eq!(exchange_kind("direct"), ExchangeKind::Direct);
        assert_eq!(exchange_kind("fanout"), ExchangeKind::Fanout);
        assert_eq!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_string())
        );
    }

    #[test]
    fn string_bodies_are_sent_verbatim() {
        let body = Value::String(r#"{"already":"encoded"}"#.to_string());
        assert_eq!(encode_body(&body).unwrap(), br#"{"already":"encoded"}"#);

        let object = serde_json::json!({"msgId": "MSG1"});
        assert_eq!(encode_body(&object).unwrap(), br#"{"msgId":"MSG1"}"#);
    }

    #[test]
    fn delivery_mode_defaults_to_persistent_without_clobbering() {
        let defaulted = persistent_by_default(BasicProperties::default());
        assert_eq!(defaulted.delivery_mode(), &Some(2));

        let transient = persistent_by_default(BasicProperties::default().with_delivery_mode(1));
        assert_eq!(transient.delivery_mode(), &Some(1));
    }

    #[test]
    fn correlation_ids_are_hex_and_distinct() {
        let a = correlation_id();
        let b = correlation_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
