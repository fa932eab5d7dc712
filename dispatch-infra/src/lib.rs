//! 可靠投递基础设施适配（dispatch-infra）
//!
//! 将 `dispatch-domain` 的协议绑定到真实后端：
//! - Redis 协调器（`redis_coordinator`）：原子计数、TTL 键与原子锁
//! - AMQP 0-9-1 客户端（`broker`）：声明/绑定/发布/消费/RPC/死信
//! - HTTP 投递通道（`http_delivery`）与服务注册表（`service_registry`）
//! - Postgres 出站存储（`outbox_pg`）与去重日志（`dedup_pg`），
//!   表结构见 `schema.sql`
//! - 幂等消费适配器（`consumer`）：把去重日志套在消费处理器外层
//!
//! 各适配器均为显式构造、按引用传递的实例，不持有全局单例；
//! 测试替身请使用 `dispatch-domain` 导出的内存实现。
//!
pub mod broker;
pub mod consumer;
pub mod dedup_pg;
pub mod http_delivery;
pub mod outbox_pg;
pub mod redis_coordinator;
pub mod service_registry;

pub use broker::{BrokerClient, ConsumeHandler, QueueInfo, RpcHandler};
pub use consumer::DedupingHandler;
pub use dedup_pg::PgDedupLog;
pub use http_delivery::HttpDeliveryClient;
pub use outbox_pg::PgOutboxStore;
pub use redis_coordinator::RedisCoordinator;
pub use service_registry::ServiceRegistry;
