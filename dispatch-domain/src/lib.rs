//! 可靠投递核心库（dispatch-domain）
//!
//! 为退货后台的多下游编排提供可靠投递所需的通用构件：
//! - 键值协调器（`coordinator`）：原子计数、TTL 键与协作式互斥锁
//! - 分布式标识（`id_generator`）与顺序业务编码（`seq_code`）
//! - 标准消息信封（`envelope`）与出站任务（`outbox`）
//! - 任务信封构建器（`task_builder`）：校验 → 信封 → 事务内落盘
//! - 调度器（`dispatcher`）与投递引擎（`engine`）：HTTP/代理双通道投递
//! - 入站去重日志（`dedup`）：重复投递短路为 no-op
//!
//! 本 crate 尽量保持与存储与传输实现解耦，仅定义协议、算法与最小必要的
//! 错误类型，以便在不同基础设施（Redis、AMQP 代理、Postgres 等）上进行
//! 适配实现；每个协议均附带内存实现，供测试与本地开发使用。
//!
//! 典型用法：
//! 1. 业务事务内通过 `TaskBuilder::submit` 写入出站行并提交；
//! 2. `DispatchEngine` 周期读取待投递行，经 `Dispatcher` 投递；
//! 3. 消费侧以 `dedup::consume_once` 包裹处理器，保证幂等。
//!
pub mod coordinator;
pub mod dedup;
pub mod dispatcher;
#[cfg(feature = "engine")]
pub mod engine;
pub mod envelope;
pub mod error;
pub mod id_generator;
pub mod outbox;
pub mod seq_code;
pub mod task_builder;
