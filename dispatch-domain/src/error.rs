//! 可靠投递子系统统一错误定义
//!
//! 聚焦参数校验、标识生成、协调器、消息代理与下游投递等最小必要集合，
//! 便于在各实现层统一转换为 `DispatchError`。
//!
use thiserror::Error;

/// 统一错误类型（基础库最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DispatchError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 参数与配置 ---
    #[error("missing parameters: {reason}")]
    MissingParameters { reason: String },
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    // --- 分布式标识 ---
    #[error("id generation exhausted after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },
    #[error("clock regression: now_ms={now_ms}, epoch_ms={epoch_ms}")]
    ClockRegression { now_ms: i64, epoch_ms: i64 },

    // --- 协调器 ---
    #[error("coordinator unavailable: {reason}")]
    Coordinator { reason: String },

    // --- 消息代理 ---
    #[error("broker connection error: {reason}")]
    BrokerConnection { reason: String },
    #[error("publish failed: exchange={exchange}, routing_key={routing_key}, reason={reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },
    #[error("rpc timeout: queue={queue}, timeout_ms={timeout_ms}")]
    RpcTimeout { queue: String, timeout_ms: u64 },
    #[error("routing config error: {reason}")]
    RoutingConfig { reason: String },

    // --- 下游投递 ---
    #[error("transport error: {reason}")]
    Transport { reason: String },
    #[error("downstream error: code={code}, msg={msg}")]
    Downstream { code: i64, msg: String },

    // --- 幂等消费 ---
    #[error("duplicate message: {msg_id}")]
    DuplicateMessage { msg_id: String },

    // --- 持久化 ---
    #[error("outbox error: {reason}")]
    Outbox { reason: String },
    #[error("dedup log error: {reason}")]
    DedupLog { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },

    // --- 消费处理 ---
    #[error("consumer error: handler={handler}, reason={reason}")]
    Consumer { handler: String, reason: String },
}

impl DispatchError {
    pub fn missing_parameters(reason: impl Into<String>) -> Self {
        Self::MissingParameters {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn coordinator(reason: impl Into<String>) -> Self {
        Self::Coordinator {
            reason: reason.into(),
        }
    }

    pub fn broker_connection(reason: impl Into<String>) -> Self {
        Self::BrokerConnection {
            reason: reason.into(),
        }
    }

    pub fn routing_config(reason: impl Into<String>) -> Self {
        Self::RoutingConfig {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn duplicate_message(msg_id: impl Into<String>) -> Self {
        Self::DuplicateMessage {
            msg_id: msg_id.into(),
        }
    }

    /// 是否为幂等消费的软信号（调用方应短路为 no-op，而非失败）
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateMessage { .. })
    }
}

/// 统一 Result 类型别名
pub type DispatchResult<T> = Result<T, DispatchError>;

// ---- Cross-crate conversions for infrastructure convenience ----
// 允许在基础设施层直接使用 `?` 将 sqlx/redis 等错误转换为 DispatchError

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DispatchError::NotFound {
                reason: "row not found".to_string(),
            },
            other => DispatchError::Database {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(feature = "infra-redis")]
impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        DispatchError::Coordinator {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for DispatchError {
    fn from(err: chrono::ParseError) -> Self {
        DispatchError::Configuration {
            reason: err.to_string(),
        }
    }
}
