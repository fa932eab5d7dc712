//! 消息信封（MessageEnvelope）
//!
//! 出站任务 `param` 与代理发布所承载的标准序列化单元：
//! `{ msgId, data, requestAt, language, operateType }`。
//! `msgId` 为 `<前缀><分布式标识>`，兼顾人工可追踪（前缀）与全局唯一（标识）。
//!
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 默认语言环境
pub const DEFAULT_LANGUAGE: &str = "zh-CN";

/// 操作类型，线上格式为整数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum OperateType {
    Create,
    Update,
    Delete,
    Query,
}

impl From<OperateType> for i32 {
    fn from(op: OperateType) -> Self {
        match op {
            OperateType::Create => 1,
            OperateType::Update => 2,
            OperateType::Delete => 3,
            OperateType::Query => 4,
        }
    }
}

impl TryFrom<i32> for OperateType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OperateType::Create),
            2 => Ok(OperateType::Update),
            3 => Ok(OperateType::Delete),
            4 => Ok(OperateType::Query),
            other => Err(format!("unknown operate type: {other}")),
        }
    }
}

/// 信封展开模式：不同下游期望不同的包裹层级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WrapMode {
    /// 完整信封对象
    #[default]
    Full,
    /// 仅 `msgId` 与 `data`
    Body,
    /// 仅原始负载
    Raw,
}

/// 标准消息信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    #[serde(rename = "msgId")]
    pub msg_id: String,
    pub data: Value,
    #[serde(rename = "requestAt", with = "request_at_format")]
    pub request_at: DateTime<Utc>,
    pub language: String,
    #[serde(rename = "operateType")]
    pub operate_type: OperateType,
}

impl MessageEnvelope {
    pub fn new(msg_id: impl Into<String>, data: Value, operate_type: OperateType) -> Self {
        Self {
            msg_id: msg_id.into(),
            data,
            request_at: Utc::now(),
            language: DEFAULT_LANGUAGE.to_string(),
            operate_type,
        }
    }

    /// 按展开模式输出 JSON
    pub fn wrap(&self, mode: WrapMode) -> serde_json::Result<Value> {
        match mode {
            WrapMode::Full => serde_json::to_value(self),
            WrapMode::Body => Ok(serde_json::json!({
                "msgId": self.msg_id,
                "data": self.data,
            })),
            WrapMode::Raw => Ok(self.data.clone()),
        }
    }
}

/// `requestAt` 的线上格式：`YYYY-MM-DD HH:MM:SS`
mod request_at_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
