//! HTTP 投递通道（reqwest）
//!
//! 以信封 JSON 为请求体 POST 到 `service_path` 解析出的基地址 + 存储的
//! URI，响应按 `{code, msg, data}` 标准形态解码：
//! - 传输层失败（连接、超时、非 2xx）转为 `Transport`；
//! - 应用层非成功码转为 `Downstream` 并保留下游 `msg`。
//!
use crate::service_registry::ServiceRegistry;
use async_trait::async_trait;
use dispatch_domain::dispatcher::{DownstreamReply, HttpDelivery};
use dispatch_domain::error::{DispatchError, DispatchResult};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpDeliveryClient {
    http: reqwest::Client,
    registry: ServiceRegistry,
}

impl HttpDeliveryClient {
    pub fn new(registry: ServiceRegistry) -> DispatchResult<Self> {
        Self::with_timeout(registry, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(registry: ServiceRegistry, timeout: Duration) -> DispatchResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::configuration(e.to_string()))?;
        Ok(Self { http, registry })
    }
}

#[async_trait]
impl HttpDelivery for HttpDeliveryClient {
    async fn post(
        &self,
        service_path: &str,
        func_name: &str,
        body: &Value,
    ) -> DispatchResult<Value> {
        let base = self.registry.resolve(service_path).ok_or_else(|| {
            DispatchError::configuration(format!("unknown service: {service_path}"))
        })?;
        let url = join_url(base, func_name);

        tracing::debug!(%url, "delivering envelope over http");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| DispatchError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::transport(format!(
                "{url} returned http status {status}"
            )));
        }

        let reply: DownstreamReply = response
            .json()
            .await
            .map_err(|e| DispatchError::transport(e.to_string()))?;
        reply.into_result()
    }
}

fn join_url(base: &str, func_name: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        func_name.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("http://warehouse.internal/", "/return/notify"),
            "http://warehouse.internal/return/notify"
        );
        assert_eq!(
            join_url("http://warehouse.internal", "return/notify"),
            "http://warehouse.internal/return/notify"
        );
    }

    #[test]
    fn downstream_reply_decodes_with_defaults() {
        let reply: DownstreamReply =
            serde_json::from_str(r#"{"code": 0, "data": {"ok": true}}"#).unwrap();
        assert_eq!(reply.code, 0);
        assert_eq!(reply.msg, "");
        assert_eq!(reply.into_result().unwrap(), serde_json::json!({"ok": true}));

        let failure: DownstreamReply =
            serde_json::from_str(r#"{"code": 5001, "msg": "库存不足"}"#).unwrap();
        assert!(matches!(
            failure.into_result(),
            Err(DispatchError::Downstream { code: 5001, .. })
        ));
    }
}
