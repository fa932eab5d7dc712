//! 服务注册表：`service_path` → 下游基地址
//!
//! 投递时把出站行的服务段解析为具体的 HTTP 基地址；
//! 配置以外部提供的反序列化结构注入，不做隐藏的全局状态。
//!
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceRegistry {
    services: HashMap<String, String>,
}

impl ServiceRegistry {
    pub fn new(services: HashMap<String, String>) -> Self {
        Self { services }
    }

    pub fn insert(&mut self, service: impl Into<String>, base_url: impl Into<String>) {
        self.services.insert(service.into(), base_url.into());
    }

    pub fn resolve(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(String::as_str)
    }
}
