//! 顺序业务编码生成器（SeqCodeGenerator）
//!
//! 基于协调器原子计数生成人类可读的业务编码（如 `ORD-20240320-0007`），
//! 支持单个与批量分配：
//! - 计数键按 `(服务, 业务键[, 日期])` 组合，日期段参与键名时计数按天隔离；
//! - 含日期的计数键在首次分配时设置"次日零点 + 缓冲"的过期时间，
//!   次日计数自动从 1 重新开始，无需人工清理；
//! - 过期设置与自增是两次网络调用，二者之间崩溃会留下无过期键
//!   （监控可见的已知窗口，非硬性失败）。
//!
//! `CodeSpec` 为一次性配置：`generate`/`generate_batch` 按值消费，
//! 每次分配前重新构造。
//!
use crate::coordinator::Coordinator;
use crate::error::{DispatchError, DispatchResult};
use bon::Builder;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

/// 计数键命名空间
const NAMESPACE: &str = "dispatch:seq";
/// 次日零点之后的过期缓冲
const ROLLOVER_BUFFER: Duration = Duration::from_secs(3_600);

/// 编码中的日期段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TimeSegment {
    /// 不包含日期段
    #[default]
    Omit,
    /// 使用当天日期（`YYYYMMDD`），计数按天隔离
    Today,
    /// 使用字面日期串（不参与按天隔离的 TTL 推算）
    Literal(String),
}

/// 单次编码配置
#[derive(Debug, Clone, Builder)]
pub struct CodeSpec {
    /// 业务判别键（必填，不可为空串）
    #[builder(into)]
    key: String,
    /// 编码前缀，空串表示省略
    #[builder(into, default)]
    prefix: String,
    /// 日期段
    #[builder(default)]
    time: TimeSegment,
    /// 段连接符
    #[builder(into, default = "-".to_string())]
    symbol: String,
    /// 数字段补齐长度
    #[builder(default = 4)]
    fill_length: usize,
    /// 补齐字符
    #[builder(default = '0')]
    pad_char: char,
}

impl CodeSpec {
    fn validate(&self) -> DispatchResult<()> {
        if self.key.is_empty() {
            return Err(DispatchError::configuration("code key must not be empty"));
        }
        Ok(())
    }

    fn date_segment(&self) -> Option<String> {
        match &self.time {
            TimeSegment::Omit => None,
            TimeSegment::Today => Some(Utc::now().format("%Y%m%d").to_string()),
            TimeSegment::Literal(s) => Some(s.clone()),
        }
    }

    fn format(&self, date: Option<&str>, id: i64) -> String {
        let mut padded = id.to_string();
        while padded.len() < self.fill_length {
            padded.insert(0, self.pad_char);
        }

        let segments = [self.prefix.as_str(), date.unwrap_or(""), padded.as_str()];
        segments
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(&self.symbol)
    }
}

/// 顺序编码生成器，计数状态存于协调器
pub struct SeqCodeGenerator {
    coordinator: Arc<dyn Coordinator>,
    service: String,
}

impl SeqCodeGenerator {
    /// `service` 为计数键中的服务标识段
    pub fn new(coordinator: Arc<dyn Coordinator>, service: impl Into<String>) -> Self {
        Self {
            coordinator,
            service: service.into(),
        }
    }

    /// 分配一个编码
    pub async fn generate(&self, spec: CodeSpec) -> DispatchResult<String> {
        spec.validate()?;
        let date = spec.date_segment();
        let counter_key = self.counter_key(&spec, date.as_deref());

        let id = self.coordinator.incr_by(&counter_key, 1).await?;
        self.expire_on_first_allocation(&spec, &counter_key, id, 1)
            .await?;

        Ok(spec.format(date.as_deref(), id))
    }

    /// 批量分配 `count` 个连续编码（一次自增推导区间 `[end-count+1, end]`）
    pub async fn generate_batch(&self, spec: CodeSpec, count: i64) -> DispatchResult<Vec<String>> {
        spec.validate()?;
        if count <= 0 {
            return Err(DispatchError::configuration(
                "batch count must be positive",
            ));
        }
        let date = spec.date_segment();
        let counter_key = self.counter_key(&spec, date.as_deref());

        let end = self.coordinator.incr_by(&counter_key, count).await?;
        self.expire_on_first_allocation(&spec, &counter_key, end, count)
            .await?;

        let start = end - count + 1;
        Ok((start..=end)
            .map(|id| spec.format(date.as_deref(), id))
            .collect())
    }

    fn counter_key(&self, spec: &CodeSpec, date: Option<&str>) -> String {
        match date {
            Some(d) if spec.time == TimeSegment::Today => {
                format!("{NAMESPACE}:{}:{}:{d}", self.service, spec.key)
            }
            _ => format!("{NAMESPACE}:{}:{}", self.service, spec.key),
        }
    }

    /// 首次分配（`id == delta`）时为按天隔离的计数键设置过期时间。
    /// 与自增是两次调用，中间崩溃会留下无过期键。
    async fn expire_on_first_allocation(
        &self,
        spec: &CodeSpec,
        counter_key: &str,
        id: i64,
        delta: i64,
    ) -> DispatchResult<()> {
        if spec.time != TimeSegment::Today || id != delta {
            return Ok(());
        }
        self.coordinator
            .expire(counter_key, until_tomorrow() + ROLLOVER_BUFFER)
            .await?;
        Ok(())
    }
}

/// 距次日零点（UTC）的时长
fn until_tomorrow() -> Duration {
    let now = Utc::now();
    let tomorrow = (now + ChronoDuration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    (tomorrow - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCoordinator;

    fn generator() -> (Arc<InMemoryCoordinator>, SeqCodeGenerator) {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let g = SeqCodeGenerator::new(coordinator.clone(), "svc");
        (coordinator, g)
    }

    #[tokio::test]
    async fn formats_prefix_date_and_padding() {
        let (coordinator, g) = generator();
        // 计数推进到 6，下一次分配得到 7
        coordinator
            .incr_by("dispatch:seq:svc:order", 6)
            .await
            .unwrap();

        let spec = CodeSpec::builder()
            .key("order")
            .prefix("ORD")
            .time(TimeSegment::Literal("20240320".into()))
            .build();
        assert_eq!(g.generate(spec).await.unwrap(), "ORD-20240320-0007");
    }

    #[tokio::test]
    async fn omitting_time_omits_the_segment() {
        let (_, g) = generator();
        let spec = CodeSpec::builder().key("order").prefix("ORD").build();
        assert_eq!(g.generate(spec).await.unwrap(), "ORD-0001");
    }

    #[tokio::test]
    async fn empty_key_is_a_configuration_error() {
        let (_, g) = generator();
        let spec = CodeSpec::builder().key("").build();
        assert!(matches!(
            g.generate(spec).await,
            Err(DispatchError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn batch_is_contiguous_and_consistent_with_single() {
        let (coordinator, g) = generator();
        coordinator
            .incr_by("dispatch:seq:svc:order", 10)
            .await
            .unwrap();

        let spec = CodeSpec::builder().key("order").prefix("ORD").build();
        let batch = g.generate_batch(spec, 5).await.unwrap();
        assert_eq!(
            batch,
            vec!["ORD-0011", "ORD-0012", "ORD-0013", "ORD-0014", "ORD-0015"]
        );
    }

    #[tokio::test]
    async fn custom_symbol_and_padding() {
        let (_, g) = generator();
        let spec = CodeSpec::builder()
            .key("box")
            .prefix("BX")
            .symbol("/")
            .fill_length(6)
            .pad_char('0')
            .build();
        assert_eq!(g.generate(spec).await.unwrap(), "BX/000001");
    }

    #[tokio::test]
    async fn date_scoped_counter_gets_rollover_ttl_on_first_allocation() {
        let (coordinator, g) = generator();
        let spec = CodeSpec::builder()
            .key("order")
            .time(TimeSegment::Today)
            .build();
        g.generate(spec.clone()).await.unwrap();

        let date = Utc::now().format("%Y%m%d").to_string();
        let key = format!("dispatch:seq:svc:order:{date}");
        let ttl = coordinator.ttl(&key).expect("ttl must be set");
        // 次日零点 + 1h 缓冲以内
        assert!(ttl <= until_tomorrow() + ROLLOVER_BUFFER);
        assert!(ttl > Duration::ZERO);

        // 第二次分配不再重设过期时间
        let ttl_before = coordinator.ttl(&key).unwrap();
        g.generate(spec).await.unwrap();
        let ttl_after = coordinator.ttl(&key).unwrap();
        assert!(ttl_after <= ttl_before);
    }

    #[tokio::test]
    async fn batch_on_fresh_date_key_sets_ttl_too() {
        let (coordinator, g) = generator();
        let spec = CodeSpec::builder()
            .key("pkg")
            .time(TimeSegment::Today)
            .build();
        g.generate_batch(spec, 3).await.unwrap();

        let date = Utc::now().format("%Y%m%d").to_string();
        assert!(coordinator.ttl(&format!("dispatch:seq:svc:pkg:{date}")).is_some());
    }
}
