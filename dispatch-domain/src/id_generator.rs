//! 分布式标识生成器（IdGenerator）
//!
//! 位打包的 64 位标识：`(timestamp_delta << 17) | (worker_id << 12) | sequence`，
//! 其中 `sequence` 为 [0, 4095] 的均匀随机数，而非毫秒内单调计数——
//! 以放弃同毫秒内的严格有序换取无需跨实例对时；由此产生的（罕见）随机
//! 碰撞通过协调器的短时标记键检测，并以有界循环重试解决。
//!
use crate::coordinator::Coordinator;
use crate::error::{DispatchError, DispatchResult};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// 时间戳左移位数（worker 5 位 + sequence 12 位）
const TIMESTAMP_SHIFT: u32 = 17;
/// worker 左移位数
const WORKER_SHIFT: u32 = 12;
/// worker 上限（含）
pub const MAX_WORKER_ID: u8 = 31;
/// sequence 掩码
const SEQUENCE_MASK: u64 = 0xFFF;
/// 碰撞重试上限
const MAX_ATTEMPTS: u32 = 5;
/// 碰撞标记键的存活时间
const MARKER_TTL: Duration = Duration::from_secs(10);
/// 默认纪元：2020-01-01T00:00:00Z
pub const DEFAULT_EPOCH_MS: i64 = 1_577_836_800_000;

/// 分布式标识生成器
pub struct IdGenerator {
    coordinator: Arc<dyn Coordinator>,
    worker_id: u8,
    epoch_ms: i64,
}

impl IdGenerator {
    /// `worker_id` 超过 [`MAX_WORKER_ID`] 视为配置错误
    pub fn new(coordinator: Arc<dyn Coordinator>, worker_id: u8) -> DispatchResult<Self> {
        Self::with_epoch(coordinator, worker_id, DEFAULT_EPOCH_MS)
    }

    pub fn with_epoch(
        coordinator: Arc<dyn Coordinator>,
        worker_id: u8,
        epoch_ms: i64,
    ) -> DispatchResult<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(DispatchError::configuration(format!(
                "worker_id {worker_id} exceeds {MAX_WORKER_ID}"
            )));
        }
        Ok(Self {
            coordinator,
            worker_id,
            epoch_ms,
        })
    }

    /// 生成一个全局唯一的 64 位标识。
    ///
    /// 同一标识的标记键已存在（碰撞）时重试，最多 [`MAX_ATTEMPTS`] 次，
    /// 超限返回 [`DispatchError::GenerationExhausted`]；系统时钟早于纪元
    /// 返回 [`DispatchError::ClockRegression`]。
    pub async fn next_id(&self) -> DispatchResult<u64> {
        for _ in 0..MAX_ATTEMPTS {
            let id = self.pack()?;
            let marker = format!("dispatch:id:{id}");
            if self.coordinator.exists(&marker).await? {
                continue;
            }
            self.coordinator
                .set_with_expiry(&marker, "1", MARKER_TTL)
                .await?;
            return Ok(id);
        }
        Err(DispatchError::GenerationExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// 生成带前缀的标识字符串（如消息 `msgId`）
    pub async fn next_prefixed(&self, prefix: &str) -> DispatchResult<String> {
        let id = self.next_id().await?;
        Ok(format!("{prefix}{id}"))
    }

    fn pack(&self) -> DispatchResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        if now_ms < self.epoch_ms {
            return Err(DispatchError::ClockRegression {
                now_ms,
                epoch_ms: self.epoch_ms,
            });
        }
        let delta = (now_ms - self.epoch_ms) as u64;
        let sequence = rand::thread_rng().gen_range(0..=SEQUENCE_MASK);
        Ok((delta << TIMESTAMP_SHIFT) | (u64::from(self.worker_id) << WORKER_SHIFT) | sequence)
    }
}
