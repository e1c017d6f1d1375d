use crate::handle::Tier;
use thiserror::Error;

/// 二进制数据损坏或被截断，只影响单个条目
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode failed: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// 请求没有送达解码线程，或者解码线程没有返回终止消息
///
/// 对流水线而言与 [`DecodeError`] 的处理方式相同。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("decode worker is gone, request for {path} was not delivered")]
    RequestNotDelivered { path: String },
    #[error("decode worker disconnected before sending a terminal message")]
    Disconnected,
    #[error("failed to spawn decode worker: {reason}")]
    WorkerSpawn { reason: String },
}

/// 调用者给出了非法的 index / tier 或者非法的配置
///
/// 只会让当次调用失败，不会破坏流水线状态。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("index {index} is out of range, {total} environments are configured")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("tier {0} is not configured")]
    TierNotConfigured(Tier),
    #[error("the low tier needs at least one environment")]
    EmptyLowTier,
    #[error("high tier has {high} environments but low tier has {low}")]
    TierLengthMismatch { low: usize, high: usize },
    #[error("progress step {0} must be in (0, 1]")]
    InvalidProgressStep(f32),
    #[error("read chunk size must be greater than zero")]
    ZeroChunkSize,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
