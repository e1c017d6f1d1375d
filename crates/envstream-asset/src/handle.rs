use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

// 请求的关联 id
// 使用 slotmap 的 generational index，请求结束后 key 失效，
// 迟到的或重复的响应可以通过 key 查不到来识别并丢弃。
new_key_type! { pub struct RequestId; }

/// 资源的质量等级
///
/// Low 用于快速预览，High 为最终分辨率。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    High,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Low, Tier::High];

    /// 在按 tier 组织的数组中的下标
    pub const fn slot(self) -> usize {
        match self {
            Tier::Low => 0,
            Tier::High => 1,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Low => f.write_str("low"),
            Tier::High => f.write_str("high"),
        }
    }
}

/// 一次解码请求，发出后不可变
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub resource_path: String,
    pub tier: Tier,
    pub index: usize,
}

/// 使用者希望显示的环境贴图
///
/// 与加载进度无关；index 在构造时校验，保证始终在 `[0, total)` 内。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    index: usize,
    tier: Tier,
}

impl Selection {
    pub fn new(index: usize, tier: Tier, total: usize) -> Result<Self, ConfigurationError> {
        if index >= total {
            return Err(ConfigurationError::IndexOutOfRange { index, total });
        }
        Ok(Self { index, tier })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }
}

/// 单个 tier 的加载状态机
///
/// 状态流转: NotStarted -> Loading(0) -> Loading(1) -> ... -> Completed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierPhase {
    NotStarted,
    /// 正在等待该 index 的终止消息
    Loading(usize),
    Completed,
}

/// 整条流水线的状态机
///
/// 状态流转: Idle -> LoadingLow -> LoadingHigh -> Ready
///                            \---------------/ (只配置了一个 tier 时跳过 LoadingHigh)
/// 任意非 Ready 状态都可以 cancel 到 Cancelled。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    LoadingLow,
    LoadingHigh,
    Ready,
    Cancelled,
}

impl PipelinePhase {
    pub fn is_loading(self) -> bool {
        matches!(self, PipelinePhase::LoadingLow | PipelinePhase::LoadingHigh)
    }
}
