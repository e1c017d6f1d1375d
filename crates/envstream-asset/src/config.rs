use crate::error::ConfigurationError;
use crate::handle::Tier;
use crate::hdr::DecoderOptions;
use anyhow::Context;
use envstream_tools::resource::EnvstreamPath;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 流水线的 TOML 配置
///
/// ```toml
/// asset_dir = "cubemaps"
/// low = ["emmarentia_1k.hdr", "studio_small_06_1k.hdr"]
/// high = ["emmarentia_2k.hdr", "studio_small_06_2k.hdr"]
/// progress_step = 0.01
/// read_chunk_size = 65536
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 所有条目的基础目录；相对路径基于配置文件所在目录
    pub asset_dir: PathBuf,

    /// Low tier 文件名，按 index 排列，不能为空
    pub low: Vec<String>,

    /// High tier 文件名；可以为空，非空时与 `low` 一一对应
    #[serde(default)]
    pub high: Vec<String>,

    /// 两次进度消息之间的最小增量，(0, 1]
    #[serde(default = "default_progress_step")]
    pub progress_step: f32,

    /// 每次读取的字节数
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_progress_step() -> f32 {
    DecoderOptions::default().progress_step
}

fn default_read_chunk_size() -> usize {
    DecoderOptions::default().read_chunk_size
}

const DEMO_ENVIRONMENTS: [&str; 4] = [
    "fouriesburg_mountain_midday",
    "emmarentia",
    "industrial_sunset_puresky",
    "studio_small_06",
];

impl Default for PipelineConfig {
    /// 演示用的四张 HDRI，1k 作为预览，2k 作为最终分辨率
    fn default() -> Self {
        Self {
            asset_dir: EnvstreamPath::cubemap_dir(),
            low: DEMO_ENVIRONMENTS.iter().map(|name| format!("{name}_1k.hdr")).collect(),
            high: DEMO_ENVIRONMENTS.iter().map(|name| format!("{name}_2k.hdr")).collect(),
            progress_step: default_progress_step(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl PipelineConfig {
    /// 从 TOML 文件加载并校验配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("failed to read config {path:?}"))?;

        let mut config: PipelineConfig =
            toml::from_str(&content).with_context(|| format!("failed to parse config {path:?}"))?;
        if config.asset_dir.is_relative()
            && let Some(parent) = path.parent()
        {
            config.asset_dir = parent.join(&config.asset_dir);
        }

        config.validate().with_context(|| format!("invalid config {path:?}"))?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("failed to write config {path:?}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.low.is_empty() {
            return Err(ConfigurationError::EmptyLowTier);
        }
        if !self.high.is_empty() && self.high.len() != self.low.len() {
            return Err(ConfigurationError::TierLengthMismatch {
                low: self.low.len(),
                high: self.high.len(),
            });
        }
        // NaN 也落在这里
        if !(self.progress_step > 0.0 && self.progress_step <= 1.0) {
            return Err(ConfigurationError::InvalidProgressStep(self.progress_step));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigurationError::ZeroChunkSize);
        }
        Ok(())
    }

    /// 环境贴图的数量
    pub fn environment_count(&self) -> usize {
        self.low.len()
    }

    pub fn has_high_tier(&self) -> bool {
        !self.high.is_empty()
    }

    pub fn names(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Low => &self.low,
            Tier::High => &self.high,
        }
    }

    /// `asset_dir` 与文件名拼接后的完整路径
    pub fn resolved_paths(&self, tier: Tier) -> Vec<String> {
        self.names(tier)
            .iter()
            .map(|name| self.asset_dir.join(name).to_string_lossy().into_owned())
            .collect()
    }

    pub fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            progress_step: self.progress_step,
            read_chunk_size: self.read_chunk_size,
        }
    }
}
