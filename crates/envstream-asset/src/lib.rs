//! HDR 环境贴图的渐进式流式加载
//!
//! 数据流:
//! `Orchestrator` -> `DecodeWorker` (请求) -> `HdrDecoder` (解析) -> `DecodeWorker` (进度/数据消息)
//! -> `ProgressAggregator` + `TextureCache` -> `EnvironmentCompositor` -> 渲染循环
//!
//! 对外只暴露两样东西: 每个 tier 的整体进度 (0-100)，以及当前可渲染的环境贴图。
//! 渲染循环每帧读取二者，永远不会被解码阻塞。

#[macro_use]
mod profiling;

pub mod cache;
pub mod compositor;
pub mod config;
pub mod error;
pub mod handle;
pub mod hdr;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod protocol;
pub mod source;
pub mod worker;

pub use cache::{CacheSlot, DecodedImage, TextureCache};
pub use compositor::{EnvironmentCompositor, EnvironmentTexture, FilteredEnvironment};
pub use config::PipelineConfig;
pub use error::{ConfigurationError, DecodeError, PipelineError, TransportError};
pub use handle::{LoadRequest, PipelinePhase, RequestId, Selection, Tier, TierPhase};
pub use pipeline::EnvironmentPipeline;
pub use progress::{ProgressAggregator, TierState};
pub use source::{AssetSource, FileSource, MemorySource};
