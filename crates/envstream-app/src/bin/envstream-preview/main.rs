//! 环境贴图流式加载预览
//!
//! ```text
//! cargo run --bin envstream-preview -- --config assets/envstream.toml --select 2 --dump-png out.png
//! ```

use anyhow::Context;
use clap::Parser;
use envstream_app::preview_app::{PreviewApp, PreviewOptions};
use envstream_app::tonemap;
use envstream_asset::{EnvironmentPipeline, EnvironmentTexture, PipelineConfig};
use envstream_tools::init_log::init_log;
use envstream_tools::resource::EnvstreamPath;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about = "Stream HDR environment maps low tier first, then high tier")]
struct Args {
    /// 配置文件；省略时使用 assets/envstream.toml，不存在则使用内置的演示配置
    #[arg(long)]
    config: Option<PathBuf>,

    /// 显示的环境贴图 index
    #[arg(long)]
    select: Option<usize>,

    /// 模拟的帧间隔 (毫秒)
    #[arg(long, default_value_t = 16)]
    frame_ms: u64,

    /// 超时 (秒)，超时后取消加载
    #[arg(long, default_value_t = 60)]
    timeout_s: u64,

    /// 把最终的环境贴图导出为 PNG
    #[arg(long)]
    dump_png: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    exposure: f32,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path),
        None => {
            let default_path = EnvstreamPath::default_config_path();
            if default_path.exists() {
                PipelineConfig::from_file(default_path)
            } else {
                log::info!("{default_path:?} not found, using the built-in demo config");
                Ok(PipelineConfig::default())
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_log();
    let args = Args::parse();

    #[cfg(feature = "profile")]
    let _tracy = tracy_client::Client::start();

    let config = load_config(args.config)?;
    log::info!(
        "{} environments from {:?} (high tier: {})",
        config.environment_count(),
        config.asset_dir,
        config.has_high_tier()
    );

    let pipeline = EnvironmentPipeline::with_file_source(config).context("failed to create pipeline")?;
    let options = PreviewOptions {
        frame_interval: Duration::from_millis(args.frame_ms),
        timeout: Duration::from_secs(args.timeout_s),
        select_at_frame: 0,
        select_index: args.select,
    };
    let summary = PreviewApp::new(pipeline, options).run()?;

    log::info!(
        "{:?} after {} frames, {} versions composited, {} items skipped",
        summary.phase,
        summary.frames,
        summary.versions_seen,
        summary.failures
    );

    if let Some(path) = args.dump_png {
        let EnvironmentTexture::Ready { texture, .. } = &summary.environment else {
            anyhow::bail!("no environment was loaded, nothing to write to {path:?}");
        };
        tonemap::save_png(texture, 0, args.exposure, &path)?;
    }

    Ok(())
}
