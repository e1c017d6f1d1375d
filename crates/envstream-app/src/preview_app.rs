use envstream_asset::{EnvironmentPipeline, EnvironmentTexture, PipelinePhase, Tier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct PreviewOptions {
    /// 模拟的帧间隔
    pub frame_interval: Duration,
    /// 超过该时长仍未 Ready 时取消加载
    pub timeout: Duration,
    /// 在第几帧切换到 `select_index`
    pub select_at_frame: u64,
    pub select_index: Option<usize>,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(16),
            timeout: Duration::from_secs(60),
            select_at_frame: 0,
            select_index: None,
        }
    }
}

/// 一次预览的结果
#[derive(Debug)]
pub struct PreviewSummary {
    pub frames: u64,
    pub phase: PipelinePhase,
    /// 合成过的环境贴图版本数
    pub versions_seen: u64,
    pub failures: usize,
    pub environment: EnvironmentTexture,
}

/// 无窗口的 "渲染循环"
///
/// 每帧: `update` -> 读取进度 -> `environment`，与真正的渲染循环读取流水线的方式相同。
pub struct PreviewApp {
    pipeline: EnvironmentPipeline,
    options: PreviewOptions,

    frame: u64,
    /// 上一次打印的整数百分比
    last_percent: [Option<u32>; 2],
    last_version: u64,
    versions_seen: u64,
}

impl PreviewApp {
    pub fn new(pipeline: EnvironmentPipeline, options: PreviewOptions) -> Self {
        Self {
            pipeline,
            options,
            frame: 0,
            last_percent: [None; 2],
            last_version: 0,
            versions_seen: 0,
        }
    }

    pub fn pipeline(&self) -> &EnvironmentPipeline {
        &self.pipeline
    }

    /// 运行到 Ready 或超时
    pub fn run(mut self) -> anyhow::Result<PreviewSummary> {
        let started = Instant::now();
        self.pipeline.start();

        loop {
            let frame_start = Instant::now();
            self.tick()?;

            if self.pipeline.is_ready() {
                log::info!("pipeline ready after {} frames ({:?})", self.frame, started.elapsed());
                break;
            }
            if started.elapsed() > self.options.timeout {
                log::warn!("timed out after {:?}, cancelling", self.options.timeout);
                self.pipeline.cancel();
                break;
            }

            if let Some(rest) = self.options.frame_interval.checked_sub(frame_start.elapsed()) {
                thread::sleep(rest);
            }
        }

        Ok(PreviewSummary {
            frames: self.frame,
            phase: self.pipeline.phase(),
            versions_seen: self.versions_seen,
            failures: self.pipeline.failures().len(),
            environment: self.pipeline.environment(),
        })
    }

    /// 单帧
    pub fn tick(&mut self) -> anyhow::Result<()> {
        if self.frame == self.options.select_at_frame
            && let Some(index) = self.options.select_index
        {
            self.pipeline.select(index)?;
        }

        self.pipeline.update();
        self.report_progress();

        let environment = self.pipeline.environment();
        if let EnvironmentTexture::Ready {
            texture,
            index,
            tier,
            version,
        } = &environment
            && *version != self.last_version
        {
            let base = texture.base();
            log::info!(
                "frame {}: environment #{index} now {tier} ({}x{}, {} mips, version {version})",
                self.frame,
                base.width,
                base.height,
                texture.mip_count()
            );
            self.last_version = *version;
            self.versions_seen += 1;
        }

        if let Some(client) = tracy_client::Client::running() {
            client.frame_mark();
        }
        self.frame += 1;
        Ok(())
    }

    fn report_progress(&mut self) {
        for tier in Tier::ALL {
            if self.pipeline.tier_state(tier).is_err() {
                continue;
            }
            let percent = self.pipeline.progress(tier).floor() as u32;
            let last = &mut self.last_percent[tier.slot()];
            if *last != Some(percent) {
                log::info!("{tier}: {percent:>3}% ({:?})", self.pipeline.phase());
                *last = Some(percent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envstream_asset::{MemorySource, PipelineConfig};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn flat_hdr(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = format!("#?RADIANCE\nFORMAT=32-bit_rle_rgbe\n\n-Y {height} +X {width}\n").into_bytes();
        for _ in 0..width * height {
            bytes.extend([64, 128, 255, 130]);
        }
        bytes
    }

    #[test]
    fn test_preview_runs_to_ready() {
        let config = PipelineConfig {
            asset_dir: PathBuf::from("mem"),
            low: vec!["a_1k.hdr".into(), "b_1k.hdr".into()],
            high: vec!["a_2k.hdr".into(), "b_2k.hdr".into()],
            ..PipelineConfig::default()
        };
        let mut source = MemorySource::new();
        for path in config.resolved_paths(Tier::Low) {
            source.insert(path, flat_hdr(4, 2));
        }
        for path in config.resolved_paths(Tier::High) {
            source.insert(path, flat_hdr(6, 3));
        }

        let pipeline = EnvironmentPipeline::new(config, Arc::new(source)).unwrap();
        let options = PreviewOptions {
            frame_interval: Duration::from_millis(1),
            select_index: Some(1),
            ..Default::default()
        };
        let summary = PreviewApp::new(pipeline, options).run().unwrap();

        assert_eq!(summary.phase, PipelinePhase::Ready);
        assert_eq!(summary.failures, 0);
        assert!(summary.versions_seen >= 1);
        let EnvironmentTexture::Ready { index, tier, .. } = summary.environment else {
            panic!("no environment after preview");
        };
        assert_eq!((index, tier), (1, Tier::High));
    }

    #[test]
    fn test_invalid_selection_fails_the_frame() {
        let config = PipelineConfig {
            low: vec!["only.hdr".into()],
            high: Vec::new(),
            ..PipelineConfig::default()
        };
        let pipeline = EnvironmentPipeline::new(config, Arc::new(MemorySource::new())).unwrap();
        let mut app = PreviewApp::new(
            pipeline,
            PreviewOptions {
                select_index: Some(5),
                ..Default::default()
            },
        );
        assert!(app.tick().is_err());
    }
}
