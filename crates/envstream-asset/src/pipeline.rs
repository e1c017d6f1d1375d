use crate::cache::TextureCache;
use crate::compositor::{EnvironmentCompositor, EnvironmentTexture};
use crate::config::PipelineConfig;
use crate::error::{ConfigurationError, PipelineError, TransportError};
use crate::handle::{PipelinePhase, RequestId, Selection, Tier};
use crate::orchestrator::{IssuedRequest, ItemFailure, Orchestrator};
use crate::progress::{ProgressAggregator, TierState};
use crate::source::{AssetSource, FileSource};
use crate::worker::{DecodeWorker, WorkerEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static NEXT_WORKER_INDEX: AtomicUsize = AtomicUsize::new(0);

/// 一次流式加载的全部状态
///
/// 解码线程、编排器、缓存、进度、合成器和当前选择都由这个对象持有，
/// 不存在模块级的共享状态，多条流水线可以互不干扰地并存。
///
/// 渲染循环每帧调用 [`update`](Self::update) 处理已到达的消息，
/// 然后读取 [`progress`](Self::progress) 和 [`environment`](Self::environment)；
/// 这些调用都不会等待解码。
///
/// 解码线程上同一时刻最多只有一个请求：取消后重新开始时，新的请求要等被取消的请求
/// 发回终止消息之后才会提交。
pub struct EnvironmentPipeline {
    config: PipelineConfig,

    worker: DecodeWorker,
    orchestrator: Orchestrator,
    /// 已提交给解码线程、还没有收到终止消息的请求
    outstanding: Option<RequestId>,
    /// 等待 `outstanding` 结束后再提交的请求
    held: Option<IssuedRequest>,

    cache: TextureCache,
    progress: ProgressAggregator,
    compositor: EnvironmentCompositor,

    selection: Selection,
}

// new & init
impl EnvironmentPipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn AssetSource>) -> Result<Self, PipelineError> {
        config.validate()?;

        let orchestrator = Orchestrator::new(config.resolved_paths(Tier::Low), config.resolved_paths(Tier::High))?;
        let total = orchestrator.total();
        let top_tier = if orchestrator.has_tier(Tier::High) { Tier::High } else { Tier::Low };

        let worker_index = NEXT_WORKER_INDEX.fetch_add(1, Ordering::Relaxed);
        let worker = DecodeWorker::spawn(worker_index, source, config.decoder_options())?;

        Ok(Self {
            cache: TextureCache::new(total),
            progress: ProgressAggregator::new(orchestrator.tier_len(Tier::Low), orchestrator.tier_len(Tier::High)),
            compositor: EnvironmentCompositor::new(),
            selection: Selection::new(0, top_tier, total)?,
            worker,
            orchestrator,
            outstanding: None,
            held: None,
            config,
        })
    }

    /// 从文件系统读取
    pub fn with_file_source(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::new(config, Arc::new(FileSource))
    }

    /// 开始加载；只在 Idle 时生效
    pub fn start(&mut self) {
        if let Some(issued) = self.orchestrator.start(&mut self.progress) {
            self.dispatch(issued);
        }
    }
}

// getters
impl EnvironmentPipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 整体进度 0-100；未配置的 tier 恒为 0
    pub fn progress(&self, tier: Tier) -> f32 {
        self.progress.overall(tier)
    }

    pub fn tier_state(&self, tier: Tier) -> Result<&TierState, ConfigurationError> {
        if !self.orchestrator.has_tier(tier) {
            return Err(ConfigurationError::TierNotConfigured(tier));
        }
        Ok(self.progress.state(tier))
    }

    pub fn phase(&self) -> PipelinePhase {
        self.orchestrator.phase()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == PipelinePhase::Ready
    }

    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    pub fn compositor(&self) -> &EnvironmentCompositor {
        &self.compositor
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn failures(&self) -> &[ItemFailure] {
        self.orchestrator.failures()
    }

    pub fn discarded_events(&self) -> usize {
        self.orchestrator.discarded()
    }

    pub fn worker_name(&self) -> &str {
        self.worker.name()
    }

    /// 解码线程上是否还有没结束的请求 (包括被取消的)
    pub fn has_outstanding_request(&self) -> bool {
        self.outstanding.is_some()
    }
}

impl EnvironmentPipeline {
    /// 处理所有已经到达的消息，不阻塞；返回处理的消息数
    pub fn update(&mut self) -> usize {
        let _span = profile_span!("EnvironmentPipeline::update");

        let mut handled = 0;
        loop {
            match self.worker.try_recv() {
                Ok(Some(event)) => {
                    self.handle(event);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail_in_flight(e);
                    break;
                }
            }
        }
        handled
    }

    /// 最多等待 `timeout` 直到有消息到达，然后处理所有已到达的消息
    ///
    /// 供工具和测试使用，渲染循环应当使用 [`update`](Self::update)。
    pub fn wait_for_event(&mut self, timeout: Duration) -> bool {
        match self.worker.recv_timeout(timeout) {
            Ok(Some(event)) => {
                self.handle(event);
                self.update();
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.fail_in_flight(e);
                false
            }
        }
    }

    /// 切换显示的环境贴图；不会打断或重排加载顺序
    pub fn select(&mut self, index: usize) -> Result<(), ConfigurationError> {
        self.selection = Selection::new(index, self.selection.tier(), self.cache.len())?;
        log::info!("select environment #{index}");
        Ok(())
    }

    /// 当前可渲染的环境贴图
    ///
    /// 选中的条目还没有任何 tier 可用时，返回上一次的结果。
    pub fn environment(&mut self) -> EnvironmentTexture {
        match self.compositor.sync(&self.cache, self.selection) {
            Ok(texture) => texture,
            Err(e) => {
                log::error!("failed to composite environment: {e}");
                self.compositor.current()
            }
        }
    }

    /// 停止发出新请求，正在解码的条目的结果会被丢弃
    pub fn cancel(&mut self) {
        self.orchestrator.cancel();
        self.held = None;
    }

    /// 取消当前加载，清空缓存与进度后从头开始
    pub fn restart(&mut self) {
        log::info!("restart pipeline");
        self.cancel();
        self.orchestrator.reset();
        self.cache.clear();
        self.progress.reset();
        self.compositor.reset();
        self.start();
    }
}

impl EnvironmentPipeline {
    fn handle(&mut self, event: WorkerEvent) {
        if event.message.is_terminal() && self.outstanding == Some(event.id) {
            self.outstanding = None;
        }
        let next = self
            .orchestrator
            .handle_event(event.id, event.message, &mut self.cache, &mut self.progress);
        if let Some(next) = next {
            self.held = Some(next);
        }
        self.flush();
    }

    fn dispatch(&mut self, issued: IssuedRequest) {
        self.held = Some(issued);
        self.flush();
    }

    /// 解码线程空闲时提交等待中的请求；送达失败时按跳过处理，直到有请求送达或没有后续请求
    fn flush(&mut self) {
        if self.outstanding.is_some() {
            return;
        }
        let _span = profile_span!("EnvironmentPipeline::dispatch");
        while let Some(issued) = self.held.take() {
            match self.worker.submit(issued.id, &issued.request.resource_path) {
                Ok(()) => {
                    self.outstanding = Some(issued.id);
                    return;
                }
                Err(e) => {
                    self.held = self
                        .orchestrator
                        .handle_transport_failure(issued.id, e, &mut self.cache, &mut self.progress);
                }
            }
        }
    }

    /// 解码线程已经断开，不会再有终止消息
    fn fail_in_flight(&mut self, error: TransportError) {
        self.outstanding = None;
        if self.held.is_some() {
            self.flush();
            return;
        }
        let Some((id, _)) = self.orchestrator.in_flight() else {
            return;
        };
        if let Some(next) = self
            .orchestrator
            .handle_transport_failure(id, error, &mut self.cache, &mut self.progress)
        {
            self.dispatch(next);
        }
    }
}
