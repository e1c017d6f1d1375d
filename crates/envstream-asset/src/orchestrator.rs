use crate::cache::{DecodedImage, TextureCache};
use crate::error::{ConfigurationError, DecodeError, PipelineError, TransportError};
use crate::handle::{LoadRequest, PipelinePhase, RequestId, Tier, TierPhase};
use crate::progress::ProgressAggregator;
use crate::protocol::WorkerMessage;
use slotmap::SlotMap;

/// 编排器刚发出的请求，调用者负责把它交给解码线程
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRequest {
    pub id: RequestId,
    pub request: LoadRequest,
}

/// 被跳过的条目
#[derive(Debug)]
pub struct ItemFailure {
    pub index: usize,
    pub tier: Tier,
    pub error: PipelineError,
}

/// 加载编排状态机
///
/// 不持有线程，只根据事件决定下一个请求：
/// - 每个 tier 内按 index 升序逐个请求，同一时刻最多一个未完成的请求
/// - Low 完成之后才开始 High
/// - 单个条目失败时跳过并继续
///
/// 每个请求在 router 中登记一个 [`RequestId`]，收到终止消息后移除；
/// 查不到 id 的事件 (迟到、重复、取消后到达) 一律丢弃，不会写入缓存。
pub struct Orchestrator {
    paths: [Vec<String>; 2],
    router: SlotMap<RequestId, LoadRequest>,
    in_flight: Option<RequestId>,

    tier_phases: [TierPhase; 2],
    phase: PipelinePhase,

    discarded: usize,
    failures: Vec<ItemFailure>,
}

// new & init
impl Orchestrator {
    /// `high` 可以为空；非空时长度必须与 `low` 相同
    pub fn new(low: Vec<String>, high: Vec<String>) -> Result<Self, ConfigurationError> {
        if low.is_empty() {
            return Err(ConfigurationError::EmptyLowTier);
        }
        if !high.is_empty() && high.len() != low.len() {
            return Err(ConfigurationError::TierLengthMismatch {
                low: low.len(),
                high: high.len(),
            });
        }

        Ok(Self {
            paths: [low, high],
            router: SlotMap::with_key(),
            in_flight: None,
            tier_phases: [TierPhase::NotStarted; 2],
            phase: PipelinePhase::Idle,
            discarded: 0,
            failures: Vec::new(),
        })
    }
}

// getters
impl Orchestrator {
    /// 环境贴图的数量
    pub fn total(&self) -> usize {
        self.paths[Tier::Low.slot()].len()
    }

    /// 某个 tier 配置的条目数，未配置为 0
    pub fn tier_len(&self, tier: Tier) -> usize {
        self.paths[tier.slot()].len()
    }

    pub fn has_tier(&self, tier: Tier) -> bool {
        !self.paths[tier.slot()].is_empty()
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn tier_phase(&self, tier: Tier) -> TierPhase {
        self.tier_phases[tier.slot()]
    }

    /// 正在等待终止消息的请求
    pub fn in_flight(&self) -> Option<(RequestId, &LoadRequest)> {
        let id = self.in_flight?;
        self.router.get(id).map(|request| (id, request))
    }

    /// 被丢弃的过期事件数
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }
}

impl Orchestrator {
    /// 开始加载 Low tier，返回 index 0 的请求；只能从 Idle 开始
    pub fn start(&mut self, progress: &mut ProgressAggregator) -> Option<IssuedRequest> {
        if self.phase != PipelinePhase::Idle {
            log::warn!("start ignored, pipeline is {:?}", self.phase);
            return None;
        }

        log::info!("loading low tier ({} environments)", self.total());
        self.phase = PipelinePhase::LoadingLow;
        Some(self.issue(Tier::Low, 0, progress))
    }

    /// 处理解码线程的消息，返回需要发出的下一个请求
    pub fn handle_event(
        &mut self,
        id: RequestId,
        message: WorkerMessage,
        cache: &mut TextureCache,
        progress: &mut ProgressAggregator,
    ) -> Option<IssuedRequest> {
        let request = self.accept(id, &message)?;

        match message {
            WorkerMessage::Progress { fraction } => {
                log::debug!("{} #{} progress {fraction:.2}", request.tier, request.index);
                progress.on_progress(request.tier, request.index, fraction);
                None
            }
            WorkerMessage::Data { pixels, width, height } => {
                let request = self.retire(id)?;
                let image = match DecodedImage::new(pixels, width, height, request.tier) {
                    Ok(image) => image,
                    Err(e) => return self.skip(request, e.into(), cache, progress),
                };
                if let Err(e) = cache.insert(request.index, request.tier, image) {
                    return self.skip(request, e.into(), cache, progress);
                }
                log::info!(
                    "{} #{} ready ({width}x{height}) {}",
                    request.tier,
                    request.index,
                    request.resource_path
                );
                progress.on_item_finished(request.tier, request.index);
                self.advance(request.tier, request.index, progress)
            }
            WorkerMessage::Error { detail } => {
                let request = self.retire(id)?;
                self.skip(request, DecodeError::new(detail).into(), cache, progress)
            }
        }
    }

    /// 请求没有送达，或者解码线程没有返回终止消息；与解码失败的处理方式相同
    pub fn handle_transport_failure(
        &mut self,
        id: RequestId,
        error: TransportError,
        cache: &mut TextureCache,
        progress: &mut ProgressAggregator,
    ) -> Option<IssuedRequest> {
        if !self.phase.is_loading() || self.in_flight != Some(id) {
            self.discard(id, "transport failure");
            return None;
        }
        let request = self.retire(id)?;
        self.skip(request, error.into(), cache, progress)
    }

    /// 停止发出新请求，之后到达的所有事件都被丢弃；已经完成的加载无法取消
    pub fn cancel(&mut self) {
        if !self.phase.is_loading() && self.phase != PipelinePhase::Idle {
            log::debug!("cancel ignored, pipeline is {:?}", self.phase);
            return;
        }

        log::info!("pipeline cancelled in {:?}", self.phase);
        self.phase = PipelinePhase::Cancelled;
        self.in_flight = None;
        // clear 而不是重建: 槽位的 generation 会递增，旧 key 不会与之后的新请求相等
        self.router.clear();
    }

    /// 回到 Idle，可以重新 start
    pub fn reset(&mut self) {
        self.router.clear();
        self.in_flight = None;
        self.tier_phases = [TierPhase::NotStarted; 2];
        self.phase = PipelinePhase::Idle;
        self.failures.clear();
    }
}

impl Orchestrator {
    /// 检查事件是否属于当前请求
    fn accept(&mut self, id: RequestId, message: &WorkerMessage) -> Option<LoadRequest> {
        if !self.phase.is_loading() || self.in_flight != Some(id) {
            self.discard(id, message.tag());
            return None;
        }
        match self.router.get(id) {
            Some(request) => Some(request.clone()),
            None => {
                self.discard(id, message.tag());
                None
            }
        }
    }

    fn discard(&mut self, id: RequestId, what: &str) {
        self.discarded += 1;
        if what == "progress" {
            log::debug!("discard stale progress for {id:?}");
        } else {
            log::warn!("discard stale {what} for {id:?} (pipeline {:?})", self.phase);
        }
    }

    /// 终止消息到达，注销请求
    fn retire(&mut self, id: RequestId) -> Option<LoadRequest> {
        self.in_flight = None;
        self.router.remove(id)
    }

    fn issue(&mut self, tier: Tier, index: usize, progress: &mut ProgressAggregator) -> IssuedRequest {
        let request = LoadRequest {
            resource_path: self.paths[tier.slot()][index].clone(),
            tier,
            index,
        };
        let id = self.router.insert(request.clone());
        self.in_flight = Some(id);
        self.tier_phases[tier.slot()] = TierPhase::Loading(index);
        progress.begin_item(tier, index);

        log::info!("request {tier} #{index}: {}", request.resource_path);
        IssuedRequest { id, request }
    }

    /// 记录失败、标记为不可用，然后像成功一样继续
    fn skip(
        &mut self,
        request: LoadRequest,
        error: PipelineError,
        cache: &mut TextureCache,
        progress: &mut ProgressAggregator,
    ) -> Option<IssuedRequest> {
        log::error!("{} #{} skipped ({}): {error}", request.tier, request.index, request.resource_path);
        if let Err(e) = cache.mark_unavailable(request.index, request.tier) {
            log::error!("failed to mark {} #{} unavailable: {e}", request.tier, request.index);
        }
        progress.on_item_finished(request.tier, request.index);
        self.failures.push(ItemFailure {
            index: request.index,
            tier: request.tier,
            error,
        });
        self.advance(request.tier, request.index, progress)
    }

    fn advance(&mut self, tier: Tier, index: usize, progress: &mut ProgressAggregator) -> Option<IssuedRequest> {
        let next = index + 1;
        if next < self.tier_len(tier) {
            return Some(self.issue(tier, next, progress));
        }

        self.tier_phases[tier.slot()] = TierPhase::Completed;
        log::info!("{tier} tier completed");

        if tier == Tier::Low && self.has_tier(Tier::High) {
            log::info!("loading high tier");
            self.phase = PipelinePhase::LoadingHigh;
            Some(self.issue(Tier::High, 0, progress))
        } else {
            log::info!("pipeline ready");
            self.phase = PipelinePhase::Ready;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSlot;
    use crate::hdr::CHANNELS;

    struct Harness {
        orchestrator: Orchestrator,
        cache: TextureCache,
        progress: ProgressAggregator,
        current: Option<IssuedRequest>,
        issued: Vec<LoadRequest>,
    }

    impl Harness {
        fn new(low: usize, high: usize) -> Self {
            let names = |tier: &str, n: usize| (0..n).map(|i| format!("{tier}_{i}.hdr")).collect();
            let orchestrator = Orchestrator::new(names("low", low), names("high", high)).unwrap();
            let mut harness = Self {
                cache: TextureCache::new(orchestrator.total()),
                progress: ProgressAggregator::new(low, high),
                orchestrator,
                current: None,
                issued: Vec::new(),
            };
            let first = harness.orchestrator.start(&mut harness.progress);
            harness.track(first);
            harness
        }

        fn track(&mut self, next: Option<IssuedRequest>) {
            if let Some(next) = &next {
                self.issued.push(next.request.clone());
            }
            if next.is_some() || self.orchestrator.in_flight().is_none() {
                self.current = next;
            }
        }

        fn current_id(&self) -> RequestId {
            self.current.as_ref().unwrap().id
        }

        fn send(&mut self, id: RequestId, message: WorkerMessage) {
            let next = self
                .orchestrator
                .handle_event(id, message, &mut self.cache, &mut self.progress);
            self.track(next);
        }

        fn report(&mut self, fraction: f32) {
            self.send(self.current_id(), WorkerMessage::Progress { fraction });
        }

        fn data(&mut self) {
            self.send(self.current_id(), data());
        }

        fn error(&mut self) {
            self.send(
                self.current_id(),
                WorkerMessage::Error {
                    detail: "truncated".to_string(),
                },
            );
        }
    }

    fn data() -> WorkerMessage {
        WorkerMessage::Data {
            pixels: vec![1.0; 2 * CHANNELS],
            width: 2,
            height: 1,
        }
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!((actual - expected).abs() < 1e-3, "{actual} != {expected}");
    }

    #[test]
    fn test_scenario_progress_sequence_then_high_tier() {
        let mut h = Harness::new(5, 5);
        let mut seen = Vec::new();
        for i in 0..5 {
            assert_eq!(h.orchestrator.tier_phase(Tier::Low), TierPhase::Loading(i));
            for fraction in [0.0, 0.5, 1.0] {
                h.report(fraction);
                seen.push(h.progress.overall(Tier::Low));
            }
            h.data();
            let expected = [20.0 * i as f32, 20.0 * i as f32 + 10.0, 20.0 * (i + 1) as f32];
            for (actual, expected) in seen[3 * i..].iter().zip(expected) {
                assert_close(*actual, expected);
            }
        }

        assert_eq!(h.progress.overall(Tier::Low), 100.0);
        assert!(h.progress.is_done(Tier::Low));
        assert_eq!(h.orchestrator.tier_phase(Tier::Low), TierPhase::Completed);
        assert_eq!(h.orchestrator.phase(), PipelinePhase::LoadingHigh);

        let current = h.current.as_ref().unwrap();
        assert_eq!((current.request.tier, current.request.index), (Tier::High, 0));
        assert_eq!(current.request.resource_path, "high_0.hdr");
        assert_eq!(h.progress.overall(Tier::High), 0.0);
    }

    #[test]
    fn test_scenario_error_is_skipped() {
        let mut h = Harness::new(5, 0);
        for i in 0..5 {
            h.report(0.5);
            if i == 2 {
                h.error();
                assert_eq!(h.current.as_ref().unwrap().request.index, 3);
            } else {
                h.data();
            }
        }

        assert_eq!(h.orchestrator.phase(), PipelinePhase::Ready);
        assert_eq!(h.progress.overall(Tier::Low), 100.0);
        assert!(h.cache.best_available(2).unwrap().is_none());
        assert!(matches!(h.cache.get(2, Tier::Low).unwrap(), CacheSlot::Unavailable));
        assert_eq!(h.cache.ready_count(Tier::Low), 4);

        let failures = h.orchestrator.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!((failures[0].index, failures[0].tier), (2, Tier::Low));
        assert!(matches!(failures[0].error, PipelineError::Decode(_)));
    }

    #[test]
    fn test_scenario_cancel_discards_late_data() {
        let mut h = Harness::new(5, 5);
        h.data();
        h.data();
        let late = h.current_id();
        assert_eq!(h.orchestrator.tier_phase(Tier::Low), TierPhase::Loading(2));

        h.orchestrator.cancel();
        let generation = h.cache.generation();
        let next = h.orchestrator.handle_event(late, data(), &mut h.cache, &mut h.progress);

        assert!(next.is_none());
        assert_eq!(h.cache.generation(), generation);
        assert!(h.cache.best_available(2).unwrap().is_none());
        assert_eq!(h.cache.ready_count(Tier::Low), 2);
        assert_eq!(h.orchestrator.phase(), PipelinePhase::Cancelled);
        assert_eq!(h.orchestrator.discarded(), 1);
        assert_close(h.progress.overall(Tier::Low), 40.0);
    }

    #[test]
    fn test_high_is_never_requested_before_low_completes() {
        let mut h = Harness::new(3, 3);
        for _ in 0..6 {
            h.report(0.5);
            h.data();
        }
        assert_eq!(h.orchestrator.phase(), PipelinePhase::Ready);

        let order: Vec<(Tier, usize)> = h.issued.iter().map(|r| (r.tier, r.index)).collect();
        assert_eq!(
            order,
            [(Tier::Low, 0), (Tier::Low, 1), (Tier::Low, 2), (Tier::High, 0), (Tier::High, 1), (Tier::High, 2)]
        );
        assert_eq!(h.cache.best_available(1).unwrap().unwrap().tier(), Tier::High);
    }

    #[test]
    fn test_stale_and_duplicate_events_are_discarded() {
        let mut h = Harness::new(2, 0);
        let first = h.current_id();
        h.data();

        // 重复的终止消息与已结束请求的进度
        h.send(first, data());
        h.send(first, WorkerMessage::Progress { fraction: 0.9 });
        // 从未发出过的 id
        h.send(RequestId::default(), data());

        assert_eq!(h.orchestrator.discarded(), 3);
        assert_eq!(h.orchestrator.tier_phase(Tier::Low), TierPhase::Loading(1));
        assert_close(h.progress.overall(Tier::Low), 50.0);
    }

    #[test]
    fn test_malformed_data_is_skipped() {
        let mut h = Harness::new(1, 0);
        h.send(
            h.current_id(),
            WorkerMessage::Data {
                pixels: vec![1.0; 3],
                width: 2,
                height: 2,
            },
        );
        assert_eq!(h.orchestrator.phase(), PipelinePhase::Ready);
        assert!(h.cache.best_available(0).unwrap().is_none());
        assert_eq!(h.orchestrator.failures().len(), 1);
    }

    #[test]
    fn test_transport_failure_is_skipped() {
        let mut h = Harness::new(2, 0);
        let id = h.current_id();
        let next = h.orchestrator.handle_transport_failure(
            id,
            TransportError::Disconnected,
            &mut h.cache,
            &mut h.progress,
        );
        assert_eq!(next.unwrap().request.index, 1);
        assert!(matches!(h.orchestrator.failures()[0].error, PipelineError::Transport(_)));
    }

    #[test]
    fn test_reset_after_cancel_invalidates_old_ids() {
        let mut h = Harness::new(2, 0);
        let old = h.current_id();
        h.orchestrator.cancel();
        h.orchestrator.reset();
        assert_eq!(h.orchestrator.phase(), PipelinePhase::Idle);

        h.progress.reset();
        let restarted = h.orchestrator.start(&mut h.progress).unwrap();
        assert_ne!(restarted.id, old);
        assert_eq!(restarted.request.index, 0);

        h.send(old, data());
        assert_eq!(h.orchestrator.discarded(), 1);
        assert_eq!(h.cache.ready_count(Tier::Low), 0);
    }

    #[test]
    fn test_start_only_from_idle() {
        let mut h = Harness::new(1, 0);
        assert!(h.orchestrator.start(&mut h.progress).is_none());
        assert_eq!(h.issued.len(), 1);
    }

    #[test]
    fn test_rejects_bad_tier_lists() {
        assert!(matches!(
            Orchestrator::new(vec![], vec![]),
            Err(ConfigurationError::EmptyLowTier)
        ));
        assert!(matches!(
            Orchestrator::new(vec!["a".into()], vec!["a".into(), "b".into()]),
            Err(ConfigurationError::TierLengthMismatch { low: 1, high: 2 })
        ));
    }
}
