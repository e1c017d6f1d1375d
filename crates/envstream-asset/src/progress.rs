use crate::handle::Tier;

/// 单个 tier 的进度状态，只由 [`ProgressAggregator`] 修改
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TierState {
    /// 已经得到终止消息的条目数 (成功或跳过)
    pub completed_count: usize,
    pub current_index: usize,
    /// 当前条目的进度，index 不变时非递减，只在 index 前进时归零
    pub current_fraction: f32,
    pub total: usize,
    pub done: bool,
}

impl TierState {
    fn new(total: usize) -> Self {
        Self {
            completed_count: 0,
            current_index: 0,
            current_fraction: 0.0,
            total,
            done: false,
        }
    }

    /// `100 * (completed + fraction) / total`，限制在 [0, 100]；未配置的 tier 为 0
    pub fn overall(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        let value = 100.0 * (self.completed_count as f32 + self.current_fraction) / self.total as f32;
        value.clamp(0.0, 100.0)
    }
}

#[derive(Clone, Copy, Debug)]
struct TierProgress {
    state: TierState,
    /// 已经对外汇报过的最大值
    reported: f32,
}

impl TierProgress {
    fn new(total: usize) -> Self {
        Self {
            state: TierState::new(total),
            reported: 0.0,
        }
    }

    fn refresh(&mut self) {
        self.reported = self.reported.max(self.state.overall());
    }
}

/// 把每个条目的进度和已完成数折叠为每个 tier 的整体百分比
///
/// 对外汇报的值单调不减：乱序到达的进度事件不会让数值回退。
#[derive(Clone, Debug)]
pub struct ProgressAggregator {
    tiers: [TierProgress; 2],
}

impl ProgressAggregator {
    pub fn new(low_total: usize, high_total: usize) -> Self {
        Self {
            tiers: [TierProgress::new(low_total), TierProgress::new(high_total)],
        }
    }

    pub fn state(&self, tier: Tier) -> &TierState {
        &self.tiers[tier.slot()].state
    }

    /// 整体进度 0-100
    pub fn overall(&self, tier: Tier) -> f32 {
        self.tiers[tier.slot()].reported
    }

    pub fn is_done(&self, tier: Tier) -> bool {
        self.tiers[tier.slot()].state.done
    }

    /// 开始加载某个条目；只有 index 前进时才清零当前进度
    pub fn begin_item(&mut self, tier: Tier, index: usize) {
        let progress = &mut self.tiers[tier.slot()];
        if progress.state.current_index != index {
            progress.state.current_index = index;
            progress.state.current_fraction = 0.0;
        }
    }

    /// 记录当前条目的进度；不属于当前条目的事件被忽略
    pub fn on_progress(&mut self, tier: Tier, index: usize, fraction: f32) {
        let progress = &mut self.tiers[tier.slot()];
        if progress.state.done || progress.state.current_index != index {
            log::debug!("ignore progress {fraction} for {tier} #{index}");
            return;
        }
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        progress.state.current_fraction = progress.state.current_fraction.max(fraction);
        progress.refresh();
    }

    /// 条目得到终止消息 (成功或跳过)
    pub fn on_item_finished(&mut self, tier: Tier, index: usize) {
        let progress = &mut self.tiers[tier.slot()];
        let state = &mut progress.state;
        if state.done || state.current_index != index {
            log::debug!("ignore completion of {tier} #{index}");
            return;
        }

        state.completed_count = (state.completed_count + 1).min(state.total);
        state.current_fraction = 0.0;
        if state.completed_count == state.total {
            state.done = true;
        } else {
            state.current_index = index + 1;
        }
        progress.refresh();
    }

    /// 重新开始，所有 tier 回到 0
    pub fn reset(&mut self) {
        for progress in &mut self.tiers {
            *progress = TierProgress::new(progress.state.total);
        }
    }
}
