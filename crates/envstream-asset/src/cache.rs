use crate::error::{ConfigurationError, DecodeError};
use crate::handle::Tier;
use crate::hdr::CHANNELS;
use std::sync::Arc;

/// 解码完成的原始图像
///
/// 像素缓冲在 解码器 -> 解码线程 -> 缓存 之间按值移动，同一时刻只有一个所有者；
/// 插入缓存后由缓存以 `Arc` 持有，读者拿到的是不可变快照。
#[derive(Debug, PartialEq)]
pub struct DecodedImage {
    pixels: Vec<f32>,
    width: u32,
    height: u32,
    tier: Tier,
}

impl DecodedImage {
    /// 缓冲长度必须是 `width * height * 4`，尺寸不能为 0
    pub fn new(pixels: Vec<f32>, width: u32, height: u32, tier: Tier) -> Result<Self, DecodeError> {
        let expected = width as usize * height as usize * CHANNELS;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(DecodeError::new(format!(
                "{} samples for a {width}x{height} image",
                pixels.len()
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
            tier,
        })
    }

    #[inline]
    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn channels(&self) -> usize {
        CHANNELS
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// (x, y) 处的 RGBA
    pub fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        let mut texel = [0.0; 4];
        texel.copy_from_slice(&self.pixels[offset..offset + CHANNELS]);
        texel
    }
}

/// 缓存表中一个 (index, tier) 的状态
#[derive(Debug, Clone, Default)]
pub enum CacheSlot {
    /// 还没有加载
    #[default]
    Pending,
    /// 本轮加载中解码失败，不会再出现
    Unavailable,
    Ready(Arc<DecodedImage>),
}

impl CacheSlot {
    pub fn image(&self) -> Option<&Arc<DecodedImage>> {
        match self {
            CacheSlot::Ready(image) => Some(image),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CacheSlot::Ready(_))
    }
}

/// (index, tier) -> DecodedImage 的表
///
/// 只由编排器处理事件时写入 (单写者)；插入以整个 `Arc` 为单位，读者不会看到写了一半的条目。
#[derive(Debug)]
pub struct TextureCache {
    slots: Vec<[CacheSlot; 2]>,
    /// 每次修改加一，读者可以用它判断表是否变化
    generation: u64,
}

impl TextureCache {
    pub fn new(total: usize) -> Self {
        Self {
            slots: vec![Default::default(); total],
            generation: 0,
        }
    }

    /// 环境贴图的数量 N
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 插入或覆盖 (index, tier)，返回缓存持有的共享引用
    pub fn insert(
        &mut self,
        index: usize,
        tier: Tier,
        image: DecodedImage,
    ) -> Result<Arc<DecodedImage>, ConfigurationError> {
        let slot = self.slot_mut(index, tier)?;
        let image = Arc::new(image);
        *slot = CacheSlot::Ready(image.clone());
        self.generation += 1;
        Ok(image)
    }

    /// 标记 (index, tier) 在本轮不可用；已经 Ready 的条目保持不变
    pub fn mark_unavailable(&mut self, index: usize, tier: Tier) -> Result<(), ConfigurationError> {
        let slot = self.slot_mut(index, tier)?;
        if !slot.is_ready() {
            *slot = CacheSlot::Unavailable;
            self.generation += 1;
        }
        Ok(())
    }

    pub fn get(&self, index: usize, tier: Tier) -> Result<&CacheSlot, ConfigurationError> {
        self.check_index(index)?;
        Ok(&self.slots[index][tier.slot()])
    }

    /// 优先返回 High，其次 Low，都没有则返回 None
    pub fn best_available(&self, index: usize) -> Result<Option<Arc<DecodedImage>>, ConfigurationError> {
        self.check_index(index)?;
        let [low, high] = &self.slots[index];
        Ok(high.image().or(low.image()).cloned())
    }

    pub fn ready_count(&self, tier: Tier) -> usize {
        self.slots.iter().filter(|slots| slots[tier.slot()].is_ready()).count()
    }

    /// 释放所有缓冲，用于整条流水线重启
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slots| *slots = Default::default());
        self.generation += 1;
    }

    fn slot_mut(&mut self, index: usize, tier: Tier) -> Result<&mut CacheSlot, ConfigurationError> {
        self.check_index(index)?;
        Ok(&mut self.slots[index][tier.slot()])
    }

    fn check_index(&self, index: usize) -> Result<(), ConfigurationError> {
        if index >= self.slots.len() {
            return Err(ConfigurationError::IndexOutOfRange {
                index,
                total: self.slots.len(),
            });
        }
        Ok(())
    }
}
