use crate::cache::{DecodedImage, TextureCache};
use crate::error::ConfigurationError;
use crate::handle::{Selection, Tier};
use glam::{Vec3, Vec4};
use rayon::prelude::*;
use std::f32::consts::PI;
use std::sync::Arc;

/// mip 链中的一层
#[derive(Debug, Clone, PartialEq)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<Vec4>,
}

impl MipLevel {
    /// 按 RGBA32F 排列的原始字节，可直接上传 GPU
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }

    fn texel(&self, x: u32, y: u32) -> Vec4 {
        self.texels[(y * self.width + x) as usize]
    }

    /// 2x2 box filter，奇数边缘的像素被钳制到最后一行/列
    fn downsample(&self) -> MipLevel {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut texels = vec![Vec4::ZERO; (width * height) as usize];

        texels.par_chunks_mut(width as usize).enumerate().for_each(|(y, row)| {
            let y0 = (y as u32 * 2).min(self.height - 1);
            let y1 = (y0 + 1).min(self.height - 1);
            for (x, texel) in row.iter_mut().enumerate() {
                let x0 = (x as u32 * 2).min(self.width - 1);
                let x1 = (x0 + 1).min(self.width - 1);
                *texel = (self.texel(x0, y0) + self.texel(x1, y0) + self.texel(x0, y1) + self.texel(x1, y1)) * 0.25;
            }
        });

        MipLevel { width, height, texels }
    }
}

/// 预滤波后的等距柱状投影环境贴图
///
/// 完整 mip 链，level 0 为原始分辨率，最后一层为 1x1。
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredEnvironment {
    levels: Vec<MipLevel>,
    source_tier: Tier,
}

impl FilteredEnvironment {
    /// 滤波，开销与图像分辨率同阶
    pub fn from_image(image: &DecodedImage) -> Self {
        let _span = profile_span!("FilteredEnvironment::from_image");

        let base = MipLevel {
            width: image.width(),
            height: image.height(),
            texels: image
                .pixels()
                .par_chunks_exact(image.channels())
                .map(|p| Vec4::new(p[0], p[1], p[2], 1.0))
                .collect(),
        };

        let mut levels = vec![base];
        while let Some(last) = levels.last()
            && (last.width > 1 || last.height > 1)
        {
            let next = last.downsample();
            levels.push(next);
        }

        Self {
            levels,
            source_tier: image.tier(),
        }
    }

    pub fn levels(&self) -> &[MipLevel] {
        &self.levels
    }

    pub fn base(&self) -> &MipLevel {
        &self.levels[0]
    }

    pub fn mip_count(&self) -> usize {
        self.levels.len()
    }

    pub fn source_tier(&self) -> Tier {
        self.source_tier
    }

    /// 按方向采样，lod 取最近的一层
    ///
    /// u = atan2(z, x) / 2π + 0.5，v = acos(y) / π
    pub fn sample(&self, direction: Vec3, lod: f32) -> Vec4 {
        let dir = direction.normalize_or_zero();
        if dir == Vec3::ZERO {
            return Vec4::ZERO;
        }

        let level_index = (lod.max(0.0).round() as usize).min(self.levels.len() - 1);
        let level = &self.levels[level_index];

        let u = dir.z.atan2(dir.x) / (2.0 * PI) + 0.5;
        let v = dir.y.clamp(-1.0, 1.0).acos() / PI;
        let x = ((u * level.width as f32) as u32).min(level.width - 1);
        let y = ((v * level.height as f32) as u32).min(level.height - 1);
        level.texel(x, y)
    }
}

/// 对外暴露的可渲染环境贴图
#[derive(Debug, Clone)]
pub enum EnvironmentTexture {
    /// 第一次 sync 时还没有任何可用的贴图
    Empty,
    Ready {
        texture: Arc<FilteredEnvironment>,
        index: usize,
        tier: Tier,
        version: u64,
    },
}

impl EnvironmentTexture {
    pub fn texture(&self) -> Option<&Arc<FilteredEnvironment>> {
        match self {
            EnvironmentTexture::Empty => None,
            EnvironmentTexture::Ready { texture, .. } => Some(texture),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            EnvironmentTexture::Empty => 0,
            EnvironmentTexture::Ready { version, .. } => *version,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EnvironmentTexture::Empty)
    }
}

/// 当前合成的来源与结果
#[derive(Debug, Default)]
struct EnvironmentSlot {
    /// 用于判断来源是否变化；reset 后为 None，filtered 保留
    source: Option<Arc<DecodedImage>>,
    filtered: Option<Arc<FilteredEnvironment>>,
    index: usize,
    tier: Option<Tier>,
    /// filtered 每变化一次加一
    version: u64,
}

/// 把当前选中的原始图像转换为可渲染的预滤波贴图
///
/// 只有来源图像 (按指针身份) 变化时才重新滤波；没有可用图像时保留上一次的结果。
#[derive(Debug, Default)]
pub struct EnvironmentCompositor {
    slot: EnvironmentSlot,
    filter_runs: u64,
}

impl EnvironmentCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(&mut self, cache: &TextureCache, selection: Selection) -> Result<EnvironmentTexture, ConfigurationError> {
        let Some(image) = cache.best_available(selection.index())? else {
            return Ok(self.current());
        };

        let unchanged = self.slot.source.as_ref().is_some_and(|source| Arc::ptr_eq(source, &image));
        if !unchanged {
            let _span = profile_span!("EnvironmentCompositor::sync");
            log::info!(
                "compositing environment #{} ({} tier, {}x{})",
                selection.index(),
                image.tier(),
                image.width(),
                image.height()
            );

            let filtered = FilteredEnvironment::from_image(&image);
            self.filter_runs += 1;
            self.slot = EnvironmentSlot {
                tier: Some(image.tier()),
                source: Some(image),
                filtered: Some(Arc::new(filtered)),
                index: selection.index(),
                version: self.slot.version + 1,
            };
        }

        Ok(self.current())
    }

    /// 最近一次合成的结果，不做任何计算
    pub fn current(&self) -> EnvironmentTexture {
        match (&self.slot.filtered, self.slot.tier) {
            (Some(filtered), Some(tier)) => EnvironmentTexture::Ready {
                texture: filtered.clone(),
                index: self.slot.index,
                tier,
                version: self.slot.version,
            },
            _ => EnvironmentTexture::Empty,
        }
    }

    pub fn version(&self) -> u64 {
        self.slot.version
    }

    /// 实际执行滤波的次数
    pub fn filter_runs(&self) -> u64 {
        self.filter_runs
    }

    /// 释放持有的原始图像；已滤波的结果继续对外可见，直到新的来源被合成
    pub fn reset(&mut self) {
        self.slot.source = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdr::CHANNELS;

    fn solid(width: u32, height: u32, value: f32, tier: Tier) -> DecodedImage {
        let mut pixels = Vec::with_capacity((width * height) as usize * CHANNELS);
        for _ in 0..width * height {
            pixels.extend([value, value * 0.5, value * 0.25, 1.0]);
        }
        DecodedImage::new(pixels, width, height, tier).unwrap()
    }

    #[test]
    fn test_mip_chain_reaches_one_texel() {
        let filtered = FilteredEnvironment::from_image(&solid(8, 4, 2.0, Tier::Low));
        let sizes: Vec<(u32, u32)> = filtered.levels().iter().map(|l| (l.width, l.height)).collect();
        assert_eq!(sizes, [(8, 4), (4, 2), (2, 1), (1, 1)]);

        // 常数图像的每一层都保持常数
        for level in filtered.levels() {
            assert!(level.texels.iter().all(|t| *t == Vec4::new(2.0, 1.0, 0.5, 1.0)));
        }
        assert_eq!(filtered.base().as_bytes().len(), 8 * 4 * 16);
    }

    #[test]
    fn test_box_filter_averages() {
        let pixels = vec![
            0.0, 0.0, 0.0, 1.0, //
            4.0, 0.0, 0.0, 1.0, //
            8.0, 0.0, 0.0, 1.0, //
            4.0, 0.0, 0.0, 1.0, //
        ];
        let filtered = FilteredEnvironment::from_image(&DecodedImage::new(pixels, 2, 2, Tier::High).unwrap());
        assert_eq!(filtered.mip_count(), 2);
        assert_eq!(filtered.levels()[1].texels[0], Vec4::new(4.0, 0.0, 0.0, 1.0));
        assert_eq!(filtered.source_tier(), Tier::High);
    }

    #[test]
    fn test_sample_equirect_mapping() {
        // 上半部分为 1，下半部分为 0
        let mut pixels = Vec::new();
        for y in 0..4 {
            let v = if y < 2 { 1.0 } else { 0.0 };
            for _ in 0..8 {
                pixels.extend([v, v, v, 1.0]);
            }
        }
        let filtered = FilteredEnvironment::from_image(&DecodedImage::new(pixels, 8, 4, Tier::Low).unwrap());

        assert_eq!(filtered.sample(Vec3::Y, 0.0).x, 1.0);
        assert_eq!(filtered.sample(-Vec3::Y, 0.0).x, 0.0);
        assert_eq!(filtered.sample(Vec3::ZERO, 0.0), Vec4::ZERO);
        // lod 超出范围时落到 1x1 层
        assert_eq!(filtered.sample(Vec3::X, 99.0).x, 0.5);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mut cache = TextureCache::new(2);
        let mut compositor = EnvironmentCompositor::new();
        let selection = Selection::new(0, Tier::High, 2).unwrap();

        assert!(compositor.sync(&cache, selection).unwrap().is_empty());
        assert_eq!(compositor.filter_runs(), 0);

        cache.insert(0, Tier::Low, solid(4, 2, 1.0, Tier::Low)).unwrap();
        let first = compositor.sync(&cache, selection).unwrap();
        let second = compositor.sync(&cache, selection).unwrap();
        assert_eq!(compositor.filter_runs(), 1);
        assert_eq!(first.version(), 1);
        assert_eq!(second.version(), 1);
        assert!(Arc::ptr_eq(first.texture().unwrap(), second.texture().unwrap()));
    }

    #[test]
    fn test_upgrade_to_high_bumps_version() {
        let mut cache = TextureCache::new(1);
        let mut compositor = EnvironmentCompositor::new();
        let selection = Selection::new(0, Tier::High, 1).unwrap();

        cache.insert(0, Tier::Low, solid(4, 2, 1.0, Tier::Low)).unwrap();
        compositor.sync(&cache, selection).unwrap();
        cache.insert(0, Tier::High, solid(8, 4, 1.0, Tier::High)).unwrap();
        let texture = compositor.sync(&cache, selection).unwrap();

        let EnvironmentTexture::Ready { tier, version, .. } = texture else {
            panic!("expected a ready texture");
        };
        assert_eq!(tier, Tier::High);
        assert_eq!(version, 2);
        assert_eq!(compositor.filter_runs(), 2);
    }

    #[test]
    fn test_missing_selection_keeps_previous_texture() {
        let mut cache = TextureCache::new(3);
        let mut compositor = EnvironmentCompositor::new();
        cache.insert(0, Tier::Low, solid(4, 2, 1.0, Tier::Low)).unwrap();

        let before = compositor.sync(&cache, Selection::new(0, Tier::Low, 3).unwrap()).unwrap();
        let after = compositor.sync(&cache, Selection::new(2, Tier::Low, 3).unwrap()).unwrap();

        let EnvironmentTexture::Ready { index, .. } = &after else {
            panic!("compositor regressed to an empty texture");
        };
        assert_eq!(*index, 0);
        assert!(Arc::ptr_eq(before.texture().unwrap(), after.texture().unwrap()));
        assert_eq!(compositor.filter_runs(), 1);
    }

    #[test]
    fn test_reset_keeps_version_monotonic() {
        let mut cache = TextureCache::new(1);
        let mut compositor = EnvironmentCompositor::new();
        let selection = Selection::new(0, Tier::Low, 1).unwrap();

        cache.insert(0, Tier::Low, solid(2, 2, 1.0, Tier::Low)).unwrap();
        let before = compositor.sync(&cache, selection).unwrap();
        compositor.reset();

        // reset 之后仍然返回上一次的结果，version 不回退
        let kept = compositor.current();
        assert_eq!(kept.version(), 1);
        assert!(Arc::ptr_eq(before.texture().unwrap(), kept.texture().unwrap()));
        assert!(compositor.sync(&TextureCache::new(1), selection).unwrap().texture().is_some());

        compositor.sync(&cache, selection).unwrap();
        assert_eq!(compositor.version(), 2);
        assert_eq!(compositor.filter_runs(), 2);
    }
}
