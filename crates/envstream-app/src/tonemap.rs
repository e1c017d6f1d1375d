use anyhow::Context;
use envstream_asset::FilteredEnvironment;
use glam::Vec3;
use std::path::Path;

/// Reinhard + gamma 2.2，输出 sRGB 近似值
pub fn tonemap_texel(rgb: Vec3, exposure: f32) -> [u8; 3] {
    let exposed = (rgb * exposure).max(Vec3::ZERO);
    let mapped = exposed / (Vec3::ONE + exposed);
    mapped.to_array().map(|v| (v.powf(1.0 / 2.2) * 255.0).round().clamp(0.0, 255.0) as u8)
}

/// 把某一层 mip 导出为 8-bit PNG
pub fn save_png(environment: &FilteredEnvironment, level: usize, exposure: f32, path: &Path) -> anyhow::Result<()> {
    let mip = environment
        .levels()
        .get(level)
        .with_context(|| format!("mip level {level} out of range, {} levels", environment.mip_count()))?;

    let image = image::RgbImage::from_fn(mip.width, mip.height, |x, y| {
        let texel = mip.texels[(y * mip.width + x) as usize];
        image::Rgb(tonemap_texel(texel.truncate(), exposure))
    });
    image.save(path).with_context(|| format!("failed to write {path:?}"))?;

    log::info!("saved {}x{} preview to {path:?}", mip.width, mip.height);
    Ok(())
}
