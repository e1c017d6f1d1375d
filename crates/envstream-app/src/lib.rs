//! 预览程序
//!
//! 以固定帧间隔驱动 [`envstream_asset::EnvironmentPipeline`]，模拟渲染循环对进度与环境贴图的读取。
//! 不创建窗口，结果可以通过 [`tonemap`] 导出为 PNG。

pub mod preview_app;
pub mod tonemap;
