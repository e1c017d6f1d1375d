use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let dir = EnvstreamPath::cubemap_dir();                 // assets/cubemaps
/// let config = EnvstreamPath::default_config_path();      // assets/envstream.toml
/// ```
pub struct EnvstreamPath {}
impl EnvstreamPath {
    /// 获取 `assets/` 目录下的文件路径
    pub fn assets_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("assets").join(filename)
    }

    /// HDR 环境贴图所在目录
    pub fn cubemap_dir() -> PathBuf {
        Self::assets_path("cubemaps")
    }

    /// 预览程序默认读取的配置文件
    pub fn default_config_path() -> PathBuf {
        Self::assets_path("envstream.toml")
    }

    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        // crates/envstream-tools -> crates -> workspace root
        manifest_dir.ancestors().nth(2).unwrap_or(manifest_dir).to_path_buf()
    }
}
