use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let model = TruvisPath::assets_path("Box.glb");            // assets/Box.glb
/// let config = TruvisPath::config_path("gltf-stream.toml");  // config/gltf-stream.toml
/// ```
pub struct TruvisPath {}
// 核心路径
impl TruvisPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        // 从当前包的位置推导 workspace 目录
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
    }
}
// 根目录下
impl TruvisPath {
    /// 获取 `assets/` 目录下的文件路径
    pub fn assets_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("assets").join(filename)
    }

    /// 获取 `config/` 目录下的文件路径
    pub fn config_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }

    /// 绝对路径原样返回，相对路径先在当前目录下查找，找不到时再到 `assets/` 下查找
    pub fn resolve_asset(path: &str) -> PathBuf {
        let direct = PathBuf::from(path);
        if direct.is_absolute() || direct.exists() {
            return direct;
        }
        Self::assets_path(path)
    }
}
