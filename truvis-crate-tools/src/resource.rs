use std::{
    env,
    path::{Path, PathBuf},
};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
/// 可以通过环境变量 `TRUVIS_ASSETS_DIR` 覆盖 assets 根目录，
/// 方便把引擎嵌入到其他工程中使用。
///
/// # 使用示例
/// ```ignore
/// let texture = TruvisPath::assets_path("textures/uv_checker.dds"); // assets/textures/uv_checker.dds
/// let mesh = TruvisPath::assets_path("meshes/cube.obj");            // assets/meshes/cube.obj
/// ```
pub struct TruvisPath {}
// 核心路径
impl TruvisPath {
    const ASSETS_DIR_ENV: &'static str = "TRUVIS_ASSETS_DIR";

    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        // truvis-crate-tools 位于工作区根目录下的一级子目录
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
    }

    pub fn target_path() -> PathBuf {
        Self::workspace_path().join("target")
    }

    /// 运行时产生的临时文件目录，位于 `target/tmp`
    pub fn temp_path() -> PathBuf {
        Self::target_path().join("tmp")
    }
}
// 资源目录
impl TruvisPath {
    /// 资源根目录，默认是 `assets/`
    pub fn assets_root() -> PathBuf {
        match env::var_os(Self::ASSETS_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => Self::workspace_path().join("assets"),
        }
    }

    /// 获取 `assets/` 目录下的文件路径
    pub fn assets_path(filename: &str) -> PathBuf {
        Self::assets_root().join(filename)
    }
}
