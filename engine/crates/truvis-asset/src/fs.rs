use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use truvis_crate_tools::resource::TruvisPath;

/// 资源所在的目录
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceDirectory {
    Textures,
    Meshes,
    /// 直接位于根目录下
    #[default]
    Other,
}

/// 文件系统接口，资源加载器通过它读取文件
///
/// streamer 线程会调用这个接口，所以需要是线程安全的
pub trait FileSystem: Send + Sync {
    fn read(&self, directory: ResourceDirectory, file_name: &str, password: Option<&str>) -> anyhow::Result<Vec<u8>>;
}

/// 基于 std::fs 的文件系统，不支持加密文件
pub struct StdFileSystem {
    root: PathBuf,
}

impl StdFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 以 `assets/` 为根目录
    pub fn assets() -> Self {
        Self::new(TruvisPath::assets_root())
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, directory: ResourceDirectory, file_name: &str) -> PathBuf {
        match directory {
            ResourceDirectory::Textures => self.root.join("textures").join(file_name),
            ResourceDirectory::Meshes => self.root.join("meshes").join(file_name),
            ResourceDirectory::Other => self.root.join(file_name),
        }
    }
}

impl FileSystem for StdFileSystem {
    fn read(&self, directory: ResourceDirectory, file_name: &str, password: Option<&str>) -> anyhow::Result<Vec<u8>> {
        if password.is_some() {
            bail!("encrypted file is not supported by StdFileSystem: {}", file_name);
        }
        let path = self.resolve(directory, file_name);
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let fs = StdFileSystem::new("/data");
        assert_eq!(fs.resolve(ResourceDirectory::Textures, "a.dds"), Path::new("/data/textures/a.dds"));
        assert_eq!(fs.resolve(ResourceDirectory::Meshes, "a.obj"), Path::new("/data/meshes/a.obj"));
        assert_eq!(fs.resolve(ResourceDirectory::Other, "a.bin"), Path::new("/data/a.bin"));
    }

    #[test]
    fn test_password_is_rejected() {
        let fs = StdFileSystem::new(std::env::temp_dir());
        let err = fs.read(ResourceDirectory::Other, "whatever.bin", Some("secret")).unwrap_err();
        assert!(err.to_string().contains("encrypted"));
    }

    #[test]
    fn test_missing_file() {
        let fs = StdFileSystem::new(std::env::temp_dir().join("truvis-asset-missing-dir"));
        assert!(fs.read(ResourceDirectory::Textures, "missing.dds", None).is_err());
    }
}
