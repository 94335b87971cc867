use std::sync::{Arc, Mutex, PoisonError};

use truvis_gfx::desc::TextureDesc;
use truvis_gfx::handles::TextureHandle;

use crate::containers::svt::VirtualTextureInfo;

/// 异步加载的结果
///
/// 文件的读取和解析发生在 streamer 线程中，所以加载函数返回时还拿不到 handle。
/// 对应的 token 完成之后，结果一定已经写入；解析失败时结果保持为空。
pub struct PendingResource<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for PendingResource<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

impl<T> Default for PendingResource<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> PendingResource<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fulfill(&self, value: T) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// 取走结果，之后再调用会返回 None
    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl<T: Clone> PendingResource<T> {
    pub fn get(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PendingResource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PendingResource")
            .field(&*self.slot.lock().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

/// 从文件加载完成的 texture
#[derive(Clone, Debug)]
pub struct LoadedTexture {
    pub texture: TextureHandle,
    pub desc: TextureDesc,
    /// 只有 SVT 容器才有
    pub virtual_info: Option<VirtualTextureInfo>,
}
