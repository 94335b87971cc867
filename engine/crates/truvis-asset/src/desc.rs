//! 资源加载器的配置以及各类请求的描述

use ash::vk;
use truvis_gfx::commands::{BufferBarrier, SemaphoreSubmit, TextureBarrier};
use truvis_gfx::desc::{BufferDesc, TextureDesc};
use truvis_gfx::handles::{BufferHandle, TextureHandle};
use truvis_gfx::state::ResourceState;

use crate::fs::ResourceDirectory;
use crate::geometry::{GeometryLoadFlags, VertexLayout};

/// 资源加载器的配置
#[derive(Clone, Debug)]
pub struct ResourceLoaderDesc {
    /// 每个 resource set 中 staging ring 的大小
    pub buffer_size: vk::DeviceSize,
    /// resource set 的数量，即同时在 GPU 上执行的上传批次数量
    pub buffer_count: u32,
    /// 为 true 时不创建 streamer 线程，每次 API 调用结束时同步执行一轮
    pub single_threaded: bool,
}

impl Default for ResourceLoaderDesc {
    fn default() -> Self {
        Self {
            buffer_size: 8 << 20,
            buffer_count: 3,
            single_threaded: false,
        }
    }
}

/// 更新 buffer 的一段区域
#[derive(Clone, Copy, Debug)]
pub struct BufferUpdateDesc {
    pub buffer: BufferHandle,
    pub dst_offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub device_index: usize,
}

impl BufferUpdateDesc {
    #[inline]
    pub fn new(buffer: BufferHandle, dst_offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        Self {
            buffer,
            dst_offset,
            size,
            device_index: 0,
        }
    }
}

/// 创建 buffer，并可选地写入初始数据
#[derive(Clone, Debug)]
pub struct BufferLoadDesc {
    pub desc: BufferDesc,
    pub data: Option<Vec<u8>>,
    pub device_index: usize,
}

/// 更新 texture 的一个 subresource
#[derive(Clone, Copy, Debug)]
pub struct TextureUpdateDesc {
    pub texture: TextureHandle,
    pub mip_level: u32,
    pub array_layer: u32,
    /// texture 当前所处的状态，更新完成后会回到这个状态
    ///
    /// 为 UNDEFINED 时，更新完成后处于 SHADER_RESOURCE
    pub current_state: ResourceState,
    pub device_index: usize,
}

impl TextureUpdateDesc {
    #[inline]
    pub fn new(texture: TextureHandle, mip_level: u32, array_layer: u32) -> Self {
        Self {
            texture,
            mip_level,
            array_layer,
            current_state: ResourceState::UNDEFINED,
            device_index: 0,
        }
    }
}

/// 纹理文件的容器类型
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureContainer {
    /// 根据文件扩展名判断
    #[default]
    Default,
    Dds,
    Ktx,
    Basis,
    /// sparse / virtual texture
    Svt,
    /// 主机平台的格式，当前平台不支持
    Gnf,
}

#[derive(Clone, Debug, Default)]
pub struct TextureLoadDesc {
    pub file_name: String,
    pub directory: ResourceDirectory,
    /// 加密文件的密码
    pub password: Option<String>,
    pub container: TextureContainer,
    /// 使用对应的 SRGB 格式，没有对应格式时保持原格式
    pub srgb: bool,
    pub device_index: usize,
}

impl TextureLoadDesc {
    pub fn new(file_name: impl AsRef<str>) -> Self {
        Self {
            file_name: file_name.as_ref().to_string(),
            directory: ResourceDirectory::Textures,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GeometryLoadDesc {
    pub file_name: String,
    pub directory: ResourceDirectory,
    pub password: Option<String>,
    pub vertex_layout: VertexLayout,
    pub flags: GeometryLoadFlags,
    pub device_index: usize,
}

impl GeometryLoadDesc {
    pub fn new(file_name: impl AsRef<str>) -> Self {
        Self {
            file_name: file_name.as_ref().to_string(),
            directory: ResourceDirectory::Meshes,
            ..Default::default()
        }
    }
}

/// 创建一个 texture，并可选地写入初始数据
///
/// 数据按 layer-major 的顺序紧密排列：每个 layer 依次包含所有 mip。
#[derive(Clone, Debug)]
pub struct TextureCreateDesc {
    pub desc: TextureDesc,
    pub data: Option<Vec<u8>>,
    pub device_index: usize,
}

#[derive(Clone, Debug, Default)]
pub struct BufferBarrierDesc {
    pub barriers: Vec<BufferBarrier>,
    pub device_index: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TextureBarrierDesc {
    pub barriers: Vec<TextureBarrier>,
    pub device_index: usize,
}

/// 把 texture 的一个 subresource 拷贝回 buffer（readback）
#[derive(Clone, Copy, Debug)]
pub struct TextureCopyDesc {
    pub texture: TextureHandle,
    pub buffer: BufferHandle,
    pub buffer_offset: vk::DeviceSize,
    pub mip_level: u32,
    pub array_layer: u32,
    /// texture 当前所处的状态，拷贝完成后会回到这个状态
    pub texture_state: ResourceState,
    /// 拷贝之前需要等待的 semaphore，例如 graphics 队列写完 texture 之后 signal 的 semaphore
    pub wait_semaphore: Option<SemaphoreSubmit>,
    pub device_index: usize,
}
