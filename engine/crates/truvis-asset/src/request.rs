//! 提交给 streamer 线程的请求

use ash::vk;
use truvis_gfx::commands::{BufferBarrier, TextureBarrier};
use truvis_gfx::handles::{BufferHandle, TextureHandle};
use truvis_gfx::state::ResourceState;

use crate::containers::TextureImage;
use crate::desc::{GeometryLoadDesc, TextureCopyDesc, TextureLoadDesc};
use crate::geometry::Geometry;
use crate::resource::{LoadedTexture, PendingResource};
use crate::token::SyncToken;

/// buffer 更新的数据来源
pub(crate) enum BufferSource {
    /// 由 streamer 线程写入 staging ring
    Bytes(Vec<u8>),
    /// 调用者已经写入了一个专用的上传 buffer
    Upload { buffer: BufferHandle, offset: vk::DeviceSize },
}

/// texture 更新的数据来源
pub(crate) enum TextureSource {
    /// 调用者已经按照 `row_pitch` / `slice_pitch` 写入了专用的上传 buffer，只包含一个 subresource
    Upload {
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        row_pitch: u32,
        slice_pitch: u32,
        mip_level: u32,
        array_layer: u32,
    },
    /// 完整的初始数据，由 streamer 线程逐个 subresource 写入 staging
    Image(TextureImage),
}

pub(crate) enum UpdateRequest {
    BufferUpdate {
        buffer: BufferHandle,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
        source: BufferSource,
    },
    TextureUpdate {
        texture: TextureHandle,
        /// 更新前后 texture 所处的状态
        current_state: ResourceState,
        source: TextureSource,
    },
    TextureLoad {
        desc: TextureLoadDesc,
        target: PendingResource<LoadedTexture>,
    },
    GeometryLoad {
        desc: GeometryLoadDesc,
        target: PendingResource<Geometry>,
    },
    BufferBarrier(Vec<BufferBarrier>),
    TextureBarrier(Vec<TextureBarrier>),
    TextureCopy(TextureCopyDesc),
}

impl UpdateRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateRequest::BufferUpdate { .. } => "buffer-update",
            UpdateRequest::TextureUpdate { .. } => "texture-update",
            UpdateRequest::TextureLoad { .. } => "texture-load",
            UpdateRequest::GeometryLoad { .. } => "geometry-load",
            UpdateRequest::BufferBarrier(_) => "buffer-barrier",
            UpdateRequest::TextureBarrier(_) => "texture-barrier",
            UpdateRequest::TextureCopy(_) => "texture-copy",
        }
    }
}

/// 已经入队的请求
pub(crate) struct QueuedRequest {
    pub request: UpdateRequest,
    /// 请求完成时满足的 token
    pub wait_index: SyncToken,
    /// 请求自己持有的上传 buffer，请求执行之后交给当前的 resource set 管理
    pub upload_buffer: Option<BufferHandle>,
}

/// handler 的执行结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UploadFunctionResult {
    /// 已经录制到 command buffer。staging 放不下时走 overflow 路径，所以不存在 staging 不足的结果
    Completed,
    /// 请求无法执行（文件不存在、格式不支持等），token 会被立刻 retire
    InvalidRequest,
}
