//! 录制到 command buffer 中的命令参数，以及队列提交的描述

use ash::vk;

use crate::handles::{BufferHandle, CommandBufferHandle, FenceHandle, SemaphoreHandle, TextureHandle};
use crate::state::ResourceState;

/// buffer -> buffer 的拷贝区域
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopyRegion {
    pub src_offset: vk::DeviceSize,
    pub dst_offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// buffer <-> texture 的拷贝
///
/// buffer 中的数据按 `row_pitch` / `slice_pitch` 排列，
/// 一行指的是一行 block（对于压缩格式是 4 个像素高）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferTextureCopy {
    pub buffer: BufferHandle,
    pub buffer_offset: vk::DeviceSize,
    /// 每一行 block 的字节数，包含对齐的 padding
    pub row_pitch: u32,
    /// 每一个 depth slice 的字节数
    pub slice_pitch: u32,
    pub texture: TextureHandle,
    pub mip_level: u32,
    pub array_layer: u32,
    /// 拷贝区域的像素尺寸
    pub extent: vk::Extent3D,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_state: ResourceState,
    pub dst_state: ResourceState,
}

/// texture barrier，可以只针对某一个 subresource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureBarrier {
    pub texture: TextureHandle,
    pub src_state: ResourceState,
    pub dst_state: ResourceState,
    /// None 表示所有 mip / layer
    pub subresource: Option<TextureSubresource>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureSubresource {
    pub mip_level: u32,
    pub array_layer: u32,
}

impl TextureBarrier {
    #[inline]
    pub fn whole(texture: TextureHandle, src_state: ResourceState, dst_state: ResourceState) -> Self {
        Self {
            texture,
            src_state,
            dst_state,
            subresource: None,
        }
    }
}

/// 提交时等待或者 signal 的 semaphore
///
/// timeline semaphore 等待 `>= value`，signal 为 `value`；binary semaphore 忽略 `value`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SemaphoreSubmit {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
}

impl SemaphoreSubmit {
    #[inline]
    pub fn binary(semaphore: SemaphoreHandle) -> Self {
        Self { semaphore, value: 0 }
    }

    #[inline]
    pub fn timeline(semaphore: SemaphoreHandle, value: u64) -> Self {
        Self { semaphore, value }
    }
}

/// 一次队列提交
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitDesc<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    pub wait_semaphores: &'a [SemaphoreSubmit],
    pub signal_semaphores: &'a [SemaphoreSubmit],
    pub fence: Option<FenceHandle>,
}
