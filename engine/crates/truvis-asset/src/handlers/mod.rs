//! 各类请求在 streamer 线程上的执行
//!
//! handler 返回 `Err` 表示 GPU 接口调用失败，streamer 会直接终止；
//! 请求本身有问题（文件不存在、格式不支持、handle 已经失效）时返回
//! [`UploadFunctionResult::InvalidRequest`]，token 立刻 retire。

pub(crate) mod buffer;
pub(crate) mod geometry;
pub(crate) mod texture;

use crate::copy_engine::CopyEngine;
use crate::fs::FileSystem;
use crate::request::{UpdateRequest, UploadFunctionResult};
use crate::streamer::StreamerStats;

pub(crate) struct HandlerContext<'a> {
    pub engine: &'a mut CopyEngine,
    pub fs: &'a dyn FileSystem,
    pub stats: &'a StreamerStats,
}

/// 按请求类型分发
pub(crate) fn dispatch(ctx: &mut HandlerContext, request: UpdateRequest) -> anyhow::Result<UploadFunctionResult> {
    match request {
        UpdateRequest::BufferUpdate {
            buffer,
            dst_offset,
            size,
            source,
        } => buffer::update_buffer(ctx, buffer, dst_offset, size, source),
        UpdateRequest::TextureUpdate {
            texture,
            current_state,
            source,
        } => texture::update_texture(ctx, texture, current_state, source),
        UpdateRequest::TextureLoad { desc, target } => texture::load_texture(ctx, &desc, &target),
        UpdateRequest::GeometryLoad { desc, target } => geometry::load_geometry(ctx, &desc, &target),
        UpdateRequest::BufferBarrier(barriers) => buffer::barrier_buffers(ctx, &barriers),
        UpdateRequest::TextureBarrier(barriers) => texture::barrier_textures(ctx, &barriers),
        UpdateRequest::TextureCopy(desc) => texture::copy_texture_to_buffer(ctx, &desc),
    }
}
