use ash::vk;
use truvis_gfx::commands::{BufferBarrier, BufferCopyRegion};
use truvis_gfx::handles::BufferHandle;

use super::HandlerContext;
use crate::request::{BufferSource, UploadFunctionResult};

/// buffer 之间的拷贝只需要 4 字节对齐
const BUFFER_COPY_ALIGNMENT: vk::DeviceSize = 4;

pub(crate) fn update_buffer(
    ctx: &mut HandlerContext,
    buffer: BufferHandle,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
    source: BufferSource,
) -> anyhow::Result<UploadFunctionResult> {
    let _span = tracy_client::span!("update_buffer");
    let device = ctx.engine.device().clone();

    let Some(dst_size) = device.buffer_size(buffer) else {
        log::warn!("update a destroyed buffer {:?}", buffer);
        return Ok(UploadFunctionResult::InvalidRequest);
    };
    if dst_offset.checked_add(size).is_none_or(|end| end > dst_size) {
        log::warn!("buffer update {}+{} is out of buffer size {}", dst_offset, size, dst_size);
        return Ok(UploadFunctionResult::InvalidRequest);
    }
    if size == 0 {
        return Ok(UploadFunctionResult::Completed);
    }

    let (src, src_offset) = match source {
        BufferSource::Bytes(data) => {
            if data.len() as vk::DeviceSize != size {
                log::warn!("buffer update has {} bytes of data but size {}", data.len(), size);
                return Ok(UploadFunctionResult::InvalidRequest);
            }
            let (mut range, path) = ctx.engine.allocate_staging(size, BUFFER_COPY_ALIGNMENT)?;
            ctx.stats.record_allocation(path);
            range.write(0, &data);
            device.flush_buffer(range.buffer, range.offset, size);
            (range.buffer, range.offset)
        }
        BufferSource::Upload { buffer: upload, offset } => {
            device.flush_buffer(upload, offset, size);
            (upload, offset)
        }
    };

    let cmd = ctx.engine.acquire_cmd()?;
    device.cmd_copy_buffer(
        cmd,
        src,
        buffer,
        BufferCopyRegion {
            src_offset,
            dst_offset,
            size,
        },
    );
    Ok(UploadFunctionResult::Completed)
}

pub(crate) fn barrier_buffers(
    ctx: &mut HandlerContext,
    barriers: &[BufferBarrier],
) -> anyhow::Result<UploadFunctionResult> {
    let device = ctx.engine.device().clone();
    if let Some(b) = barriers.iter().find(|b| device.buffer_size(b.buffer).is_none()) {
        log::warn!("barrier on a destroyed buffer {:?}", b.buffer);
        return Ok(UploadFunctionResult::InvalidRequest);
    }
    if barriers.is_empty() {
        return Ok(UploadFunctionResult::Completed);
    }

    let cmd = ctx.engine.acquire_cmd()?;
    device.cmd_resource_barrier(cmd, barriers, &[]);
    Ok(UploadFunctionResult::Completed)
}
