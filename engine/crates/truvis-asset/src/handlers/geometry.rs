use ash::vk;
use itertools::Itertools;
use truvis_gfx::commands::{BufferBarrier, BufferCopyRegion};
use truvis_gfx::desc::{BufferDesc, MemoryUsage};
use truvis_gfx::device::GfxDevice;
use truvis_gfx::handles::{BufferHandle, CommandBufferHandle};
use truvis_gfx::state::ResourceState;

use super::HandlerContext;
use crate::desc::GeometryLoadDesc;
use crate::geometry::{DrawIndexedArgs, Geometry, parse_obj};
use crate::request::UploadFunctionResult;
use crate::resource::PendingResource;

/// 通过 staging 把 `data` 拷贝到 `dst` 的起始位置
fn stage_copy(
    ctx: &mut HandlerContext,
    device: &dyn GfxDevice,
    cmd: CommandBufferHandle,
    dst: BufferHandle,
    data: &[u8],
) -> anyhow::Result<()> {
    let size = data.len() as vk::DeviceSize;
    let (mut range, path) = ctx.engine.allocate_staging(size, 4)?;
    ctx.stats.record_allocation(path);
    range.write(0, data);
    device.flush_buffer(range.buffer, range.offset, size);
    device.cmd_copy_buffer(
        cmd,
        range.buffer,
        dst,
        BufferCopyRegion {
            src_offset: range.offset,
            dst_offset: 0,
            size,
        },
    );
    Ok(())
}

pub(crate) fn load_geometry(
    ctx: &mut HandlerContext,
    desc: &GeometryLoadDesc,
    target: &PendingResource<Geometry>,
) -> anyhow::Result<UploadFunctionResult> {
    let _span = tracy_client::span!("load_geometry");

    let bytes = match ctx.fs.read(desc.directory, &desc.file_name, desc.password.as_deref()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to open geometry {}: {:#}", desc.file_name, e);
            return Ok(UploadFunctionResult::InvalidRequest);
        }
    };
    let data = match parse_obj(&bytes, &desc.vertex_layout, desc.flags) {
        Ok(data) => data,
        Err(e) => {
            log::warn!("failed to parse geometry {}: {:#}", desc.file_name, e);
            return Ok(UploadFunctionResult::InvalidRequest);
        }
    };
    if data.vertex_count == 0 || data.index_count == 0 {
        log::warn!("geometry {} is empty", desc.file_name);
        return Ok(UploadFunctionResult::InvalidRequest);
    }

    let device = ctx.engine.device().clone();
    let vertex_buffers = data
        .vertex_streams
        .iter()
        .enumerate()
        .map(|(binding, stream)| {
            device.create_buffer(&BufferDesc::new(
                stream.len() as vk::DeviceSize,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryUsage::GpuOnly,
                format!("{}-vertex-{}", desc.file_name, binding),
            ))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let index_buffer = device.create_buffer(&BufferDesc::new(
        data.index_data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryUsage::GpuOnly,
        format!("{}-index", desc.file_name),
    ))?;

    let cmd = ctx.engine.acquire_cmd()?;
    for (buffer, stream) in vertex_buffers.iter().zip(&data.vertex_streams) {
        stage_copy(ctx, device.as_ref(), cmd, *buffer, stream)?;
    }
    stage_copy(ctx, device.as_ref(), cmd, index_buffer, &data.index_data)?;

    let barriers = vertex_buffers
        .iter()
        .map(|buffer| BufferBarrier {
            buffer: *buffer,
            src_state: ResourceState::COPY_DEST,
            dst_state: ResourceState::VERTEX_AND_CONSTANT_BUFFER,
        })
        .chain(std::iter::once(BufferBarrier {
            buffer: index_buffer,
            src_state: ResourceState::COPY_DEST,
            dst_state: ResourceState::INDEX_BUFFER,
        }))
        .collect_vec();
    device.cmd_resource_barrier(cmd, &barriers, &[]);

    log::debug!(
        "geometry loaded: {} vertices={} indices={}",
        desc.file_name,
        data.vertex_count,
        data.index_count
    );
    target.fulfill(Geometry {
        vertex_buffers,
        vertex_strides: data.vertex_strides,
        index_buffer,
        index_type: data.index_type,
        vertex_count: data.vertex_count,
        index_count: data.index_count,
        draw_args: DrawIndexedArgs {
            index_count: data.index_count,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        },
        shadow: data.shadow,
    });
    Ok(UploadFunctionResult::Completed)
}
