use ash::vk;
use truvis_gfx::commands::{BufferTextureCopy, TextureBarrier, TextureSubresource};
use truvis_gfx::desc::{BufferDesc, DeviceLimits, TextureDesc};
use truvis_gfx::format::{format_info, surface_info};
use truvis_gfx::handles::TextureHandle;
use truvis_gfx::state::ResourceState;

use super::HandlerContext;
use crate::containers::{ParsedTexture, SubresourceData, TextureImage, parse_texture};
use crate::desc::{TextureCopyDesc, TextureLoadDesc};
use crate::request::{TextureSource, UploadFunctionResult};
use crate::resource::{LoadedTexture, PendingResource};
use crate::staging::MappedMemoryRange;

/// 一个 subresource 在上传 / readback buffer 中的布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyFootprint {
    /// 一行 block 的有效字节数
    pub row_bytes: u32,
    /// 相邻两行的间距，满足设备的对齐要求
    pub row_pitch: u32,
    pub num_rows: u32,
    /// 相邻两个 depth slice 的间距
    pub slice_pitch: u32,
    pub depth: u32,
    /// buffer 中 offset 的对齐要求
    pub offset_alignment: vk::DeviceSize,
}

impl CopyFootprint {
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.slice_pitch as vk::DeviceSize * self.depth as vk::DeviceSize
    }
}

const fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

#[inline]
const fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// 计算 texture 第 `mip_level` 级在 buffer 中的布局
///
/// 行间距需要同时是设备行对齐和 block 字节数的整数倍，不支持的格式返回 None
pub fn texture_copy_footprint(desc: &TextureDesc, mip_level: u32, limits: &DeviceLimits) -> Option<CopyFootprint> {
    let info = format_info(desc.format)?;
    let extent = desc.mip_extent(mip_level);
    let surface = surface_info(desc.format, extent.width, extent.height)?;

    let block_bytes = info.bytes_per_block as u64;
    let pitch_alignment = lcm(limits.upload_row_pitch_alignment.max(1), block_bytes);
    let row_pitch = surface.row_bytes.div_ceil(pitch_alignment) * pitch_alignment;
    let slice_pitch = row_pitch * surface.num_rows as u64;

    Some(CopyFootprint {
        row_bytes: u32::try_from(surface.row_bytes).ok()?,
        row_pitch: u32::try_from(row_pitch).ok()?,
        num_rows: surface.num_rows,
        slice_pitch: u32::try_from(slice_pitch).ok()?,
        depth: extent.depth,
        offset_alignment: lcm(limits.upload_offset_alignment.max(1), block_bytes),
    })
}

/// 把源数据逐行写入 staging 内存
fn write_rows(range: &mut MappedMemoryRange, base: usize, image: &TextureImage, sub: &SubresourceData, footprint: &CopyFootprint) {
    let row_bytes = sub.row_bytes.min(footprint.row_bytes as usize);
    for z in 0..sub.depth.min(footprint.depth) {
        for row in 0..sub.num_rows.min(footprint.num_rows) {
            let dst = base + z as usize * footprint.slice_pitch as usize + row as usize * footprint.row_pitch as usize;
            range.write(dst, &image.row(sub, z, row)[..row_bytes]);
        }
    }
}

fn subresource_barrier(
    texture: TextureHandle,
    mip_level: u32,
    array_layer: u32,
    src_state: ResourceState,
    dst_state: ResourceState,
) -> TextureBarrier {
    TextureBarrier {
        texture,
        src_state,
        dst_state,
        subresource: Some(TextureSubresource { mip_level, array_layer }),
    }
}

/// 通过 staging 上传一张完整的 texture，结束后处于 `final_state`
pub(crate) fn upload_texture_image(
    ctx: &mut HandlerContext,
    texture: TextureHandle,
    image: &TextureImage,
    final_state: ResourceState,
) -> anyhow::Result<UploadFunctionResult> {
    let _span = tracy_client::span!("upload_texture_image");
    let device = ctx.engine.device().clone();
    let limits = device.limits();

    let Some(footprints) = image
        .subresources
        .iter()
        .map(|sub| texture_copy_footprint(&image.desc, sub.mip_level, &limits))
        .collect::<Option<Vec<_>>>()
    else {
        log::warn!("texture <{}> has unsupported format {:?}", image.desc.name, image.desc.format);
        return Ok(UploadFunctionResult::InvalidRequest);
    };

    let cmd = ctx.engine.acquire_cmd()?;
    device.cmd_resource_barrier(
        cmd,
        &[],
        &[TextureBarrier::whole(texture, ResourceState::UNDEFINED, ResourceState::COPY_DEST)],
    );

    for (sub, footprint) in image.subresources.iter().zip(&footprints) {
        let (mut range, path) = ctx.engine.allocate_staging(footprint.size(), footprint.offset_alignment)?;
        ctx.stats.record_allocation(path);
        write_rows(&mut range, 0, image, sub, footprint);
        device.flush_buffer(range.buffer, range.offset, range.size);

        device.cmd_copy_buffer_to_texture(
            cmd,
            &BufferTextureCopy {
                buffer: range.buffer,
                buffer_offset: range.offset,
                row_pitch: footprint.row_pitch,
                slice_pitch: footprint.slice_pitch,
                texture,
                mip_level: sub.mip_level,
                array_layer: sub.array_layer,
                extent: image.desc.mip_extent(sub.mip_level),
            },
        );
    }

    device.cmd_resource_barrier(cmd, &[], &[TextureBarrier::whole(texture, ResourceState::COPY_DEST, final_state)]);
    Ok(UploadFunctionResult::Completed)
}

pub(crate) fn update_texture(
    ctx: &mut HandlerContext,
    texture: TextureHandle,
    current_state: ResourceState,
    source: TextureSource,
) -> anyhow::Result<UploadFunctionResult> {
    let _span = tracy_client::span!("update_texture");
    let device = ctx.engine.device().clone();
    let Some(desc) = device.texture_desc(texture) else {
        log::warn!("update a destroyed texture {:?}", texture);
        return Ok(UploadFunctionResult::InvalidRequest);
    };
    let final_state = if current_state.is_empty() { ResourceState::SHADER_RESOURCE } else { current_state };

    match source {
        TextureSource::Image(image) => upload_texture_image(ctx, texture, &image, final_state),
        TextureSource::Upload {
            buffer,
            offset,
            row_pitch,
            slice_pitch,
            mip_level,
            array_layer,
        } => {
            if mip_level >= desc.mip_levels || array_layer >= desc.array_layers {
                log::warn!("texture <{}> has no subresource mip {} layer {}", desc.name, mip_level, array_layer);
                return Ok(UploadFunctionResult::InvalidRequest);
            }
            let extent = desc.mip_extent(mip_level);
            device.flush_buffer(buffer, offset, slice_pitch as vk::DeviceSize * extent.depth as vk::DeviceSize);

            let cmd = ctx.engine.acquire_cmd()?;
            device.cmd_resource_barrier(
                cmd,
                &[],
                &[subresource_barrier(texture, mip_level, array_layer, current_state, ResourceState::COPY_DEST)],
            );
            device.cmd_copy_buffer_to_texture(
                cmd,
                &BufferTextureCopy {
                    buffer,
                    buffer_offset: offset,
                    row_pitch,
                    slice_pitch,
                    texture,
                    mip_level,
                    array_layer,
                    extent,
                },
            );
            device.cmd_resource_barrier(
                cmd,
                &[],
                &[subresource_barrier(texture, mip_level, array_layer, ResourceState::COPY_DEST, final_state)],
            );
            Ok(UploadFunctionResult::Completed)
        }
    }
}

pub(crate) fn load_texture(
    ctx: &mut HandlerContext,
    desc: &TextureLoadDesc,
    target: &PendingResource<LoadedTexture>,
) -> anyhow::Result<UploadFunctionResult> {
    let _span = tracy_client::span!("load_texture");

    let bytes = match ctx.fs.read(desc.directory, &desc.file_name, desc.password.as_deref()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to open texture {}: {:#}", desc.file_name, e);
            return Ok(UploadFunctionResult::InvalidRequest);
        }
    };
    let parsed = match parse_texture(&bytes, desc.container, &desc.file_name, desc.srgb) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("failed to parse texture {}: {:#}", desc.file_name, e);
            return Ok(UploadFunctionResult::InvalidRequest);
        }
    };

    let device = ctx.engine.device().clone();
    let (image, virtual_info) = match parsed {
        ParsedTexture::Image(image) => (image, None),
        ParsedTexture::Virtual(svt) => (svt.tail, Some(svt.info)),
    };
    let texture = device.create_texture(&image.desc)?;

    let result = match virtual_info {
        None => upload_texture_image(ctx, texture, &image, ResourceState::SHADER_RESOURCE)?,
        Some(_) => upload_mip_tail(ctx, texture, &image)?,
    };
    if result != UploadFunctionResult::Completed {
        device.destroy_texture(texture);
        return Ok(result);
    }

    log::debug!("texture loaded: {} {:?}", desc.file_name, image.desc.extent);
    target.fulfill(LoadedTexture {
        texture,
        desc: image.desc,
        virtual_info,
    });
    Ok(UploadFunctionResult::Completed)
}

/// virtual texture 只上传 mip tail，使用一个专用的上传 buffer，不经过 staging ring
fn upload_mip_tail(
    ctx: &mut HandlerContext,
    texture: TextureHandle,
    image: &TextureImage,
) -> anyhow::Result<UploadFunctionResult> {
    let _span = tracy_client::span!("upload_mip_tail");
    let device = ctx.engine.device().clone();
    let limits = device.limits();

    // 先计算每个 mip 在上传 buffer 中的位置
    let mut layout = Vec::with_capacity(image.subresources.len());
    let mut total: vk::DeviceSize = 0;
    for sub in &image.subresources {
        let Some(footprint) = texture_copy_footprint(&image.desc, sub.mip_level, &limits) else {
            log::warn!("virtual texture <{}> has unsupported format {:?}", image.desc.name, image.desc.format);
            return Ok(UploadFunctionResult::InvalidRequest);
        };
        let offset = total.div_ceil(footprint.offset_alignment) * footprint.offset_alignment;
        total = offset + footprint.size();
        layout.push((sub, footprint, offset));
    }

    let cmd = ctx.engine.acquire_cmd()?;
    device.cmd_resource_barrier(
        cmd,
        &[],
        &[TextureBarrier::whole(texture, ResourceState::UNDEFINED, ResourceState::COPY_DEST)],
    );

    if total > 0 {
        let upload = device.create_buffer(&BufferDesc::upload(total, format!("{}-mip-tail", image.desc.name)))?;
        // resource set 被复用时销毁
        ctx.engine.retire_buffer(upload);
        let mut range = MappedMemoryRange::map_buffer(device.as_ref(), upload, 0, total)?;
        for (sub, footprint, offset) in &layout {
            write_rows(&mut range, *offset as usize, image, sub, footprint);
            device.cmd_copy_buffer_to_texture(
                cmd,
                &BufferTextureCopy {
                    buffer: upload,
                    buffer_offset: *offset,
                    row_pitch: footprint.row_pitch,
                    slice_pitch: footprint.slice_pitch,
                    texture,
                    mip_level: sub.mip_level,
                    array_layer: sub.array_layer,
                    extent: image.desc.mip_extent(sub.mip_level),
                },
            );
        }
        device.flush_buffer(upload, 0, total);
    }

    device.cmd_resource_barrier(
        cmd,
        &[],
        &[TextureBarrier::whole(texture, ResourceState::COPY_DEST, ResourceState::SHADER_RESOURCE)],
    );
    Ok(UploadFunctionResult::Completed)
}

pub(crate) fn barrier_textures(
    ctx: &mut HandlerContext,
    barriers: &[TextureBarrier],
) -> anyhow::Result<UploadFunctionResult> {
    let device = ctx.engine.device().clone();
    if let Some(b) = barriers.iter().find(|b| device.texture_desc(b.texture).is_none()) {
        log::warn!("barrier on a destroyed texture {:?}", b.texture);
        return Ok(UploadFunctionResult::InvalidRequest);
    }
    if barriers.is_empty() {
        return Ok(UploadFunctionResult::Completed);
    }

    let cmd = ctx.engine.acquire_cmd()?;
    device.cmd_resource_barrier(cmd, &[], barriers);
    Ok(UploadFunctionResult::Completed)
}

/// 把一个 subresource 拷贝回 buffer，布局由 [`texture_copy_footprint`] 决定
pub(crate) fn copy_texture_to_buffer(
    ctx: &mut HandlerContext,
    desc: &TextureCopyDesc,
) -> anyhow::Result<UploadFunctionResult> {
    let _span = tracy_client::span!("copy_texture_to_buffer");
    let device = ctx.engine.device().clone();

    let Some(texture_desc) = device.texture_desc(desc.texture) else {
        log::warn!("copy from a destroyed texture {:?}", desc.texture);
        return Ok(UploadFunctionResult::InvalidRequest);
    };
    if desc.mip_level >= texture_desc.mip_levels || desc.array_layer >= texture_desc.array_layers {
        log::warn!(
            "texture <{}> has no subresource mip {} layer {}",
            texture_desc.name,
            desc.mip_level,
            desc.array_layer
        );
        return Ok(UploadFunctionResult::InvalidRequest);
    }
    let Some(footprint) = texture_copy_footprint(&texture_desc, desc.mip_level, &device.limits()) else {
        log::warn!("texture <{}> has unsupported format {:?}", texture_desc.name, texture_desc.format);
        return Ok(UploadFunctionResult::InvalidRequest);
    };
    let buffer_size = device.buffer_size(desc.buffer).unwrap_or(0);
    let end = desc.buffer_offset.checked_add(footprint.size());
    if end.is_none_or(|end| end > buffer_size) {
        log::warn!(
            "readback buffer is too small: need {} bytes at {}, have {}",
            footprint.size(),
            desc.buffer_offset,
            buffer_size
        );
        return Ok(UploadFunctionResult::InvalidRequest);
    }

    if let Some(semaphore) = desc.wait_semaphore {
        ctx.engine.add_wait_semaphore(semaphore);
    }

    let cmd = ctx.engine.acquire_cmd()?;
    let needs_transition = desc.texture_state != ResourceState::COPY_SOURCE;
    if needs_transition {
        device.cmd_resource_barrier(
            cmd,
            &[],
            &[subresource_barrier(
                desc.texture,
                desc.mip_level,
                desc.array_layer,
                desc.texture_state,
                ResourceState::COPY_SOURCE,
            )],
        );
    }
    device.cmd_copy_texture_to_buffer(
        cmd,
        &BufferTextureCopy {
            buffer: desc.buffer,
            buffer_offset: desc.buffer_offset,
            row_pitch: footprint.row_pitch,
            slice_pitch: footprint.slice_pitch,
            texture: desc.texture,
            mip_level: desc.mip_level,
            array_layer: desc.array_layer,
            extent: texture_desc.mip_extent(desc.mip_level),
        },
    );
    if needs_transition && !desc.texture_state.is_empty() {
        device.cmd_resource_barrier(
            cmd,
            &[],
            &[subresource_barrier(
                desc.texture,
                desc.mip_level,
                desc.array_layer,
                ResourceState::COPY_SOURCE,
                desc.texture_state,
            )],
        );
    }
    Ok(UploadFunctionResult::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footprint_alignment() {
        let limits = DeviceLimits {
            upload_offset_alignment: 16,
            upload_row_pitch_alignment: 256,
            max_allocation_size: u64::MAX,
        };
        let desc = TextureDesc::new_2d(13, 7, vk::Format::R8G8B8A8_UNORM, "t");
        let footprint = texture_copy_footprint(&desc, 0, &limits).unwrap();
        assert_eq!(footprint.row_bytes, 52);
        assert_eq!(footprint.row_pitch, 256);
        assert_eq!(footprint.slice_pitch, 256 * 7);
        assert_eq!(footprint.offset_alignment, 16);
    }

    #[test]
    fn test_footprint_of_three_byte_texels() {
        let limits = DeviceLimits {
            upload_offset_alignment: 4,
            upload_row_pitch_alignment: 4,
            max_allocation_size: u64::MAX,
        };
        let desc = TextureDesc::new_2d(5, 1, vk::Format::R8G8B8_UNORM, "t");
        let footprint = texture_copy_footprint(&desc, 0, &limits).unwrap();
        // 15 字节，对齐到 lcm(4, 3) = 12 的倍数
        assert_eq!(footprint.row_pitch, 24);
        assert_eq!(footprint.row_pitch % 3, 0);
        assert_eq!(footprint.offset_alignment, 12);
    }

    #[test]
    fn test_footprint_of_compressed_mip() {
        let desc = TextureDesc::new_2d(16, 16, vk::Format::BC1_RGBA_UNORM_BLOCK, "t").with_mip_levels(5);
        let footprint = texture_copy_footprint(&desc, 4, &DeviceLimits::default()).unwrap();
        assert_eq!(footprint.row_bytes, 8);
        assert_eq!(footprint.num_rows, 1);
        assert_eq!(footprint.size(), 8);
    }
}
