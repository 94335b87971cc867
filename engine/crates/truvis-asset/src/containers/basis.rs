//! Basis Universal 容器
//!
//! 转码为 RGBA32 之后按照普通纹理上传。每个 image 对应一个 array layer。

use std::sync::Once;

use anyhow::{Context, bail};
use ash::vk;
use basis_universal::{TranscodeParameters, Transcoder, TranscoderTextureFormat};
use truvis_gfx::desc::TextureDesc;

use super::TextureImage;

static TRANSCODER_INIT: Once = Once::new();

pub(crate) fn transcode(bytes: &[u8], name: &str) -> anyhow::Result<TextureImage> {
    let _span = tracy_client::span!("basis::transcode");
    TRANSCODER_INIT.call_once(basis_universal::transcoder_init);

    let mut transcoder = Transcoder::new();
    if !transcoder.validate_header(bytes) {
        bail!("{}: invalid basis header", name);
    }

    let image_count = transcoder.image_count(bytes);
    if image_count == 0 {
        bail!("{}: basis file contains no image", name);
    }
    let mip_levels = transcoder.image_level_count(bytes, 0);
    let base = transcoder
        .image_level_description(bytes, 0, 0)
        .with_context(|| format!("{}: missing level description", name))?;

    transcoder.prepare_transcoding(bytes).map_err(|_| anyhow::anyhow!("{}: failed to prepare transcoding", name))?;
    // 无论成功与否都需要 end_transcoding
    let transcoder = scopeguard::guard(transcoder, |mut t| t.end_transcoding());

    let mut data = Vec::new();
    for image_index in 0..image_count {
        if transcoder.image_level_count(bytes, image_index) != mip_levels {
            bail!("{}: images have different mip counts", name);
        }
        for level_index in 0..mip_levels {
            let level = transcoder
                .transcode_image_level(
                    bytes,
                    TranscoderTextureFormat::RGBA32,
                    TranscodeParameters {
                        image_index,
                        level_index,
                        decode_flags: None,
                        output_row_pitch_in_blocks_or_pixels: None,
                        output_rows_in_pixels: None,
                    },
                )
                .map_err(|e| anyhow::anyhow!("{}: transcode image {} level {} failed: {:?}", name, image_index, level_index, e))?;
            data.extend_from_slice(&level);
        }
    }

    log::debug!(
        "basis transcoded: {} {}x{} images={} mips={}",
        name,
        base.original_width,
        base.original_height,
        image_count,
        mip_levels
    );

    let desc = TextureDesc::new_2d(base.original_width, base.original_height, vk::Format::R8G8B8A8_UNORM, name)
        .with_mip_levels(mip_levels)
        .with_array_layers(image_count);
    TextureImage::from_tight_data(desc, data)
}
