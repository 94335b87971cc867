use anyhow::Context;
use ash::vk;
use truvis_gfx::desc::TextureDesc;

use super::TextureImage;

/// 通过 image crate 解码 png / jpg / tga 等格式，统一转换为 RGBA8
pub(crate) fn decode(bytes: &[u8], name: &str) -> anyhow::Result<TextureImage> {
    let _span = tracy_client::span!("image_file::decode");

    let image = image::load_from_memory(bytes).with_context(|| format!("{}: failed to decode image", name))?.into_rgba8();
    let (width, height) = image.dimensions();
    log::debug!("image decoded: {} {}x{}", name, width, height);

    let desc = TextureDesc::new_2d(width, height, vk::Format::R8G8B8A8_UNORM, name);
    TextureImage::from_tight_data(desc, image.into_raw())
}
