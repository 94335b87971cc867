//! KTX (v1) 容器
//!
//! 数据按 mip-major 排列，每个 mip 前面有 4 字节的 imageSize；
//! 非压缩格式的每一行、cubemap 的每个 face、每个 mip 都对齐到 4 字节。

use anyhow::{Context, bail};
use ash::vk;
use truvis_gfx::desc::TextureDesc;

use super::{ByteReader, SourceAlignment, SubresourceOrder, TextureImage, build_subresources};

pub(crate) const KTX_IDENTIFIER: [u8; 12] = [0xAB, 0x4B, 0x54, 0x58, 0x20, 0x31, 0x31, 0xBB, 0x0D, 0x0A, 0x1A, 0x0A];
const KTX_ENDIAN_LE: u32 = 0x0403_0201;
const HEADER_SIZE: usize = 64;

pub(crate) fn parse(bytes: &[u8], name: &str) -> anyhow::Result<TextureImage> {
    let _span = tracy_client::span!("ktx::parse");
    let reader = ByteReader::new(bytes, name);

    if reader.bytes_at(0, 12)? != KTX_IDENTIFIER {
        bail!("{}: not a KTX file", name);
    }
    if reader.u32_at(12)? != KTX_ENDIAN_LE {
        bail!("{}: big-endian KTX files are not supported", name);
    }

    let gl_internal_format = reader.u32_at(28)?;
    let width = reader.u32_at(36)?;
    let height = reader.u32_at(40)?.max(1);
    let depth = reader.u32_at(44)?.max(1);
    let array_elements = reader.u32_at(48)?;
    let faces = reader.u32_at(52)?;
    let mip_levels = reader.u32_at(56)?.max(1);
    let kv_bytes = reader.u32_at(60)? as usize;

    if faces != 1 && faces != 6 {
        bail!("{}: invalid face count {}", name, faces);
    }
    let format = gl_to_vk(gl_internal_format)
        .with_context(|| format!("{}: unsupported glInternalFormat 0x{:04x}", name, gl_internal_format))?;
    let compressed = truvis_gfx::format::format_info(format).is_some_and(|info| info.is_compressed());

    let is_cube = faces == 6;
    let array_layers = array_elements
        .max(1)
        .checked_mul(faces)
        .with_context(|| format!("{}: {} array elements x {} faces overflows", name, array_elements, faces))?;
    let mut desc = TextureDesc::new_2d(width.max(1), height, format, name)
        .with_mip_levels(mip_levels)
        .with_array_layers(array_layers)
        .with_depth(depth);
    desc.is_cube = is_cube;

    let alignment = SourceAlignment {
        row: if compressed { 1 } else { 4 },
        layer: 4,
        mip: 4,
    };
    let subresources = build_subresources(
        &desc,
        bytes.len(),
        HEADER_SIZE.checked_add(kv_bytes).context("key/value data overflows")?,
        SubresourceOrder::MipMajor,
        &alignment,
        |cursor, mip| {
            // imageSize 只用于校验文件没有被截断
            let image_size = reader.u32_at(cursor)? as usize;
            if (cursor + 4).checked_add(image_size).is_none_or(|end| end > bytes.len()) {
                bail!("mip {} claims {} bytes past the end of file", mip, image_size);
            }
            Ok(4)
        },
    )
    .with_context(|| format!("{}: invalid KTX layout", name))?;

    log::debug!(
        "ktx parsed: {} {}x{}x{} mips={} layers={} {:?}",
        name,
        width,
        height,
        depth,
        mip_levels,
        array_layers,
        format
    );

    Ok(TextureImage {
        desc,
        data: bytes.to_vec(),
        subresources,
    })
}

fn gl_to_vk(gl: u32) -> Option<vk::Format> {
    let format = match gl {
        0x8229 => vk::Format::R8_UNORM,
        0x822B => vk::Format::R8G8_UNORM,
        0x8051 => vk::Format::R8G8B8_UNORM,
        0x8C41 => vk::Format::R8G8B8_SRGB,
        0x8058 => vk::Format::R8G8B8A8_UNORM,
        0x8C43 => vk::Format::R8G8B8A8_SRGB,
        0x822D => vk::Format::R16_SFLOAT,
        0x822F => vk::Format::R16G16_SFLOAT,
        0x881A => vk::Format::R16G16B16A16_SFLOAT,
        0x822E => vk::Format::R32_SFLOAT,
        0x8230 => vk::Format::R32G32_SFLOAT,
        0x8814 => vk::Format::R32G32B32A32_SFLOAT,
        0x8C3A => vk::Format::B10G11R11_UFLOAT_PACK32,
        0x83F0 => vk::Format::BC1_RGB_UNORM_BLOCK,
        0x83F1 => vk::Format::BC1_RGBA_UNORM_BLOCK,
        0x83F2 => vk::Format::BC2_UNORM_BLOCK,
        0x83F3 => vk::Format::BC3_UNORM_BLOCK,
        0x8C4C => vk::Format::BC1_RGB_SRGB_BLOCK,
        0x8C4D => vk::Format::BC1_RGBA_SRGB_BLOCK,
        0x8C4E => vk::Format::BC2_SRGB_BLOCK,
        0x8C4F => vk::Format::BC3_SRGB_BLOCK,
        0x8DBB => vk::Format::BC4_UNORM_BLOCK,
        0x8DBC => vk::Format::BC4_SNORM_BLOCK,
        0x8DBD => vk::Format::BC5_UNORM_BLOCK,
        0x8DBE => vk::Format::BC5_SNORM_BLOCK,
        0x8E8C => vk::Format::BC7_UNORM_BLOCK,
        0x8E8D => vk::Format::BC7_SRGB_BLOCK,
        0x8E8E => vk::Format::BC6H_SFLOAT_BLOCK,
        0x8E8F => vk::Format::BC6H_UFLOAT_BLOCK,
        0x9274 => vk::Format::ETC2_R8G8B8_UNORM_BLOCK,
        0x9275 => vk::Format::ETC2_R8G8B8_SRGB_BLOCK,
        0x9278 => vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK,
        0x9279 => vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK,
        0x93B0 => vk::Format::ASTC_4X4_UNORM_BLOCK,
        0x93D0 => vk::Format::ASTC_4X4_SRGB_BLOCK,
        0x93B7 => vk::Format::ASTC_8X8_UNORM_BLOCK,
        0x93D7 => vk::Format::ASTC_8X8_SRGB_BLOCK,
        _ => return None,
    };
    Some(format)
}

/// 生成 KTX 文件头，`body` 需要调用方按 KTX 的布局自行填写
#[cfg(test)]
pub(crate) fn write_header(gl_internal_format: u32, width: u32, height: u32, faces: u32, mip_levels: u32) -> Vec<u8> {
    let mut header = KTX_IDENTIFIER.to_vec();
    let fields = [KTX_ENDIAN_LE, 0, 1, 0, gl_internal_format, 0, width, height, 0, 0, faces, mip_levels, 0];
    for field in fields {
        header.extend_from_slice(&field.to_le_bytes());
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb8_rows_are_padded() {
        // 3x2 RGB8：每行 9 字节，文件中对齐到 12
        let mut file = write_header(0x8051, 3, 2, 1, 1);
        file.extend_from_slice(&24u32.to_le_bytes());
        for row in 0..2u8 {
            file.extend(std::iter::repeat_n(row + 1, 9));
            file.extend([0u8; 3]);
        }

        let image = parse(&file, "a.ktx").unwrap();
        assert_eq!(image.desc.format, vk::Format::R8G8B8_UNORM);
        let sub = image.subresources[0];
        assert_eq!(sub.offset, HEADER_SIZE + 4);
        assert_eq!(sub.row_pitch, 12);
        assert_eq!(image.row(&sub, 0, 1), &[2u8; 9]);
    }

    #[test]
    fn test_cubemap_mip_major() {
        // 2x2 RGBA8 cubemap，两个 mip
        let mut file = write_header(0x8058, 2, 2, 6, 2);
        file.extend_from_slice(&16u32.to_le_bytes());
        for face in 0..6u8 {
            file.extend([face; 16]);
        }
        file.extend_from_slice(&4u32.to_le_bytes());
        for face in 0..6u8 {
            file.extend([face + 10; 4]);
        }

        let image = parse(&file, "cube.ktx").unwrap();
        assert!(image.desc.is_cube);
        assert_eq!(image.desc.array_layers, 6);
        assert_eq!(image.subresources.len(), 12);
        let mip1_face2 = image
            .subresources
            .iter()
            .find(|s| s.mip_level == 1 && s.array_layer == 2)
            .unwrap();
        assert_eq!(image.row(mip1_face2, 0, 0), &[12u8; 4]);
    }

    #[test]
    fn test_rejects_bad_counts() {
        // 2x2 最多 2 级 mip
        let mut file = write_header(0x8058, 2, 2, 1, 33);
        file.extend_from_slice(&16u32.to_le_bytes());
        file.extend([0u8; 16 + 8 * 33]);
        assert!(parse(&file, "a.ktx").is_err());

        // numberOfArrayElements x 6 个 face 溢出
        let mut file = write_header(0x8058, 2, 2, 6, 1);
        file[48..52].copy_from_slice(&u32::MAX.to_le_bytes());
        file.extend_from_slice(&16u32.to_le_bytes());
        file.extend([0u8; 16 * 6]);
        assert!(parse(&file, "cube.ktx").is_err());
    }

    #[test]
    fn test_rejects_unknown_format() {
        let mut file = write_header(0x1234, 2, 2, 1, 1);
        file.extend_from_slice(&16u32.to_le_bytes());
        file.extend([0u8; 16]);
        assert!(parse(&file, "a.ktx").is_err());
    }
}
