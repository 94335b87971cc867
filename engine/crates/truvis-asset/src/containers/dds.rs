//! DDS 容器
//!
//! 支持 legacy FourCC、DX10 扩展头以及按位掩码描述的非压缩格式。
//! 数据按 layer-major 排列：每个 layer（cubemap 的每个 face）依次包含完整的 mip 链。

use anyhow::{Context, bail};
use ash::vk;
use truvis_gfx::desc::TextureDesc;

use super::{ByteReader, SubresourceOrder, TIGHT, TextureImage, build_subresources};

const DDS_MAGIC: u32 = 0x2053_4444;
const HEADER_SIZE: u32 = 124;
const DX10_HEADER_SIZE: usize = 20;

const DDPF_ALPHAPIXELS: u32 = 0x1;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;
const DDPF_LUMINANCE: u32 = 0x2_0000;

const DDSCAPS2_CUBEMAP: u32 = 0x200;
const DDSCAPS2_VOLUME: u32 = 0x20_0000;

const DX10_MISC_TEXTURECUBE: u32 = 0x4;
const DX10_DIMENSION_TEXTURE3D: u32 = 4;

// 文件内偏移
const OFF_HEIGHT: usize = 12;
const OFF_WIDTH: usize = 16;
const OFF_DEPTH: usize = 24;
const OFF_MIP_COUNT: usize = 28;
const OFF_PF_FLAGS: usize = 80;
const OFF_PF_FOURCC: usize = 84;
const OFF_PF_BIT_COUNT: usize = 88;
const OFF_PF_MASKS: usize = 92;
const OFF_CAPS2: usize = 112;
const DATA_OFFSET: usize = 128;

#[inline]
const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

pub(crate) fn parse(bytes: &[u8], name: &str) -> anyhow::Result<TextureImage> {
    let _span = tracy_client::span!("dds::parse");
    let reader = ByteReader::new(bytes, name);

    if reader.u32_at(0)? != DDS_MAGIC {
        bail!("{}: not a DDS file", name);
    }
    if reader.u32_at(4)? != HEADER_SIZE {
        bail!("{}: invalid DDS header size", name);
    }

    let width = reader.u32_at(OFF_WIDTH)?;
    let height = reader.u32_at(OFF_HEIGHT)?;
    let mip_levels = reader.u32_at(OFF_MIP_COUNT)?.max(1);
    let caps2 = reader.u32_at(OFF_CAPS2)?;
    let pf_flags = reader.u32_at(OFF_PF_FLAGS)?;

    let mut is_cube = caps2 & DDSCAPS2_CUBEMAP != 0;
    let mut is_volume = caps2 & DDSCAPS2_VOLUME != 0;
    let mut array_size = 1;
    let mut data_offset = DATA_OFFSET;

    let format = if pf_flags & DDPF_FOURCC != 0 {
        let code = reader.u32_at(OFF_PF_FOURCC)?;
        if code == fourcc(b"DX10") {
            let dxgi_format = reader.u32_at(DATA_OFFSET)?;
            let dimension = reader.u32_at(DATA_OFFSET + 4)?;
            let misc_flag = reader.u32_at(DATA_OFFSET + 8)?;
            array_size = reader.u32_at(DATA_OFFSET + 12)?.max(1);
            data_offset += DX10_HEADER_SIZE;

            is_cube = misc_flag & DX10_MISC_TEXTURECUBE != 0;
            is_volume = dimension == DX10_DIMENSION_TEXTURE3D;
            dxgi_to_vk(dxgi_format).with_context(|| format!("{}: unsupported DXGI format {}", name, dxgi_format))?
        } else {
            fourcc_to_vk(code).with_context(|| format!("{}: unsupported FourCC 0x{:08x}", name, code))?
        }
    } else {
        let bit_count = reader.u32_at(OFF_PF_BIT_COUNT)?;
        let masks = [
            reader.u32_at(OFF_PF_MASKS)?,
            reader.u32_at(OFF_PF_MASKS + 4)?,
            reader.u32_at(OFF_PF_MASKS + 8)?,
            reader.u32_at(OFF_PF_MASKS + 12)?,
        ];
        mask_to_vk(pf_flags, bit_count, masks)
            .with_context(|| format!("{}: unsupported pixel format, {} bits {:x?}", name, bit_count, masks))?
    };

    let depth = if is_volume { reader.u32_at(OFF_DEPTH)?.max(1) } else { 1 };
    let array_layers = if is_cube {
        array_size
            .checked_mul(6)
            .with_context(|| format!("{}: cube array size {} overflows", name, array_size))?
    } else {
        array_size
    };

    let mut desc = TextureDesc::new_2d(width.max(1), height.max(1), format, name)
        .with_mip_levels(mip_levels)
        .with_array_layers(array_layers)
        .with_depth(depth);
    desc.is_cube = is_cube;

    let subresources = build_subresources(&desc, bytes.len(), data_offset, SubresourceOrder::LayerMajor, &TIGHT, |_, _| {
        Ok(0)
    })
    .with_context(|| format!("{}: invalid DDS layout", name))?;

    log::debug!(
        "dds parsed: {} {}x{}x{} mips={} layers={} {:?}",
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

fn fourcc_to_vk(code: u32) -> Option<vk::Format> {
    let format = match code {
        c if c == fourcc(b"DXT1") => vk::Format::BC1_RGBA_UNORM_BLOCK,
        c if c == fourcc(b"DXT2") || c == fourcc(b"DXT3") => vk::Format::BC2_UNORM_BLOCK,
        c if c == fourcc(b"DXT4") || c == fourcc(b"DXT5") => vk::Format::BC3_UNORM_BLOCK,
        c if c == fourcc(b"ATI1") || c == fourcc(b"BC4U") => vk::Format::BC4_UNORM_BLOCK,
        c if c == fourcc(b"BC4S") => vk::Format::BC4_SNORM_BLOCK,
        c if c == fourcc(b"ATI2") || c == fourcc(b"BC5U") => vk::Format::BC5_UNORM_BLOCK,
        c if c == fourcc(b"BC5S") => vk::Format::BC5_SNORM_BLOCK,
        // D3DFORMAT 数值
        36 => vk::Format::R16G16B16A16_UNORM,
        111 => vk::Format::R16_SFLOAT,
        112 => vk::Format::R16G16_SFLOAT,
        113 => vk::Format::R16G16B16A16_SFLOAT,
        114 => vk::Format::R32_SFLOAT,
        115 => vk::Format::R32G32_SFLOAT,
        116 => vk::Format::R32G32B32A32_SFLOAT,
        _ => return None,
    };
    Some(format)
}

fn mask_to_vk(flags: u32, bit_count: u32, [r, g, b, a]: [u32; 4]) -> Option<vk::Format> {
    let has_alpha = flags & DDPF_ALPHAPIXELS != 0;
    if flags & DDPF_RGB != 0 {
        return match (bit_count, r, g, b) {
            (32, 0xff, 0xff00, 0xff_0000) => Some(vk::Format::R8G8B8A8_UNORM),
            (32, 0xff_0000, 0xff00, 0xff) => Some(vk::Format::B8G8R8A8_UNORM),
            (32, 0x3ff, 0xf_fc00, 0x3ff0_0000) if !has_alpha || a == 0xc000_0000 => {
                Some(vk::Format::A2B10G10R10_UNORM_PACK32)
            }
            (32, 0xffff, 0xffff_0000, 0) => Some(vk::Format::R16G16_UNORM),
            (16, 0xf800, 0x7e0, 0x1f) => Some(vk::Format::R5G6B5_UNORM_PACK16),
            _ => None,
        };
    }
    if flags & DDPF_LUMINANCE != 0 {
        return match (bit_count, r, a) {
            (8, 0xff, _) => Some(vk::Format::R8_UNORM),
            (16, 0xffff, _) if !has_alpha => Some(vk::Format::R16_UNORM),
            (16, 0xff, 0xff00) => Some(vk::Format::R8G8_UNORM),
            _ => None,
        };
    }
    None
}

fn dxgi_to_vk(dxgi: u32) -> Option<vk::Format> {
    let format = match dxgi {
        2 => vk::Format::R32G32B32A32_SFLOAT,
        6 => vk::Format::R32G32B32_SFLOAT,
        10 => vk::Format::R16G16B16A16_SFLOAT,
        11 => vk::Format::R16G16B16A16_UNORM,
        16 => vk::Format::R32G32_SFLOAT,
        24 => vk::Format::A2B10G10R10_UNORM_PACK32,
        26 => vk::Format::B10G11R11_UFLOAT_PACK32,
        28 => vk::Format::R8G8B8A8_UNORM,
        29 => vk::Format::R8G8B8A8_SRGB,
        30 => vk::Format::R8G8B8A8_UINT,
        31 => vk::Format::R8G8B8A8_SNORM,
        34 => vk::Format::R16G16_SFLOAT,
        35 => vk::Format::R16G16_UNORM,
        41 => vk::Format::R32_SFLOAT,
        42 => vk::Format::R32_UINT,
        49 => vk::Format::R8G8_UNORM,
        54 => vk::Format::R16_SFLOAT,
        56 => vk::Format::R16_UNORM,
        61 => vk::Format::R8_UNORM,
        67 => vk::Format::E5B9G9R9_UFLOAT_PACK32,
        71 => vk::Format::BC1_RGBA_UNORM_BLOCK,
        72 => vk::Format::BC1_RGBA_SRGB_BLOCK,
        74 => vk::Format::BC2_UNORM_BLOCK,
        75 => vk::Format::BC2_SRGB_BLOCK,
        77 => vk::Format::BC3_UNORM_BLOCK,
        78 => vk::Format::BC3_SRGB_BLOCK,
        80 => vk::Format::BC4_UNORM_BLOCK,
        81 => vk::Format::BC4_SNORM_BLOCK,
        83 => vk::Format::BC5_UNORM_BLOCK,
        84 => vk::Format::BC5_SNORM_BLOCK,
        85 => vk::Format::R5G6B5_UNORM_PACK16,
        87 => vk::Format::B8G8R8A8_UNORM,
        91 => vk::Format::B8G8R8A8_SRGB,
        95 => vk::Format::BC6H_UFLOAT_BLOCK,
        96 => vk::Format::BC6H_SFLOAT_BLOCK,
        98 => vk::Format::BC7_UNORM_BLOCK,
        99 => vk::Format::BC7_SRGB_BLOCK,
        _ => return None,
    };
    Some(format)
}

/// 生成 DDS 文件头，测试使用
#[cfg(test)]
pub(crate) fn write_header(width: u32, height: u32, mip_levels: u32, fourcc_or_dx10: Option<(&[u8; 4], u32)>) -> Vec<u8> {
    fn put(header: &mut [u8], offset: usize, value: u32) {
        header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    let mut header = vec![0u8; DATA_OFFSET];
    put(&mut header, 0, DDS_MAGIC);
    put(&mut header, 4, HEADER_SIZE);
    put(&mut header, OFF_HEIGHT, height);
    put(&mut header, OFF_WIDTH, width);
    put(&mut header, OFF_MIP_COUNT, mip_levels);
    put(&mut header, 76, 32);
    match fourcc_or_dx10 {
        Some((code, dxgi)) => {
            put(&mut header, OFF_PF_FLAGS, DDPF_FOURCC);
            put(&mut header, OFF_PF_FOURCC, fourcc(code));
            if code == b"DX10" {
                let mut ext = [0u8; DX10_HEADER_SIZE];
                put(&mut ext, 0, dxgi);
                put(&mut ext, 4, 3);
                put(&mut ext, 12, 1);
                header.extend_from_slice(&ext);
            }
        }
        None => {
            put(&mut header, OFF_PF_FLAGS, DDPF_RGB | DDPF_ALPHAPIXELS);
            put(&mut header, OFF_PF_BIT_COUNT, 32);
            put(&mut header, OFF_PF_MASKS, 0xff);
            put(&mut header, OFF_PF_MASKS + 4, 0xff00);
            put(&mut header, OFF_PF_MASKS + 8, 0xff_0000);
            put(&mut header, OFF_PF_MASKS + 12, 0xff00_0000);
        }
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_masks() {
        let mut file = write_header(4, 2, 1, None);
        file.extend((0..32).map(|i| i as u8));

        let image = parse(&file, "a.dds").unwrap();
        assert_eq!(image.desc.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(image.desc.extent.width, 4);
        assert_eq!(image.subresources.len(), 1);
        assert_eq!(image.subresources[0].offset, DATA_OFFSET);
        assert_eq!(image.row(&image.subresources[0], 0, 1), &(16..32).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn test_dxt1_mip_chain() {
        // 8x8: 2x2 block + 1 block + 1 block
        let mut file = write_header(8, 8, 4, Some((b"DXT1", 0)));
        file.extend(std::iter::repeat_n(0u8, 32 + 8 + 8 + 8));

        let image = parse(&file, "a.dds").unwrap();
        assert_eq!(image.desc.format, vk::Format::BC1_RGBA_UNORM_BLOCK);
        assert_eq!(image.subresources.len(), 4);
        assert_eq!(image.subresources[1].offset, DATA_OFFSET + 32);
        assert_eq!(image.subresources[3].num_rows, 1);
    }

    #[test]
    fn test_dx10_header() {
        let mut file = write_header(4, 4, 1, Some((b"DX10", 98)));
        file.extend(std::iter::repeat_n(0u8, 16));

        let image = parse(&file, "a.dds").unwrap();
        assert_eq!(image.desc.format, vk::Format::BC7_UNORM_BLOCK);
        assert_eq!(image.subresources[0].offset, DATA_OFFSET + DX10_HEADER_SIZE);
    }

    #[test]
    fn test_truncated_and_bad_magic() {
        let mut file = write_header(4, 4, 1, None);
        file.extend(std::iter::repeat_n(0u8, 63));
        assert!(parse(&file, "a.dds").is_err());

        assert!(parse(b"not a dds file at all", "a.dds").is_err());
    }

    #[test]
    fn test_mip_count_beyond_chain() {
        // 1x1 的纹理声明了 40 级 mip
        let mut file = write_header(1, 1, 40, None);
        file.extend(std::iter::repeat_n(0u8, 40 * 4));
        let err = parse(&file, "a.dds").err().unwrap();
        assert!(format!("{err:#}").contains("mip levels"), "{err:#}");
    }

    #[test]
    fn test_cube_array_size_overflow() {
        let mut file = write_header(4, 4, 1, Some((b"DX10", 28)));
        // DX10 头：miscFlag = TEXTURECUBE，arraySize = u32::MAX
        file[DATA_OFFSET + 8..DATA_OFFSET + 12].copy_from_slice(&DX10_MISC_TEXTURECUBE.to_le_bytes());
        file[DATA_OFFSET + 12..DATA_OFFSET + 16].copy_from_slice(&u32::MAX.to_le_bytes());
        file.extend(std::iter::repeat_n(0u8, 64 * 6));
        assert!(parse(&file, "a.dds").is_err());

        // 不溢出但是 layer 数远大于文件
        file[DATA_OFFSET + 12..DATA_OFFSET + 16].copy_from_slice(&0x1000_0000u32.to_le_bytes());
        assert!(parse(&file, "a.dds").is_err());
    }
}
