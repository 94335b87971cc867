//! 纹理格式的尺寸计算
//!
//! 上传纹理时需要知道每一行 block 占多少字节、一共有多少行，
//! 压缩格式按 block 计算（BC 系列为 4x4）。

use ash::vk;

/// 一个格式的 block 信息，非压缩格式的 block 为 1x1
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    pub block_width: u32,
    pub block_height: u32,
    pub bytes_per_block: u32,
}

impl FormatInfo {
    const fn pixel(bytes: u32) -> Self {
        Self {
            block_width: 1,
            block_height: 1,
            bytes_per_block: bytes,
        }
    }

    const fn block(width: u32, height: u32, bytes: u32) -> Self {
        Self {
            block_width: width,
            block_height: height,
            bytes_per_block: bytes,
        }
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.block_width > 1 || self.block_height > 1
    }
}

/// 一个 subresource 的字节布局（紧密排列，不含对齐）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceInfo {
    /// 一行 block 的字节数
    pub row_bytes: u64,
    /// block 的行数
    pub num_rows: u32,
    /// 一个 depth slice 的字节数
    pub num_bytes: u64,
}

/// 查询格式的 block 信息，不支持的格式返回 None
pub fn format_info(format: vk::Format) -> Option<FormatInfo> {
    let info = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => {
            FormatInfo::pixel(1)
        }
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R16_UNORM
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UINT
        | vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::B5G6R5_UNORM_PACK16
        | vk::Format::A1R5G5B5_UNORM_PACK16
        | vk::Format::D16_UNORM => FormatInfo::pixel(2),
        vk::Format::R8G8B8_UNORM | vk::Format::R8G8B8_SRGB | vk::Format::B8G8R8_UNORM | vk::Format::B8G8R8_SRGB => {
            FormatInfo::pixel(3)
        }
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::A2R10G10B10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::E5B9G9R9_UFLOAT_PACK32
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => FormatInfo::pixel(4),
        vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT => FormatInfo::pixel(8),
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_UINT => FormatInfo::pixel(12),
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => FormatInfo::pixel(16),

        vk::Format::BC1_RGB_UNORM_BLOCK
        | vk::Format::BC1_RGB_SRGB_BLOCK
        | vk::Format::BC1_RGBA_UNORM_BLOCK
        | vk::Format::BC1_RGBA_SRGB_BLOCK
        | vk::Format::BC4_UNORM_BLOCK
        | vk::Format::BC4_SNORM_BLOCK
        | vk::Format::ETC2_R8G8B8_UNORM_BLOCK
        | vk::Format::ETC2_R8G8B8_SRGB_BLOCK
        | vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK
        | vk::Format::EAC_R11_UNORM_BLOCK => FormatInfo::block(4, 4, 8),
        vk::Format::BC2_UNORM_BLOCK
        | vk::Format::BC2_SRGB_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC3_SRGB_BLOCK
        | vk::Format::BC5_UNORM_BLOCK
        | vk::Format::BC5_SNORM_BLOCK
        | vk::Format::BC6H_UFLOAT_BLOCK
        | vk::Format::BC6H_SFLOAT_BLOCK
        | vk::Format::BC7_UNORM_BLOCK
        | vk::Format::BC7_SRGB_BLOCK
        | vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK
        | vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK
        | vk::Format::EAC_R11G11_UNORM_BLOCK
        | vk::Format::ASTC_4X4_UNORM_BLOCK
        | vk::Format::ASTC_4X4_SRGB_BLOCK => FormatInfo::block(4, 4, 16),
        vk::Format::ASTC_8X8_UNORM_BLOCK | vk::Format::ASTC_8X8_SRGB_BLOCK => FormatInfo::block(8, 8, 16),
        _ => return None,
    };
    Some(info)
}

/// 计算 `width x height` 的一个 slice 的紧密布局
pub fn surface_info(format: vk::Format, width: u32, height: u32) -> Option<SurfaceInfo> {
    let info = format_info(format)?;
    let blocks_wide = width.div_ceil(info.block_width).max(1);
    let num_rows = height.div_ceil(info.block_height).max(1);
    let row_bytes = blocks_wide as u64 * info.bytes_per_block as u64;
    Some(SurfaceInfo {
        row_bytes,
        num_rows,
        // 超大尺寸饱和到 u64::MAX，由调用方的长度检查拒绝
        num_bytes: row_bytes.saturating_mul(num_rows as u64),
    })
}

/// 完整 mip 链的级数：`floor(log2(max(w, h, d))) + 1`
#[inline]
pub fn full_mip_count(extent: vk::Extent3D) -> u32 {
    let largest = extent.width.max(extent.height).max(extent.depth).max(1);
    u32::BITS - largest.leading_zeros()
}

/// 返回格式对应的 SRGB 版本，没有对应版本时返回 None
pub fn srgb_format(format: vk::Format) -> Option<vk::Format> {
    let srgb = match format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => vk::Format::R8G8B8A8_SRGB,
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => vk::Format::B8G8R8A8_SRGB,
        vk::Format::R8G8B8_UNORM | vk::Format::R8G8B8_SRGB => vk::Format::R8G8B8_SRGB,
        vk::Format::B8G8R8_UNORM | vk::Format::B8G8R8_SRGB => vk::Format::B8G8R8_SRGB,
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => vk::Format::R8_SRGB,
        vk::Format::BC1_RGB_UNORM_BLOCK | vk::Format::BC1_RGB_SRGB_BLOCK => vk::Format::BC1_RGB_SRGB_BLOCK,
        vk::Format::BC1_RGBA_UNORM_BLOCK | vk::Format::BC1_RGBA_SRGB_BLOCK => vk::Format::BC1_RGBA_SRGB_BLOCK,
        vk::Format::BC2_UNORM_BLOCK | vk::Format::BC2_SRGB_BLOCK => vk::Format::BC2_SRGB_BLOCK,
        vk::Format::BC3_UNORM_BLOCK | vk::Format::BC3_SRGB_BLOCK => vk::Format::BC3_SRGB_BLOCK,
        vk::Format::BC7_UNORM_BLOCK | vk::Format::BC7_SRGB_BLOCK => vk::Format::BC7_SRGB_BLOCK,
        vk::Format::ETC2_R8G8B8_UNORM_BLOCK | vk::Format::ETC2_R8G8B8_SRGB_BLOCK => {
            vk::Format::ETC2_R8G8B8_SRGB_BLOCK
        }
        vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK | vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK => {
            vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK
        }
        vk::Format::ASTC_4X4_UNORM_BLOCK | vk::Format::ASTC_4X4_SRGB_BLOCK => vk::Format::ASTC_4X4_SRGB_BLOCK,
        vk::Format::ASTC_8X8_UNORM_BLOCK | vk::Format::ASTC_8X8_SRGB_BLOCK => vk::Format::ASTC_8X8_SRGB_BLOCK,
        _ => return None,
    };
    Some(srgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_surface() {
        let info = surface_info(vk::Format::R8G8B8A8_UNORM, 13, 7).unwrap();
        assert_eq!(info.row_bytes, 52);
        assert_eq!(info.num_rows, 7);
        assert_eq!(info.num_bytes, 52 * 7);
    }

    #[test]
    fn test_bc_surface_rounds_up_to_block() {
        // 5x5 的 BC1 需要 2x2 个 block
        let info = surface_info(vk::Format::BC1_RGBA_UNORM_BLOCK, 5, 5).unwrap();
        assert_eq!(info.row_bytes, 16);
        assert_eq!(info.num_rows, 2);
        assert_eq!(info.num_bytes, 32);

        // 比一个 block 还小的 mip 也占一个完整 block
        let tail = surface_info(vk::Format::BC7_UNORM_BLOCK, 1, 1).unwrap();
        assert_eq!(tail.num_bytes, 16);
    }

    #[test]
    fn test_unknown_format() {
        assert!(format_info(vk::Format::UNDEFINED).is_none());
        assert!(surface_info(vk::Format::UNDEFINED, 4, 4).is_none());
    }

    #[test]
    fn test_mip_chain() {
        let extent = |width, height, depth| vk::Extent3D { width, height, depth };
        assert_eq!(full_mip_count(extent(4, 4, 1)), 3);
        assert_eq!(full_mip_count(extent(1, 1, 1)), 1);
        assert_eq!(full_mip_count(extent(1024, 512, 1)), 11);
        assert_eq!(full_mip_count(extent(2, 2, 16)), 5);
        assert_eq!(full_mip_count(extent(u32::MAX, 1, 1)), 32);
    }

    #[test]
    fn test_huge_surface_saturates() {
        let info = surface_info(vk::Format::R32G32B32A32_SFLOAT, u32::MAX, u32::MAX).unwrap();
        assert_eq!(info.num_bytes, u64::MAX);
    }

    #[test]
    fn test_srgb_mapping() {
        assert_eq!(srgb_format(vk::Format::R8G8B8A8_UNORM), Some(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(srgb_format(vk::Format::BC3_UNORM_BLOCK), Some(vk::Format::BC3_SRGB_BLOCK));
        assert_eq!(srgb_format(vk::Format::R16G16B16A16_SFLOAT), None);
    }
}
