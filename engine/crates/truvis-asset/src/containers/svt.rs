//! SVT：sparse / virtual texture 容器
//!
//! ```text
//! "SVT1"
//! width, height, mip_count, page_size, format, mip_tail_start, page_count   (u32 x 7)
//! page_count x { mip: u32, x: u32, y: u32, offset: u64, size: u32 }
//! mip tail：mip_tail_start..mip_count 的数据，紧密排列
//! ```
//!
//! 加载时只创建 texture 并上传 mip tail，其余的 page 由上层按需调度，
//! 所以 page table 通过 [`VirtualTextureInfo`] 交给调用者。

use anyhow::{Context, bail};
use ash::vk;
use truvis_gfx::desc::TextureDesc;
use truvis_gfx::format::surface_info;

use super::{ByteReader, SubresourceData, TextureImage};

pub(crate) const SVT_MAGIC: &[u8; 4] = b"SVT1";
const HEADER_SIZE: usize = 32;
const PAGE_ENTRY_SIZE: usize = 24;

/// 一个 page 在文件中的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualPage {
    pub mip_level: u32,
    /// page 坐标，单位是 page
    pub x: u32,
    pub y: u32,
    /// 相对文件起始位置
    pub offset: u64,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualTextureInfo {
    /// page 的边长，单位是 texel
    pub page_size: u32,
    /// 从这一级开始的 mip 常驻显存
    pub mip_tail_start: u32,
    pub pages: Vec<VirtualPage>,
}

/// 解析得到的 virtual texture：`tail` 只包含 mip tail 的 subresource
pub(crate) struct SvtImage {
    pub tail: TextureImage,
    pub info: VirtualTextureInfo,
}

pub(crate) fn parse(bytes: &[u8], name: &str) -> anyhow::Result<SvtImage> {
    let _span = tracy_client::span!("svt::parse");
    let reader = ByteReader::new(bytes, name);

    if reader.bytes_at(0, 4)? != SVT_MAGIC {
        bail!("{}: not a SVT file", name);
    }
    let width = reader.u32_at(4)?;
    let height = reader.u32_at(8)?;
    let mip_levels = reader.u32_at(12)?.max(1);
    let page_size = reader.u32_at(16)?;
    let format = vk::Format::from_raw(reader.u32_at(20)? as i32);
    let mip_tail_start = reader.u32_at(24)?;
    let page_count = reader.u32_at(28)? as usize;

    if width == 0 || height == 0 || page_size == 0 {
        bail!("{}: invalid SVT extent {}x{} page {}", name, width, height, page_size);
    }
    if mip_tail_start > mip_levels {
        bail!("{}: mip tail {} is beyond mip count {}", name, mip_tail_start, mip_levels);
    }
    let desc = TextureDesc::new_2d(width, height, format, name).with_mip_levels(mip_levels);
    if mip_levels > desc.max_mip_levels() {
        bail!("{}: {} mip levels for {}x{}, at most {}", name, mip_levels, width, height, desc.max_mip_levels());
    }
    // page table 之前先确认文件放得下
    let max_pages = bytes.len().saturating_sub(HEADER_SIZE) / PAGE_ENTRY_SIZE;
    if page_count > max_pages {
        bail!("{}: {} pages claimed, the file holds at most {}", name, page_count, max_pages);
    }

    let mut pages = Vec::with_capacity(page_count);
    for i in 0..page_count {
        let entry = HEADER_SIZE + i * PAGE_ENTRY_SIZE;
        let page = VirtualPage {
            mip_level: reader.u32_at(entry)?,
            x: reader.u32_at(entry + 4)?,
            y: reader.u32_at(entry + 8)?,
            offset: reader.u64_at(entry + 12)?,
            size: reader.u32_at(entry + 20)?,
        };
        let end = page.offset.checked_add(page.size as u64);
        if page.mip_level >= mip_tail_start || end.is_none_or(|end| end > bytes.len() as u64) {
            bail!("{}: invalid page entry {}: {:?}", name, i, page);
        }
        pages.push(page);
    }

    // mip tail 紧跟在 page table 之后
    let mut cursor = HEADER_SIZE + page_count * PAGE_ENTRY_SIZE;
    let mut subresources = Vec::new();
    for mip in mip_tail_start..mip_levels {
        let extent = desc.mip_extent(mip);
        let surface = surface_info(format, extent.width, extent.height)
            .with_context(|| format!("{}: unsupported format {:?}", name, format))?;
        let sub = SubresourceData {
            mip_level: mip,
            array_layer: 0,
            offset: cursor,
            row_pitch: surface.row_bytes as usize,
            row_bytes: surface.row_bytes as usize,
            num_rows: surface.num_rows,
            depth: 1,
        };
        let end = sub.checked_size().and_then(|size| cursor.checked_add(size));
        if end.is_none_or(|end| end > bytes.len()) {
            bail!("{}: mip tail is truncated at mip {}", name, mip);
        }
        cursor += sub.size();
        subresources.push(sub);
    }

    log::debug!(
        "svt parsed: {} {}x{} mips={} tail={} pages={}",
        name,
        width,
        height,
        mip_levels,
        mip_tail_start,
        page_count
    );

    Ok(SvtImage {
        tail: TextureImage {
            desc,
            data: bytes.to_vec(),
            subresources,
        },
        info: VirtualTextureInfo {
            page_size,
            mip_tail_start,
            pages,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_svt(pages: &[VirtualPage], tail: &[u8]) -> Vec<u8> {
        // 8x8，4 级 mip，page 为 4x4，mip 2 开始是 tail
        let mut file = write_svt_header(4, pages.len() as u32);
        for page in pages {
            file.extend_from_slice(&page.mip_level.to_le_bytes());
            file.extend_from_slice(&page.x.to_le_bytes());
            file.extend_from_slice(&page.y.to_le_bytes());
            file.extend_from_slice(&page.offset.to_le_bytes());
            file.extend_from_slice(&page.size.to_le_bytes());
        }
        file.extend_from_slice(tail);
        file
    }

    fn write_svt_header(mip_levels: u32, page_count: u32) -> Vec<u8> {
        let mut file = SVT_MAGIC.to_vec();
        let format = vk::Format::R8G8B8A8_UNORM.as_raw() as u32;
        for field in [8u32, 8, mip_levels, 4, format, 2, page_count] {
            file.extend_from_slice(&field.to_le_bytes());
        }
        file
    }

    #[test]
    fn test_page_count_larger_than_file() {
        let mut file = write_svt_header(4, u32::MAX);
        file.extend([0u8; 28]);
        assert_eq!(file.len(), 60);
        let err = parse(&file, "a.svt").err().unwrap();
        assert!(format!("{err:#}").contains("pages claimed"), "{err:#}");
    }

    #[test]
    fn test_mip_count_beyond_chain() {
        // 8x8 最多 4 级
        let mut file = write_svt_header(40, 0);
        file.extend([0u8; 1024]);
        assert!(parse(&file, "a.svt").is_err());
    }

    #[test]
    fn test_page_range_overflow() {
        let page = VirtualPage {
            mip_level: 0,
            x: 0,
            y: 0,
            offset: u64::MAX - 1,
            size: 4,
        };
        let file = write_svt(&[page], &[0; 20]);
        assert!(parse(&file, "a.svt").is_err());
    }

    #[test]
    fn test_parse_tail_and_pages() {
        let page = VirtualPage {
            mip_level: 0,
            x: 1,
            y: 0,
            offset: 0,
            size: 4,
        };
        // mip 2: 2x2, mip 3: 1x1
        let tail: Vec<u8> = (0..20).collect();
        let file = write_svt(&[page], &tail);

        let svt = parse(&file, "a.svt").unwrap();
        assert_eq!(svt.info.page_size, 4);
        assert_eq!(svt.info.pages, vec![page]);
        assert_eq!(svt.tail.desc.mip_levels, 4);
        assert_eq!(svt.tail.subresources.len(), 2);
        assert_eq!(svt.tail.subresources[0].mip_level, 2);
        assert_eq!(svt.tail.row(&svt.tail.subresources[1], 0, 0), &[16, 17, 18, 19]);
    }

    #[test]
    fn test_page_inside_tail_is_rejected() {
        let page = VirtualPage {
            mip_level: 3,
            x: 0,
            y: 0,
            offset: 0,
            size: 4,
        };
        let file = write_svt(&[page], &[0; 20]);
        assert!(parse(&file, "a.svt").is_err());
    }

    #[test]
    fn test_truncated_tail() {
        let file = write_svt(&[], &[0; 19]);
        assert!(parse(&file, "a.svt").is_err());
    }
}
