//! 纹理容器格式的解析
//!
//! 所有容器最终都被解析为 [`TextureImage`]：一个 [`TextureDesc`] 加上一段原始数据，
//! 以及每个 subresource 在这段数据中的位置。上传时逐行拷贝到 staging 内存中，
//! 所以源数据的行间距可以和 GPU 要求的不同。

pub(crate) mod basis;
pub(crate) mod dds;
pub(crate) mod image_file;
pub(crate) mod ktx;
pub(crate) mod svt;

use std::path::Path;

use anyhow::{Context, bail};
use truvis_gfx::desc::TextureDesc;
use truvis_gfx::format::{format_info, srgb_format, surface_info};

use crate::desc::TextureContainer;

/// 一个 subresource 在源数据中的布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SubresourceData {
    pub mip_level: u32,
    pub array_layer: u32,
    /// 在 [`TextureImage::data`] 中的起始位置
    pub offset: usize,
    /// 源数据中相邻两行的间距
    pub row_pitch: usize,
    /// 一行有效数据的字节数
    pub row_bytes: usize,
    /// block 行数
    pub num_rows: u32,
    pub depth: u32,
}

impl SubresourceData {
    #[inline]
    pub fn slice_pitch(&self) -> usize {
        self.row_pitch * self.num_rows as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.slice_pitch() * self.depth as usize
    }

    /// 和 [`Self::size`] 相同，但是来自文件头的尺寸可能溢出
    pub fn checked_size(&self) -> Option<usize> {
        self.row_pitch.checked_mul(self.num_rows as usize)?.checked_mul(self.depth as usize)
    }
}

/// 检查来自文件头的 mip / layer 数量
///
/// 每个 subresource 至少占 1 字节，所以数量超过剩余数据长度的文件一定是截断或者损坏的
pub(crate) fn validate_layout(desc: &TextureDesc, available: usize) -> anyhow::Result<u32> {
    if desc.mip_levels == 0 || desc.array_layers == 0 {
        bail!("texture needs at least one mip level and one array layer");
    }
    if desc.mip_levels > desc.max_mip_levels() {
        bail!(
            "{} mip levels for a {}x{}x{} texture, at most {}",
            desc.mip_levels,
            desc.extent.width,
            desc.extent.height,
            desc.extent.depth,
            desc.max_mip_levels()
        );
    }
    let count = desc
        .subresource_count()
        .with_context(|| format!("{} mips x {} layers overflows", desc.mip_levels, desc.array_layers))?;
    if count as usize > available {
        bail!("{} subresources cannot fit in {} bytes", count, available);
    }
    Ok(count)
}

/// 解析完成、等待上传的纹理
pub(crate) struct TextureImage {
    pub desc: TextureDesc,
    pub data: Vec<u8>,
    pub subresources: Vec<SubresourceData>,
}

impl TextureImage {
    /// 第 `z` 个 slice 的第 `row` 行
    pub fn row(&self, sub: &SubresourceData, z: u32, row: u32) -> &[u8] {
        let start = sub.offset + z as usize * sub.slice_pitch() + row as usize * sub.row_pitch;
        &self.data[start..start + sub.row_bytes]
    }

    /// 紧密排列的像素数据，layer-major
    pub fn from_tight_data(desc: TextureDesc, data: Vec<u8>) -> anyhow::Result<Self> {
        let subresources = build_subresources(&desc, data.len(), 0, SubresourceOrder::LayerMajor, &TIGHT, |_, _| Ok(0))?;
        Ok(Self {
            desc,
            data,
            subresources,
        })
    }

    /// 使用 SRGB 格式，没有对应格式时打印警告并保持原格式
    pub fn apply_srgb(&mut self, name: &str) {
        match srgb_format(self.desc.format) {
            Some(format) => self.desc.format = format,
            None => log::warn!("{}: format {:?} has no SRGB variant, keep the original format", name, self.desc.format),
        }
    }
}

/// 解析结果：普通纹理走通用的 staging 上传，virtual texture 走独立的路径
pub(crate) enum ParsedTexture {
    Image(TextureImage),
    Virtual(svt::SvtImage),
}

/// subresource 在文件中的排列顺序
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubresourceOrder {
    /// 先 layer 后 mip：layer0[mip0, mip1...], layer1[...]（DDS）
    LayerMajor,
    /// 先 mip 后 layer：mip0[layer0, layer1...], mip1[...]（KTX）
    MipMajor,
}

/// 源数据中的对齐要求
pub(crate) struct SourceAlignment {
    pub row: usize,
    /// 每个 layer（face）之后的对齐
    pub layer: usize,
    /// 每个 mip 之后的对齐
    pub mip: usize,
}

pub(crate) const TIGHT: SourceAlignment = SourceAlignment {
    row: 1,
    layer: 1,
    mip: 1,
};

#[inline]
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment.max(1)) * alignment.max(1)
}

/// 计算每个 subresource 在源数据中的位置
///
/// `pre_mip` 在 MipMajor 顺序下、每个 mip 开始之前调用，参数为当前位置和 mip 级别，
/// 返回需要跳过的字节数（例如 KTX 在每个 mip 前面有 4 字节的 imageSize）。
pub(crate) fn build_subresources(
    desc: &TextureDesc,
    data_len: usize,
    start: usize,
    order: SubresourceOrder,
    alignment: &SourceAlignment,
    mut pre_mip: impl FnMut(usize, u32) -> anyhow::Result<usize>,
) -> anyhow::Result<Vec<SubresourceData>> {
    if format_info(desc.format).is_none() {
        bail!("unsupported format {:?}", desc.format);
    }

    let describe = |mip: u32, layer: u32, offset: usize| -> anyhow::Result<SubresourceData> {
        let extent = desc.mip_extent(mip);
        let surface =
            surface_info(desc.format, extent.width, extent.height).context("surface info of a supported format")?;
        let sub = SubresourceData {
            mip_level: mip,
            array_layer: layer,
            offset,
            row_pitch: align_up(surface.row_bytes as usize, alignment.row),
            row_bytes: surface.row_bytes as usize,
            num_rows: surface.num_rows,
            depth: extent.depth,
        };
        let end = sub.checked_size().and_then(|size| offset.checked_add(size));
        if end.is_none_or(|end| end > data_len) {
            bail!(
                "texture data is truncated at mip {} layer {}: need {:?} bytes, have {}",
                mip,
                layer,
                end,
                data_len
            );
        }
        Ok(sub)
    };

    let count = validate_layout(desc, data_len.saturating_sub(start))?;
    let mut subresources = Vec::with_capacity(count as usize);
    let mut cursor = start;
    match order {
        SubresourceOrder::LayerMajor => {
            for layer in 0..desc.array_layers {
                for mip in 0..desc.mip_levels {
                    let sub = describe(mip, layer, cursor)?;
                    cursor = align_up(cursor + sub.size(), alignment.mip);
                    subresources.push(sub);
                }
                cursor = align_up(cursor, alignment.layer);
            }
        }
        SubresourceOrder::MipMajor => {
            for mip in 0..desc.mip_levels {
                cursor += pre_mip(cursor, mip)?;
                for layer in 0..desc.array_layers {
                    let sub = describe(mip, layer, cursor)?;
                    cursor = align_up(cursor + sub.size(), alignment.layer);
                    subresources.push(sub);
                }
                cursor = align_up(cursor, alignment.mip);
            }
        }
    }
    Ok(subresources)
}

/// 根据容器类型（或文件扩展名）解析纹理文件
pub(crate) fn parse_texture(
    bytes: &[u8],
    container: TextureContainer,
    file_name: &str,
    srgb: bool,
) -> anyhow::Result<ParsedTexture> {
    let _span = tracy_client::span!("parse_texture");

    let container = match container {
        TextureContainer::Default => container_from_extension(file_name),
        other => Some(other),
    };

    let parsed = match container {
        Some(TextureContainer::Dds) => ParsedTexture::Image(dds::parse(bytes, file_name)?),
        Some(TextureContainer::Ktx) => ParsedTexture::Image(ktx::parse(bytes, file_name)?),
        Some(TextureContainer::Basis) => ParsedTexture::Image(basis::transcode(bytes, file_name)?),
        Some(TextureContainer::Svt) => ParsedTexture::Virtual(svt::parse(bytes, file_name)?),
        Some(TextureContainer::Gnf) => bail!("GNF textures are only supported on console platforms: {}", file_name),
        // 其余格式交给 image crate
        Some(TextureContainer::Default) | None => ParsedTexture::Image(image_file::decode(bytes, file_name)?),
    };

    Ok(match parsed {
        ParsedTexture::Image(mut image) => {
            if srgb {
                image.apply_srgb(file_name);
            }
            ParsedTexture::Image(image)
        }
        ParsedTexture::Virtual(mut svt) => {
            if srgb {
                svt.tail.apply_srgb(file_name);
            }
            ParsedTexture::Virtual(svt)
        }
    })
}

fn container_from_extension(file_name: &str) -> Option<TextureContainer> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "dds" => Some(TextureContainer::Dds),
        "ktx" => Some(TextureContainer::Ktx),
        "basis" => Some(TextureContainer::Basis),
        "svt" => Some(TextureContainer::Svt),
        "gnf" => Some(TextureContainer::Gnf),
        _ => None,
    }
}

/// 小端读取工具
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    name: &'a str,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8], name: &'a str) -> Self {
        Self { bytes, name }
    }

    pub fn u32_at(&self, offset: usize) -> anyhow::Result<u32> {
        let raw = self
            .bytes
            .get(offset..offset + 4)
            .with_context(|| format!("{}: unexpected end of file at {}", self.name, offset))?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn u64_at(&self, offset: usize) -> anyhow::Result<u64> {
        let lo = self.u32_at(offset)? as u64;
        let hi = self.u32_at(offset + 4)? as u64;
        Ok(lo | (hi << 32))
    }

    pub fn bytes_at(&self, offset: usize, len: usize) -> anyhow::Result<&'a [u8]> {
        self.bytes
            .get(offset..offset + len)
            .with_context(|| format!("{}: unexpected end of file at {}", self.name, offset))
    }
}
