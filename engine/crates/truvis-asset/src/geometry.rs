//! OBJ 几何体的解析
//!
//! 通过 tobj 读取（三角化、单一索引），再按照 [`VertexLayout`] 把属性交错排列到各个 binding 中。

use std::io::Cursor;

use anyhow::{Context, bail};
use ash::vk;
use bitflags::bitflags;
use truvis_gfx::desc::IndexType;
use truvis_gfx::handles::BufferHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    TexCoord,
}

impl VertexSemantic {
    #[inline]
    pub fn component_count(self) -> usize {
        match self {
            VertexSemantic::Position | VertexSemantic::Normal => 3,
            VertexSemantic::TexCoord => 2,
        }
    }

    #[inline]
    pub fn format(self) -> vk::Format {
        match self {
            VertexSemantic::Position | VertexSemantic::Normal => vk::Format::R32G32B32_SFLOAT,
            VertexSemantic::TexCoord => vk::Format::R32G32_SFLOAT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub semantic: VertexSemantic,
    pub binding: u32,
}

/// 顶点布局：同一个 binding 内的属性按声明顺序交错排列
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexLayout {
    pub attributes: Vec<VertexAttribute>,
}

impl Default for VertexLayout {
    /// position + normal + texcoord，全部位于 binding 0
    fn default() -> Self {
        Self {
            attributes: vec![
                VertexAttribute {
                    semantic: VertexSemantic::Position,
                    binding: 0,
                },
                VertexAttribute {
                    semantic: VertexSemantic::Normal,
                    binding: 0,
                },
                VertexAttribute {
                    semantic: VertexSemantic::TexCoord,
                    binding: 0,
                },
            ],
        }
    }
}

impl VertexLayout {
    #[inline]
    pub fn binding_count(&self) -> u32 {
        self.attributes.iter().map(|a| a.binding + 1).max().unwrap_or(0)
    }

    /// 一个 binding 中每个顶点占用的字节数
    pub fn stride(&self, binding: u32) -> u32 {
        self.attributes
            .iter()
            .filter(|a| a.binding == binding)
            .map(|a| (a.semantic.component_count() * size_of::<f32>()) as u32)
            .sum()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GeometryLoadFlags: u32 {
        /// 总是使用 32 位索引
        const FORCE_32BIT_INDICES = 1 << 0;
        /// 在 CPU 端保留一份 position 和 index 数据
        const SHADOWED = 1 << 1;
    }
}

/// 与 `VkDrawIndexedIndirectCommand` 的内存布局一致
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// CPU 端保留的几何数据
#[derive(Clone, Debug, Default)]
pub struct GeometryShadow {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

/// 加载完成的几何体
#[derive(Clone, Debug)]
pub struct Geometry {
    /// 每个 binding 一个 vertex buffer
    pub vertex_buffers: Vec<BufferHandle>,
    pub vertex_strides: Vec<u32>,
    pub index_buffer: BufferHandle,
    pub index_type: IndexType,
    pub vertex_count: u32,
    pub index_count: u32,
    pub draw_args: DrawIndexedArgs,
    pub shadow: Option<GeometryShadow>,
}

/// 解析得到的 CPU 端数据，等待上传
pub(crate) struct GeometryData {
    pub vertex_streams: Vec<Vec<u8>>,
    pub vertex_strides: Vec<u32>,
    pub index_data: Vec<u8>,
    pub index_type: IndexType,
    pub vertex_count: u32,
    pub index_count: u32,
    pub shadow: Option<GeometryShadow>,
}

pub(crate) fn parse_obj(bytes: &[u8], layout: &VertexLayout, flags: GeometryLoadFlags) -> anyhow::Result<GeometryData> {
    let _span = tracy_client::span!("parse_obj");

    if layout.attributes.is_empty() {
        bail!("vertex layout has no attribute");
    }

    let (models, _materials) = tobj::load_obj_buf(
        &mut Cursor::new(bytes),
        &tobj::LoadOptions {
            single_index: true,
            triangulate: true,
            ignore_lines: true,
            ignore_points: true,
            ..Default::default()
        },
        // 只需要几何数据，材质全部忽略
        |_| Ok(Default::default()),
    )
    .context("failed to parse obj")?;

    if models.is_empty() {
        bail!("obj contains no model");
    }

    // 多个 model 合并为一个几何体
    let mut positions: Vec<[f32; 3]> = Vec::new();
    let mut normals: Vec<[f32; 3]> = Vec::new();
    let mut texcoords: Vec<[f32; 2]> = Vec::new();
    let mut indices: Vec<u32> = Vec::new();
    for model in &models {
        let mesh = &model.mesh;
        let base = positions.len() as u32;
        let count = mesh.positions.len() / 3;

        positions.extend(mesh.positions.chunks_exact(3).map(|p| [p[0], p[1], p[2]]));
        if mesh.normals.len() == count * 3 {
            normals.extend(mesh.normals.chunks_exact(3).map(|n| [n[0], n[1], n[2]]));
        } else {
            normals.extend(std::iter::repeat_n([0.0; 3], count));
        }
        if mesh.texcoords.len() == count * 2 {
            texcoords.extend(mesh.texcoords.chunks_exact(2).map(|t| [t[0], t[1]]));
        } else {
            texcoords.extend(std::iter::repeat_n([0.0; 2], count));
        }
        indices.extend(mesh.indices.iter().map(|i| i + base));
    }

    let vertex_count = positions.len();
    if let Some(max) = indices.iter().max()
        && *max as usize >= vertex_count
    {
        bail!("obj index {} is out of range, vertex count: {}", max, vertex_count);
    }

    // 按 binding 交错排列
    let binding_count = layout.binding_count();
    let mut vertex_streams = Vec::with_capacity(binding_count as usize);
    let mut vertex_strides = Vec::with_capacity(binding_count as usize);
    for binding in 0..binding_count {
        let attributes: Vec<_> = layout.attributes.iter().filter(|a| a.binding == binding).collect();
        let stride = layout.stride(binding);
        let mut floats: Vec<f32> = Vec::with_capacity(vertex_count * stride as usize / size_of::<f32>());
        for v in 0..vertex_count {
            for attribute in &attributes {
                match attribute.semantic {
                    VertexSemantic::Position => floats.extend_from_slice(&positions[v]),
                    VertexSemantic::Normal => floats.extend_from_slice(&normals[v]),
                    VertexSemantic::TexCoord => floats.extend_from_slice(&texcoords[v]),
                }
            }
        }
        vertex_streams.push(bytemuck::cast_slice::<f32, u8>(&floats).to_vec());
        vertex_strides.push(stride);
    }

    let use_u16 =
        !flags.contains(GeometryLoadFlags::FORCE_32BIT_INDICES) && indices.iter().all(|i| *i <= u16::MAX as u32);
    let (index_type, index_data) = if use_u16 {
        let narrow: Vec<u16> = indices.iter().map(|i| *i as u16).collect();
        (IndexType::U16, bytemuck::cast_slice::<u16, u8>(&narrow).to_vec())
    } else {
        (IndexType::U32, bytemuck::cast_slice::<u32, u8>(&indices).to_vec())
    };

    let index_count = indices.len() as u32;
    let shadow = flags.contains(GeometryLoadFlags::SHADOWED).then(|| GeometryShadow {
        positions: positions.clone(),
        indices: indices.clone(),
    });

    log::debug!(
        "obj parsed: {} models, {} vertices, {} indices ({:?})",
        models.len(),
        vertex_count,
        index_count,
        index_type
    );

    Ok(GeometryData {
        vertex_streams,
        vertex_strides,
        index_data,
        index_type,
        vertex_count: vertex_count as u32,
        index_count,
        shadow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1 4/4/1
";

    #[test]
    fn test_default_layout() {
        let layout = VertexLayout::default();
        assert_eq!(layout.binding_count(), 1);
        assert_eq!(layout.stride(0), 32);
    }

    #[test]
    fn test_parse_quad() {
        let data = parse_obj(QUAD.as_bytes(), &VertexLayout::default(), GeometryLoadFlags::empty()).unwrap();
        assert_eq!(data.vertex_count, 4);
        // 四边形被三角化为两个三角形
        assert_eq!(data.index_count, 6);
        assert_eq!(data.index_type, IndexType::U16);
        assert_eq!(data.index_data.len(), 12);
        assert_eq!(data.vertex_streams.len(), 1);
        assert_eq!(data.vertex_streams[0].len(), 4 * 32);
        assert!(data.shadow.is_none());

        // 第二个顶点：position (1,0,0), normal (0,0,1), uv (1,0)
        let floats: &[f32] = bytemuck::cast_slice(&data.vertex_streams[0][32..64]);
        assert_eq!(floats, &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_split_bindings_and_32bit_indices() {
        let layout = VertexLayout {
            attributes: vec![
                VertexAttribute {
                    semantic: VertexSemantic::Position,
                    binding: 0,
                },
                VertexAttribute {
                    semantic: VertexSemantic::TexCoord,
                    binding: 1,
                },
            ],
        };
        let flags = GeometryLoadFlags::FORCE_32BIT_INDICES | GeometryLoadFlags::SHADOWED;
        let data = parse_obj(QUAD.as_bytes(), &layout, flags).unwrap();
        assert_eq!(data.vertex_strides, vec![12, 8]);
        assert_eq!(data.index_type, IndexType::U32);
        assert_eq!(data.index_data.len(), 24);
        let shadow = data.shadow.unwrap();
        assert_eq!(shadow.positions.len(), 4);
        assert_eq!(shadow.indices.len(), 6);
    }

    #[test]
    fn test_invalid_obj() {
        assert!(parse_obj(b"", &VertexLayout::default(), GeometryLoadFlags::empty()).is_err());
    }
}
