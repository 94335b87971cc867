//! GPU 资源的创建描述

use ash::vk;

/// Buffer 所在内存的访问模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    /// 只有 GPU 可以访问，需要通过 staging buffer 上传
    #[default]
    GpuOnly,
    /// CPU 写，GPU 读。会被持久映射
    CpuToGpu,
    /// GPU 写，CPU 读。用于 readback，会被持久映射
    GpuToCpu,
}

impl MemoryUsage {
    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
    pub name: String,
}

impl BufferDesc {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags, memory: MemoryUsage, name: impl AsRef<str>) -> Self {
        Self {
            size,
            usage,
            memory,
            name: name.as_ref().to_string(),
        }
    }

    /// CPU 可写的上传用 buffer
    #[inline]
    pub fn upload(size: vk::DeviceSize, name: impl AsRef<str>) -> Self {
        Self::new(size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryUsage::CpuToGpu, name)
    }

    /// CPU 可读的 readback buffer
    #[inline]
    pub fn readback(size: vk::DeviceSize, name: impl AsRef<str>) -> Self {
        Self::new(size, vk::BufferUsageFlags::TRANSFER_DST, MemoryUsage::GpuToCpu, name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    /// cubemap 时为 6 的整数倍
    pub array_layers: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub is_cube: bool,
    pub name: String,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: vk::Format, name: impl AsRef<str>) -> Self {
        Self {
            extent: vk::Extent3D { width, height, depth: 1 },
            mip_levels: 1,
            array_layers: 1,
            format,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::SAMPLED,
            is_cube: false,
            name: name.as_ref().to_string(),
        }
    }

    #[inline]
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    #[inline]
    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    #[inline]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.extent.depth = depth;
        self
    }

    /// 溢出 u32 时返回 None
    #[inline]
    pub fn subresource_count(&self) -> Option<u32> {
        self.mip_levels.checked_mul(self.array_layers)
    }

    /// 完整 mip 链的级数：`floor(log2(max(w, h, d))) + 1`
    #[inline]
    pub fn max_mip_levels(&self) -> u32 {
        crate::format::full_mip_count(self.extent)
    }

    /// 第 `mip` 级的尺寸，每个维度最小为 1
    #[inline]
    pub fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        let shrink = |size: u32| size.checked_shr(mip).unwrap_or(0).max(1);
        vk::Extent3D {
            width: shrink(self.extent.width),
            height: shrink(self.extent.height),
            depth: shrink(self.extent.depth),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Transfer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    #[inline]
    pub fn size_in_bytes(self) -> u32 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }

    #[inline]
    pub fn vk_index_type(self) -> vk::IndexType {
        match self {
            IndexType::U16 => vk::IndexType::UINT16,
            IndexType::U32 => vk::IndexType::UINT32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Complete,
    Incomplete,
}

/// 设备对传输操作的限制
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// buffer -> image 拷贝时 buffer offset 的对齐要求
    pub upload_offset_alignment: vk::DeviceSize,
    /// buffer -> image 拷贝时每一行的对齐要求
    pub upload_row_pitch_alignment: vk::DeviceSize,
    /// 单次分配的最大尺寸
    pub max_allocation_size: vk::DeviceSize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            upload_offset_alignment: 16,
            upload_row_pitch_alignment: 1,
            max_allocation_size: 1 << 32,
        }
    }
}
