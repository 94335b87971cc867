//! Staging 内存分配
//!
//! 每个 resource set 有一个固定大小、持久映射的 staging ring，分配时只移动游标，
//! resource set 被复用时整体回收。放不下的请求会单独创建一个上传用的 buffer，
//! 挂在 resource set 的临时 buffer 列表上，等 fence 完成之后销毁。

use std::ptr::NonNull;

use anyhow::Context;
use ash::vk;
use truvis_gfx::desc::BufferDesc;
use truvis_gfx::device::GfxDevice;
use truvis_gfx::handles::BufferHandle;

/// 一段 CPU 可写的上传内存
#[derive(Debug)]
pub struct MappedMemoryRange {
    pub buffer: BufferHandle,
    /// 在 `buffer` 中的偏移
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    ptr: NonNull<u8>,
}

// 指针指向的内存由 buffer 持有，buffer 在 range 使用完之前不会被销毁
unsafe impl Send for MappedMemoryRange {}

impl MappedMemoryRange {
    /// # Safety
    /// `ptr` 需要指向 `buffer` 中 `offset` 处至少 `size` 字节的映射内存
    pub(crate) unsafe fn new(buffer: BufferHandle, offset: vk::DeviceSize, size: vk::DeviceSize, ptr: NonNull<u8>) -> Self {
        Self {
            buffer,
            offset,
            size,
            ptr,
        }
    }

    /// 映射内存所在的 buffer 需要是 host visible 的
    pub(crate) fn map_buffer(
        device: &dyn GfxDevice,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> anyhow::Result<Self> {
        let capacity = device.buffer_size(buffer).context("map a destroyed buffer")?;
        anyhow::ensure!(
            offset.checked_add(size).is_some_and(|end| end <= capacity),
            "mapped range {}+{} is out of buffer size {}",
            offset,
            size,
            capacity
        );
        let base = device.mapped_ptr(buffer).context("buffer is not host visible")?;
        // SAFETY: 范围已经检查过，位于 buffer 的映射内存之内
        Ok(unsafe { Self::new(buffer, offset, size, base.add(offset as usize)) })
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 构造时保证了指针有效，且 &mut self 保证了独占访问
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size as usize) }
    }

    /// 在 `offset` 处写入 `data`
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        let slice = self.as_mut_slice();
        assert!(
            offset + data.len() <= slice.len(),
            "write {}+{} out of mapped range {}",
            offset,
            data.len(),
            slice.len()
        );
        slice[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// 计算在 ring 中的分配位置，放不下时返回 None
#[inline]
pub(crate) fn ring_fit(
    allocated: vk::DeviceSize,
    capacity: vk::DeviceSize,
    size: vk::DeviceSize,
    alignment: vk::DeviceSize,
) -> Option<vk::DeviceSize> {
    let offset = allocated.div_ceil(alignment.max(1)) * alignment.max(1);
    (offset.checked_add(size)? <= capacity).then_some(offset)
}

/// 分配来自哪里
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StagingPath {
    Ring,
    Overflow,
}

pub(crate) struct StagingRing {
    buffer: BufferHandle,
    base: NonNull<u8>,
    capacity: vk::DeviceSize,
    allocated: vk::DeviceSize,
}

// 映射的内存归 staging buffer 所有，ring 只在 streamer 线程上使用
unsafe impl Send for StagingRing {}

// new & init
impl StagingRing {
    pub fn new(device: &dyn GfxDevice, capacity: vk::DeviceSize, name: &str) -> anyhow::Result<Self> {
        let buffer = device.create_buffer(&BufferDesc::upload(capacity, name))?;
        let Some(base) = device.mapped_ptr(buffer) else {
            device.destroy_buffer(buffer);
            anyhow::bail!("staging buffer <{}> is not host visible", name);
        };
        Ok(Self {
            buffer,
            base,
            capacity,
            allocated: 0,
        })
    }

    pub fn destroy(self, device: &dyn GfxDevice) {
        device.destroy_buffer(self.buffer);
    }
}

// getters
impl StagingRing {
    #[cfg(test)]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[inline]
    pub fn allocated(&self) -> vk::DeviceSize {
        self.allocated
    }
}

// tools
impl StagingRing {
    pub fn try_allocate(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<MappedMemoryRange> {
        let offset = ring_fit(self.allocated, self.capacity, size, alignment)?;
        self.allocated = offset + size;
        // SAFETY: ring_fit 保证了 [offset, offset + size) 位于 staging buffer 之内
        Some(unsafe { MappedMemoryRange::new(self.buffer, offset, size, self.base.add(offset as usize)) })
    }

    /// resource set 被复用时调用，之前分配的内存全部作废
    #[inline]
    pub fn reset(&mut self) {
        self.allocated = 0;
    }
}

/// 创建一个大小刚好的临时上传 buffer
pub(crate) fn allocate_overflow(
    device: &dyn GfxDevice,
    size: vk::DeviceSize,
    name: &str,
) -> anyhow::Result<MappedMemoryRange> {
    let buffer = device.create_buffer(&BufferDesc::upload(size.max(1), name))?;
    match MappedMemoryRange::map_buffer(device, buffer, 0, size) {
        Ok(range) => Ok(range),
        Err(e) => {
            device.destroy_buffer(buffer);
            Err(e)
        }
    }
}
