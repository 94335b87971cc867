use std::alloc::{self, Layout};
use std::ptr::NonNull;

use anyhow::Context;

/// 一块地址固定的 host 内存，模拟持久映射的 device memory
///
/// 可以同时被 CPU（通过 mapped 指针）和 timeline 线程访问，
/// 所有读写都通过裸指针进行，不会产生 `&mut [u8]` 引用。
pub(crate) struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
    size: usize,
}

// 内存本身没有线程亲和性，读写的同步由 fence / semaphore 负责
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    const ALIGNMENT: usize = 64;

    pub fn new(size: u64) -> anyhow::Result<Self> {
        let size = usize::try_from(size).context("host memory size overflow")?;
        let layout = Layout::from_size_align(size.max(1), Self::ALIGNMENT)?;
        // SAFETY: layout 的 size 不为 0
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).with_context(|| format!("failed to allocate {size} bytes of host memory"))?;
        Ok(Self { ptr, layout, size })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.size as u64)
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(self.contains(offset as u64, dst.len() as u64));
        // SAFETY: 调用方保证区间在范围内
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len()) }
    }

    pub fn write(&self, offset: usize, src: &[u8]) {
        debug_assert!(self.contains(offset as u64, src.len() as u64));
        // SAFETY: 调用方保证区间在范围内
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len()) }
    }

    /// 两块内存之间的拷贝，允许是同一块内存
    pub fn copy(src: &HostMemory, src_offset: usize, dst: &HostMemory, dst_offset: usize, len: usize) {
        debug_assert!(src.contains(src_offset as u64, len as u64));
        debug_assert!(dst.contains(dst_offset as u64, len as u64));
        // SAFETY: 区间在范围内；同一块内存时使用 copy 处理重叠
        unsafe { std::ptr::copy(src.ptr.as_ptr().add(src_offset), dst.ptr.as_ptr().add(dst_offset), len) }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr 由同一个 layout 分配
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_rw() {
        let mem = HostMemory::new(32).unwrap();
        let mut out = [0xffu8; 32];
        mem.read(0, &mut out);
        assert!(out.iter().all(|b| *b == 0));

        mem.write(8, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        mem.read(8, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_overlapping_copy() {
        let mem = HostMemory::new(8).unwrap();
        mem.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        HostMemory::copy(&mem, 0, &mem, 2, 4);
        let mut out = [0u8; 8];
        mem.read(0, &mut out);
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 7, 8]);
    }

    #[test]
    fn test_bounds() {
        let mem = HostMemory::new(16).unwrap();
        assert!(mem.contains(0, 16));
        assert!(!mem.contains(8, 9));
        assert!(!mem.contains(u64::MAX, 2));
    }
}
