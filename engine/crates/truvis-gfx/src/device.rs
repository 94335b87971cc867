use std::ptr::NonNull;

use ash::vk;

use crate::commands::{BufferBarrier, BufferCopyRegion, BufferTextureCopy, SubmitDesc, TextureBarrier};
use crate::desc::{BufferDesc, DeviceLimits, FenceStatus, QueueType, TextureDesc};
use crate::handles::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, SemaphoreHandle, TextureHandle,
};

/// 资源加载器所需要的 GPU 设备接口
///
/// 一个 `GfxDevice` 对应一张 GPU。所有的对象都通过 handle 引用，
/// handle 只在创建它的设备上有效。
///
/// # 线程安全
/// - 资源的创建和销毁可以在任意线程调用
/// - command buffer 的录制只会在一个线程（streamer 线程）上进行
/// - `queue_submit` 需要实现自己保证同一个队列的外部同步
pub trait GfxDevice: Send + Sync {
    fn name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    // buffer
    fn create_buffer(&self, desc: &BufferDesc) -> anyhow::Result<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    fn buffer_size(&self, buffer: BufferHandle) -> Option<vk::DeviceSize>;
    /// host visible 的 buffer 会被持久映射，返回映射的起始地址
    ///
    /// 返回的指针在 buffer 被销毁之前一直有效
    fn mapped_ptr(&self, buffer: BufferHandle) -> Option<NonNull<u8>>;
    /// CPU 写入之后使 GPU 可见
    fn flush_buffer(&self, buffer: BufferHandle, offset: vk::DeviceSize, size: vk::DeviceSize);
    /// GPU 写入之后使 CPU 可见
    fn invalidate_buffer(&self, buffer: BufferHandle, offset: vk::DeviceSize, size: vk::DeviceSize);

    // texture
    fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle>;
    fn destroy_texture(&self, texture: TextureHandle);
    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc>;

    // 同步对象
    fn create_fence(&self, signaled: bool) -> anyhow::Result<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn fence_status(&self, fence: FenceHandle) -> anyhow::Result<FenceStatus>;
    fn wait_fence(&self, fence: FenceHandle) -> anyhow::Result<()>;
    fn reset_fence(&self, fence: FenceHandle) -> anyhow::Result<()>;
    /// binary semaphore：每次 signal 之后必须先被等待一次，才能再次 signal
    fn create_semaphore(&self) -> anyhow::Result<SemaphoreHandle>;
    /// timeline semaphore：signal 的值必须单调递增，可以被任意多次等待，也可以不被等待
    fn create_timeline_semaphore(&self, initial_value: u64) -> anyhow::Result<SemaphoreHandle>;
    /// timeline semaphore 当前的值
    fn semaphore_value(&self, semaphore: SemaphoreHandle) -> anyhow::Result<u64>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    // command
    fn create_command_pool(&self, queue: QueueType) -> anyhow::Result<CommandPoolHandle>;
    /// 同时会释放从这个 pool 分配的所有 command buffer
    fn destroy_command_pool(&self, pool: CommandPoolHandle);
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> anyhow::Result<()>;
    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> anyhow::Result<CommandBufferHandle>;
    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> anyhow::Result<()>;
    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> anyhow::Result<()>;

    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, region: BufferCopyRegion);
    fn cmd_copy_buffer_to_texture(&self, cmd: CommandBufferHandle, copy: &BufferTextureCopy);
    fn cmd_copy_texture_to_buffer(&self, cmd: CommandBufferHandle, copy: &BufferTextureCopy);
    fn cmd_resource_barrier(
        &self,
        cmd: CommandBufferHandle,
        buffer_barriers: &[BufferBarrier],
        texture_barriers: &[TextureBarrier],
    );

    // queue
    fn queue_submit(&self, queue: QueueType, submit: &SubmitDesc) -> anyhow::Result<()>;
    fn wait_idle(&self) -> anyhow::Result<()>;
}
