//! 纯 CPU 实现的 GfxDevice
//!
//! 资源都存放在 host 内存中，"GPU" 是每个队列一个的 timeline 线程，
//! 按顺序执行提交上来的 command buffer，然后 signal semaphore 和 fence。
//!
//! 它会跟踪每个 texture subresource 的 [`ResourceState`]，
//! 不合法的使用（例如往不是 COPY_DEST 的 texture 里拷贝）会被记为 validation error，
//! 测试中可以借此检查 barrier 是否正确。

mod memory;
mod timeline;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, bail};
use ash::vk;
use crossbeam_channel::Sender;
use slotmap::SlotMap;

use crate::commands::{BufferBarrier, BufferCopyRegion, BufferTextureCopy, SemaphoreSubmit, SubmitDesc, TextureBarrier};
use crate::desc::{BufferDesc, DeviceLimits, FenceStatus, QueueType, TextureDesc};
use crate::device::GfxDevice;
use crate::format::surface_info;
use crate::handles::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, SemaphoreHandle, TextureHandle,
};
use crate::state::ResourceState;
use memory::HostMemory;
use timeline::{HostCommand, HostSubmission, queue_index, run_timeline};

#[derive(Clone, Debug)]
pub struct HostDeviceDesc {
    pub name: String,
    pub limits: DeviceLimits,
    /// 每次 submit 在执行前额外等待的时间，用于模拟慢速 GPU
    pub execution_delay: Option<Duration>,
}

impl Default for HostDeviceDesc {
    fn default() -> Self {
        Self {
            name: "host-device".to_string(),
            limits: DeviceLimits::default(),
            execution_delay: None,
        }
    }
}

/// 当前存活的对象数量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostObjectCounts {
    pub buffers: usize,
    pub textures: usize,
    pub fences: usize,
    pub semaphores: usize,
    pub command_pools: usize,
    pub command_buffers: usize,
}

impl HostObjectCounts {
    #[inline]
    pub fn total(&self) -> usize {
        self.buffers + self.textures + self.fences + self.semaphores + self.command_pools + self.command_buffers
    }
}

pub(crate) struct HostBuffer {
    desc: BufferDesc,
    memory: HostMemory,
    state: ResourceState,
}

pub(crate) struct HostTexture {
    desc: TextureDesc,
    /// 按 `layer * mip_levels + mip` 排列，每个 subresource 紧密排列
    subresources: Vec<Vec<u8>>,
    states: Vec<ResourceState>,
}

impl HostTexture {
    fn subresource_index(&self, mip_level: u32, array_layer: u32) -> Result<usize, String> {
        if mip_level >= self.desc.mip_levels || array_layer >= self.desc.array_layers {
            return Err(format!(
                "subresource mip {mip_level} layer {array_layer} is out of range for {}",
                self.desc.name
            ));
        }
        Ok((array_layer * self.desc.mip_levels + mip_level) as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HostSemaphore {
    Binary { signaled: bool },
    Timeline { value: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

struct HostCommandBuffer {
    pool: CommandPoolHandle,
    state: CommandBufferState,
    commands: Vec<HostCommand>,
}

struct HostCommandPool {
    queue: QueueType,
    command_buffers: Vec<CommandBufferHandle>,
}

#[derive(Default)]
pub(crate) struct HostState {
    buffers: SlotMap<BufferHandle, HostBuffer>,
    textures: SlotMap<TextureHandle, HostTexture>,
    /// value 表示是否处于 signaled 状态
    fences: SlotMap<FenceHandle, bool>,
    semaphores: SlotMap<SemaphoreHandle, HostSemaphore>,
    command_pools: SlotMap<CommandPoolHandle, HostCommandPool>,
    command_buffers: SlotMap<CommandBufferHandle, HostCommandBuffer>,
    /// 每个队列已经提交但还未执行完的 submit 数量
    queue_pending: [u64; 2],
}

/// 设备和 timeline 线程共享的状态
pub(crate) struct HostShared {
    state: Mutex<HostState>,
    /// fence / semaphore / 队列空闲 的状态变化都通过这个 condvar 通知
    cond: Condvar,
    validation_errors: AtomicU64,
    execution_delay: Option<Duration>,
}

impl HostShared {
    fn validation_error(&self, msg: String) {
        log::error!("[host-device validation] {msg}");
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }
}

struct HostQueue {
    sender: Option<Sender<HostSubmission>>,
    thread: Option<JoinHandle<()>>,
}

pub struct HostDevice {
    name: String,
    limits: DeviceLimits,
    shared: Arc<HostShared>,
    queues: [HostQueue; 2],
    submit_count: AtomicU64,
}

// new & init
impl HostDevice {
    /// fence 等待的超时时间，超时说明等待了一个永远不会被 signal 的 fence
    const FENCE_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(desc: HostDeviceDesc) -> Arc<Self> {
        let shared = Arc::new(HostShared {
            state: Mutex::new(HostState::default()),
            cond: Condvar::new(),
            validation_errors: AtomicU64::new(0),
            execution_delay: desc.execution_delay,
        });

        let spawn_queue = |queue: QueueType| {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let thread_shared = shared.clone();
            let thread = std::thread::Builder::new()
                .name(format!("{}-{:?}", desc.name, queue).to_lowercase())
                .spawn(move || run_timeline(queue, thread_shared, receiver));
            match thread {
                Ok(thread) => HostQueue {
                    sender: Some(sender),
                    thread: Some(thread),
                },
                // 线程创建失败时队列不可用，submit 会返回错误
                Err(e) => {
                    log::error!("failed to spawn host timeline thread for {:?}: {}", queue, e);
                    HostQueue {
                        sender: None,
                        thread: None,
                    }
                }
            }
        };
        let queues = [spawn_queue(QueueType::Graphics), spawn_queue(QueueType::Transfer)];

        log::info!("host device <{}> created, limits: {:?}", desc.name, desc.limits);
        Arc::new(Self {
            name: desc.name,
            limits: desc.limits,
            shared,
            queues,
            submit_count: AtomicU64::new(0),
        })
    }
}

// getters & 检查工具
impl HostDevice {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn live_objects(&self) -> HostObjectCounts {
        let state = self.lock();
        HostObjectCounts {
            buffers: state.buffers.len(),
            textures: state.textures.len(),
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            command_pools: state.command_pools.len(),
            command_buffers: state.command_buffers.len(),
        }
    }

    /// 一共执行过多少次 queue submit
    #[inline]
    pub fn submit_count(&self) -> u64 {
        self.submit_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn validation_errors(&self) -> u64 {
        self.shared.validation_errors.load(Ordering::Acquire)
    }

    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.lock();
        let buffer = state.buffers.get(buffer)?;
        if !buffer.memory.contains(offset, len as u64) {
            return None;
        }
        let mut data = vec![0; len];
        buffer.memory.read(offset as usize, &mut data);
        Some(data)
    }

    /// 读取一个 subresource 紧密排列的内容
    pub fn read_texture(&self, texture: TextureHandle, mip_level: u32, array_layer: u32) -> Option<Vec<u8>> {
        let state = self.lock();
        let texture = state.textures.get(texture)?;
        let index = texture.subresource_index(mip_level, array_layer).ok()?;
        Some(texture.subresources[index].clone())
    }

    pub fn texture_state(&self, texture: TextureHandle, mip_level: u32, array_layer: u32) -> Option<ResourceState> {
        let state = self.lock();
        let texture = state.textures.get(texture)?;
        let index = texture.subresource_index(mip_level, array_layer).ok()?;
        Some(texture.states[index])
    }

    pub fn buffer_state(&self, buffer: BufferHandle) -> Option<ResourceState> {
        self.lock().buffers.get(buffer).map(|b| b.state)
    }
}

// tools
impl HostDevice {
    fn record(&self, cmd: CommandBufferHandle, command: HostCommand) {
        let error = {
            let mut state = self.lock();
            match state.command_buffers.get_mut(cmd) {
                Some(cb) if cb.state == CommandBufferState::Recording => {
                    cb.commands.push(command);
                    None
                }
                Some(cb) => Some(format!("recording into a command buffer in {:?} state", cb.state)),
                None => Some("recording into a destroyed command buffer".to_string()),
            }
        };
        if let Some(msg) = error {
            self.shared.validation_error(msg);
        }
    }
}

impl GfxDevice for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> anyhow::Result<BufferHandle> {
        if desc.size > self.limits.max_allocation_size {
            bail!(
                "buffer <{}> size {} exceeds max allocation size {}",
                desc.name,
                desc.size,
                self.limits.max_allocation_size
            );
        }
        let memory = HostMemory::new(desc.size).with_context(|| format!("create buffer <{}>", desc.name))?;
        let handle = self.lock().buffers.insert(HostBuffer {
            desc: desc.clone(),
            memory,
            state: ResourceState::UNDEFINED,
        });
        log::trace!("host buffer <{}> created, size: {}", desc.name, desc.size);
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if self.lock().buffers.remove(buffer).is_none() {
            log::warn!("destroy an unknown buffer: {:?}", buffer);
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<vk::DeviceSize> {
        self.lock().buffers.get(buffer).map(|b| b.desc.size)
    }

    fn mapped_ptr(&self, buffer: BufferHandle) -> Option<NonNull<u8>> {
        let state = self.lock();
        let buffer = state.buffers.get(buffer)?;
        buffer.desc.memory.is_host_visible().then(|| buffer.memory.ptr())
    }

    fn flush_buffer(&self, _buffer: BufferHandle, _offset: vk::DeviceSize, _size: vk::DeviceSize) {
        // host 内存天然 coherent
    }

    fn invalidate_buffer(&self, _buffer: BufferHandle, _offset: vk::DeviceSize, _size: vk::DeviceSize) {}

    fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle> {
        if desc.mip_levels == 0 || desc.array_layers == 0 {
            bail!("texture <{}> needs at least one mip level and one array layer", desc.name);
        }
        if desc.is_cube && desc.array_layers % 6 != 0 {
            bail!("cube texture <{}> has {} layers", desc.name, desc.array_layers);
        }

        if desc.mip_levels > desc.max_mip_levels() {
            bail!("texture <{}> has {} mip levels, at most {}", desc.name, desc.mip_levels, desc.max_mip_levels());
        }
        let count = desc.subresource_count().with_context(|| format!("texture <{}> has too many subresources", desc.name))?;

        let mut subresources = Vec::with_capacity(count as usize);
        for _layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                let extent = desc.mip_extent(mip);
                let surface = surface_info(desc.format, extent.width, extent.height)
                    .with_context(|| format!("texture <{}> has unsupported format {:?}", desc.name, desc.format))?;
                let size = surface.num_bytes.saturating_mul(extent.depth as u64);
                if size > self.limits.max_allocation_size {
                    bail!("texture <{}> mip {} needs {} bytes, over the allocation limit", desc.name, mip, size);
                }
                subresources.push(vec![0u8; size as usize]);
            }
        }

        let handle = self.lock().textures.insert(HostTexture {
            desc: desc.clone(),
            states: vec![ResourceState::UNDEFINED; subresources.len()],
            subresources,
        });
        log::trace!("host texture <{}> created: {:?}", desc.name, desc.extent);
        Ok(handle)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        if self.lock().textures.remove(texture).is_none() {
            log::warn!("destroy an unknown texture: {:?}", texture);
        }
    }

    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.lock().textures.get(texture).map(|t| t.desc.clone())
    }

    fn create_fence(&self, signaled: bool) -> anyhow::Result<FenceHandle> {
        Ok(self.lock().fences.insert(signaled))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.lock().fences.remove(fence);
    }

    fn fence_status(&self, fence: FenceHandle) -> anyhow::Result<FenceStatus> {
        match self.lock().fences.get(fence) {
            Some(true) => Ok(FenceStatus::Complete),
            Some(false) => Ok(FenceStatus::Incomplete),
            None => bail!("query status of a destroyed fence"),
        }
    }

    fn wait_fence(&self, fence: FenceHandle) -> anyhow::Result<()> {
        let _span = tracy_client::span!("HostDevice::wait_fence");
        let mut state = self.lock();
        loop {
            match state.fences.get(fence).copied() {
                Some(true) => return Ok(()),
                Some(false) => {
                    let (guard, timeout) = self
                        .shared
                        .cond
                        .wait_timeout(state, Self::FENCE_TIMEOUT)
                        .unwrap_or_else(PoisonError::into_inner);
                    if timeout.timed_out() {
                        bail!("fence wait timed out after {:?}", Self::FENCE_TIMEOUT);
                    }
                    state = guard;
                }
                None => bail!("wait on a destroyed fence"),
            }
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> anyhow::Result<()> {
        let mut state = self.lock();
        let signaled = state.fences.get_mut(fence).context("reset a destroyed fence")?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&self) -> anyhow::Result<SemaphoreHandle> {
        Ok(self.lock().semaphores.insert(HostSemaphore::Binary { signaled: false }))
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> anyhow::Result<SemaphoreHandle> {
        Ok(self.lock().semaphores.insert(HostSemaphore::Timeline { value: initial_value }))
    }

    fn semaphore_value(&self, semaphore: SemaphoreHandle) -> anyhow::Result<u64> {
        match self.lock().semaphores.get(semaphore) {
            Some(HostSemaphore::Timeline { value }) => Ok(*value),
            Some(HostSemaphore::Binary { .. }) => bail!("query the value of a binary semaphore"),
            None => bail!("query a destroyed semaphore"),
        }
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.lock().semaphores.remove(semaphore);
    }

    fn create_command_pool(&self, queue: QueueType) -> anyhow::Result<CommandPoolHandle> {
        Ok(self.lock().command_pools.insert(HostCommandPool {
            queue,
            command_buffers: Vec::new(),
        }))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.lock();
        if let Some(pool) = state.command_pools.remove(pool) {
            for cmd in pool.command_buffers {
                state.command_buffers.remove(cmd);
            }
        }
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> anyhow::Result<()> {
        let mut state = self.lock();
        let HostState {
            command_pools,
            command_buffers,
            ..
        } = &mut *state;
        let pool = command_pools.get(pool).context("reset a destroyed command pool")?;
        for cmd in &pool.command_buffers {
            if let Some(cb) = command_buffers.get_mut(*cmd) {
                cb.state = CommandBufferState::Initial;
                cb.commands.clear();
            }
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> anyhow::Result<CommandBufferHandle> {
        let mut state = self.lock();
        if !state.command_pools.contains_key(pool) {
            bail!("allocate from a destroyed command pool");
        }
        let cmd = state.command_buffers.insert(HostCommandBuffer {
            pool,
            state: CommandBufferState::Initial,
            commands: Vec::new(),
        });
        if let Some(pool) = state.command_pools.get_mut(pool) {
            pool.command_buffers.push(cmd);
        }
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> anyhow::Result<()> {
        let mut state = self.lock();
        let cb = state.command_buffers.get_mut(cmd).context("begin a destroyed command buffer")?;
        if cb.state == CommandBufferState::Recording {
            bail!("command buffer is already recording");
        }
        cb.state = CommandBufferState::Recording;
        cb.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> anyhow::Result<()> {
        let mut state = self.lock();
        let cb = state.command_buffers.get_mut(cmd).context("end a destroyed command buffer")?;
        if cb.state != CommandBufferState::Recording {
            bail!("end a command buffer in {:?} state", cb.state);
        }
        cb.state = CommandBufferState::Executable;
        Ok(())
    }

    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, region: BufferCopyRegion) {
        self.record(cmd, HostCommand::CopyBuffer { src, dst, region });
    }

    fn cmd_copy_buffer_to_texture(&self, cmd: CommandBufferHandle, copy: &BufferTextureCopy) {
        self.record(cmd, HostCommand::CopyBufferToTexture(*copy));
    }

    fn cmd_copy_texture_to_buffer(&self, cmd: CommandBufferHandle, copy: &BufferTextureCopy) {
        self.record(cmd, HostCommand::CopyTextureToBuffer(*copy));
    }

    fn cmd_resource_barrier(
        &self,
        cmd: CommandBufferHandle,
        buffer_barriers: &[BufferBarrier],
        texture_barriers: &[TextureBarrier],
    ) {
        self.record(
            cmd,
            HostCommand::Barrier {
                buffers: buffer_barriers.to_vec(),
                textures: texture_barriers.to_vec(),
            },
        );
    }

    fn queue_submit(&self, queue: QueueType, submit: &SubmitDesc) -> anyhow::Result<()> {
        let _span = tracy_client::span!("HostDevice::queue_submit");
        let sender = self.queues[queue_index(queue)]
            .sender
            .as_ref()
            .with_context(|| format!("{queue:?} queue of <{}> is not available", self.name))?;

        let mut state = self.lock();
        let mut commands = Vec::new();
        for &cmd in submit.command_buffers {
            let cb = state.command_buffers.get(cmd).context("submit a destroyed command buffer")?;
            if cb.state != CommandBufferState::Executable {
                bail!("submit a command buffer in {:?} state", cb.state);
            }
            let pool_queue = state.command_pools.get(cb.pool).map(|p| p.queue);
            if pool_queue != Some(queue) {
                bail!("command buffer allocated for {:?} submitted to {:?}", pool_queue, queue);
            }
            commands.extend(cb.commands.iter().cloned());
        }
        if let Some(fence) = submit.fence {
            match state.fences.get(fence) {
                Some(false) => {}
                Some(true) => bail!("submit with a fence that is already signaled"),
                None => bail!("submit with a destroyed fence"),
            }
        }

        state.queue_pending[queue_index(queue)] += 1;
        // 持锁发送，保证多个线程提交到同一个队列时顺序和 pending 计数一致
        let sent = sender.send(HostSubmission {
            commands,
            wait_semaphores: submit.wait_semaphores.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });
        if sent.is_err() {
            state.queue_pending[queue_index(queue)] -= 1;
            bail!("{queue:?} queue timeline of <{}> has stopped", self.name);
        }
        drop(state);

        self.submit_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn wait_idle(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        while state.queue_pending.iter().any(|pending| *pending > 0) {
            state = self.shared.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        for queue in &mut self.queues {
            // sender drop 之后 timeline 线程会执行完剩余的 submit 再退出
            queue.sender.take();
            if let Some(thread) = queue.thread.take() {
                if thread.join().is_err() {
                    log::error!("host timeline thread of <{}> panicked", self.name);
                }
            }
        }

        let leaked = self.live_objects();
        if leaked.total() > 0 {
            log::warn!("host device <{}> dropped with live objects: {:?}", self.name, leaked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::TextureSubresource;
    use crate::desc::MemoryUsage;

    fn device() -> Arc<HostDevice> {
        truvis_crate_tools::init_log::init_log();
        HostDevice::new(HostDeviceDesc::default())
    }

    fn submit_and_wait(device: &HostDevice, pool: CommandPoolHandle, record: impl FnOnce(CommandBufferHandle)) {
        let cmd = device.allocate_command_buffer(pool).unwrap();
        let fence = device.create_fence(false).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        record(cmd);
        device.end_command_buffer(cmd).unwrap();
        device
            .queue_submit(
                QueueType::Transfer,
                &SubmitDesc {
                    command_buffers: &[cmd],
                    fence: Some(fence),
                    ..Default::default()
                },
            )
            .unwrap();
        device.wait_fence(fence).unwrap();
        device.destroy_fence(fence);
    }

    #[test]
    fn test_buffer_copy() {
        let device = device();
        let src = device.create_buffer(&BufferDesc::upload(16, "src")).unwrap();
        let dst = device
            .create_buffer(&BufferDesc::new(16, vk::BufferUsageFlags::TRANSFER_DST, MemoryUsage::GpuOnly, "dst"))
            .unwrap();
        assert!(device.mapped_ptr(dst).is_none());

        let ptr = device.mapped_ptr(src).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr(), 4) };

        let pool = device.create_command_pool(QueueType::Transfer).unwrap();
        submit_and_wait(&device, pool, |cmd| {
            device.cmd_copy_buffer(
                cmd,
                src,
                dst,
                BufferCopyRegion {
                    src_offset: 0,
                    dst_offset: 4,
                    size: 4,
                },
            );
        });

        assert_eq!(device.read_buffer(dst, 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(device.submit_count(), 1);
        assert_eq!(device.validation_errors(), 0);

        device.destroy_command_pool(pool);
        device.destroy_buffer(src);
        device.destroy_buffer(dst);
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn test_texture_copy_requires_copy_dest() {
        let device = device();
        let texture = device.create_texture(&TextureDesc::new_2d(2, 2, vk::Format::R8G8B8A8_UNORM, "tex")).unwrap();
        let staging = device.create_buffer(&BufferDesc::upload(64, "staging")).unwrap();
        let pool = device.create_command_pool(QueueType::Transfer).unwrap();
        let copy = BufferTextureCopy {
            buffer: staging,
            buffer_offset: 0,
            row_pitch: 16,
            slice_pitch: 32,
            texture,
            mip_level: 0,
            array_layer: 0,
            extent: vk::Extent3D {
                width: 2,
                height: 2,
                depth: 1,
            },
        };

        // 没有 barrier，直接拷贝
        submit_and_wait(&device, pool, |cmd| device.cmd_copy_buffer_to_texture(cmd, &copy));
        assert_eq!(device.validation_errors(), 1);

        submit_and_wait(&device, pool, |cmd| {
            device.cmd_resource_barrier(
                cmd,
                &[],
                &[TextureBarrier {
                    texture,
                    src_state: ResourceState::UNDEFINED,
                    dst_state: ResourceState::COPY_DEST,
                    subresource: Some(TextureSubresource {
                        mip_level: 0,
                        array_layer: 0,
                    }),
                }],
            );
            device.cmd_copy_buffer_to_texture(cmd, &copy);
        });
        assert_eq!(device.validation_errors(), 1);
        assert_eq!(device.texture_state(texture, 0, 0), Some(ResourceState::COPY_DEST));

        device.destroy_command_pool(pool);
        device.destroy_buffer(staging);
        device.destroy_texture(texture);
    }

    #[test]
    fn test_semaphore_chains_queues() {
        let device = HostDevice::new(HostDeviceDesc {
            execution_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let semaphore = device.create_semaphore().unwrap();
        let transfer_fence = device.create_fence(false).unwrap();
        let graphics_fence = device.create_fence(false).unwrap();

        device
            .queue_submit(
                QueueType::Transfer,
                &SubmitDesc {
                    signal_semaphores: &[SemaphoreSubmit::binary(semaphore)],
                    fence: Some(transfer_fence),
                    ..Default::default()
                },
            )
            .unwrap();
        device
            .queue_submit(
                QueueType::Graphics,
                &SubmitDesc {
                    wait_semaphores: &[SemaphoreSubmit::binary(semaphore)],
                    fence: Some(graphics_fence),
                    ..Default::default()
                },
            )
            .unwrap();

        device.wait_fence(graphics_fence).unwrap();
        assert_eq!(device.fence_status(transfer_fence).unwrap(), FenceStatus::Complete);
        device.wait_idle().unwrap();

        device.destroy_semaphore(semaphore);
        device.destroy_fence(transfer_fence);
        device.destroy_fence(graphics_fence);
    }

    #[test]
    fn test_binary_semaphore_signaled_twice() {
        let device = device();
        let semaphore = device.create_semaphore().unwrap();
        let signal = [SemaphoreSubmit::binary(semaphore)];
        for _ in 0..2 {
            device
                .queue_submit(
                    QueueType::Transfer,
                    &SubmitDesc {
                        signal_semaphores: &signal,
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        device.wait_idle().unwrap();
        // 第二次 signal 之前没有人等待过
        assert_eq!(device.validation_errors(), 1);
        assert!(device.semaphore_value(semaphore).is_err());
        device.destroy_semaphore(semaphore);
    }

    #[test]
    fn test_timeline_semaphore() {
        let device = HostDevice::new(HostDeviceDesc {
            execution_delay: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        let timeline = device.create_timeline_semaphore(0).unwrap();
        let graphics_fence = device.create_fence(false).unwrap();

        // 没有人等待也可以连续 signal
        for value in 1..=3 {
            device
                .queue_submit(
                    QueueType::Transfer,
                    &SubmitDesc {
                        signal_semaphores: &[SemaphoreSubmit::timeline(timeline, value)],
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        device
            .queue_submit(
                QueueType::Graphics,
                &SubmitDesc {
                    wait_semaphores: &[SemaphoreSubmit::timeline(timeline, 3)],
                    fence: Some(graphics_fence),
                    ..Default::default()
                },
            )
            .unwrap();
        device.wait_fence(graphics_fence).unwrap();
        assert_eq!(device.semaphore_value(timeline).unwrap(), 3);

        // 值没有递增
        device
            .queue_submit(
                QueueType::Transfer,
                &SubmitDesc {
                    signal_semaphores: &[SemaphoreSubmit::timeline(timeline, 2)],
                    ..Default::default()
                },
            )
            .unwrap();
        device.wait_idle().unwrap();
        assert_eq!(device.validation_errors(), 1);
        assert_eq!(device.semaphore_value(timeline).unwrap(), 3);

        device.destroy_semaphore(timeline);
        device.destroy_fence(graphics_fence);
    }

    #[test]
    fn test_max_allocation_size() {
        let device = HostDevice::new(HostDeviceDesc {
            limits: DeviceLimits {
                max_allocation_size: 1024,
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(device.create_buffer(&BufferDesc::upload(2048, "too-big")).is_err());
        assert_eq!(device.live_objects().buffers, 0);
    }
}
