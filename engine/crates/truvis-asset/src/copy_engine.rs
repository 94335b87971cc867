//! 每个 device 一个 copy engine，持有若干轮转使用的 resource set
//!
//! resource set 的状态：
//! ```text
//! Idle --acquire_cmd--> Recording --flush--> Submitted --wait_and_reset--> Idle
//! ```
//! 一个 resource set 只会在 ring 转回到它的时候才被等待和重置。

use std::sync::Arc;

use ash::vk;
use scopeguard::ScopeGuard;
use truvis_gfx::commands::{SemaphoreSubmit, SubmitDesc};
use truvis_gfx::desc::{FenceStatus, QueueType};
use truvis_gfx::device::GfxDevice;
use truvis_gfx::handles::{BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, SemaphoreHandle};

use crate::staging::{MappedMemoryRange, StagingPath, StagingRing, allocate_overflow};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResourceSetState {
    /// fence 已经 signal，或者从未使用过
    Idle,
    /// command buffer 正在录制
    Recording,
    /// 已经提交，等待 GPU 执行完成
    Submitted,
}

pub(crate) struct CopyResourceSet {
    fence: FenceHandle,
    command_pool: CommandPoolHandle,
    cmd: CommandBufferHandle,
    staging: StagingRing,
    /// staging ring 放不下时创建的临时 buffer，以及请求自带的上传 buffer
    temp_buffers: Vec<BufferHandle>,
    state: ResourceSetState,
}

impl CopyResourceSet {
    fn new(device: &dyn GfxDevice, buffer_size: vk::DeviceSize, name: &str) -> anyhow::Result<Self> {
        // 中途失败时销毁已经创建的对象
        let fence = scopeguard::guard(device.create_fence(true)?, |f| device.destroy_fence(f));
        let command_pool =
            scopeguard::guard(device.create_command_pool(QueueType::Transfer)?, |p| device.destroy_command_pool(p));
        let cmd = device.allocate_command_buffer(*command_pool)?;
        let staging = StagingRing::new(device, buffer_size, &format!("{name}-staging"))?;

        Ok(Self {
            fence: ScopeGuard::into_inner(fence),
            command_pool: ScopeGuard::into_inner(command_pool),
            cmd,
            staging,
            temp_buffers: Vec::new(),
            state: ResourceSetState::Idle,
        })
    }

    fn destroy(self, device: &dyn GfxDevice) {
        for buffer in self.temp_buffers {
            device.destroy_buffer(buffer);
        }
        self.staging.destroy(device);
        device.destroy_command_pool(self.command_pool);
        device.destroy_fence(self.fence);
    }
}

pub(crate) struct CopyEngine {
    device: Arc<dyn GfxDevice>,
    device_index: usize,
    sets: Vec<CopyResourceSet>,
    active: usize,
    is_recording: bool,
    /// 每次提交 signal 一个递增的值，等待方不需要每次都等待
    timeline: SemaphoreHandle,
    timeline_value: u64,
    /// 下一次提交需要等待的 semaphore
    pending_waits: Vec<SemaphoreSubmit>,
}

// new & init
impl CopyEngine {
    pub fn new(
        device: Arc<dyn GfxDevice>,
        device_index: usize,
        buffer_count: u32,
        buffer_size: vk::DeviceSize,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("CopyEngine::new");
        anyhow::ensure!(buffer_count > 0, "copy engine needs at least one resource set");

        let timeline = scopeguard::guard(device.create_timeline_semaphore(0)?, |s| device.destroy_semaphore(s));
        let sets = {
            let device = device.as_ref();
            let mut sets = scopeguard::guard(Vec::with_capacity(buffer_count as usize), |sets: Vec<CopyResourceSet>| {
                sets.into_iter().for_each(|set| set.destroy(device))
            });
            for i in 0..buffer_count {
                let name = format!("copy-engine-{device_index}-{i}");
                sets.push(CopyResourceSet::new(device, buffer_size, &name)?);
            }
            ScopeGuard::into_inner(sets)
        };

        log::info!(
            "copy engine created on <{}>: {} resource sets, {} bytes staging each",
            device.name(),
            buffer_count,
            buffer_size
        );

        let timeline = ScopeGuard::into_inner(timeline);
        Ok(Self {
            device,
            device_index,
            sets,
            active: 0,
            is_recording: false,
            timeline,
            timeline_value: 0,
            pending_waits: Vec::new(),
        })
    }

    /// 等待所有 resource set 完成，并销毁所有 GPU 对象
    pub fn destroy(mut self) {
        let _span = tracy_client::span!("CopyEngine::destroy");
        if self.is_recording {
            log::warn!("copy engine {} destroyed while recording", self.device_index);
        }
        for set in &self.sets {
            if set.state == ResourceSetState::Submitted
                && let Err(e) = self.device.wait_fence(set.fence)
            {
                log::error!("failed to wait copy engine fence: {:?}", e);
            }
        }
        for set in std::mem::take(&mut self.sets) {
            set.destroy(self.device.as_ref());
        }
        self.device.destroy_semaphore(self.timeline);
    }
}

// getters
impl CopyEngine {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    #[cfg(test)]
    pub fn active_state(&self) -> ResourceSetState {
        self.sets[self.active].state
    }

    #[cfg(test)]
    pub fn temp_buffer_count(&self) -> usize {
        self.sets.iter().map(|s| s.temp_buffers.len()).sum()
    }
}

// 录制与提交
impl CopyEngine {
    /// 切换到 `slot`，如果它上一次提交的工作还没有完成则阻塞等待，之后重置
    pub fn wait_and_reset(&mut self, slot: usize) -> anyhow::Result<()> {
        let _span = tracy_client::span!("CopyEngine::wait_and_reset");
        debug_assert!(!self.is_recording, "rotate while recording");

        self.active = slot % self.sets.len();
        let set = &mut self.sets[self.active];
        if set.state == ResourceSetState::Submitted {
            // 先 peek，只有还没完成时才阻塞
            if self.device.fence_status(set.fence)? == FenceStatus::Incomplete {
                let _span = tracy_client::span!("wait copy fence");
                self.device.wait_fence(set.fence)?;
            }
        }

        for buffer in set.temp_buffers.drain(..) {
            self.device.destroy_buffer(buffer);
        }
        set.staging.reset();
        set.state = ResourceSetState::Idle;
        Ok(())
    }

    /// 获取当前 resource set 的 command buffer，同一轮中多次调用返回同一个
    pub fn acquire_cmd(&mut self) -> anyhow::Result<CommandBufferHandle> {
        let set = &mut self.sets[self.active];
        if !self.is_recording {
            self.device.reset_command_pool(set.command_pool)?;
            self.device.begin_command_buffer(set.cmd)?;
            set.state = ResourceSetState::Recording;
            self.is_recording = true;
        }
        Ok(set.cmd)
    }

    /// 分配 staging 内存：优先使用 ring，放不下时创建临时 buffer
    pub fn allocate_staging(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> anyhow::Result<(MappedMemoryRange, StagingPath)> {
        let set = &mut self.sets[self.active];
        if let Some(range) = set.staging.try_allocate(size, alignment) {
            return Ok((range, StagingPath::Ring));
        }

        log::debug!(
            "staging ring of device {} is full ({} bytes used), allocate {} bytes temp buffer",
            self.device_index,
            set.staging.allocated(),
            size
        );
        let range = allocate_overflow(self.device.as_ref(), size, "staging-overflow")?;
        set.temp_buffers.push(range.buffer);
        Ok((range, StagingPath::Overflow))
    }

    /// 交给当前 resource set 管理，resource set 被复用时销毁
    pub fn retire_buffer(&mut self, buffer: BufferHandle) {
        self.sets[self.active].temp_buffers.push(buffer);
    }

    /// 下一次提交之前需要等待 `semaphore`
    pub fn add_wait_semaphore(&mut self, semaphore: SemaphoreSubmit) {
        if !self.pending_waits.contains(&semaphore) {
            self.pending_waits.push(semaphore);
        }
    }

    /// 结束录制并提交，返回完成时 timeline semaphore 会到达的值
    pub fn flush(&mut self) -> anyhow::Result<SemaphoreSubmit> {
        let _span = tracy_client::span!("CopyEngine::flush");
        anyhow::ensure!(self.is_recording, "flush without recording");

        let set = &mut self.sets[self.active];
        self.device.end_command_buffer(set.cmd)?;
        self.is_recording = false;

        // fence 只在提交之前重置，这样没有使用过的 resource set 的 fence 一直保持 signaled
        self.device.reset_fence(set.fence)?;
        let waits = std::mem::take(&mut self.pending_waits);
        let signal = SemaphoreSubmit::timeline(self.timeline, self.timeline_value + 1);
        self.device.queue_submit(
            QueueType::Transfer,
            &SubmitDesc {
                command_buffers: std::slice::from_ref(&set.cmd),
                wait_semaphores: &waits,
                signal_semaphores: std::slice::from_ref(&signal),
                fence: Some(set.fence),
            },
        )?;
        self.timeline_value = signal.value;
        set.state = ResourceSetState::Submitted;
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use truvis_gfx::host_device::{HostDevice, HostDeviceDesc};

    use super::*;

    fn new_engine(device: &Arc<HostDevice>, buffer_size: vk::DeviceSize) -> CopyEngine {
        CopyEngine::new(device.clone(), 0, 2, buffer_size).unwrap()
    }

    #[test]
    fn test_resource_set_lifecycle() {
        let device = HostDevice::new(HostDeviceDesc::default());
        let mut engine = new_engine(&device, 256);
        engine.wait_and_reset(0).unwrap();
        assert_eq!(engine.active_state(), ResourceSetState::Idle);

        let cmd = engine.acquire_cmd().unwrap();
        assert_eq!(engine.acquire_cmd().unwrap(), cmd);
        assert_eq!(engine.active_state(), ResourceSetState::Recording);

        engine.flush().unwrap();
        assert!(!engine.is_recording());
        assert_eq!(engine.active_state(), ResourceSetState::Submitted);
        assert_eq!(device.submit_count(), 1);

        engine.wait_and_reset(0).unwrap();
        assert_eq!(engine.active_state(), ResourceSetState::Idle);
        engine.destroy();
        assert_eq!(device.live_objects().total(), 0);
        assert_eq!(device.validation_errors(), 0);
    }

    #[test]
    fn test_overflow_buffers_live_until_reuse() {
        let device = HostDevice::new(HostDeviceDesc::default());
        let mut engine = new_engine(&device, 64);
        engine.wait_and_reset(0).unwrap();

        let (_, path) = engine.allocate_staging(32, 4).unwrap();
        assert_eq!(path, StagingPath::Ring);
        let (range, path) = engine.allocate_staging(1024, 4).unwrap();
        assert_eq!(path, StagingPath::Overflow);
        assert_eq!(range.size, 1024);
        assert_eq!(engine.temp_buffer_count(), 1);

        // 切到另一个 slot 不影响之前的临时 buffer
        engine.wait_and_reset(1).unwrap();
        assert_eq!(engine.temp_buffer_count(), 1);
        engine.wait_and_reset(0).unwrap();
        assert_eq!(engine.temp_buffer_count(), 0);

        engine.destroy();
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn test_timeline_value_per_flush() {
        let device = HostDevice::new(HostDeviceDesc::default());
        let mut engine = new_engine(&device, 64);
        let mut signals = Vec::new();
        // 没有任何消费者等待，连续多轮提交
        for slot in 0..5 {
            engine.wait_and_reset(slot).unwrap();
            engine.acquire_cmd().unwrap();
            signals.push(engine.flush().unwrap());
        }
        assert!(signals.windows(2).all(|w| w[0].semaphore == w[1].semaphore && w[0].value + 1 == w[1].value));

        device.wait_idle().unwrap();
        assert_eq!(device.semaphore_value(signals[4].semaphore).unwrap(), signals[4].value);
        assert_eq!(device.validation_errors(), 0);
        engine.destroy();
        assert_eq!(device.live_objects().total(), 0);
    }

    #[test]
    fn test_flush_without_recording() {
        let device = HostDevice::new(HostDeviceDesc::default());
        let mut engine = new_engine(&device, 64);
        assert!(engine.flush().is_err());
        engine.destroy();
    }
}
