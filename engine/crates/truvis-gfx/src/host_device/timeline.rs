//! HostDevice 的队列执行
//!
//! 每个队列有一个独立的 timeline 线程，按提交顺序执行 command buffer 中录制的命令。

use std::sync::{Arc, PoisonError};
use std::thread;

use crossbeam_channel::Receiver;

use crate::commands::{BufferBarrier, BufferCopyRegion, BufferTextureCopy, SemaphoreSubmit, TextureBarrier};
use crate::desc::QueueType;
use crate::format::surface_info;
use crate::handles::{BufferHandle, FenceHandle};
use crate::host_device::memory::HostMemory;
use crate::host_device::{HostSemaphore, HostShared, HostState};
use crate::state::ResourceState;

/// 录制在 command buffer 中的命令
#[derive(Clone, Debug)]
pub(crate) enum HostCommand {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        region: BufferCopyRegion,
    },
    CopyBufferToTexture(BufferTextureCopy),
    CopyTextureToBuffer(BufferTextureCopy),
    Barrier {
        buffers: Vec<BufferBarrier>,
        textures: Vec<TextureBarrier>,
    },
}

/// 一次 queue submit 的内容，command buffer 中的命令在提交时被拷贝出来
pub(crate) struct HostSubmission {
    pub commands: Vec<HostCommand>,
    pub wait_semaphores: Vec<SemaphoreSubmit>,
    pub signal_semaphores: Vec<SemaphoreSubmit>,
    pub fence: Option<FenceHandle>,
}

pub(crate) fn queue_index(queue: QueueType) -> usize {
    match queue {
        QueueType::Graphics => 0,
        QueueType::Transfer => 1,
    }
}

pub(crate) fn run_timeline(queue: QueueType, shared: Arc<HostShared>, receiver: Receiver<HostSubmission>) {
    log::debug!("host timeline for {:?} queue started", queue);

    while let Ok(submission) = receiver.recv() {
        if let Some(delay) = shared.execution_delay {
            thread::sleep(delay);
        }

        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);

        // binary semaphore 等待之后 unsignal；timeline semaphore 等到值不小于目标值
        for wait in &submission.wait_semaphores {
            loop {
                match state.semaphores.get(wait.semaphore).copied() {
                    Some(HostSemaphore::Binary { signaled: true }) => {
                        if let Some(semaphore) = state.semaphores.get_mut(wait.semaphore) {
                            *semaphore = HostSemaphore::Binary { signaled: false };
                        }
                        break;
                    }
                    Some(HostSemaphore::Timeline { value }) if value >= wait.value => break,
                    Some(_) => {
                        state = shared.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                    }
                    None => {
                        shared.validation_error(format!("{queue:?} queue waits on a destroyed semaphore"));
                        break;
                    }
                }
            }
        }

        for command in &submission.commands {
            if let Err(msg) = state.execute(command) {
                shared.validation_error(format!("{queue:?} queue: {msg}"));
            }
        }

        for signal in &submission.signal_semaphores {
            let error = match state.semaphores.get_mut(signal.semaphore) {
                Some(HostSemaphore::Binary { signaled: true }) => {
                    Some("signals a binary semaphore that is still signaled".to_string())
                }
                Some(HostSemaphore::Binary { signaled }) => {
                    *signaled = true;
                    None
                }
                Some(HostSemaphore::Timeline { value }) if signal.value <= *value => Some(format!(
                    "signals timeline semaphore with {}, current value is {}",
                    signal.value, value
                )),
                Some(HostSemaphore::Timeline { value }) => {
                    *value = signal.value;
                    None
                }
                None => Some("signals a destroyed semaphore".to_string()),
            };
            if let Some(msg) = error {
                shared.validation_error(format!("{queue:?} queue {msg}"));
            }
        }
        if let Some(fence) = submission.fence {
            match state.fences.get_mut(fence) {
                Some(signaled) => *signaled = true,
                None => shared.validation_error(format!("{queue:?} queue signals a destroyed fence")),
            }
        }

        state.queue_pending[queue_index(queue)] -= 1;
        drop(state);
        shared.cond.notify_all();
    }

    log::debug!("host timeline for {:?} queue stopped", queue);
}

// 命令执行
impl HostState {
    fn execute(&mut self, command: &HostCommand) -> Result<(), String> {
        match command {
            HostCommand::CopyBuffer { src, dst, region } => self.copy_buffer(*src, *dst, region),
            HostCommand::CopyBufferToTexture(copy) => self.copy_buffer_to_texture(copy),
            HostCommand::CopyTextureToBuffer(copy) => self.copy_texture_to_buffer(copy),
            HostCommand::Barrier { buffers, textures } => {
                for barrier in buffers {
                    let buffer = self.buffers.get_mut(barrier.buffer).ok_or("barrier on a destroyed buffer")?;
                    buffer.state = barrier.dst_state;
                }
                textures.iter().try_for_each(|barrier| self.texture_barrier(barrier))
            }
        }
    }

    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, region: &BufferCopyRegion) -> Result<(), String> {
        let src = self.buffers.get(src).ok_or("copy from a destroyed buffer")?;
        let dst = self.buffers.get(dst).ok_or("copy into a destroyed buffer")?;
        if !src.memory.contains(region.src_offset, region.size) {
            return Err(format!("copy source range out of bounds: {region:?} in {}", src.desc.name));
        }
        if !dst.memory.contains(region.dst_offset, region.size) {
            return Err(format!("copy destination range out of bounds: {region:?} in {}", dst.desc.name));
        }
        HostMemory::copy(
            &src.memory,
            region.src_offset as usize,
            &dst.memory,
            region.dst_offset as usize,
            region.size as usize,
        );
        Ok(())
    }

    fn copy_buffer_to_texture(&mut self, copy: &BufferTextureCopy) -> Result<(), String> {
        let buffer = self.buffers.get(copy.buffer).ok_or("copy from a destroyed buffer")?;
        let texture = self.textures.get_mut(copy.texture).ok_or("copy into a destroyed texture")?;
        let index = texture.subresource_index(copy.mip_level, copy.array_layer)?;
        if texture.states[index] != ResourceState::COPY_DEST {
            return Err(format!(
                "texture {} mip {} layer {} is in {:?} while copying into it",
                texture.desc.name, copy.mip_level, copy.array_layer, texture.states[index]
            ));
        }
        let layout = texture.copy_layout(copy)?;

        let data = &mut texture.subresources[index];
        for z in 0..layout.depth {
            for row in 0..layout.num_rows {
                let src = copy.buffer_offset + z * copy.slice_pitch as u64 + row * copy.row_pitch as u64;
                if !buffer.memory.contains(src, layout.row_bytes) {
                    return Err(format!("buffer -> texture copy reads outside of {}", buffer.desc.name));
                }
                let dst = (z * layout.slice_bytes + row * layout.row_bytes) as usize;
                buffer.memory.read(src as usize, &mut data[dst..dst + layout.row_bytes as usize]);
            }
        }
        Ok(())
    }

    fn copy_texture_to_buffer(&mut self, copy: &BufferTextureCopy) -> Result<(), String> {
        let buffer = self.buffers.get(copy.buffer).ok_or("copy into a destroyed buffer")?;
        let texture = self.textures.get(copy.texture).ok_or("copy from a destroyed texture")?;
        let index = texture.subresource_index(copy.mip_level, copy.array_layer)?;
        if texture.states[index] != ResourceState::COPY_SOURCE {
            return Err(format!(
                "texture {} mip {} layer {} is in {:?} while copying from it",
                texture.desc.name, copy.mip_level, copy.array_layer, texture.states[index]
            ));
        }
        let layout = texture.copy_layout(copy)?;

        let data = &texture.subresources[index];
        for z in 0..layout.depth {
            for row in 0..layout.num_rows {
                let dst = copy.buffer_offset + z * copy.slice_pitch as u64 + row * copy.row_pitch as u64;
                if !buffer.memory.contains(dst, layout.row_bytes) {
                    return Err(format!("texture -> buffer copy writes outside of {}", buffer.desc.name));
                }
                let src = (z * layout.slice_bytes + row * layout.row_bytes) as usize;
                buffer.memory.write(dst as usize, &data[src..src + layout.row_bytes as usize]);
            }
        }
        Ok(())
    }

    fn texture_barrier(&mut self, barrier: &TextureBarrier) -> Result<(), String> {
        let texture = self.textures.get_mut(barrier.texture).ok_or("barrier on a destroyed texture")?;
        let indices: Vec<usize> = match barrier.subresource {
            Some(sub) => vec![texture.subresource_index(sub.mip_level, sub.array_layer)?],
            None => (0..texture.states.len()).collect(),
        };

        let mut mismatch = None;
        for index in indices {
            let current = texture.states[index];
            // UNDEFINED 作为 src 表示丢弃原有内容，可以从任意状态转换
            if barrier.src_state != ResourceState::UNDEFINED && current != barrier.src_state {
                mismatch = Some(current);
            }
            texture.states[index] = barrier.dst_state;
        }

        match mismatch {
            Some(current) => Err(format!(
                "texture {} barrier expects {:?} but subresource is in {:?}",
                texture.desc.name, barrier.src_state, current
            )),
            None => Ok(()),
        }
    }
}

/// 一次 buffer <-> texture 拷贝在 texture 一侧的紧密布局
pub(crate) struct CopyLayout {
    pub row_bytes: u64,
    pub num_rows: u64,
    pub slice_bytes: u64,
    pub depth: u64,
}

impl crate::host_device::HostTexture {
    fn copy_layout(&self, copy: &BufferTextureCopy) -> Result<CopyLayout, String> {
        let extent = self.desc.mip_extent(copy.mip_level);
        if extent != copy.extent {
            return Err(format!(
                "partial subresource copy is not supported: {:?} vs {:?} ({})",
                copy.extent, extent, self.desc.name
            ));
        }
        let surface = surface_info(self.desc.format, extent.width, extent.height)
            .ok_or_else(|| format!("unsupported format {:?}", self.desc.format))?;
        if (copy.row_pitch as u64) < surface.row_bytes {
            return Err(format!("row pitch {} is smaller than row size {}", copy.row_pitch, surface.row_bytes));
        }
        Ok(CopyLayout {
            row_bytes: surface.row_bytes,
            num_rows: surface.num_rows as u64,
            slice_bytes: surface.num_bytes,
            depth: extent.depth as u64,
        })
    }
}
