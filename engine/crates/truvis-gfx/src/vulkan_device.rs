//! 基于 ash + vk-mem 的 GfxDevice 实现
//!
//! instance / device / queue 由外部（renderer）创建，这里只负责
//! transfer 相关的资源创建和命令录制。

use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use ash::vk;
use itertools::Itertools;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::commands::{BufferBarrier, BufferCopyRegion, BufferTextureCopy, SubmitDesc, TextureBarrier};
use crate::desc::{BufferDesc, DeviceLimits, FenceStatus, MemoryUsage, QueueType, TextureDesc};
use crate::device::GfxDevice;
use crate::format::format_info;
use crate::handles::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, SemaphoreHandle, TextureHandle,
};

#[derive(Clone, Copy, Debug)]
pub struct VulkanQueueInfo {
    pub queue: vk::Queue,
    pub family_index: u32,
}

pub struct VulkanDeviceCreateInfo {
    pub name: String,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: VulkanQueueInfo,
    /// 没有独立的 transfer 队列时可以和 graphics 队列相同
    pub transfer_queue: VulkanQueueInfo,
}

struct VulkanBuffer {
    handle: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,
    /// 在创建时映射，销毁时解除映射
    mapped_ptr: Option<NonNull<u8>>,
}

struct VulkanTexture {
    handle: vk::Image,
    allocation: vk_mem::Allocation,
    desc: TextureDesc,
}

struct VulkanCommandPool {
    handle: vk::CommandPool,
    command_buffers: Vec<CommandBufferHandle>,
}

#[derive(Default)]
struct VulkanObjects {
    buffers: SlotMap<BufferHandle, VulkanBuffer>,
    textures: SlotMap<TextureHandle, VulkanTexture>,
    fences: SlotMap<FenceHandle, vk::Fence>,
    semaphores: SlotMap<SemaphoreHandle, vk::Semaphore>,
    command_pools: SlotMap<CommandPoolHandle, VulkanCommandPool>,
    command_buffers: SlotMap<CommandBufferHandle, vk::CommandBuffer>,
}

// mapped_ptr 指向持久映射的 device memory，本身可以跨线程使用
unsafe impl Send for VulkanObjects {}

pub struct VulkanDevice {
    name: String,
    limits: DeviceLimits,

    device: ash::Device,
    allocator: vk_mem::Allocator,
    graphics_queue: VulkanQueueInfo,
    transfer_queue: VulkanQueueInfo,

    objects: Mutex<VulkanObjects>,
    /// vkQueueSubmit 需要外部同步，graphics 和 transfer 可能是同一个队列，所以共用一个锁
    submit_lock: Mutex<()>,
}

// new & init
impl VulkanDevice {
    pub fn new(ci: VulkanDeviceCreateInfo) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("VulkanDevice::new");

        let allocator = unsafe {
            vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(&ci.instance, &ci.device, ci.physical_device))
                .context("create vk-mem allocator")?
        };

        let limits = Self::query_limits(&ci.instance, ci.physical_device);
        log::info!(
            "vulkan device <{}> created, transfer queue family: {}, limits: {:?}",
            ci.name,
            ci.transfer_queue.family_index,
            limits
        );

        Ok(Self {
            name: ci.name,
            limits,
            device: ci.device,
            allocator,
            graphics_queue: ci.graphics_queue,
            transfer_queue: ci.transfer_queue,
            objects: Mutex::new(VulkanObjects::default()),
            submit_lock: Mutex::new(()),
        })
    }

    fn query_limits(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> DeviceLimits {
        let mut maintenance3 = vk::PhysicalDeviceMaintenance3Properties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut maintenance3);
        unsafe { instance.get_physical_device_properties2(pdevice, &mut props2) };
        let limits = props2.properties.limits;

        DeviceLimits {
            upload_offset_alignment: limits.optimal_buffer_copy_offset_alignment.max(1),
            upload_row_pitch_alignment: limits.optimal_buffer_copy_row_pitch_alignment.max(1),
            max_allocation_size: maintenance3.max_memory_allocation_size,
        }
    }
}

// tools
impl VulkanDevice {
    #[inline]
    fn objects(&self) -> MutexGuard<'_, VulkanObjects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn queue(&self, queue: QueueType) -> VulkanQueueInfo {
        match queue {
            QueueType::Graphics => self.graphics_queue,
            QueueType::Transfer => self.transfer_queue,
        }
    }

    fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
        match format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
            vk::Format::D24_UNORM_S8_UINT => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            _ => vk::ImageAspectFlags::COLOR,
        }
    }

    /// 把以字节为单位的 row / slice pitch 转换为 vulkan 以 texel 为单位的描述
    fn buffer_image_copy(
        &self,
        objects: &VulkanObjects,
        copy: &BufferTextureCopy,
    ) -> Option<(vk::Buffer, vk::Image, vk::BufferImageCopy)> {
        let buffer = objects.buffers.get(copy.buffer)?;
        let texture = objects.textures.get(copy.texture)?;
        let info = format_info(texture.desc.format)?;

        let row_length = copy.row_pitch / info.bytes_per_block * info.block_width;
        let image_height = if copy.row_pitch == 0 {
            0
        } else {
            copy.slice_pitch / copy.row_pitch * info.block_height
        };

        let region = vk::BufferImageCopy {
            buffer_offset: copy.buffer_offset,
            buffer_row_length: row_length,
            buffer_image_height: image_height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: Self::aspect_mask(texture.desc.format),
                mip_level: copy.mip_level,
                base_array_layer: copy.array_layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: copy.extent,
        };
        Some((buffer.handle, texture.handle, region))
    }
}

impl GfxDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> anyhow::Result<BufferHandle> {
        let buffer_ci = vk::BufferCreateInfo::default().size(desc.size.max(1)).usage(desc.usage);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: match desc.memory {
                MemoryUsage::GpuOnly => vk_mem::MemoryUsage::AutoPreferDevice,
                MemoryUsage::CpuToGpu | MemoryUsage::GpuToCpu => vk_mem::MemoryUsage::AutoPreferHost,
            },
            flags: match desc.memory {
                MemoryUsage::GpuOnly => vk_mem::AllocationCreateFlags::empty(),
                MemoryUsage::CpuToGpu => vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                MemoryUsage::GpuToCpu => vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            },
            ..Default::default()
        };

        let (buffer, mut allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci) }
            .with_context(|| format!("create buffer <{}>", desc.name))?;

        let mut mapped_ptr = None;
        if desc.memory.is_host_visible() {
            match unsafe { self.allocator.map_memory(&mut allocation) } {
                Ok(ptr) => mapped_ptr = NonNull::new(ptr),
                Err(e) => {
                    unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
                    return Err(e).with_context(|| format!("map buffer <{}>", desc.name));
                }
            }
        }

        Ok(self.objects().buffers.insert(VulkanBuffer {
            handle: buffer,
            allocation,
            size: desc.size,
            mapped_ptr,
        }))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let Some(mut buffer) = self.objects().buffers.remove(buffer) else {
            log::warn!("destroy an unknown buffer: {:?}", buffer);
            return;
        };
        unsafe {
            if buffer.mapped_ptr.is_some() {
                self.allocator.unmap_memory(&mut buffer.allocation);
            }
            self.allocator.destroy_buffer(buffer.handle, &mut buffer.allocation);
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<vk::DeviceSize> {
        self.objects().buffers.get(buffer).map(|b| b.size)
    }

    fn mapped_ptr(&self, buffer: BufferHandle) -> Option<NonNull<u8>> {
        self.objects().buffers.get(buffer).and_then(|b| b.mapped_ptr)
    }

    fn flush_buffer(&self, buffer: BufferHandle, offset: vk::DeviceSize, size: vk::DeviceSize) {
        let objects = self.objects();
        if let Some(buffer) = objects.buffers.get(buffer) {
            if let Err(e) = self.allocator.flush_allocation(&buffer.allocation, offset, size) {
                log::error!("flush allocation failed: {:?}", e);
            }
        }
    }

    fn invalidate_buffer(&self, buffer: BufferHandle, offset: vk::DeviceSize, size: vk::DeviceSize) {
        let objects = self.objects();
        if let Some(buffer) = objects.buffers.get(buffer) {
            if let Err(e) = self.allocator.invalidate_allocation(&buffer.allocation, offset, size) {
                log::error!("invalidate allocation failed: {:?}", e);
            }
        }
    }

    fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle> {
        anyhow::ensure!(
            desc.mip_levels > 0 && desc.mip_levels <= desc.max_mip_levels(),
            "texture <{}> has {} mip levels, at most {}",
            desc.name,
            desc.mip_levels,
            desc.max_mip_levels()
        );
        let image_type = if desc.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let flags = if desc.is_cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_ci = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) = unsafe { self.allocator.create_image(&image_ci, &alloc_ci) }
            .with_context(|| format!("create texture <{}>", desc.name))?;

        Ok(self.objects().textures.insert(VulkanTexture {
            handle: image,
            allocation,
            desc: desc.clone(),
        }))
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let Some(mut texture) = self.objects().textures.remove(texture) else {
            log::warn!("destroy an unknown texture: {:?}", texture);
            return;
        };
        unsafe { self.allocator.destroy_image(texture.handle, &mut texture.allocation) };
    }

    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.objects().textures.get(texture).map(|t| t.desc.clone())
    }

    fn create_fence(&self, signaled: bool) -> anyhow::Result<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None)? };
        Ok(self.objects().fences.insert(fence))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if let Some(fence) = self.objects().fences.remove(fence) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn fence_status(&self, fence: FenceHandle) -> anyhow::Result<FenceStatus> {
        let fence = *self.objects().fences.get(fence).context("query status of a destroyed fence")?;
        let signaled = unsafe { self.device.get_fence_status(fence)? };
        Ok(if signaled {
            FenceStatus::Complete
        } else {
            FenceStatus::Incomplete
        })
    }

    fn wait_fence(&self, fence: FenceHandle) -> anyhow::Result<()> {
        let _span = tracy_client::span!("VulkanDevice::wait_fence");
        let fence = *self.objects().fences.get(fence).context("wait on a destroyed fence")?;
        unsafe { self.device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)? };
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> anyhow::Result<()> {
        let fence = *self.objects().fences.get(fence).context("reset a destroyed fence")?;
        unsafe { self.device.reset_fences(std::slice::from_ref(&fence))? };
        Ok(())
    }

    fn create_semaphore(&self) -> anyhow::Result<SemaphoreHandle> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        Ok(self.objects().semaphores.insert(semaphore))
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> anyhow::Result<SemaphoreHandle> {
        let mut type_ci =
            vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(initial_value);
        let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut type_ci);
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_ci, None)? };
        Ok(self.objects().semaphores.insert(semaphore))
    }

    fn semaphore_value(&self, semaphore: SemaphoreHandle) -> anyhow::Result<u64> {
        let semaphore = *self.objects().semaphores.get(semaphore).context("query a destroyed semaphore")?;
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.objects().semaphores.remove(semaphore) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_command_pool(&self, queue: QueueType) -> anyhow::Result<CommandPoolHandle> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue(queue).family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_ci, None)? };
        Ok(self.objects().command_pools.insert(VulkanCommandPool {
            handle: pool,
            command_buffers: Vec::new(),
        }))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut objects = self.objects();
        if let Some(pool) = objects.command_pools.remove(pool) {
            for cmd in pool.command_buffers {
                objects.command_buffers.remove(cmd);
            }
            unsafe { self.device.destroy_command_pool(pool.handle, None) };
        }
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> anyhow::Result<()> {
        let pool = self
            .objects()
            .command_pools
            .get(pool)
            .map(|p| p.handle)
            .context("reset a destroyed command pool")?;
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle) -> anyhow::Result<CommandBufferHandle> {
        let mut objects = self.objects();
        let pool_handle =
            objects.command_pools.get(pool).map(|p| p.handle).context("allocate from a destroyed command pool")?;
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool_handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&info)? }
            .into_iter()
            .next()
            .context("vkAllocateCommandBuffers returned no command buffer")?;

        let handle = objects.command_buffers.insert(cmd);
        if let Some(pool) = objects.command_pools.get_mut(pool) {
            pool.command_buffers.push(handle);
        }
        Ok(handle)
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> anyhow::Result<()> {
        let cmd = *self.objects().command_buffers.get(cmd).context("begin a destroyed command buffer")?;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> anyhow::Result<()> {
        let cmd = *self.objects().command_buffers.get(cmd).context("end a destroyed command buffer")?;
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, region: BufferCopyRegion) {
        let objects = self.objects();
        let (Some(cmd), Some(src), Some(dst)) =
            (objects.command_buffers.get(cmd), objects.buffers.get(src), objects.buffers.get(dst))
        else {
            log::error!("cmd_copy_buffer with destroyed objects");
            return;
        };
        let copy = vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        };
        unsafe { self.device.cmd_copy_buffer(*cmd, src.handle, dst.handle, std::slice::from_ref(&copy)) };
    }

    fn cmd_copy_buffer_to_texture(&self, cmd: CommandBufferHandle, copy: &BufferTextureCopy) {
        let objects = self.objects();
        let (Some(vk_cmd), Some((buffer, image, region))) =
            (objects.command_buffers.get(cmd).copied(), self.buffer_image_copy(&objects, copy))
        else {
            log::error!("cmd_copy_buffer_to_texture with destroyed objects");
            return;
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                vk_cmd,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            )
        };
    }

    fn cmd_copy_texture_to_buffer(&self, cmd: CommandBufferHandle, copy: &BufferTextureCopy) {
        let objects = self.objects();
        let (Some(vk_cmd), Some((buffer, image, region))) =
            (objects.command_buffers.get(cmd).copied(), self.buffer_image_copy(&objects, copy))
        else {
            log::error!("cmd_copy_texture_to_buffer with destroyed objects");
            return;
        };
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                vk_cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                buffer,
                std::slice::from_ref(&region),
            )
        };
    }

    fn cmd_resource_barrier(
        &self,
        cmd: CommandBufferHandle,
        buffer_barriers: &[BufferBarrier],
        texture_barriers: &[TextureBarrier],
    ) {
        let objects = self.objects();
        let Some(vk_cmd) = objects.command_buffers.get(cmd).copied() else {
            log::error!("cmd_resource_barrier on a destroyed command buffer");
            return;
        };

        let vk_buffer_barriers = buffer_barriers
            .iter()
            .filter_map(|barrier| {
                let buffer = objects.buffers.get(barrier.buffer)?;
                Some(
                    vk::BufferMemoryBarrier2::default()
                        .buffer(buffer.handle)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                        .src_stage_mask(barrier.src_state.vk_stage())
                        .src_access_mask(barrier.src_state.vk_access())
                        .dst_stage_mask(barrier.dst_state.vk_stage())
                        .dst_access_mask(barrier.dst_state.vk_access())
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED),
                )
            })
            .collect_vec();

        let vk_image_barriers = texture_barriers
            .iter()
            .filter_map(|barrier| {
                let texture = objects.textures.get(barrier.texture)?;
                let range = match barrier.subresource {
                    Some(sub) => vk::ImageSubresourceRange {
                        aspect_mask: Self::aspect_mask(texture.desc.format),
                        base_mip_level: sub.mip_level,
                        level_count: 1,
                        base_array_layer: sub.array_layer,
                        layer_count: 1,
                    },
                    None => vk::ImageSubresourceRange {
                        aspect_mask: Self::aspect_mask(texture.desc.format),
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    },
                };
                Some(
                    vk::ImageMemoryBarrier2::default()
                        .image(texture.handle)
                        .subresource_range(range)
                        .old_layout(barrier.src_state.vk_image_layout())
                        .new_layout(barrier.dst_state.vk_image_layout())
                        .src_stage_mask(barrier.src_state.vk_stage())
                        .src_access_mask(barrier.src_state.vk_access())
                        .dst_stage_mask(barrier.dst_state.vk_stage())
                        .dst_access_mask(barrier.dst_state.vk_access())
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED),
                )
            })
            .collect_vec();

        let dependency_info = vk::DependencyInfo::default()
            .buffer_memory_barriers(&vk_buffer_barriers)
            .image_memory_barriers(&vk_image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(vk_cmd, &dependency_info) };
    }

    fn queue_submit(&self, queue: QueueType, submit: &SubmitDesc) -> anyhow::Result<()> {
        let _span = tracy_client::span!("VulkanDevice::queue_submit");

        let (cmd_infos, wait_infos, signal_infos, fence) = {
            let objects = self.objects();
            let cmd_infos = submit
                .command_buffers
                .iter()
                .map(|cmd| objects.command_buffers.get(*cmd).copied().context("submit a destroyed command buffer"))
                .map_ok(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let wait_infos = submit
                .wait_semaphores
                .iter()
                .map(|s| objects.semaphores.get(s.semaphore).map(|vk_s| (*vk_s, s.value)).context("wait on a destroyed semaphore"))
                .map_ok(|(s, value)| {
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(s)
                        .value(value)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let signal_infos = submit
                .signal_semaphores
                .iter()
                .map(|s| objects.semaphores.get(s.semaphore).map(|vk_s| (*vk_s, s.value)).context("signal a destroyed semaphore"))
                .map_ok(|(s, value)| {
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(s)
                        .value(value)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let fence = match submit.fence {
                Some(fence) => *objects.fences.get(fence).context("submit with a destroyed fence")?,
                None => vk::Fence::null(),
            };
            (cmd_infos, wait_infos, signal_infos, fence)
        };

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&cmd_infos)
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos);

        let _guard = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe { self.device.queue_submit2(self.queue(queue).queue, std::slice::from_ref(&submit_info), fence)? };
        Ok(())
    }

    fn wait_idle(&self) -> anyhow::Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("wait idle before destroying <{}> failed: {:?}", self.name, e);
        }

        let objects = std::mem::take(&mut *self.objects());
        if objects.buffers.len() + objects.textures.len() > 0 {
            log::warn!(
                "vulkan device <{}> dropped with {} buffers and {} textures alive",
                self.name,
                objects.buffers.len(),
                objects.textures.len()
            );
        }
        unsafe {
            for (_, mut buffer) in objects.buffers {
                if buffer.mapped_ptr.is_some() {
                    self.allocator.unmap_memory(&mut buffer.allocation);
                }
                self.allocator.destroy_buffer(buffer.handle, &mut buffer.allocation);
            }
            for (_, mut texture) in objects.textures {
                self.allocator.destroy_image(texture.handle, &mut texture.allocation);
            }
            for (_, fence) in objects.fences {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in objects.semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            for (_, pool) in objects.command_pools {
                self.device.destroy_command_pool(pool.handle, None);
            }
        }
    }
}
