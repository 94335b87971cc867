//! 资源加载器的公开接口
//!
//! 所有方法都可以在任意线程调用，返回的 [`SyncToken`] 用来查询或等待请求完成。
//! 请求按照提交的顺序在 streamer 上执行，同一个 device 上后提交的请求不会先于之前的请求执行。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::Context;
use ash::vk;
use scopeguard::ScopeGuard;
use truvis_gfx::commands::{SemaphoreSubmit, TextureBarrier};
use truvis_gfx::device::GfxDevice;
use truvis_gfx::handles::{BufferHandle, TextureHandle};
use truvis_gfx::state::ResourceState;

use crate::containers::TextureImage;
use crate::copy_engine::CopyEngine;
use crate::desc::{
    BufferBarrierDesc, BufferLoadDesc, BufferUpdateDesc, GeometryLoadDesc, ResourceLoaderDesc, TextureBarrierDesc,
    TextureCopyDesc, TextureCreateDesc, TextureLoadDesc, TextureUpdateDesc,
};
use crate::fs::{FileSystem, StdFileSystem};
use crate::geometry::Geometry;
use crate::handlers::texture::{CopyFootprint, texture_copy_footprint};
use crate::request::{BufferSource, TextureSource, UpdateRequest};
use crate::resource::{LoadedTexture, PendingResource};
use crate::staging::{MappedMemoryRange, allocate_overflow};
use crate::streamer::{LoaderStats, Streamer, StreamerShared};
use crate::token::SyncToken;

/// 同一时刻只允许存在一个资源加载器
static LOADER_ALIVE: AtomicBool = AtomicBool::new(false);

/// 一次进行中的 buffer 更新，写完之后交给 [`ResourceLoader::end_update_buffer`]
///
/// 目标 buffer 是 host visible 时直接写入目标 buffer，否则写入一个专用的上传 buffer。
/// 没有交还给 `end_update_buffer` 的更新会泄漏上传 buffer。
pub struct BufferUpdate {
    desc: BufferUpdateDesc,
    range: MappedMemoryRange,
    /// None 表示直接写入目标 buffer
    upload: Option<BufferHandle>,
}

impl BufferUpdate {
    #[inline]
    pub fn desc(&self) -> &BufferUpdateDesc {
        &self.desc
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.upload.is_none()
    }

    /// 大小为 `desc.size` 的可写内存
    #[inline]
    pub fn mapped_data(&mut self) -> &mut [u8] {
        self.range.as_mut_slice()
    }
}

/// 一次进行中的 texture subresource 更新
///
/// 内存布局由 [`CopyFootprint`] 描述：每一行 block 占 `row_pitch` 字节，
/// 只有前 `row_bytes` 字节有意义。
pub struct TextureUpdate {
    desc: TextureUpdateDesc,
    footprint: CopyFootprint,
    range: MappedMemoryRange,
    upload: BufferHandle,
}

impl TextureUpdate {
    #[inline]
    pub fn desc(&self) -> &TextureUpdateDesc {
        &self.desc
    }

    #[inline]
    pub fn footprint(&self) -> &CopyFootprint {
        &self.footprint
    }

    #[inline]
    pub fn row_pitch(&self) -> u32 {
        self.footprint.row_pitch
    }

    #[inline]
    pub fn row_count(&self) -> u32 {
        self.footprint.num_rows
    }

    #[inline]
    pub fn mapped_data(&mut self) -> &mut [u8] {
        self.range.as_mut_slice()
    }

    /// 第 `slice` 个 depth slice 的第 `row` 行 block，长度为 `row_bytes`
    pub fn row_mut(&mut self, slice: u32, row: u32) -> &mut [u8] {
        assert!(slice < self.footprint.depth && row < self.footprint.num_rows, "row {row} slice {slice} out of range");
        let start = slice as usize * self.footprint.slice_pitch as usize + row as usize * self.footprint.row_pitch as usize;
        let row_bytes = self.footprint.row_bytes as usize;
        &mut self.range.as_mut_slice()[start..start + row_bytes]
    }
}

/// 锁住单线程模式的 streamer
///
/// 上一次执行中 panic 过的 streamer 状态不完整，在这里放弃并返回 None。
fn lock_inline(streamer: &Mutex<Option<Streamer>>) -> MutexGuard<'_, Option<Streamer>> {
    match streamer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            let mut guard = poisoned.into_inner();
            if let Some(streamer) = guard.take() {
                log::error!("resource streamer panicked on the caller thread");
                streamer.abandon();
            }
            guard
        }
    }
}

enum StreamerMode {
    Thread(Option<JoinHandle<()>>),
    /// 每次 API 调用结束时，在调用者线程上执行一轮
    Inline(Mutex<Option<Streamer>>),
}

pub struct ResourceLoader {
    desc: ResourceLoaderDesc,
    devices: Vec<Arc<dyn GfxDevice>>,
    shared: Arc<StreamerShared>,
    streamer: StreamerMode,
}

// new & init
impl ResourceLoader {
    /// 以 `assets/` 为根目录读取文件
    pub fn new(devices: Vec<Arc<dyn GfxDevice>>, desc: ResourceLoaderDesc) -> anyhow::Result<Self> {
        Self::with_file_system(devices, desc, Arc::new(StdFileSystem::assets()))
    }

    pub fn with_file_system(
        devices: Vec<Arc<dyn GfxDevice>>,
        desc: ResourceLoaderDesc,
        fs: Arc<dyn FileSystem>,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("ResourceLoader::new");
        anyhow::ensure!(!devices.is_empty(), "resource loader needs at least one device");
        anyhow::ensure!(desc.buffer_count > 0, "buffer_count must be greater than 0");

        if LOADER_ALIVE.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            anyhow::bail!("a ResourceLoader is already alive");
        }
        let alive = scopeguard::guard((), |_| LOADER_ALIVE.store(false, Ordering::Release));

        let engines = {
            let mut engines = scopeguard::guard(Vec::with_capacity(devices.len()), |engines: Vec<CopyEngine>| {
                engines.into_iter().for_each(CopyEngine::destroy)
            });
            for (device_index, device) in devices.iter().enumerate() {
                engines.push(CopyEngine::new(device.clone(), device_index, desc.buffer_count, desc.buffer_size)?);
            }
            ScopeGuard::into_inner(engines)
        };

        let shared = Arc::new(StreamerShared::new(devices.len(), fs));
        let streamer = Streamer::new(shared.clone(), engines, desc.buffer_count as usize);
        let streamer = if desc.single_threaded {
            StreamerMode::Inline(Mutex::new(Some(streamer)))
        } else {
            let handle = std::thread::Builder::new()
                .name("resource-streamer".to_string())
                .spawn(move || streamer.run())
                .context("failed to spawn resource streamer thread")?;
            StreamerMode::Thread(Some(handle))
        };

        ScopeGuard::into_inner(alive);
        log::info!(
            "resource loader created: {} devices, {} x {} bytes staging, single threaded: {}",
            devices.len(),
            desc.buffer_count,
            desc.buffer_size,
            desc.single_threaded
        );
        Ok(Self {
            desc,
            devices,
            shared,
            streamer,
        })
    }

    /// 执行完所有已经提交的请求，等待 GPU 完成，然后销毁 streamer 持有的所有对象
    ///
    /// 可以重复调用；之后提交的请求会被直接丢弃，返回的 token 立刻完成。
    pub fn shutdown(&mut self) {
        let _span = tracy_client::span!("ResourceLoader::shutdown");
        let was_running = self.shared.run.swap(false, Ordering::AcqRel);
        self.shared.queue.wake();

        match &mut self.streamer {
            StreamerMode::Thread(handle) => {
                if let Some(handle) = handle.take()
                    && handle.join().is_err()
                {
                    log::error!("resource streamer thread panicked");
                }
            }
            StreamerMode::Inline(streamer) => {
                if let Some(streamer) = lock_inline(streamer).take() {
                    streamer.shutdown();
                }
            }
        }
        if was_running {
            log::info!("resource loader shut down, stats: {:?}", self.stats());
        }
    }
}

impl Drop for ResourceLoader {
    fn drop(&mut self) {
        self.shutdown();
        LOADER_ALIVE.store(false, Ordering::Release);
    }
}

// getters
impl ResourceLoader {
    #[inline]
    pub fn desc(&self) -> &ResourceLoaderDesc {
        &self.desc
    }

    #[inline]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    #[inline]
    pub fn stats(&self) -> LoaderStats {
        self.shared.stats.snapshot()
    }

    /// texture 第 `mip_level` 级在上传 / readback buffer 中的布局
    pub fn copy_footprint(&self, device_index: usize, texture: TextureHandle, mip_level: u32) -> Option<CopyFootprint> {
        let device = self.devices.get(device_index)?;
        texture_copy_footprint(&device.texture_desc(texture)?, mip_level, &device.limits())
    }

    fn device(&self, device_index: usize) -> anyhow::Result<&Arc<dyn GfxDevice>> {
        self.devices
            .get(device_index)
            .with_context(|| format!("device index {} is out of range, {} devices", device_index, self.devices.len()))
    }
}

// tools
impl ResourceLoader {
    /// 单线程模式下执行一轮
    fn pump(&self) {
        if let StreamerMode::Inline(streamer) = &self.streamer
            && let Some(streamer) = lock_inline(streamer).as_mut()
        {
            streamer.pump();
        }
    }

    fn enqueue(&self, device_index: usize, request: UpdateRequest, upload_buffer: Option<BufferHandle>) -> SyncToken {
        let running = self.shared.run.load(Ordering::Acquire);
        if !running || device_index >= self.devices.len() {
            log::error!(
                "{} request dropped: device index {} of {}, loader running: {}",
                request.kind(),
                device_index,
                self.devices.len(),
                running
            );
            if let (Some(buffer), Some(device)) = (upload_buffer, self.devices.get(device_index)) {
                device.destroy_buffer(buffer);
            }
            let token = self.shared.queue.issue_retired(&self.shared.tokens);
            if !running {
                // 没有 streamer 再推进水位了
                self.shared.tokens.publish_submitted(token);
            }
            return token;
        }

        let token = self.shared.queue.submit(device_index, request, upload_buffer, &self.shared.tokens);
        self.pump();
        token
    }

    /// 没有 GPU 工作的请求
    fn retire_now(&self) -> SyncToken {
        let token = self.shared.queue.issue_retired(&self.shared.tokens);
        self.pump();
        token
    }
}

// buffer
impl ResourceLoader {
    /// 开始更新 buffer 的一段区域，调用者写入 [`BufferUpdate::mapped_data`] 之后调用 `end_update_buffer`
    pub fn begin_update_buffer(&self, desc: BufferUpdateDesc) -> anyhow::Result<BufferUpdate> {
        let _span = tracy_client::span!("begin_update_buffer");
        let device = self.device(desc.device_index)?;
        let buffer_size = device.buffer_size(desc.buffer).context("update a destroyed buffer")?;
        anyhow::ensure!(
            desc.dst_offset.checked_add(desc.size).is_some_and(|end| end <= buffer_size),
            "buffer update {}+{} is out of buffer size {}",
            desc.dst_offset,
            desc.size,
            buffer_size
        );

        if device.mapped_ptr(desc.buffer).is_some() {
            let range = MappedMemoryRange::map_buffer(device.as_ref(), desc.buffer, desc.dst_offset, desc.size)?;
            return Ok(BufferUpdate {
                desc,
                range,
                upload: None,
            });
        }

        let range = allocate_overflow(device.as_ref(), desc.size, "buffer-update-upload")?;
        let upload = Some(range.buffer);
        Ok(BufferUpdate { desc, range, upload })
    }

    pub fn end_update_buffer(&self, update: BufferUpdate) -> SyncToken {
        let BufferUpdate { desc, range, upload } = update;
        match upload {
            // 数据已经在目标 buffer 中，没有 GPU 工作
            None => {
                if let Some(device) = self.devices.get(desc.device_index) {
                    device.flush_buffer(range.buffer, range.offset, range.size);
                }
                self.retire_now()
            }
            Some(upload) => self.enqueue(
                desc.device_index,
                UpdateRequest::BufferUpdate {
                    buffer: desc.buffer,
                    dst_offset: desc.dst_offset,
                    size: desc.size,
                    source: BufferSource::Upload {
                        buffer: upload,
                        offset: 0,
                    },
                },
                Some(upload),
            ),
        }
    }

    /// 用 `data` 更新 buffer 的一段区域，数据会由 streamer 写入 staging
    ///
    /// `data` 的长度需要等于 `desc.size`，否则请求无效
    pub fn update_buffer(&self, desc: BufferUpdateDesc, data: impl Into<Vec<u8>>) -> SyncToken {
        self.enqueue(
            desc.device_index,
            UpdateRequest::BufferUpdate {
                buffer: desc.buffer,
                dst_offset: desc.dst_offset,
                size: desc.size,
                source: BufferSource::Bytes(data.into()),
            },
            None,
        )
    }

    /// 创建 buffer 并写入可选的初始数据
    ///
    /// host visible 的 buffer 在返回之前就已经写好，不产生 GPU 工作
    pub fn add_buffer(&self, desc: BufferLoadDesc) -> anyhow::Result<(BufferHandle, SyncToken)> {
        let _span = tracy_client::span!("add_buffer");
        let BufferLoadDesc {
            desc: mut buffer_desc,
            data,
            device_index,
        } = desc;
        let device = self.device(device_index)?;
        if let Some(data) = &data {
            anyhow::ensure!(
                data.len() as vk::DeviceSize <= buffer_desc.size,
                "buffer <{}> has {} bytes, initial data has {}",
                buffer_desc.name,
                buffer_desc.size,
                data.len()
            );
            if !buffer_desc.memory.is_host_visible() {
                buffer_desc.usage |= vk::BufferUsageFlags::TRANSFER_DST;
            }
        }

        let buffer = scopeguard::guard(device.create_buffer(&buffer_desc)?, |b| device.destroy_buffer(b));
        let Some(data) = data else {
            return Ok((ScopeGuard::into_inner(buffer), SyncToken::NONE));
        };

        if device.mapped_ptr(*buffer).is_some() {
            let size = data.len() as vk::DeviceSize;
            let mut range = MappedMemoryRange::map_buffer(device.as_ref(), *buffer, 0, size)?;
            range.write(0, &data);
            device.flush_buffer(*buffer, 0, size);
            return Ok((ScopeGuard::into_inner(buffer), self.retire_now()));
        }

        let buffer = ScopeGuard::into_inner(buffer);
        let token = self.enqueue(
            device_index,
            UpdateRequest::BufferUpdate {
                buffer,
                dst_offset: 0,
                size: data.len() as vk::DeviceSize,
                source: BufferSource::Bytes(data),
            },
            None,
        );
        Ok((buffer, token))
    }

    /// 立刻销毁。调用者需要保证之前涉及这个 buffer 的 token 都已经完成
    pub fn remove_buffer(&self, device_index: usize, buffer: BufferHandle) {
        if let Some(device) = self.devices.get(device_index) {
            device.destroy_buffer(buffer);
        }
    }

    pub fn barrier_buffer(&self, desc: BufferBarrierDesc) -> SyncToken {
        self.enqueue(desc.device_index, UpdateRequest::BufferBarrier(desc.barriers), None)
    }
}

// texture
impl ResourceLoader {
    /// 开始更新 texture 的一个 subresource，按照 [`TextureUpdate::footprint`] 的布局写入
    pub fn begin_update_texture(&self, desc: TextureUpdateDesc) -> anyhow::Result<TextureUpdate> {
        let _span = tracy_client::span!("begin_update_texture");
        let device = self.device(desc.device_index)?;
        let texture_desc = device.texture_desc(desc.texture).context("update a destroyed texture")?;
        anyhow::ensure!(
            desc.mip_level < texture_desc.mip_levels && desc.array_layer < texture_desc.array_layers,
            "texture <{}> has no subresource mip {} layer {}",
            texture_desc.name,
            desc.mip_level,
            desc.array_layer
        );
        let footprint = texture_copy_footprint(&texture_desc, desc.mip_level, &device.limits())
            .with_context(|| format!("texture <{}> has unsupported format {:?}", texture_desc.name, texture_desc.format))?;

        let range = allocate_overflow(device.as_ref(), footprint.size(), "texture-update-upload")?;
        let upload = range.buffer;
        Ok(TextureUpdate {
            desc,
            footprint,
            range,
            upload,
        })
    }

    pub fn end_update_texture(&self, update: TextureUpdate) -> SyncToken {
        let TextureUpdate {
            desc, footprint, upload, ..
        } = update;
        self.enqueue(
            desc.device_index,
            UpdateRequest::TextureUpdate {
                texture: desc.texture,
                current_state: desc.current_state,
                source: TextureSource::Upload {
                    buffer: upload,
                    offset: 0,
                    row_pitch: footprint.row_pitch,
                    slice_pitch: footprint.slice_pitch,
                    mip_level: desc.mip_level,
                    array_layer: desc.array_layer,
                },
            },
            Some(upload),
        )
    }

    /// 从文件加载 texture
    ///
    /// 文件在 streamer 上读取和解析，token 完成之后结果可用；
    /// 文件不存在或者格式不支持时 token 同样会完成，但结果为空
    pub fn add_texture(&self, desc: TextureLoadDesc) -> (PendingResource<LoadedTexture>, SyncToken) {
        let target = PendingResource::new();
        let device_index = desc.device_index;
        let token = self.enqueue(
            device_index,
            UpdateRequest::TextureLoad {
                desc,
                target: target.clone(),
            },
            None,
        );
        (target, token)
    }

    /// 按描述创建 texture，并写入可选的初始数据
    ///
    /// 完成之后 texture 处于 SHADER_RESOURCE 状态
    pub fn add_texture_from_desc(&self, desc: TextureCreateDesc) -> anyhow::Result<(TextureHandle, SyncToken)> {
        let _span = tracy_client::span!("add_texture_from_desc");
        let TextureCreateDesc {
            desc: mut texture_desc,
            data,
            device_index,
        } = desc;
        let device = self.device(device_index)?;
        if data.is_some() {
            texture_desc.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        let image = data.map(|data| TextureImage::from_tight_data(texture_desc.clone(), data)).transpose()?;
        let texture = device.create_texture(&texture_desc)?;

        let request = match image {
            Some(image) => UpdateRequest::TextureUpdate {
                texture,
                current_state: ResourceState::UNDEFINED,
                source: TextureSource::Image(image),
            },
            None => UpdateRequest::TextureBarrier(vec![TextureBarrier::whole(
                texture,
                ResourceState::UNDEFINED,
                ResourceState::SHADER_RESOURCE,
            )]),
        };
        Ok((texture, self.enqueue(device_index, request, None)))
    }

    /// 立刻销毁。调用者需要保证之前涉及这个 texture 的 token 都已经完成
    pub fn remove_texture(&self, device_index: usize, texture: TextureHandle) {
        if let Some(device) = self.devices.get(device_index) {
            device.destroy_texture(texture);
        }
    }

    pub fn barrier_texture(&self, desc: TextureBarrierDesc) -> SyncToken {
        self.enqueue(desc.device_index, UpdateRequest::TextureBarrier(desc.barriers), None)
    }

    /// 把 texture 的一个 subresource 拷贝到 buffer，布局见 [`ResourceLoader::copy_footprint`]
    ///
    /// token 完成之后 CPU 才能读取 buffer
    pub fn copy_texture_to_buffer(&self, desc: TextureCopyDesc) -> SyncToken {
        self.enqueue(desc.device_index, UpdateRequest::TextureCopy(desc), None)
    }
}

// geometry
impl ResourceLoader {
    /// 从 OBJ 文件加载几何体，按照 `desc.vertex_layout` 拆分 vertex stream
    pub fn add_geometry(&self, desc: GeometryLoadDesc) -> (PendingResource<Geometry>, SyncToken) {
        let target = PendingResource::new();
        let device_index = desc.device_index;
        let token = self.enqueue(
            device_index,
            UpdateRequest::GeometryLoad {
                desc,
                target: target.clone(),
            },
            None,
        );
        (target, token)
    }

    /// 立刻销毁所有 vertex / index buffer
    pub fn remove_geometry(&self, device_index: usize, geometry: Geometry) {
        let Some(device) = self.devices.get(device_index) else {
            return;
        };
        for buffer in geometry.vertex_buffers {
            device.destroy_buffer(buffer);
        }
        device.destroy_buffer(geometry.index_buffer);
    }
}

// token
impl ResourceLoader {
    #[inline]
    pub fn is_token_completed(&self, token: SyncToken) -> bool {
        self.shared.tokens.is_completed(token)
    }

    /// 所有 `<=` 返回值的 token 都已经完成
    #[inline]
    pub fn get_last_token_completed(&self) -> SyncToken {
        self.shared.tokens.last_completed()
    }

    pub fn wait_for_token(&self, token: SyncToken) {
        let _span = tracy_client::span!("wait_for_token");
        match &self.streamer {
            StreamerMode::Thread(_) => self.shared.tokens.wait(token),
            StreamerMode::Inline(streamer) => self.pump_until(streamer, || self.shared.tokens.is_completed(token)),
        }
    }

    /// 单线程模式下在调用者线程上推进 streamer，直到 `done` 返回 true
    fn pump_until(&self, streamer: &Mutex<Option<Streamer>>, done: impl Fn() -> bool) {
        while !done() {
            let mut streamer = lock_inline(streamer);
            match streamer.as_mut() {
                Some(streamer) => {
                    streamer.pump();
                }
                None => break,
            }
        }
    }

    #[inline]
    pub fn all_resource_loads_completed(&self) -> bool {
        self.shared.tokens.all_completed()
    }

    /// 等待到目前为止提交的所有请求完成
    pub fn wait_for_all_resource_loads(&self) {
        let _span = tracy_client::span!("wait_for_all_resource_loads");
        match &self.streamer {
            StreamerMode::Thread(_) => self.shared.tokens.wait_all(),
            StreamerMode::Inline(streamer) => {
                let target = self.shared.tokens.counter();
                self.pump_until(streamer, || self.shared.tokens.last_completed() >= target)
            }
        }
    }

    /// device 上最近一次提交的上传完成时，timeline semaphore 会到达的值
    ///
    /// graphics 队列可以等待它，也可以不等待
    #[inline]
    pub fn get_last_semaphore_completed(&self, device_index: usize) -> Option<SemaphoreSubmit> {
        self.shared.last_semaphore(device_index)
    }

    /// 单线程模式下手动执行一轮，多线程模式下什么都不做
    ///
    /// 返回这一轮是否执行了
    pub fn stream_once(&self) -> bool {
        match &self.streamer {
            StreamerMode::Thread(_) => false,
            StreamerMode::Inline(streamer) => {
                lock_inline(streamer).as_mut().is_some_and(Streamer::pump)
            }
        }
    }
}
