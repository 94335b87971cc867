//! 异步 GPU 资源流式加载
//!
//! 任意线程都可以提交上传请求（buffer / texture 更新，从文件加载 texture 和几何体，
//! barrier，texture readback），请求由一个 streamer 线程批量录制到 transfer 队列上。
//!
//! - 每个 device 有若干轮转使用的 resource set，每个 set 自带 staging ring、command buffer 和 fence
//! - 每个请求都会分配一个 [`SyncToken`]，可以轮询或者阻塞等待它完成
//! - 单线程模式下不创建 streamer 线程，每次 API 调用都会在调用者线程上推进一轮
//!
//! ```ignore
//! let loader = ResourceLoader::new(vec![device.clone()], ResourceLoaderDesc::default())?;
//! let (texture, token) = loader.add_texture(TextureLoadDesc::new("sky.dds"));
//! loader.wait_for_token(token);
//! let texture = texture.take();
//! ```

mod containers;
mod copy_engine;
mod handlers;
mod request;
mod request_queue;
mod staging;
mod streamer;

pub mod desc;
pub mod fs;
pub mod geometry;
pub mod loader;
pub mod resource;
pub mod token;

pub use containers::svt::{VirtualPage, VirtualTextureInfo};
pub use desc::*;
pub use fs::{FileSystem, ResourceDirectory, StdFileSystem};
pub use geometry::{DrawIndexedArgs, Geometry, GeometryLoadFlags, GeometryShadow, VertexLayout};
pub use handlers::texture::{CopyFootprint, texture_copy_footprint};
pub use loader::{BufferUpdate, ResourceLoader, TextureUpdate};
pub use resource::{LoadedTexture, PendingResource};
pub use staging::MappedMemoryRange;
pub use streamer::LoaderStats;
pub use token::SyncToken;
