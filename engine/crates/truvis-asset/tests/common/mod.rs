//! 集成测试共用的工具
//!
//! 资源加载器是进程内唯一的，同一个测试二进制中的 case 需要通过 [`serial`] 串行执行。

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use truvis_asset::{ResourceLoader, ResourceLoaderDesc, StdFileSystem};
use truvis_crate_tools::resource::TruvisPath;
use truvis_gfx::desc::DeviceLimits;
use truvis_gfx::device::GfxDevice;
use truvis_gfx::host_device::{HostDevice, HostDeviceDesc};

static SERIAL: Mutex<()> = Mutex::new(());

/// 持有期间独占资源加载器
pub fn serial() -> MutexGuard<'static, ()> {
    truvis_crate_tools::init_log::init_log();
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn host_device() -> Arc<HostDevice> {
    HostDevice::new(HostDeviceDesc::default())
}

pub fn host_device_with_limits(limits: DeviceLimits) -> Arc<HostDevice> {
    HostDevice::new(HostDeviceDesc {
        limits,
        ..Default::default()
    })
}

/// 每个 case 独立的资源目录，位于 `target/tmp`
pub fn fixture_dir(case: &str) -> PathBuf {
    let dir = TruvisPath::temp_path().join(format!("truvis-asset-{}-{}", case, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_fixture(dir: &PathBuf, file_name: &str, bytes: &[u8]) {
    std::fs::write(dir.join(file_name), bytes).unwrap();
}

pub fn new_loader(device: &Arc<HostDevice>, desc: ResourceLoaderDesc, dir: &PathBuf) -> ResourceLoader {
    let devices: Vec<Arc<dyn GfxDevice>> = vec![device.clone()];
    ResourceLoader::with_file_system(devices, desc, Arc::new(StdFileSystem::new(dir.clone()))).unwrap()
}

pub fn small_staging(single_threaded: bool) -> ResourceLoaderDesc {
    ResourceLoaderDesc {
        buffer_size: 4096,
        buffer_count: 3,
        single_threaded,
    }
}

fn put(header: &mut [u8], offset: usize, value: u32) {
    header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// 非压缩 RGBA8 的 DDS 文件，`pixels` 按 layer-major 排列好所有 mip
pub fn rgba8_dds(width: u32, height: u32, mip_levels: u32, pixels: &[u8]) -> Vec<u8> {
    let mut file = vec![0u8; 128];
    put(&mut file, 0, 0x2053_4444);
    put(&mut file, 4, 124);
    put(&mut file, 12, height);
    put(&mut file, 16, width);
    put(&mut file, 28, mip_levels);
    put(&mut file, 76, 32);
    // DDPF_RGB | DDPF_ALPHAPIXELS
    put(&mut file, 80, 0x41);
    put(&mut file, 88, 32);
    put(&mut file, 92, 0xff);
    put(&mut file, 96, 0xff00);
    put(&mut file, 100, 0xff_0000);
    put(&mut file, 104, 0xff00_0000);
    file.extend_from_slice(pixels);
    file
}

/// 只有一个 mip、一个 face 的 KTX 文件，`pixels` 每行需要已经是 4 字节对齐的
pub fn single_image_ktx(gl_internal_format: u32, width: u32, height: u32, pixels: &[u8]) -> Vec<u8> {
    let mut file = vec![0xAB, 0x4B, 0x54, 0x58, 0x20, 0x31, 0x31, 0xBB, 0x0D, 0x0A, 0x1A, 0x0A];
    let fields = [0x0403_0201u32, 0, 1, 0, gl_internal_format, 0, width, height, 0, 0, 1, 1, 0];
    for field in fields {
        file.extend_from_slice(&field.to_le_bytes());
    }
    file.extend_from_slice(&(pixels.len() as u32).to_le_bytes());
    file.extend_from_slice(pixels);
    file
}

pub const QUAD_OBJ: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1
f 1/1/1 3/3/1 4/4/1
";
