//! streamer 的调度、token 以及 staging 行为

mod common;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use truvis_asset::{
    BufferLoadDesc, BufferUpdateDesc, ResourceLoader, ResourceLoaderDesc, StdFileSystem, SyncToken, TextureCreateDesc,
    TextureLoadDesc, TextureUpdateDesc,
};
use truvis_gfx::desc::{BufferDesc, DeviceLimits, MemoryUsage, TextureDesc};
use truvis_gfx::device::GfxDevice;
use truvis_gfx::host_device::{HostDevice, HostDeviceDesc, HostObjectCounts};
use truvis_gfx::state::ResourceState;

use common::*;

fn gpu_buffer(size: vk::DeviceSize) -> BufferLoadDesc {
    BufferLoadDesc {
        desc: BufferDesc::new(size, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryUsage::GpuOnly, "test-buffer"),
        data: None,
        device_index: 0,
    }
}

#[test]
fn test_tokens_increase_and_watermarks_are_ordered() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("tokens");
    let loader = new_loader(&device, small_staging(false), &dir);

    let (buffer, _) = loader.add_buffer(gpu_buffer(256)).unwrap();
    let tokens: Vec<SyncToken> = (0..8u8)
        .map(|i| loader.update_buffer(BufferUpdateDesc::new(buffer, i as u64 * 16, 16), vec![i; 16]))
        .collect();
    assert!(tokens.windows(2).all(|w| w[0] < w[1]));

    loader.wait_for_token(*tokens.last().unwrap());
    assert!(tokens.iter().all(|t| loader.is_token_completed(*t)));
    assert!(loader.get_last_token_completed() >= *tokens.last().unwrap());

    loader.wait_for_all_resource_loads();
    assert!(loader.all_resource_loads_completed());
    let expected: Vec<u8> = (0..8u8).flat_map(|i| [i; 16]).collect();
    assert_eq!(device.read_buffer(buffer, 0, 128).unwrap(), expected);

    loader.remove_buffer(0, buffer);
    drop(loader);
    assert_eq!(device.validation_errors(), 0);
}

#[test]
fn test_completion_lags_one_full_rotation() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("rotation");
    let loader = new_loader(&device, small_staging(true), &dir);

    let (buffer, _) = loader.add_buffer(gpu_buffer(64)).unwrap();
    let token = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 64), vec![7u8; 64]);
    // 提交时已经执行了一轮：录制并提交，但 slot 还没有被复用
    assert!(!loader.is_token_completed(token));
    assert_eq!(loader.stats().submissions, 1);

    assert!(loader.stream_once());
    assert!(loader.stream_once());
    assert!(!loader.is_token_completed(token));
    // ring 转回到提交时的 slot，等待它的 fence 之后 token 完成
    assert!(loader.stream_once());
    assert!(loader.is_token_completed(token));
    assert_eq!(device.read_buffer(buffer, 0, 64).unwrap(), vec![7u8; 64]);

    loader.remove_buffer(0, buffer);
}

#[test]
fn test_single_threaded_runs_inline() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("inline");
    let loader = new_loader(&device, small_staging(true), &dir);
    assert_eq!(loader.stats().iterations, 0);

    let (buffer, _) = loader.add_buffer(gpu_buffer(16)).unwrap();
    let token = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 16), vec![1u8; 16]);
    assert_eq!(loader.stats().iterations, 1);

    loader.wait_for_token(token);
    assert!(loader.is_token_completed(token));
    // 全部完成之后不再空转
    assert!(!loader.stream_once());

    loader.remove_buffer(0, buffer);
}

#[test]
fn test_large_update_overflows_staging() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("overflow");
    let loader = new_loader(&device, small_staging(false), &dir);

    let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let (buffer, token) = loader
        .add_buffer(BufferLoadDesc {
            data: Some(data.clone()),
            ..gpu_buffer(data.len() as u64)
        })
        .unwrap();
    loader.wait_for_token(token);

    assert_eq!(device.read_buffer(buffer, 0, data.len()).unwrap(), data);
    let stats = loader.stats();
    assert_eq!(stats.overflow_allocations, 1);
    assert_eq!(stats.invalid_requests, 0);

    loader.remove_buffer(0, buffer);
    drop(loader);
    // 临时 buffer 跟随 resource set 一起销毁
    assert_eq!(device.live_objects().total(), 0);
}

#[test]
fn test_updates_apply_in_submission_order() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("fifo");
    let loader = new_loader(&device, small_staging(false), &dir);

    let (buffer, _) = loader.add_buffer(gpu_buffer(32)).unwrap();
    loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 32), vec![1u8; 32]);
    let last = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 32), vec![2u8; 32]);
    loader.wait_for_token(last);
    assert_eq!(device.read_buffer(buffer, 0, 32).unwrap(), vec![2u8; 32]);

    loader.remove_buffer(0, buffer);
}

#[test]
fn test_begin_end_update_through_upload_buffer() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("begin-end");
    let loader = new_loader(&device, small_staging(false), &dir);

    let (buffer, _) = loader.add_buffer(gpu_buffer(128)).unwrap();
    let mut update = loader.begin_update_buffer(BufferUpdateDesc::new(buffer, 64, 64)).unwrap();
    assert!(!update.is_direct());
    update.mapped_data().copy_from_slice(&[9u8; 64]);
    let token = loader.end_update_buffer(update);
    loader.wait_for_token(token);

    assert_eq!(device.read_buffer(buffer, 64, 64).unwrap(), vec![9u8; 64]);
    assert!(loader.begin_update_buffer(BufferUpdateDesc::new(buffer, 100, 64)).is_err());

    loader.remove_buffer(0, buffer);
    drop(loader);
    assert_eq!(device.live_objects().total(), 0);
}

#[test]
fn test_direct_mapped_update_needs_no_gpu_work() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("direct");
    let loader = new_loader(&device, small_staging(false), &dir);

    let (buffer, token) = loader
        .add_buffer(BufferLoadDesc {
            desc: BufferDesc::upload(64, "host-visible"),
            data: None,
            device_index: 0,
        })
        .unwrap();
    assert_eq!(token, SyncToken::NONE);

    let mut update = loader.begin_update_buffer(BufferUpdateDesc::new(buffer, 0, 64)).unwrap();
    assert!(update.is_direct());
    update.mapped_data().fill(5);
    let token = loader.end_update_buffer(update);
    assert!(loader.is_token_completed(token));

    loader.wait_for_all_resource_loads();
    assert_eq!(device.submit_count(), 0);
    assert_eq!(device.read_buffer(buffer, 0, 64).unwrap(), vec![5u8; 64]);

    loader.remove_buffer(0, buffer);
}

#[test]
fn test_invalid_request_retires_immediately() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("invalid");
    let loader = new_loader(&device, small_staging(false), &dir);

    let (texture, token) = loader.add_texture(TextureLoadDesc::new("missing.dds"));
    loader.wait_for_token(token);
    assert!(loader.is_token_completed(token));
    assert!(!texture.is_ready());
    assert_eq!(loader.stats().invalid_requests, 1);

    // 之后的请求不受影响
    let (buffer, _) = loader.add_buffer(gpu_buffer(16)).unwrap();
    let token = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 16), vec![3u8; 16]);
    loader.wait_for_token(token);
    assert_eq!(device.read_buffer(buffer, 0, 16).unwrap(), vec![3u8; 16]);

    // 数据长度和描述不一致
    let token = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 16), vec![3u8; 8]);
    loader.wait_for_token(token);
    assert_eq!(loader.stats().invalid_requests, 2);

    loader.remove_buffer(0, buffer);
}

#[test]
fn test_texture_update_rows() {
    let _serial = serial();
    let device = host_device_with_limits(truvis_gfx::desc::DeviceLimits {
        upload_row_pitch_alignment: 256,
        ..Default::default()
    });
    let dir = fixture_dir("texture-update");
    let loader = new_loader(&device, small_staging(false), &dir);

    let (texture, token) = loader
        .add_texture_from_desc(TextureCreateDesc {
            desc: TextureDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM, "target"),
            data: None,
            device_index: 0,
        })
        .unwrap();
    loader.wait_for_token(token);
    assert_eq!(device.texture_state(texture, 0, 0), Some(ResourceState::SHADER_RESOURCE));

    let mut update = loader
        .begin_update_texture(TextureUpdateDesc {
            current_state: ResourceState::SHADER_RESOURCE,
            ..TextureUpdateDesc::new(texture, 0, 0)
        })
        .unwrap();
    assert_eq!(update.row_pitch(), 256);
    assert_eq!(update.row_count(), 4);
    for row in 0..4 {
        update.row_mut(0, row).fill(row as u8 + 1);
    }
    let token = loader.end_update_texture(update);
    loader.wait_for_token(token);

    let expected: Vec<u8> = (0..4u8).flat_map(|row| [row + 1; 16]).collect();
    assert_eq!(device.read_texture(texture, 0, 0).unwrap(), expected);
    assert_eq!(device.texture_state(texture, 0, 0), Some(ResourceState::SHADER_RESOURCE));

    loader.remove_texture(0, texture);
    drop(loader);
    assert_eq!(device.validation_errors(), 0);
    assert_eq!(device.live_objects().total(), 0);
}

#[test]
fn test_shutdown_releases_everything() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("shutdown");
    write_fixture(&dir, "quad.obj", QUAD_OBJ.as_bytes());
    let mut loader = new_loader(&device, small_staging(false), &dir);

    let (geometry, _) = loader.add_geometry(truvis_asset::GeometryLoadDesc {
        directory: truvis_asset::ResourceDirectory::Other,
        ..truvis_asset::GeometryLoadDesc::new("quad.obj")
    });
    let (buffer, _) = loader.add_buffer(gpu_buffer(32)).unwrap();
    loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 32), vec![4u8; 32]);

    // shutdown 会先执行完所有请求
    loader.shutdown();
    assert!(loader.all_resource_loads_completed());
    assert!(loader.get_last_semaphore_completed(0).is_none());
    assert_eq!(device.read_buffer(buffer, 0, 32).unwrap(), vec![4u8; 32]);

    // 之后提交的请求直接完成
    let token = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 32), vec![0u8; 32]);
    loader.wait_for_token(token);
    assert_eq!(device.read_buffer(buffer, 0, 32).unwrap(), vec![4u8; 32]);

    loader.remove_geometry(0, geometry.take().unwrap());
    loader.remove_buffer(0, buffer);
    drop(loader);
    assert_eq!(device.live_objects().total(), 0);
    assert_eq!(device.validation_errors(), 0);
}

#[test]
fn test_only_one_loader_at_a_time() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("singleton");

    let loader = new_loader(&device, ResourceLoaderDesc::default(), &dir);
    let devices: Vec<Arc<dyn GfxDevice>> = vec![device.clone()];
    assert!(
        ResourceLoader::with_file_system(devices, ResourceLoaderDesc::default(), Arc::new(StdFileSystem::new(dir.clone())))
            .is_err()
    );
    drop(loader);

    let loader = new_loader(&device, ResourceLoaderDesc::default(), &dir);
    drop(loader);
    assert_eq!(device.live_objects().total(), 0);
}

#[test]
fn test_last_semaphore_is_published() {
    let _serial = serial();
    let device = host_device();
    let dir = fixture_dir("semaphore");
    let loader = new_loader(&device, small_staging(false), &dir);
    assert!(loader.get_last_semaphore_completed(0).is_none());
    assert!(loader.get_last_semaphore_completed(1).is_none());

    let (buffer, _) = loader.add_buffer(gpu_buffer(16)).unwrap();
    let token = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 16), vec![1u8; 16]);
    loader.wait_for_token(token);
    let first = loader.get_last_semaphore_completed(0).unwrap();

    // 没有任何队列等待这个 semaphore，连续提交也不能重复 signal 同一个值
    for i in 0..8u8 {
        let token = loader.update_buffer(BufferUpdateDesc::new(buffer, 0, 16), vec![i; 16]);
        loader.wait_for_token(token);
    }
    let last = loader.get_last_semaphore_completed(0).unwrap();
    assert_eq!(last.semaphore, first.semaphore);
    assert!(last.value > first.value);
    assert!(device.semaphore_value(last.semaphore).unwrap() >= last.value);
    assert_eq!(device.validation_errors(), 0);

    loader.remove_buffer(0, buffer);
}

#[test]
fn test_multi_device_token_waits_for_every_device() {
    let _serial = serial();
    let fast = host_device();
    let slow = HostDevice::new(HostDeviceDesc {
        name: "slow-device".to_string(),
        execution_delay: Some(Duration::from_millis(30)),
        ..Default::default()
    });
    let dir = fixture_dir("multi-device");
    let devices: Vec<Arc<dyn GfxDevice>> = vec![fast.clone(), slow.clone()];
    let loader =
        ResourceLoader::with_file_system(devices, small_staging(false), Arc::new(StdFileSystem::new(dir.clone()))).unwrap();

    let (fast_buffer, _) = loader.add_buffer(gpu_buffer(16)).unwrap();
    let (slow_buffer, _) = loader
        .add_buffer(BufferLoadDesc {
            device_index: 1,
            ..gpu_buffer(16)
        })
        .unwrap();

    // 两个 device 交替写同一块区域，各自按提交顺序执行
    let tokens: Vec<SyncToken> = (0..4u8)
        .map(|i| {
            let slow_update = BufferUpdateDesc {
                device_index: 1,
                ..BufferUpdateDesc::new(slow_buffer, 0, 16)
            };
            loader.update_buffer(slow_update, vec![i; 16]);
            loader.update_buffer(BufferUpdateDesc::new(fast_buffer, 0, 16), vec![10 + i; 16])
        })
        .collect();
    let last = *tokens.last().unwrap();

    // device 0 的 token 完成时，device 1 上之前的请求一定已经执行完
    loop {
        let completed = loader.is_token_completed(last);
        let landed = slow.read_buffer(slow_buffer, 0, 16).unwrap() == vec![3u8; 16];
        assert!(!completed || landed, "device 0 token completed before device 1 finished");
        if completed {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(fast.read_buffer(fast_buffer, 0, 16).unwrap(), vec![13u8; 16]);
    assert!(loader.get_last_semaphore_completed(0).is_some());
    assert!(loader.get_last_semaphore_completed(1).is_some());

    loader.remove_buffer(0, fast_buffer);
    loader.remove_buffer(1, slow_buffer);
    drop(loader);
    for device in [&fast, &slow] {
        assert_eq!(device.live_objects().total(), 0);
        assert_eq!(device.validation_errors(), 0);
    }
}

/// staging 放不下、临时 buffer 又超过 allocation 上限时，streamer 内部的 GPU 调用会失败
fn oversized_upload() -> TextureCreateDesc {
    TextureCreateDesc {
        desc: TextureDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM, "oversized-upload"),
        data: Some(vec![1u8; 64]),
        device_index: 0,
    }
}

#[test]
fn test_streamer_panic_does_not_hang_waiters() {
    let _serial = serial();
    for single_threaded in [false, true] {
        let device = host_device_with_limits(DeviceLimits {
            upload_row_pitch_alignment: 4096,
            max_allocation_size: 8192,
            ..Default::default()
        });
        let dir = fixture_dir("streamer-panic");
        let loader = new_loader(&device, small_staging(single_threaded), &dir);

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let (_, token) = loader.add_texture_from_desc(oversized_upload()).unwrap();
            loader.wait_for_token(token);
            token
        }));
        // 单线程模式下 panic 发生在调用者线程上
        assert_eq!(outcome.is_err(), single_threaded);
        if let Ok(token) = outcome {
            assert!(loader.is_token_completed(token));
        }

        // 之后的请求不再执行，但 token 照常完成
        let (texture, token) = loader
            .add_texture_from_desc(TextureCreateDesc {
                desc: TextureDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM, "after-panic"),
                data: None,
                device_index: 0,
            })
            .unwrap();
        loader.wait_for_token(token);
        loader.wait_for_all_resource_loads();
        assert!(loader.all_resource_loads_completed());
        assert!(loader.get_last_semaphore_completed(0).is_none());

        loader.remove_texture(0, texture);
        drop(loader);
        // 只剩下 panic 的那次请求创建的 texture
        assert_eq!(
            device.live_objects(),
            HostObjectCounts {
                textures: 1,
                ..Default::default()
            }
        );
    }
}
