//! GPU 设备抽象层
//!
//! 资源加载器只通过 [`device::GfxDevice`] 与 GPU 交互，所有 GPU 对象都以
//! slotmap 的强类型 handle 表示。提供两个实现：
//! - [`vulkan_device::VulkanDevice`]：基于 ash + vk-mem，device 由外部创建
//! - [`host_device::HostDevice`]：纯 CPU 的实现，用 timeline 线程模拟队列执行，主要用于测试

pub mod commands;
pub mod desc;
pub mod device;
pub mod format;
pub mod handles;
pub mod host_device;
pub mod state;
pub mod vulkan_device;
