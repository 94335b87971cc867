//! 资源状态定义
//!
//! 以 bitflags 的形式描述一个资源当前被如何使用，
//! 并提供到 Vulkan 的 pipeline stage、access mask 和 image layout 的映射，
//! 用于在 transfer 队列上生成 barrier。

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// 资源状态
    ///
    /// 多个只读状态可以组合（例如 `VERTEX_AND_CONSTANT_BUFFER | INDEX_BUFFER`），
    /// 写状态应当单独使用。
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ResourceState: u32 {
        const UNDEFINED                  = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER               = 1 << 1;
        const UNORDERED_ACCESS           = 1 << 2;
        const SHADER_RESOURCE            = 1 << 3;
        const COPY_DEST                  = 1 << 4;
        const COPY_SOURCE                = 1 << 5;
        const PRESENT                    = 1 << 6;
        const COMMON                     = 1 << 7;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::SHADER_RESOURCE.bits()
            | Self::COPY_SOURCE.bits();
    }
}

// vk 映射
impl ResourceState {
    /// 该状态对应的 pipeline stage
    pub fn vk_stage(self) -> vk::PipelineStageFlags2 {
        if self.is_empty() {
            return vk::PipelineStageFlags2::TOP_OF_PIPE;
        }
        if self.intersects(Self::COMMON) {
            return vk::PipelineStageFlags2::ALL_COMMANDS;
        }

        let mut stage = vk::PipelineStageFlags2::NONE;
        if self.intersects(Self::COPY_DEST | Self::COPY_SOURCE) {
            stage |= vk::PipelineStageFlags2::TRANSFER;
        }
        if self.intersects(Self::VERTEX_AND_CONSTANT_BUFFER) {
            stage |= vk::PipelineStageFlags2::VERTEX_INPUT | vk::PipelineStageFlags2::ALL_GRAPHICS;
        }
        if self.intersects(Self::INDEX_BUFFER) {
            stage |= vk::PipelineStageFlags2::INDEX_INPUT;
        }
        if self.intersects(Self::SHADER_RESOURCE | Self::UNORDERED_ACCESS) {
            stage |= vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER;
        }
        if self.intersects(Self::PRESENT) {
            stage |= vk::PipelineStageFlags2::BOTTOM_OF_PIPE;
        }
        stage
    }

    /// 该状态对应的 access mask
    pub fn vk_access(self) -> vk::AccessFlags2 {
        if self.intersects(Self::COMMON) {
            return vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE;
        }

        let mut access = vk::AccessFlags2::NONE;
        if self.intersects(Self::COPY_DEST) {
            access |= vk::AccessFlags2::TRANSFER_WRITE;
        }
        if self.intersects(Self::COPY_SOURCE) {
            access |= vk::AccessFlags2::TRANSFER_READ;
        }
        if self.intersects(Self::VERTEX_AND_CONSTANT_BUFFER) {
            access |= vk::AccessFlags2::VERTEX_ATTRIBUTE_READ | vk::AccessFlags2::UNIFORM_READ;
        }
        if self.intersects(Self::INDEX_BUFFER) {
            access |= vk::AccessFlags2::INDEX_READ;
        }
        if self.intersects(Self::SHADER_RESOURCE) {
            access |= vk::AccessFlags2::SHADER_READ;
        }
        if self.intersects(Self::UNORDERED_ACCESS) {
            access |= vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
        }
        access
    }

    /// 该状态对应的 image layout，只对 texture 有意义
    pub fn vk_image_layout(self) -> vk::ImageLayout {
        if self.is_empty() {
            return vk::ImageLayout::UNDEFINED;
        }
        if self == Self::COPY_DEST {
            return vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        }
        if self == Self::COPY_SOURCE {
            return vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        }
        if self == Self::PRESENT {
            return vk::ImageLayout::PRESENT_SRC_KHR;
        }
        if self.intersects(Self::UNORDERED_ACCESS | Self::COMMON) {
            return vk::ImageLayout::GENERAL;
        }
        if self.intersects(Self::SHADER_RESOURCE) {
            return vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        }
        vk::ImageLayout::GENERAL
    }

    /// 是否包含写操作
    #[inline]
    pub fn is_write(self) -> bool {
        self.intersects(Self::COPY_DEST | Self::UNORDERED_ACCESS | Self::COMMON)
    }
}
