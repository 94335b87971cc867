use slotmap::new_key_type;

// 强类型句柄
// 使用 slotmap 的 generational index 机制，避免悬垂引用和资源释放后的 ID 复用问题。
// 句柄只在创建它的 GfxDevice 内有意义，本身只是一个轻量级的 ID，可以安全地 Copy/Clone。
new_key_type! {
    /// 指向一个 GPU Buffer 资源
    pub struct BufferHandle;
    /// 指向一个 GPU Texture (Image) 资源
    pub struct TextureHandle;
    /// CPU 等待 GPU 的同步对象
    pub struct FenceHandle;
    /// 队列之间的同步对象
    pub struct SemaphoreHandle;
    pub struct CommandPoolHandle;
    pub struct CommandBufferHandle;
}
