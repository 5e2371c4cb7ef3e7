//! GPU 资源创建的抽象
//!
//! loader 只通过 `GpuDevice` 创建 / 销毁 buffer 和 texture。
//! `GpuBuffer` / `GpuTexture` 是 RAII 句柄：Drop 时调用 device 的 destroy，保证每个资源只销毁一次。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::error::{LoadError, LoadResult};

pub type GpuResourceId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IndexFormat {
    U8,
    U16,
    U32,
}

impl IndexFormat {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// RGBA8 texture 的描述
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// 包含 level 0
    pub mip_level_count: u32,
    pub label: String,
}

/// 渲染后端需要提供的能力
pub trait GpuDevice: Send + Sync {
    /// 不同的 context 不能共享 GPU 对象，会参与 cache key
    fn context_id(&self) -> u64;

    /// 是否支持 8 位 index（Vulkan 需要 `VK_EXT_index_type_uint8`）
    fn supports_u8_indices(&self) -> bool;

    /// mipmap 和 REPEAT wrap 是否要求 power-of-two 尺寸（WebGL1 一类的设备）
    fn requires_power_of_two_textures(&self) -> bool;

    fn create_vertex_buffer(&self, bytes: &[u8]) -> anyhow::Result<GpuResourceId>;

    fn create_index_buffer(&self, bytes: &[u8], format: IndexFormat) -> anyhow::Result<GpuResourceId>;

    /// `levels[0]` 是 base level，之后依次是更小的 mip
    fn create_texture(&self, desc: &TextureDesc, levels: &[&[u8]]) -> anyhow::Result<GpuResourceId>;

    fn destroy_buffer(&self, id: GpuResourceId);

    fn destroy_texture(&self, id: GpuResourceId);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GpuBufferUsage {
    Vertex,
    Index(IndexFormat),
}

/// GPU buffer (RAII)
pub struct GpuBuffer {
    id: GpuResourceId,
    usage: GpuBufferUsage,
    byte_length: usize,
    device: Arc<dyn GpuDevice>,
}
// new & init
impl GpuBuffer {
    pub fn create_vertex(device: &Arc<dyn GpuDevice>, bytes: &[u8]) -> LoadResult<Self> {
        let _span = tracy_client::span!("GpuBuffer::create_vertex");
        let id = device.create_vertex_buffer(bytes).map_err(|e| LoadError::gpu(&e))?;
        Ok(Self {
            id,
            usage: GpuBufferUsage::Vertex,
            byte_length: bytes.len(),
            device: device.clone(),
        })
    }

    pub fn create_index(device: &Arc<dyn GpuDevice>, bytes: &[u8], format: IndexFormat) -> LoadResult<Self> {
        let _span = tracy_client::span!("GpuBuffer::create_index");
        let id = device.create_index_buffer(bytes, format).map_err(|e| LoadError::gpu(&e))?;
        Ok(Self {
            id,
            usage: GpuBufferUsage::Index(format),
            byte_length: bytes.len(),
            device: device.clone(),
        })
    }
}
// getters
impl GpuBuffer {
    #[inline]
    pub fn id(&self) -> GpuResourceId {
        self.id
    }

    #[inline]
    pub fn usage(&self) -> GpuBufferUsage {
        self.usage
    }

    #[inline]
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }
}
impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.id);
    }
}
impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("id", &self.id)
            .field("usage", &self.usage)
            .field("byte_length", &self.byte_length)
            .finish()
    }
}

/// GPU texture (RAII)
pub struct GpuTexture {
    id: GpuResourceId,
    desc: TextureDesc,
    byte_length: usize,
    device: Arc<dyn GpuDevice>,
}
// new & init
impl GpuTexture {
    pub fn create(device: &Arc<dyn GpuDevice>, desc: TextureDesc, levels: &[&[u8]]) -> LoadResult<Self> {
        let _span = tracy_client::span!("GpuTexture::create");
        let id = device.create_texture(&desc, levels).map_err(|e| LoadError::gpu(&e))?;
        Ok(Self {
            id,
            desc,
            byte_length: levels.iter().map(|level| level.len()).sum(),
            device: device.clone(),
        })
    }
}
// getters
impl GpuTexture {
    #[inline]
    pub fn id(&self) -> GpuResourceId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }
}
impl Drop for GpuTexture {
    fn drop(&mut self) {
        self.device.destroy_texture(self.id);
    }
}
impl fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTexture")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}

/// 不连接任何图形 API 的 device
///
/// 只分配 id，并统计创建 / 销毁次数。命令行工具和测试都使用它。
pub struct HeadlessDevice {
    context_id: u64,
    supports_u8_indices: bool,
    requires_power_of_two: bool,
    fail_textures: AtomicBool,

    next_id: AtomicU64,
    vertex_buffers_created: AtomicUsize,
    index_buffers_created: AtomicUsize,
    textures_created: AtomicUsize,
    buffers_destroyed: AtomicUsize,
    textures_destroyed: AtomicUsize,
    last_index_format: std::sync::Mutex<Option<IndexFormat>>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(0)
    }
}
// new & init
impl HeadlessDevice {
    pub fn new(context_id: u64) -> Self {
        Self {
            context_id,
            supports_u8_indices: true,
            requires_power_of_two: false,
            fail_textures: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            vertex_buffers_created: AtomicUsize::new(0),
            index_buffers_created: AtomicUsize::new(0),
            textures_created: AtomicUsize::new(0),
            buffers_destroyed: AtomicUsize::new(0),
            textures_destroyed: AtomicUsize::new(0),
            last_index_format: std::sync::Mutex::new(None),
        }
    }

    /// 模拟 WebGL1 一类的设备：没有 8 位 index，NPOT texture 不能使用 mipmap / REPEAT
    pub fn webgl1_class(context_id: u64) -> Self {
        Self {
            supports_u8_indices: false,
            requires_power_of_two: true,
            ..Self::new(context_id)
        }
    }

    pub fn with_u8_indices(mut self, supported: bool) -> Self {
        self.supports_u8_indices = supported;
        self
    }

    /// 之后所有的 texture 创建都会失败
    pub fn fail_texture_creation(&self, fail: bool) {
        self.fail_textures.store(fail, Ordering::Relaxed);
    }
}
// getters
impl HeadlessDevice {
    #[inline]
    pub fn vertex_buffers_created(&self) -> usize {
        self.vertex_buffers_created.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn index_buffers_created(&self) -> usize {
        self.index_buffers_created.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn textures_created(&self) -> usize {
        self.textures_created.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buffers_destroyed(&self) -> usize {
        self.buffers_destroyed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn textures_destroyed(&self) -> usize {
        self.textures_destroyed.load(Ordering::Relaxed)
    }

    pub fn live_resources(&self) -> usize {
        self.vertex_buffers_created() + self.index_buffers_created() + self.textures_created()
            - self.buffers_destroyed()
            - self.textures_destroyed()
    }

    pub fn last_index_format(&self) -> Option<IndexFormat> {
        self.last_index_format.lock().ok().and_then(|format| *format)
    }
}
impl HeadlessDevice {
    #[inline]
    fn allocate_id(&self) -> GpuResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl GpuDevice for HeadlessDevice {
    fn context_id(&self) -> u64 {
        self.context_id
    }

    fn supports_u8_indices(&self) -> bool {
        self.supports_u8_indices
    }

    fn requires_power_of_two_textures(&self) -> bool {
        self.requires_power_of_two
    }

    fn create_vertex_buffer(&self, bytes: &[u8]) -> anyhow::Result<GpuResourceId> {
        anyhow::ensure!(!bytes.is_empty(), "vertex buffer is empty");
        self.vertex_buffers_created.fetch_add(1, Ordering::Relaxed);
        Ok(self.allocate_id())
    }

    fn create_index_buffer(&self, bytes: &[u8], format: IndexFormat) -> anyhow::Result<GpuResourceId> {
        anyhow::ensure!(
            bytes.len() % format.size() == 0,
            "{} bytes is not a whole number of {:?} indices",
            bytes.len(),
            format
        );
        if format == IndexFormat::U8 && !self.supports_u8_indices {
            anyhow::bail!("8-bit indices are not supported by this device");
        }
        if let Ok(mut last) = self.last_index_format.lock() {
            *last = Some(format);
        }
        self.index_buffers_created.fetch_add(1, Ordering::Relaxed);
        Ok(self.allocate_id())
    }

    fn create_texture(&self, desc: &TextureDesc, levels: &[&[u8]]) -> anyhow::Result<GpuResourceId> {
        if self.fail_textures.load(Ordering::Relaxed) {
            anyhow::bail!("texture creation disabled on headless device {}", self.context_id);
        }
        anyhow::ensure!(
            levels.len() == desc.mip_level_count as usize,
            "expected {} mip levels, got {}",
            desc.mip_level_count,
            levels.len()
        );
        let base_size = desc.width as usize * desc.height as usize * 4;
        anyhow::ensure!(
            levels.first().map(|level| level.len()) == Some(base_size),
            "base level of {} does not match {}x{} RGBA8",
            desc.label,
            desc.width,
            desc.height
        );
        self.textures_created.fetch_add(1, Ordering::Relaxed);
        Ok(self.allocate_id())
    }

    fn destroy_buffer(&self, _id: GpuResourceId) {
        self.buffers_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn destroy_texture(&self, _id: GpuResourceId) {
        self.textures_destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_destroyed_on_drop() {
        crate::test_utils::init_test_env();
        let headless = Arc::new(HeadlessDevice::new(3));
        let device: Arc<dyn GpuDevice> = headless.clone();

        let buffer = GpuBuffer::create_vertex(&device, &[0; 36]).unwrap();
        assert_eq!(buffer.byte_length(), 36);
        assert_eq!(headless.live_resources(), 1);

        drop(buffer);
        assert_eq!(headless.buffers_destroyed(), 1);
        assert_eq!(headless.live_resources(), 0);
    }

    #[test]
    fn test_u8_indices_rejected_without_support() {
        crate::test_utils::init_test_env();
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::webgl1_class(0));
        let err = GpuBuffer::create_index(&device, &[0, 1, 2], IndexFormat::U8).unwrap_err();
        assert_eq!(err.kind(), crate::error::LoadErrorKind::Gpu);
    }

    #[test]
    fn test_texture_failure_switch() {
        crate::test_utils::init_test_env();
        let headless = Arc::new(HeadlessDevice::new(0));
        let device: Arc<dyn GpuDevice> = headless.clone();
        let desc = TextureDesc {
            width: 1,
            height: 1,
            mip_level_count: 1,
            label: "pixel".to_string(),
        };

        let texture = GpuTexture::create(&device, desc.clone(), &[&[255; 4]]).unwrap();
        assert_eq!(texture.byte_length(), 4);

        headless.fail_texture_creation(true);
        assert!(GpuTexture::create(&device, desc, &[&[255; 4]]).is_err());
        assert_eq!(headless.textures_created(), 1);
    }
}
