//! 所有 loader 共用的状态机
//!
//! 每个 loader 都是一个被轮询的状态机：
//! - `load()` 只调用一次，发起请求（子 loader / IO）
//! - `process()` 每帧调用，推进状态；到达 Ready / Failed 之后是 no-op
//! - `unload()` 通过 cache 释放子 loader，丢弃数据，回到 Unloaded
//! - `destroy()` = `unload()` + destroyed 标记；destroyed 之后不会再写入状态
//!
//! 子 loader 的 handle 只能通过 `ResourceCache::unload` 释放。

pub mod buffer;
pub mod buffer_view;
pub mod gltf_json;
pub mod image;
pub mod index_buffer;
pub mod texture;
pub mod vertex_buffer;

use crate::cache::ResourceCache;
use crate::error::LoadError;
use crate::frame::FrameState;
use crate::job_scheduler::JobType;
use crate::state::LoaderState;

pub use buffer::BufferLoader;
pub use buffer_view::{BufferViewLoader, BufferViewRequest};
pub use gltf_json::{GltfJsonLoader, GltfJsonRequest};
pub use image::{ImageLoader, ImageRequest};
pub use index_buffer::{IndexBufferLoader, IndexBufferRequest};
pub use texture::{TextureLoader, TextureRequest};
pub use vertex_buffer::{VertexBufferLoader, VertexBufferRequest};

/// 每个 loader 都持有一份，负责状态流转和错误记录
#[derive(Debug)]
pub struct LoaderCore {
    cache_key: String,
    state: LoaderState,
    error: Option<LoadError>,
    destroyed: bool,
}
// new & init
impl LoaderCore {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            state: LoaderState::Unloaded,
            error: None,
            destroyed: false,
        }
    }
}
// getters
impl LoaderCore {
    #[inline]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    #[inline]
    pub fn state(&self) -> LoaderState {
        self.state
    }

    #[inline]
    pub fn error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}
// update
impl LoaderCore {
    /// 向前推进状态
    ///
    /// destroyed 之后、或者不是向前推进时返回 false，状态不变。
    pub fn transition(&mut self, next: LoaderState) -> bool {
        if self.destroyed {
            return false;
        }
        if next.rank() <= self.state.rank() {
            log::warn!(
                "Ignored state transition {:?} -> {:?} for {}",
                self.state,
                next,
                self.cache_key
            );
            return false;
        }
        self.state = next;
        true
    }

    /// 进入 Failed，并在错误外面包一层上下文
    pub fn fail(&mut self, error: LoadError, context: impl Into<String>) {
        if !self.transition(LoaderState::Failed) {
            return;
        }
        let error = error.context(context);
        log::error!("{}: {}", self.cache_key, error.chain());
        self.error = Some(error);
    }

    /// `unload()` 使用：回到 Unloaded，清除错误
    pub fn reset(&mut self) {
        self.state = LoaderState::Unloaded;
        self.error = None;
    }

    pub fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }
}

/// 所有 loader 的公共接口
pub trait ResourceLoader {
    fn core(&self) -> &LoaderCore;

    fn core_mut(&mut self) -> &mut LoaderCore;

    /// 发起加载，只调用一次
    fn load(&mut self, cache: &mut ResourceCache);

    /// 每帧调用，推进加载；已经结束时为 no-op
    fn process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState);

    /// 释放子 loader，丢弃数据；可以多次调用
    fn unload(&mut self, cache: &mut ResourceCache);

    fn destroy(&mut self, cache: &mut ResourceCache) {
        self.unload(cache);
        self.core_mut().mark_destroyed();
    }

    #[inline]
    fn cache_key(&self) -> &str {
        self.core().cache_key()
    }

    #[inline]
    fn state(&self) -> LoaderState {
        self.core().state()
    }

    #[inline]
    fn error(&self) -> Option<&LoadError> {
        self.core().error()
    }

    #[inline]
    fn is_destroyed(&self) -> bool {
        self.core().is_destroyed()
    }
}

/// cache 中保存的 loader，构造时就确定了种类
pub enum Loader {
    Buffer(BufferLoader),
    BufferView(BufferViewLoader),
    VertexBuffer(VertexBufferLoader),
    IndexBuffer(IndexBufferLoader),
    Image(ImageLoader),
    Texture(TextureLoader),
    GltfJson(GltfJsonLoader),
}

impl Loader {
    fn as_dyn(&self) -> &dyn ResourceLoader {
        match self {
            Self::Buffer(loader) => loader,
            Self::BufferView(loader) => loader,
            Self::VertexBuffer(loader) => loader,
            Self::IndexBuffer(loader) => loader,
            Self::Image(loader) => loader,
            Self::Texture(loader) => loader,
            Self::GltfJson(loader) => loader,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn ResourceLoader {
        match self {
            Self::Buffer(loader) => loader,
            Self::BufferView(loader) => loader,
            Self::VertexBuffer(loader) => loader,
            Self::IndexBuffer(loader) => loader,
            Self::Image(loader) => loader,
            Self::Texture(loader) => loader,
            Self::GltfJson(loader) => loader,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::BufferView(_) => "buffer-view",
            Self::VertexBuffer(_) => "vertex-buffer",
            Self::IndexBuffer(_) => "index-buffer",
            Self::Image(_) => "image",
            Self::Texture(_) => "texture",
            Self::GltfJson(_) => "gltf",
        }
    }
}

impl ResourceLoader for Loader {
    fn core(&self) -> &LoaderCore {
        self.as_dyn().core()
    }

    fn core_mut(&mut self) -> &mut LoaderCore {
        self.as_dyn_mut().core_mut()
    }

    fn load(&mut self, cache: &mut ResourceCache) {
        self.as_dyn_mut().load(cache)
    }

    fn process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        self.as_dyn_mut().process(cache, frame)
    }

    fn unload(&mut self, cache: &mut ResourceCache) {
        self.as_dyn_mut().unload(cache)
    }

    fn destroy(&mut self, cache: &mut ResourceCache) {
        self.as_dyn_mut().destroy(cache)
    }
}

macro_rules! impl_loader_from {
    ($($variant:ident => $loader:ty),* $(,)?) => {
        $(
            impl From<$loader> for Loader {
                fn from(loader: $loader) -> Self {
                    Self::$variant(loader)
                }
            }
        )*
    };
}

impl_loader_from! {
    Buffer => BufferLoader,
    BufferView => BufferViewLoader,
    VertexBuffer => VertexBufferLoader,
    IndexBuffer => IndexBufferLoader,
    Image => ImageLoader,
    Texture => TextureLoader,
    GltfJson => GltfJsonLoader,
}

/// 执行一次 GPU 资源创建
///
/// 按帧切片时交给 JobScheduler，预算不足返回 None，下一帧重试；否则直接执行。
pub(crate) fn run_gpu_job<T>(
    frame: &mut FrameState,
    time_sliced: bool,
    job_type: JobType,
    job: impl FnOnce() -> T,
) -> Option<T> {
    if !time_sliced {
        return Some(job());
    }

    let mut output = None;
    frame.job_scheduler_mut().execute(job_type, || output = Some(job()));
    output
}
