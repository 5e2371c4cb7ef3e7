use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::bytes::SharedBytes;
use crate::cache_key::{self, BufferSource};
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::frame::FrameState;
use crate::io::{ByteFetcher, ImageDecoder, IoDispatcher, RasterDecoder, UriFetcher};
use crate::loaders::{
    BufferLoader, BufferViewLoader, BufferViewRequest, GltfJsonLoader, GltfJsonRequest, ImageLoader, ImageRequest,
    IndexBufferLoader, IndexBufferRequest, Loader, ResourceLoader, TextureLoader, TextureRequest, VertexBufferLoader,
    VertexBufferRequest,
};
use crate::state::LoaderState;

// 强类型句柄
// 使用 slotmap 的 generational index 机制，entry 被销毁之后旧的 handle 不会指向新的 entry。
new_key_type! { pub struct LoaderHandle; }

struct CacheEntry {
    cache_key: String,
    reference_count: usize,
    /// `load` / `process` 期间被取出，结束后放回
    loader: Option<Loader>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub hits: usize,
    pub misses: usize,
    pub live_entries: usize,
    /// Ready 的 vertex / index buffer 占用的 GPU 字节数
    pub geometry_bytes: usize,
    /// Ready 的 texture 占用的 GPU 字节数
    pub texture_bytes: usize,
}

/// cache key -> {loader, 引用计数}
///
/// 同一个 key 只会有一个 loader；引用计数归零时 destroy 并移除。
/// 所有的 `load_xxx` 都是先推导 key，命中时只增加引用计数，未命中时才构造新的 loader。
pub struct ResourceCache {
    entries: SlotMap<LoaderHandle, CacheEntry>,
    // cache key 到句柄的映射，用于去重
    handles: HashMap<String, LoaderHandle>,

    io: IoDispatcher,
    fetcher: Arc<dyn ByteFetcher>,
    decoder: Arc<dyn ImageDecoder>,

    hits: usize,
    misses: usize,
}
// new & init
impl ResourceCache {
    pub fn new(io: IoDispatcher, fetcher: Arc<dyn ByteFetcher>, decoder: Arc<dyn ImageDecoder>) -> Self {
        Self {
            entries: SlotMap::with_key(),
            handles: HashMap::new(),
            io,
            fetcher,
            decoder,
            hits: 0,
            misses: 0,
        }
    }

    /// 默认的 IO 线程池、uri fetcher 和图片解码器
    pub fn from_config(config: &LoaderConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            IoDispatcher::new(config.io_worker_threads)?,
            Arc::new(UriFetcher::new()),
            Arc::new(RasterDecoder),
        ))
    }
}
// getters
impl ResourceCache {
    #[inline]
    pub fn io(&self) -> &IoDispatcher {
        &self.io
    }

    #[inline]
    pub fn fetcher(&self) -> &Arc<dyn ByteFetcher> {
        &self.fetcher
    }

    #[inline]
    pub fn decoder(&self) -> &Arc<dyn ImageDecoder> {
        &self.decoder
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains_key(&self, cache_key: &str) -> bool {
        self.handles.contains_key(cache_key)
    }

    pub fn handle_of(&self, cache_key: &str) -> Option<LoaderHandle> {
        self.handles.get(cache_key).copied()
    }

    pub fn reference_count(&self, handle: LoaderHandle) -> usize {
        self.entries.get(handle).map_or(0, |entry| entry.reference_count)
    }

    pub fn cache_key(&self, handle: LoaderHandle) -> Option<&str> {
        self.entries.get(handle).map(|entry| entry.cache_key.as_str())
    }

    /// 正在被 `load` / `process` 的 loader 不可见
    pub fn loader(&self, handle: LoaderHandle) -> Option<&Loader> {
        self.entries.get(handle).and_then(|entry| entry.loader.as_ref())
    }

    /// 所有当前可见的 loader
    pub fn loaders(&self) -> impl Iterator<Item = &Loader> + '_ {
        self.entries.values().filter_map(|entry| entry.loader.as_ref())
    }

    /// handle 已经失效时视为 Unloaded
    pub fn state(&self, handle: LoaderHandle) -> LoaderState {
        self.loader(handle).map_or(LoaderState::Unloaded, |loader| loader.state())
    }

    pub fn error(&self, handle: LoaderHandle) -> Option<&LoadError> {
        self.loader(handle).and_then(|loader| loader.error())
    }

    pub fn statistics(&self) -> CacheStatistics {
        let mut statistics = CacheStatistics {
            hits: self.hits,
            misses: self.misses,
            live_entries: self.entries.len(),
            ..Default::default()
        };
        for loader in self.loaders() {
            match loader {
                Loader::VertexBuffer(loader) => {
                    statistics.geometry_bytes += loader.gpu_buffer().map_or(0, |buffer| buffer.byte_length());
                }
                Loader::IndexBuffer(loader) => {
                    statistics.geometry_bytes += loader.gpu_buffer().map_or(0, |buffer| buffer.byte_length());
                }
                Loader::Texture(loader) => {
                    statistics.texture_bytes += loader.texture().map_or(0, |texture| texture.byte_length());
                }
                _ => {}
            }
        }
        statistics
    }
}
macro_rules! typed_accessor {
    ($($name:ident => $variant:ident : $loader:ty),* $(,)?) => {
        $(
            pub fn $name(&self, handle: LoaderHandle) -> Option<&$loader> {
                match self.loader(handle)? {
                    Loader::$variant(loader) => Some(loader),
                    _ => None,
                }
            }
        )*
    };
}
// typed getters
impl ResourceCache {
    typed_accessor! {
        buffer => Buffer: BufferLoader,
        buffer_view => BufferView: BufferViewLoader,
        vertex_buffer => VertexBuffer: VertexBufferLoader,
        index_buffer => IndexBuffer: IndexBufferLoader,
        image => Image: ImageLoader,
        texture => Texture: TextureLoader,
        gltf_json => GltfJson: GltfJsonLoader,
    }
}
// registry
impl ResourceCache {
    /// 命中时增加引用计数并返回 handle
    pub fn get(&mut self, cache_key: &str) -> Option<LoaderHandle> {
        let handle = *self.handles.get(cache_key)?;
        let entry = self.entries.get_mut(handle)?;
        entry.reference_count += 1;
        self.hits += 1;
        Some(handle)
    }

    /// 插入新的 entry（引用计数为 1），然后调用 `loader.load()`
    ///
    /// key 已经存在是调用方的错误：新的 loader 被丢弃，返回已有的 entry（引用计数 +1）。
    pub fn load(&mut self, loader: impl Into<Loader>) -> LoaderHandle {
        let mut loader = loader.into();
        let cache_key = loader.cache_key().to_string();
        if let Some(handle) = self.get(&cache_key) {
            log::error!("Rejected duplicate {} loader for {}", loader.kind_name(), cache_key);
            return handle;
        }

        self.misses += 1;
        let handle = self.entries.insert(CacheEntry {
            cache_key: cache_key.clone(),
            reference_count: 1,
            loader: None,
        });
        self.handles.insert(cache_key, handle);

        loader.load(self);
        self.restore(handle, loader);
        handle
    }

    /// 引用计数减一；归零时 destroy 并移除
    pub fn unload(&mut self, handle: LoaderHandle) {
        let Some(entry) = self.entries.get_mut(handle) else {
            log::warn!("Unload of a stale loader handle {:?}", handle);
            return;
        };

        entry.reference_count -= 1;
        if entry.reference_count > 0 {
            return;
        }

        let Some(entry) = self.entries.remove(handle) else {
            return;
        };
        self.handles.remove(&entry.cache_key);
        log::debug!("Destroy {}", entry.cache_key);
        // 正在被 process 的 loader 会在放回时 destroy
        if let Some(mut loader) = entry.loader {
            loader.destroy(self);
        }
    }

    /// 推进一个 loader；已经结束或者正在被处理时为 no-op
    pub fn process(&mut self, handle: LoaderHandle, frame: &mut FrameState) {
        let Some(mut loader) = self.entries.get_mut(handle).and_then(|entry| entry.loader.take()) else {
            return;
        };
        if !loader.state().is_settled() {
            loader.process(self, frame);
        }
        self.restore(handle, loader);
    }

    /// 把取出的 loader 放回；entry 在此期间被移除时直接 destroy
    fn restore(&mut self, handle: LoaderHandle, mut loader: Loader) {
        match self.entries.get_mut(handle) {
            Some(entry) if entry.loader.is_none() => entry.loader = Some(loader),
            _ => loader.destroy(self),
        }
    }
}
// loadX
impl ResourceCache {
    pub fn load_external_buffer(&mut self, uri: &Url) -> LoaderHandle {
        let _span = tracy_client::span!("ResourceCache::load_external_buffer");
        let cache_key = cache_key::external_buffer_key(uri);
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        log::info!("Request external buffer: {}", uri);
        self.load(BufferLoader::external(uri.clone()))
    }

    pub fn load_embedded_buffer(&mut self, parent: &Url, index: usize, bytes: SharedBytes) -> LoaderHandle {
        let cache_key = cache_key::embedded_buffer_key(parent, index);
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        self.load(BufferLoader::embedded(parent.clone(), index, bytes))
    }

    /// 外部 buffer 按需 fetch；嵌入的 buffer 必须已经由 GltfJsonLoader 注册
    pub fn acquire_buffer(&mut self, source: &BufferSource) -> LoadResult<LoaderHandle> {
        match source {
            BufferSource::External(uri) => Ok(self.load_external_buffer(uri)),
            BufferSource::Embedded { .. } => self.get(&source.cache_key()).ok_or_else(|| {
                LoadError::malformed(format!("embedded buffer {} is not registered", source.buffer_key()))
            }),
        }
    }

    pub fn load_buffer_view(&mut self, request: BufferViewRequest) -> LoaderHandle {
        let _span = tracy_client::span!("ResourceCache::load_buffer_view");
        let cache_key = cache_key::buffer_view_key(&request.source, &request.view, request.meshopt);
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        self.load(BufferViewLoader::new(cache_key, request))
    }

    pub fn load_vertex_buffer(&mut self, request: VertexBufferRequest) -> LoaderHandle {
        let _span = tracy_client::span!("ResourceCache::load_vertex_buffer");
        let cache_key = request.cache_key();
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        log::info!("Request vertex buffer: {}", cache_key);
        self.load(VertexBufferLoader::new(cache_key, request))
    }

    pub fn load_index_buffer(&mut self, request: IndexBufferRequest) -> LoaderHandle {
        let _span = tracy_client::span!("ResourceCache::load_index_buffer");
        let cache_key = request.cache_key();
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        log::info!("Request index buffer: {}", cache_key);
        self.load(IndexBufferLoader::new(cache_key, request))
    }

    pub fn load_image(&mut self, request: ImageRequest) -> LoaderHandle {
        let _span = tracy_client::span!("ResourceCache::load_image");
        let cache_key = request.source.cache_key();
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        log::info!("Request image: {}", cache_key);
        self.load(ImageLoader::new(cache_key, request))
    }

    pub fn load_texture(&mut self, request: TextureRequest) -> LoaderHandle {
        let _span = tracy_client::span!("ResourceCache::load_texture");
        let cache_key = request.cache_key();
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        log::info!("Request texture: {}", cache_key);
        self.load(TextureLoader::new(cache_key, request))
    }

    pub fn load_gltf_json(&mut self, request: GltfJsonRequest) -> LoaderHandle {
        let _span = tracy_client::span!("ResourceCache::load_gltf_json");
        let cache_key = cache_key::gltf_key(&request.uri);
        if let Some(handle) = self.get(&cache_key) {
            return handle;
        }
        log::info!("Request glTF: {}", request.uri);
        self.load(GltfJsonLoader::new(cache_key, request))
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log::warn!("ResourceCache dropped with {} live entries", self.entries.len());
        }
    }
}
