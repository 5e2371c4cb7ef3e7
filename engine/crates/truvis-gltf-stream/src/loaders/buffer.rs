use url::Url;

use crate::bytes::SharedBytes;
use crate::cache::ResourceCache;
use crate::cache_key::{BufferSource, embedded_buffer_key, external_buffer_key};
use crate::error::LoadError;
use crate::frame::FrameState;
use crate::io::{IoPoll, IoTask};
use crate::loaders::{LoaderCore, ResourceLoader};
use crate::state::LoaderState;

/// 原始字节 buffer
///
/// - 嵌入模式：字节已经在内存中，`load()` 中同步进入 Ready
/// - 外部模式：在 IO 线程上 fetch，完成后进入 Ready
pub struct BufferLoader {
    core: LoaderCore,
    source: BufferSource,
    /// 只在嵌入模式且尚未 load 时存在
    embedded: Option<SharedBytes>,
    fetch: Option<IoTask<anyhow::Result<Vec<u8>>>>,
    bytes: Option<SharedBytes>,
}
// new & init
impl BufferLoader {
    pub fn embedded(parent: Url, index: usize, bytes: SharedBytes) -> Self {
        Self {
            core: LoaderCore::new(embedded_buffer_key(&parent, index)),
            source: BufferSource::Embedded { parent, index },
            embedded: Some(bytes),
            fetch: None,
            bytes: None,
        }
    }

    pub fn external(uri: Url) -> Self {
        Self {
            core: LoaderCore::new(external_buffer_key(&uri)),
            source: BufferSource::External(uri),
            embedded: None,
            fetch: None,
            bytes: None,
        }
    }
}
// getters
impl BufferLoader {
    #[inline]
    pub fn source(&self) -> &BufferSource {
        &self.source
    }

    /// Ready 之后可用
    #[inline]
    pub fn bytes(&self) -> Option<&SharedBytes> {
        self.bytes.as_ref()
    }
}
// tools
impl BufferLoader {
    fn poll_fetch(&mut self) {
        let Some(task) = &self.fetch else {
            return;
        };
        let BufferSource::External(uri) = &self.source else {
            return;
        };

        let result = match task.poll() {
            IoPoll::Pending => return,
            IoPoll::Ready(result) => result.map_err(|e| LoadError::fetch(uri, &e)),
            IoPoll::Lost => Err(LoadError::FetchFailure {
                uri: uri.to_string(),
                reason: "io worker dropped the request".to_string(),
            }),
        };
        self.fetch = None;

        match result {
            Ok(bytes) => {
                log::info!("Fetched {} bytes from {}", bytes.len(), uri);
                if self.core.transition(LoaderState::Ready) {
                    self.bytes = Some(SharedBytes::new(bytes));
                }
            }
            Err(e) => {
                let context = format!("Failed to load external buffer: {uri}");
                self.core.fail(e, context);
            }
        }
    }
}

impl ResourceLoader for BufferLoader {
    fn core(&self) -> &LoaderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LoaderCore {
        &mut self.core
    }

    fn load(&mut self, cache: &mut ResourceCache) {
        if !self.core.transition(LoaderState::Loading) {
            return;
        }

        match &self.source {
            BufferSource::Embedded { .. } => {
                self.bytes = self.embedded.take();
                self.core.transition(LoaderState::Ready);
            }
            BufferSource::External(uri) => {
                let fetcher = cache.fetcher().clone();
                let uri = uri.clone();
                self.fetch = Some(cache.io().spawn(move || fetcher.fetch(&uri)));
                // inline 模式下结果已经就绪
                self.poll_fetch();
            }
        }
    }

    fn process(&mut self, _cache: &mut ResourceCache, _frame: &mut FrameState) {
        if self.core.state() == LoaderState::Loading {
            self.poll_fetch();
        }
    }

    fn unload(&mut self, _cache: &mut ResourceCache) {
        // 丢弃 receiver，之后到达的 fetch 结果会被丢弃
        self.fetch = None;
        self.bytes = None;
        self.embedded = None;
        self.core.reset();
    }
}
