use crate::accessor::ViewDesc;
use crate::bytes::SharedBytes;
use crate::cache::{LoaderHandle, ResourceCache};
use crate::cache_key::BufferSource;
use crate::error::LoadError;
use crate::frame::FrameState;
use crate::loaders::{LoaderCore, ResourceLoader};
use crate::state::LoaderState;

#[derive(Clone, Debug)]
pub struct BufferViewRequest {
    pub source: BufferSource,
    pub view: ViewDesc,
    /// bufferView 上声明了 `EXT_meshopt_compression`
    pub meshopt: bool,
}

/// 从 buffer 中切出 `[byteOffset, byteOffset + byteLength)`，不拷贝
pub struct BufferViewLoader {
    core: LoaderCore,
    request: BufferViewRequest,
    buffer: Option<LoaderHandle>,
    bytes: Option<SharedBytes>,
}
// new & init
impl BufferViewLoader {
    pub fn new(cache_key: String, request: BufferViewRequest) -> Self {
        Self {
            core: LoaderCore::new(cache_key),
            request,
            buffer: None,
            bytes: None,
        }
    }
}
// getters
impl BufferViewLoader {
    #[inline]
    pub fn view(&self) -> &ViewDesc {
        &self.request.view
    }

    /// Ready 之后可用
    #[inline]
    pub fn bytes(&self) -> Option<&SharedBytes> {
        self.bytes.as_ref()
    }
}
// tools
impl BufferViewLoader {
    fn fail(&mut self, cache: &mut ResourceCache, error: LoadError) {
        self.release_buffer(cache);
        let context = format!("Failed to load buffer view: {}", self.core.cache_key());
        self.core.fail(error, context);
    }

    fn release_buffer(&mut self, cache: &mut ResourceCache) {
        if let Some(handle) = self.buffer.take() {
            cache.unload(handle);
        }
    }

    /// 等待 buffer 就绪，然后切片
    fn advance(&mut self, cache: &mut ResourceCache) {
        let Some(buffer) = self.buffer else {
            return;
        };

        match cache.state(buffer) {
            LoaderState::Ready => {}
            LoaderState::Failed => {
                let error = cache
                    .error(buffer)
                    .cloned()
                    .unwrap_or_else(|| LoadError::malformed("buffer failed without an error"));
                self.fail(cache, error);
                return;
            }
            _ => return,
        }

        let sliced = cache
            .buffer(buffer)
            .and_then(|loader| loader.bytes())
            .ok_or_else(|| LoadError::malformed("ready buffer has no bytes"))
            .and_then(|bytes| bytes.slice(self.request.view.byte_offset, self.request.view.byte_length));
        let bytes = match sliced {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(cache, e);
                return;
            }
        };

        if self.request.meshopt {
            self.core.transition(LoaderState::Processing);
            self.fail(cache, LoadError::not_implemented("EXT_meshopt_compression decoding"));
            return;
        }

        if self.core.transition(LoaderState::Ready) {
            self.bytes = Some(bytes);
        }
    }
}

impl ResourceLoader for BufferViewLoader {
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
        match cache.acquire_buffer(&self.request.source) {
            Ok(handle) => {
                self.buffer = Some(handle);
                self.advance(cache);
            }
            Err(e) => self.fail(cache, e),
        }
    }

    fn process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        if self.core.state() != LoaderState::Loading {
            return;
        }
        if let Some(buffer) = self.buffer {
            cache.process(buffer, frame);
        }
        self.advance(cache);
    }

    fn unload(&mut self, cache: &mut ResourceCache) {
        self.release_buffer(cache);
        self.bytes = None;
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadErrorKind;
    use crate::test_utils::{TestContext, file_url};

    fn view(byte_offset: usize, byte_length: usize) -> ViewDesc {
        ViewDesc {
            byte_offset,
            byte_length,
            byte_stride: None,
        }
    }

    #[test]
    fn test_slice_shares_buffer_memory() {
        let mut ctx = TestContext::new();
        let parent = file_url("/a.glb");
        let buffer = ctx
            .cache
            .load_embedded_buffer(&parent, 0, SharedBytes::new((0u8..64).collect()));

        let handle = ctx.cache.load_buffer_view(BufferViewRequest {
            source: BufferSource::Embedded { parent, index: 0 },
            view: view(16, 8),
            meshopt: false,
        });

        assert_eq!(ctx.cache.state(handle), LoaderState::Ready);
        let bytes = ctx.cache.buffer_view(handle).unwrap().bytes().unwrap();
        assert_eq!(bytes.as_slice(), &[16, 17, 18, 19, 20, 21, 22, 23]);
        let parent_bytes = ctx.cache.buffer(buffer).unwrap().bytes().unwrap();
        assert!(bytes.shares_allocation_with(parent_bytes));
        assert_eq!(ctx.cache.reference_count(buffer), 2);

        ctx.cache.unload(handle);
        assert_eq!(ctx.cache.reference_count(buffer), 1);
        ctx.cache.unload(buffer);
        assert!(ctx.cache.is_empty());
    }

    #[test]
    fn test_out_of_range_is_malformed_and_releases_buffer() {
        let mut ctx = TestContext::new();
        let parent = file_url("/a.glb");
        let buffer = ctx.cache.load_embedded_buffer(&parent, 0, SharedBytes::new(vec![0; 10]));

        let handle = ctx.cache.load_buffer_view(BufferViewRequest {
            source: BufferSource::Embedded { parent, index: 0 },
            view: view(8, 8),
            meshopt: false,
        });

        assert_eq!(ctx.cache.state(handle), LoaderState::Failed);
        assert_eq!(ctx.cache.error(handle).unwrap().kind(), LoadErrorKind::MalformedAsset);
        assert_eq!(ctx.cache.reference_count(buffer), 1);
    }

    #[test]
    fn test_meshopt_is_not_implemented() {
        let mut ctx = TestContext::new();
        let parent = file_url("/a.glb");
        ctx.cache.load_embedded_buffer(&parent, 0, SharedBytes::new(vec![0; 10]));

        let handle = ctx.cache.load_buffer_view(BufferViewRequest {
            source: BufferSource::Embedded { parent, index: 0 },
            view: view(0, 10),
            meshopt: true,
        });

        assert_eq!(ctx.cache.error(handle).unwrap().kind(), LoadErrorKind::NotImplemented);
    }

    #[test]
    fn test_external_buffer_is_fetched_once_for_two_views() {
        let mut ctx = TestContext::new();
        let uri = file_url("/shared.bin");
        ctx.fetcher.insert(&uri, vec![1; 32]);

        let first = ctx.cache.load_buffer_view(BufferViewRequest {
            source: BufferSource::External(uri.clone()),
            view: view(0, 16),
            meshopt: false,
        });
        let second = ctx.cache.load_buffer_view(BufferViewRequest {
            source: BufferSource::External(uri),
            view: view(16, 16),
            meshopt: false,
        });
        ctx.settle(first);
        ctx.settle(second);

        assert_ne!(first, second);
        assert!(ctx.cache.state(first).is_ready());
        assert!(ctx.cache.state(second).is_ready());
        assert_eq!(ctx.fetcher.fetch_count(), 1);
    }
}
