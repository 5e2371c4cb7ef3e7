use std::sync::Arc;

use crate::cache::{LoaderHandle, ResourceCache};
use crate::cache_key::ImageSource;
use crate::error::{LoadError, LoadResult};
use crate::frame::FrameState;
use crate::io::{DecodedImage, ImageDecoder, ImageFormat, IoPoll, IoTask};
use crate::loaders::{BufferViewRequest, LoaderCore, ResourceLoader};
use crate::state::LoaderState;

#[derive(Clone, Debug)]
pub struct ImageRequest {
    pub source: ImageSource,
}

/// 图片的 fetch + 解码
///
/// 嵌入图片先等待 buffer view，再把解码交给 IO 线程；外部图片的 fetch 和解码在同一个 IO job 中完成。
pub struct ImageLoader {
    core: LoaderCore,
    request: ImageRequest,
    view: Option<LoaderHandle>,
    decode: Option<IoTask<LoadResult<DecodedImage>>>,
    image: Option<Arc<DecodedImage>>,
}
// new & init
impl ImageLoader {
    pub fn new(cache_key: String, request: ImageRequest) -> Self {
        Self {
            core: LoaderCore::new(cache_key),
            request,
            view: None,
            decode: None,
            image: None,
        }
    }
}
// getters
impl ImageLoader {
    #[inline]
    pub fn source(&self) -> &ImageSource {
        &self.request.source
    }

    /// Ready 之后可用
    #[inline]
    pub fn image(&self) -> Option<&Arc<DecodedImage>> {
        self.image.as_ref()
    }
}
// tools
impl ImageLoader {
    fn fail(&mut self, cache: &mut ResourceCache, error: LoadError) {
        self.release_view(cache);
        self.decode = None;
        let context = format!("Failed to load image: {}", self.core.cache_key());
        self.core.fail(error, context);
    }

    fn release_view(&mut self, cache: &mut ResourceCache) {
        if let Some(handle) = self.view.take() {
            cache.unload(handle);
        }
    }

    /// 只接受可以解码的光栅格式
    fn check_format(format: Option<ImageFormat>, what: &str) -> LoadResult<ImageFormat> {
        match format {
            None => Err(LoadError::UnsupportedFormat(format!("unrecognized image signature in {what}"))),
            Some(ImageFormat::Ktx2) => Err(LoadError::not_implemented(format!("KTX2 image {what}"))),
            Some(format) => Ok(format),
        }
    }

    fn decode_bytes(decoder: &dyn ImageDecoder, bytes: &[u8], format: ImageFormat) -> LoadResult<DecodedImage> {
        decoder
            .decode(bytes, format)
            .map_err(|e| LoadError::malformed(format!("{e:#}")))
    }

    fn advance_view(&mut self, cache: &mut ResourceCache) {
        let Some(view) = self.view else {
            return;
        };

        match cache.state(view) {
            LoaderState::Ready => {}
            LoaderState::Failed => {
                let error = cache
                    .error(view)
                    .cloned()
                    .unwrap_or_else(|| LoadError::malformed("buffer view failed without an error"));
                self.fail(cache, error);
                return;
            }
            _ => return,
        }

        let Some(bytes) = cache.buffer_view(view).and_then(|loader| loader.bytes()).cloned() else {
            self.fail(cache, LoadError::malformed("ready buffer view has no bytes"));
            return;
        };
        let format = match Self::check_format(ImageFormat::sniff(&bytes), "buffer view") {
            Ok(format) => format,
            Err(e) => {
                self.fail(cache, e);
                return;
            }
        };

        if !self.core.transition(LoaderState::Processing) {
            return;
        }
        let decoder = cache.decoder().clone();
        self.decode = Some(
            cache
                .io()
                .spawn(move || Self::decode_bytes(decoder.as_ref(), &bytes, format)),
        );
        self.poll_decode(cache);
    }

    fn poll_decode(&mut self, cache: &mut ResourceCache) {
        let Some(task) = &self.decode else {
            return;
        };

        let result = match task.poll() {
            IoPoll::Pending => return,
            IoPoll::Ready(result) => result,
            IoPoll::Lost => Err(LoadError::malformed("io worker dropped the image request")),
        };
        self.decode = None;

        match result {
            Ok(image) => {
                log::info!(
                    "Decoded image {}x{} for {}",
                    image.width,
                    image.height,
                    self.core.cache_key()
                );
                self.release_view(cache);
                if self.core.transition(LoaderState::Ready) {
                    self.image = Some(Arc::new(image));
                }
            }
            Err(e) => self.fail(cache, e),
        }
    }
}

impl ResourceLoader for ImageLoader {
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

        match self.request.source.clone() {
            ImageSource::View { source, view } => {
                self.view = Some(cache.load_buffer_view(BufferViewRequest {
                    source,
                    view,
                    meshopt: false,
                }));
                self.advance_view(cache);
            }
            ImageSource::External(uri) => {
                if ImageFormat::from_uri_path(uri.path()) == Some(ImageFormat::Ktx2) {
                    self.fail(cache, LoadError::not_implemented(format!("KTX2 image {uri}")));
                    return;
                }

                let fetcher = cache.fetcher().clone();
                let decoder = cache.decoder().clone();
                self.decode = Some(cache.io().spawn(move || {
                    let bytes = fetcher.fetch(&uri).map_err(|e| LoadError::fetch(&uri, &e))?;
                    let format = Self::check_format(ImageFormat::sniff(&bytes), uri.as_str())?;
                    Self::decode_bytes(decoder.as_ref(), &bytes, format)
                }));
                self.poll_decode(cache);
            }
        }
    }

    fn process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        match self.core.state() {
            LoaderState::Loading => {
                if let Some(view) = self.view {
                    cache.process(view, frame);
                    self.advance_view(cache);
                } else {
                    self.poll_decode(cache);
                }
            }
            LoaderState::Processing => self.poll_decode(cache),
            _ => {}
        }
    }

    fn unload(&mut self, cache: &mut ResourceCache) {
        self.release_view(cache);
        self.decode = None;
        self.image = None;
        self.core.reset();
    }
}
