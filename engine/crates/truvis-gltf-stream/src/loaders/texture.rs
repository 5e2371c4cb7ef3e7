use std::sync::Arc;

use image::RgbaImage;
use image::imageops::FilterType;

use crate::cache::{LoaderHandle, ResourceCache};
use crate::cache_key::{ImageSource, texture_key};
use crate::error::{LoadError, LoadResult};
use crate::frame::FrameState;
use crate::gpu::{GpuDevice, GpuTexture, TextureDesc};
use crate::io::DecodedImage;
use crate::job_scheduler::JobType;
use crate::loaders::{ImageRequest, LoaderCore, ResourceLoader, run_gpu_job};
use crate::sampler::Sampler;
use crate::state::LoaderState;

#[derive(Clone)]
pub struct TextureRequest {
    pub image: ImageSource,
    pub sampler: Sampler,
    pub device: Arc<dyn GpuDevice>,
    pub time_sliced: bool,
}

impl TextureRequest {
    pub fn cache_key(&self) -> String {
        texture_key(&self.image, &self.sampler, self.device.context_id())
    }
}

/// image + sampler -> GPU texture
///
/// 需要时先缩放到 power-of-two 并生成 mip chain，和 texture 创建一起作为一个 `Texture` job 执行。
pub struct TextureLoader {
    core: LoaderCore,
    request: TextureRequest,
    image: Option<LoaderHandle>,
    texture: Option<GpuTexture>,
}
// new & init
impl TextureLoader {
    pub fn new(cache_key: String, request: TextureRequest) -> Self {
        Self {
            core: LoaderCore::new(cache_key),
            request,
            image: None,
            texture: None,
        }
    }
}
// getters
impl TextureLoader {
    #[inline]
    pub fn sampler(&self) -> &Sampler {
        &self.request.sampler
    }

    #[inline]
    pub fn texture(&self) -> Option<&GpuTexture> {
        self.texture.as_ref()
    }
}
// tools
impl TextureLoader {
    fn fail(&mut self, cache: &mut ResourceCache, error: LoadError) {
        self.release_image(cache);
        let context = format!("Failed to load texture: {}", self.core.cache_key());
        self.core.fail(error, context);
    }

    fn release_image(&mut self, cache: &mut ResourceCache) {
        if let Some(handle) = self.image.take() {
            cache.unload(handle);
        }
    }

    fn advance_image(&mut self, cache: &mut ResourceCache) {
        let Some(image) = self.image else {
            return;
        };
        match cache.state(image) {
            LoaderState::Ready => {
                self.core.transition(LoaderState::Processing);
            }
            LoaderState::Failed => {
                let error = cache
                    .error(image)
                    .cloned()
                    .unwrap_or_else(|| LoadError::malformed("image failed without an error"));
                self.fail(cache, error);
            }
            _ => {}
        }
    }

    fn create(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        let Some(decoded) = self.image.and_then(|handle| cache.image(handle)).and_then(|loader| loader.image()).cloned()
        else {
            self.fail(cache, LoadError::malformed("ready image has no pixels"));
            return;
        };

        let device = self.request.device.clone();
        let sampler = self.request.sampler;
        let label = self.core.cache_key().to_string();
        let created = run_gpu_job(frame, self.request.time_sliced, JobType::Texture, || {
            let _span = tracy_client::span!("TextureLoader::create");
            let levels = prepare_levels(&decoded, &sampler, device.requires_power_of_two_textures())?;
            let (width, height) = levels.size;
            let level_refs: Vec<&[u8]> = levels.levels.iter().map(Vec::as_slice).collect();
            let desc = TextureDesc {
                width,
                height,
                mip_level_count: level_refs.len() as u32,
                label,
            };
            GpuTexture::create(&device, desc, &level_refs)
        });

        match created {
            None => {}
            Some(Ok(texture)) => {
                log::info!(
                    "Created texture {}x{} ({} levels) for {}",
                    texture.desc().width,
                    texture.desc().height,
                    texture.desc().mip_level_count,
                    self.core.cache_key()
                );
                self.release_image(cache);
                if self.core.transition(LoaderState::Ready) {
                    self.texture = Some(texture);
                }
            }
            Some(Err(e)) => self.fail(cache, e),
        }
    }
}

impl ResourceLoader for TextureLoader {
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
        self.image = Some(cache.load_image(ImageRequest {
            source: self.request.image.clone(),
        }));
        self.advance_image(cache);
    }

    fn process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        if self.core.state() == LoaderState::Loading {
            if let Some(image) = self.image {
                cache.process(image, frame);
            }
            self.advance_image(cache);
        }
        if self.core.state() == LoaderState::Processing {
            self.create(cache, frame);
        }
    }

    fn unload(&mut self, cache: &mut ResourceCache) {
        self.release_image(cache);
        self.texture = None;
        self.core.reset();
    }
}

/// 上传到 GPU 的各级 mip
struct TextureLevels {
    size: (u32, u32),
    levels: Vec<Vec<u8>>,
}

fn needs_power_of_two_resize(image: &DecodedImage, sampler: &Sampler, device_requires_pot: bool) -> bool {
    device_requires_pot && (sampler.requires_mipmaps() || sampler.uses_repeating_wrap()) && !image.is_power_of_two()
}

/// 计算最终上传的各级数据：按需 POT 缩放，按需生成 mip chain
fn prepare_levels(image: &DecodedImage, sampler: &Sampler, device_requires_pot: bool) -> LoadResult<TextureLevels> {
    let resize = needs_power_of_two_resize(image, sampler, device_requires_pot);
    // 缩放之后预先生成的 mip 失效
    if !resize && (image.has_mipmaps() || !sampler.requires_mipmaps()) {
        let mut levels = Vec::with_capacity(1 + image.mip_levels.len());
        levels.push(image.pixels.clone());
        if sampler.requires_mipmaps() {
            levels.extend(image.mip_levels.iter().cloned());
        }
        return Ok(TextureLevels {
            size: (image.width, image.height),
            levels,
        });
    }

    let mut base = RgbaImage::from_raw(image.width, image.height, image.pixels.clone()).ok_or_else(|| {
        LoadError::malformed(format!(
            "{} bytes is not a {}x{} RGBA8 image",
            image.pixels.len(),
            image.width,
            image.height
        ))
    })?;
    if resize {
        let width = image.width.next_power_of_two();
        let height = image.height.next_power_of_two();
        log::debug!("Resize {}x{} texture to {}x{}", image.width, image.height, width, height);
        base = image::imageops::resize(&base, width, height, FilterType::Triangle);
    }

    let size = base.dimensions();
    let levels = if sampler.requires_mipmaps() {
        generate_mip_chain(base)
    } else {
        vec![base.into_raw()]
    };
    Ok(TextureLevels { size, levels })
}

/// level 0 开始，每级减半直到 1x1
fn generate_mip_chain(base: RgbaImage) -> Vec<Vec<u8>> {
    let (mut width, mut height) = base.dimensions();
    let mut levels = Vec::new();
    let mut current = base;
    while width > 1 || height > 1 {
        width = (width / 2).max(1);
        height = (height / 2).max(1);
        let next = image::imageops::resize(&current, width, height, FilterType::Triangle);
        levels.push(std::mem::replace(&mut current, next).into_raw());
    }
    levels.push(current.into_raw());
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadErrorKind;
    use crate::gpu::HeadlessDevice;
    use crate::sampler::{MinFilter, WrapMode};
    use crate::test_utils::{TestContext, encode_png, file_url};

    fn decoded(width: u32, height: u32) -> DecodedImage {
        DecodedImage {
            width,
            height,
            pixels: vec![128; (width * height * 4) as usize],
            mip_levels: Vec::new(),
        }
    }

    fn mip_sampler() -> Sampler {
        Sampler {
            min_filter: MinFilter::LinearMipmapLinear,
            ..Sampler::default()
        }
    }

    #[test]
    fn test_mip_chain_sizes() {
        let levels = prepare_levels(&decoded(4, 2), &mip_sampler(), false).unwrap();
        assert_eq!(levels.size, (4, 2));
        let lengths: Vec<usize> = levels.levels.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![32, 8, 4]);
    }

    #[test]
    fn test_power_of_two_resize_only_when_required() {
        let image = decoded(3, 5);
        let clamp = Sampler {
            wrap_s: WrapMode::ClampToEdge,
            wrap_t: WrapMode::ClampToEdge,
            ..Sampler::default()
        };

        assert!(needs_power_of_two_resize(&image, &Sampler::default(), true));
        assert!(!needs_power_of_two_resize(&image, &Sampler::default(), false));
        assert!(!needs_power_of_two_resize(&image, &clamp, true));
        assert!(!needs_power_of_two_resize(&decoded(4, 8), &Sampler::default(), true));

        let levels = prepare_levels(&image, &Sampler::default(), true).unwrap();
        assert_eq!(levels.size, (4, 8));
        assert_eq!(levels.levels.len(), 1);
        assert_eq!(levels.levels[0].len(), 4 * 8 * 4);
    }

    #[test]
    fn test_prebuilt_mips_are_kept() {
        let mut image = decoded(2, 2);
        image.mip_levels = vec![vec![7; 4]];

        let levels = prepare_levels(&image, &mip_sampler(), false).unwrap();
        assert_eq!(levels.levels, vec![vec![128; 16], vec![7; 4]]);
    }

    #[test]
    fn test_texture_from_external_image() {
        let mut ctx = TestContext::new();
        let uri = file_url("/textures/npot.png");
        ctx.fetcher.insert(&uri, encode_png(3, 2, [255, 0, 0, 255]));
        let device = Arc::new(HeadlessDevice::webgl1_class(9));

        let handle = ctx.cache.load_texture(TextureRequest {
            image: ImageSource::External(uri),
            sampler: mip_sampler(),
            device: device.clone(),
            time_sliced: true,
        });
        ctx.settle(handle);

        let texture = ctx.cache.texture(handle).unwrap().texture().unwrap();
        assert_eq!((texture.desc().width, texture.desc().height), (4, 2));
        assert_eq!(texture.desc().mip_level_count, 3);
        assert_eq!(device.textures_created(), 1);
        // image loader 已经释放
        assert_eq!(ctx.cache.len(), 1);

        ctx.cache.unload(handle);
        assert_eq!(device.textures_destroyed(), 1);
        assert!(ctx.cache.is_empty());
    }

    #[test]
    fn test_device_failure_releases_image() {
        let mut ctx = TestContext::new();
        let uri = file_url("/textures/a.png");
        ctx.fetcher.insert(&uri, encode_png(2, 2, [0, 0, 0, 255]));
        ctx.device.fail_texture_creation(true);

        let handle = ctx.cache.load_texture(TextureRequest {
            image: ImageSource::External(uri),
            sampler: Sampler::default(),
            device: ctx.gpu_device(),
            time_sliced: false,
        });
        ctx.settle(handle);

        assert_eq!(ctx.cache.error(handle).unwrap().kind(), LoadErrorKind::Gpu);
        assert_eq!(ctx.cache.len(), 1);
    }

    #[test]
    fn test_same_image_and_sampler_share_one_texture() {
        let mut ctx = TestContext::new();
        let uri = file_url("/textures/shared.png");
        ctx.fetcher.insert(&uri, encode_png(2, 2, [9, 9, 9, 255]));
        let request = TextureRequest {
            image: ImageSource::External(uri),
            sampler: Sampler::default(),
            device: ctx.gpu_device(),
            time_sliced: false,
        };

        let first = ctx.cache.load_texture(request.clone());
        let second = ctx.cache.load_texture(request.clone());
        let clamped = ctx.cache.load_texture(TextureRequest {
            sampler: Sampler {
                wrap_s: WrapMode::ClampToEdge,
                ..Sampler::default()
            },
            ..request
        });
        ctx.settle(first);
        ctx.settle(clamped);

        assert_eq!(first, second);
        assert_ne!(first, clamped);
        assert_eq!(ctx.cache.reference_count(first), 2);
        assert_eq!(ctx.device.textures_created(), 2);
        assert_eq!(ctx.fetcher.fetch_count(), 1);
    }
}
