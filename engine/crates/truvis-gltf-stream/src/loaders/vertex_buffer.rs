use std::sync::Arc;

use crate::accessor::{AccessorDesc, ViewDesc};
use crate::cache::{LoaderHandle, ResourceCache};
use crate::cache_key::{BufferSource, VertexKeyParams, vertex_buffer_key};
use crate::error::LoadError;
use crate::frame::FrameState;
use crate::gpu::{GpuBuffer, GpuDevice};
use crate::job_scheduler::JobType;
use crate::loaders::{BufferViewRequest, LoaderCore, ResourceLoader, run_gpu_job};
use crate::packing::{PackedArray, pack_accessor};
use crate::state::LoaderState;

/// 一个 vertex attribute 的加载请求
///
/// `device` 为 Some 时创建 GPU buffer，`typed_array` 为 true 时保留紧密排列的 CPU 数组，两者互相独立。
#[derive(Clone)]
pub struct VertexBufferRequest {
    pub source: BufferSource,
    pub view: ViewDesc,
    pub meshopt: bool,
    pub accessor: AccessorDesc,
    /// Draco 压缩的 primitive 中该 attribute 的 semantic
    pub draco_semantic: Option<String>,
    pub dequantize: bool,
    pub device: Option<Arc<dyn GpuDevice>>,
    pub typed_array: bool,
    /// GPU buffer 的创建交给 JobScheduler
    pub time_sliced: bool,
}

impl VertexBufferRequest {
    pub fn cache_key(&self) -> String {
        vertex_buffer_key(&VertexKeyParams {
            source: &self.source,
            view: &self.view,
            accessor: &self.accessor,
            draco_semantic: self.draco_semantic.as_deref(),
            dequantize: self.dequantize,
            gpu_context: self.device.as_ref().map(|device| device.context_id()),
            typed_array: self.typed_array,
        })
    }
}

pub struct VertexBufferLoader {
    core: LoaderCore,
    request: VertexBufferRequest,
    view: Option<LoaderHandle>,
    /// 只需要 GPU buffer 时，上传前临时保存的数据
    pending_upload: Option<PackedArray>,
    typed_array: Option<PackedArray>,
    buffer: Option<GpuBuffer>,
}
// new & init
impl VertexBufferLoader {
    pub fn new(cache_key: String, request: VertexBufferRequest) -> Self {
        Self {
            core: LoaderCore::new(cache_key),
            request,
            view: None,
            pending_upload: None,
            typed_array: None,
            buffer: None,
        }
    }
}
// getters
impl VertexBufferLoader {
    #[inline]
    pub fn accessor(&self) -> &AccessorDesc {
        &self.request.accessor
    }

    #[inline]
    pub fn typed_array(&self) -> Option<&PackedArray> {
        self.typed_array.as_ref()
    }

    #[inline]
    pub fn gpu_buffer(&self) -> Option<&GpuBuffer> {
        self.buffer.as_ref()
    }
}
// tools
impl VertexBufferLoader {
    fn fail(&mut self, cache: &mut ResourceCache, error: LoadError) {
        self.release_view(cache);
        self.pending_upload = None;
        let context = format!("Failed to load vertex buffer: {}", self.core.cache_key());
        self.core.fail(error, context);
    }

    fn release_view(&mut self, cache: &mut ResourceCache) {
        if let Some(handle) = self.view.take() {
            cache.unload(handle);
        }
    }

    fn finish(&mut self, cache: &mut ResourceCache) {
        self.release_view(cache);
        self.pending_upload = None;
        self.core.transition(LoaderState::Ready);
    }

    /// 等待 buffer view 就绪，然后打包
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

        let packed = cache
            .buffer_view(view)
            .and_then(|loader| loader.bytes())
            .ok_or_else(|| LoadError::malformed("ready buffer view has no bytes"))
            .and_then(|bytes| pack_accessor(bytes, &self.request.accessor, self.request.view.byte_stride));
        let packed = match packed {
            Ok(packed) => packed,
            Err(e) => {
                self.fail(cache, e);
                return;
            }
        };

        if !self.core.transition(LoaderState::Processing) {
            return;
        }
        let wants_gpu = self.request.device.is_some();
        if self.request.typed_array {
            self.typed_array = Some(packed);
        } else if wants_gpu {
            self.pending_upload = Some(packed);
        }

        if !wants_gpu {
            self.finish(cache);
        }
    }

    fn upload(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        let Some(device) = self.request.device.clone() else {
            self.finish(cache);
            return;
        };
        let Some(data) = self.pending_upload.as_ref().or(self.typed_array.as_ref()) else {
            self.fail(cache, LoadError::malformed("no vertex data to upload"));
            return;
        };

        let created = run_gpu_job(frame, self.request.time_sliced, JobType::BufferUpload, || {
            GpuBuffer::create_vertex(&device, data.as_bytes())
        });
        match created {
            None => {}
            Some(Ok(buffer)) => {
                self.buffer = Some(buffer);
                self.finish(cache);
            }
            Some(Err(e)) => self.fail(cache, e),
        }
    }
}

impl ResourceLoader for VertexBufferLoader {
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

        if let Some(semantic) = &self.request.draco_semantic {
            let error = LoadError::not_implemented(format!("KHR_draco_mesh_compression decoding of {semantic}"));
            self.fail(cache, error);
            return;
        }
        if self.request.dequantize && !self.request.accessor.component_type.is_float() {
            let error = LoadError::not_implemented(format!(
                "KHR_mesh_quantization dequantization of {:?} attributes",
                self.request.accessor.component_type
            ));
            self.fail(cache, error);
            return;
        }

        self.view = Some(cache.load_buffer_view(BufferViewRequest {
            source: self.request.source.clone(),
            view: self.request.view,
            meshopt: self.request.meshopt,
        }));
        self.advance_view(cache);
    }

    fn process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        match self.core.state() {
            LoaderState::Loading => {
                if let Some(view) = self.view {
                    cache.process(view, frame);
                }
                self.advance_view(cache);
            }
            LoaderState::Processing => self.upload(cache, frame),
            _ => {}
        }
    }

    fn unload(&mut self, cache: &mut ResourceCache) {
        self.release_view(cache);
        self.pending_upload = None;
        self.typed_array = None;
        // GpuBuffer drop 时销毁 GPU 资源
        self.buffer = None;
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{ComponentType, ElementType};
    use crate::bytes::SharedBytes;
    use crate::error::LoadErrorKind;
    use crate::test_utils::{TestContext, file_url};

    /// 3 个顶点，stride 16：3 个 f32 position + 4 字节填充
    fn strided_positions() -> Vec<u8> {
        let mut bytes = Vec::new();
        for vertex in 0..3u32 {
            for component in 0..3u32 {
                bytes.extend_from_slice(&((vertex * 3 + component) as f32).to_le_bytes());
            }
            bytes.extend_from_slice(&[0; 4]);
        }
        bytes
    }

    fn request(ctx: &TestContext, stride: Option<usize>, typed_array: bool, gpu: bool) -> VertexBufferRequest {
        VertexBufferRequest {
            source: BufferSource::Embedded {
                parent: file_url("/a.glb"),
                index: 0,
            },
            view: ViewDesc {
                byte_offset: 0,
                byte_length: 48,
                byte_stride: stride,
            },
            meshopt: false,
            accessor: AccessorDesc {
                byte_offset: 0,
                component_type: ComponentType::F32,
                element_type: ElementType::Vec3,
                count: 3,
                normalized: false,
            },
            draco_semantic: None,
            dequantize: false,
            device: gpu.then(|| ctx.gpu_device()),
            typed_array,
            time_sliced: true,
        }
    }

    fn register_buffer(ctx: &mut TestContext) -> LoaderHandle {
        ctx.cache
            .load_embedded_buffer(&file_url("/a.glb"), 0, SharedBytes::new(strided_positions()))
    }

    #[test]
    fn test_strided_typed_array_and_gpu_buffer() {
        let mut ctx = TestContext::new();
        let buffer = register_buffer(&mut ctx);

        let vertex_request = request(&ctx, Some(16), true, true);
        let handle = ctx.cache.load_vertex_buffer(vertex_request);
        assert_eq!(ctx.cache.state(handle), LoaderState::Processing);
        ctx.settle(handle);

        let loader = ctx.cache.vertex_buffer(handle).unwrap();
        assert_eq!(loader.state(), LoaderState::Ready);
        let typed = loader.typed_array().unwrap();
        assert_eq!(&*typed.typed::<f32>(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(loader.gpu_buffer().unwrap().byte_length(), 36);
        assert_eq!(ctx.device.vertex_buffers_created(), 1);

        // Ready 之后 buffer view 被释放
        assert_eq!(ctx.cache.len(), 2);
        assert_eq!(ctx.cache.reference_count(buffer), 1);
    }

    #[test]
    fn test_gpu_only_does_not_keep_typed_array() {
        let mut ctx = TestContext::new();
        register_buffer(&mut ctx);

        let vertex_request = request(&ctx, Some(16), false, true);
        let handle = ctx.cache.load_vertex_buffer(vertex_request);
        ctx.settle(handle);

        let loader = ctx.cache.vertex_buffer(handle).unwrap();
        assert!(loader.typed_array().is_none());
        assert!(loader.gpu_buffer().is_some());
    }

    #[test]
    fn test_typed_array_only_is_ready_in_load() {
        let mut ctx = TestContext::new();
        register_buffer(&mut ctx);

        let vertex_request = request(&ctx, Some(16), true, false);
        let handle = ctx.cache.load_vertex_buffer(vertex_request);

        assert_eq!(ctx.cache.state(handle), LoaderState::Ready);
        assert_eq!(ctx.device.vertex_buffers_created(), 0);
    }

    #[test]
    fn test_disabled_scheduler_defers_upload() {
        let mut ctx = TestContext::new();
        register_buffer(&mut ctx);
        let vertex_request = request(&ctx, Some(16), false, true);
        let handle = ctx.cache.load_vertex_buffer(vertex_request);

        ctx.frame.next_frame();
        ctx.frame.job_scheduler_mut().disable_this_frame();
        ctx.cache.process(handle, &mut ctx.frame);
        assert_eq!(ctx.cache.state(handle), LoaderState::Processing);

        ctx.frame.next_frame();
        ctx.cache.process(handle, &mut ctx.frame);
        assert_eq!(ctx.cache.state(handle), LoaderState::Ready);
    }

    #[test]
    fn test_draco_is_not_implemented() {
        let mut ctx = TestContext::new();
        register_buffer(&mut ctx);
        let mut draco = request(&ctx, Some(16), false, true);
        draco.draco_semantic = Some("POSITION".to_string());

        let handle = ctx.cache.load_vertex_buffer(draco);

        assert_eq!(ctx.cache.error(handle).unwrap().kind(), LoadErrorKind::NotImplemented);
        assert_eq!(ctx.device.vertex_buffers_created(), 0);
    }

    #[test]
    fn test_dequantize_integer_attribute_is_not_implemented() {
        let mut ctx = TestContext::new();
        register_buffer(&mut ctx);
        let mut quantized = request(&ctx, None, true, false);
        quantized.dequantize = true;
        quantized.accessor.component_type = ComponentType::U16;

        let handle = ctx.cache.load_vertex_buffer(quantized);

        assert_eq!(ctx.cache.error(handle).unwrap().kind(), LoadErrorKind::NotImplemented);
    }

    #[test]
    fn test_two_strides_over_one_range() {
        let mut ctx = TestContext::new();
        register_buffer(&mut ctx);

        // 第一个请求的 GPU 上传被推迟，buffer view 仍然被它持有
        let strided = request(&ctx, Some(16), false, true);
        let first = ctx.cache.load_vertex_buffer(strided);
        assert_eq!(ctx.cache.state(first), LoaderState::Processing);

        // 同一段 48 字节按 stride 12 解释为 4 个顶点
        let mut tight = request(&ctx, Some(12), true, false);
        tight.accessor.count = 4;
        let second = ctx.cache.load_vertex_buffer(tight);

        assert_ne!(first, second);
        let loader = ctx.cache.vertex_buffer(second).unwrap();
        assert_eq!(loader.state(), LoaderState::Ready);
        assert_eq!(loader.typed_array().unwrap().typed::<f32>().len(), 12);

        ctx.settle(first);
        let loader = ctx.cache.vertex_buffer(first).unwrap();
        assert_eq!(loader.gpu_buffer().unwrap().byte_length(), 36);
    }

    #[test]
    fn test_bad_stride_fails_and_releases_view() {
        let mut ctx = TestContext::new();
        let buffer = register_buffer(&mut ctx);

        let vertex_request = request(&ctx, Some(8), true, false);
        let handle = ctx.cache.load_vertex_buffer(vertex_request);

        assert_eq!(ctx.cache.error(handle).unwrap().kind(), LoadErrorKind::MalformedAsset);
        assert_eq!(ctx.cache.reference_count(buffer), 1);
    }
}
