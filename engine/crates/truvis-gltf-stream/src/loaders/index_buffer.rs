use std::sync::Arc;

use crate::accessor::{AccessorDesc, ComponentType, ElementType, ViewDesc};
use crate::cache::{LoaderHandle, ResourceCache};
use crate::cache_key::{BufferSource, IndexKeyParams, index_buffer_key};
use crate::error::LoadError;
use crate::frame::FrameState;
use crate::gpu::{GpuBuffer, GpuDevice, IndexFormat};
use crate::job_scheduler::JobType;
use crate::loaders::{BufferViewRequest, LoaderCore, ResourceLoader, run_gpu_job};
use crate::packing::{PackedArray, pack_accessor};
use crate::state::LoaderState;

#[derive(Clone)]
pub struct IndexBufferRequest {
    pub source: BufferSource,
    pub view: ViewDesc,
    pub meshopt: bool,
    pub accessor: AccessorDesc,
    /// primitive 使用 Draco 压缩
    pub draco: bool,
    pub device: Option<Arc<dyn GpuDevice>>,
    pub typed_array: bool,
    pub time_sliced: bool,
}

impl IndexBufferRequest {
    pub fn cache_key(&self) -> String {
        index_buffer_key(&IndexKeyParams {
            source: &self.source,
            view: &self.view,
            accessor: &self.accessor,
            draco: self.draco,
            gpu_context: self.device.as_ref().map(|device| device.context_id()),
            typed_array: self.typed_array,
        })
    }
}

pub struct IndexBufferLoader {
    core: LoaderCore,
    request: IndexBufferRequest,
    view: Option<LoaderHandle>,
    pending_upload: Option<PackedArray>,
    typed_array: Option<PackedArray>,
    buffer: Option<GpuBuffer>,
}
// new & init
impl IndexBufferLoader {
    pub fn new(cache_key: String, request: IndexBufferRequest) -> Self {
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
impl IndexBufferLoader {
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

    /// GPU buffer 中的 index 格式；8 位 index 在设备不支持时会被扩展为 16 位
    pub fn index_format(&self) -> Option<IndexFormat> {
        let format = match self.request.accessor.component_type {
            ComponentType::U8 => IndexFormat::U8,
            ComponentType::U16 => IndexFormat::U16,
            ComponentType::U32 => IndexFormat::U32,
            _ => return None,
        };
        match &self.request.device {
            Some(device) if format == IndexFormat::U8 && !device.supports_u8_indices() => Some(IndexFormat::U16),
            _ => Some(format),
        }
    }
}
// tools
impl IndexBufferLoader {
    fn fail(&mut self, cache: &mut ResourceCache, error: LoadError) {
        self.release_view(cache);
        self.pending_upload = None;
        let context = format!("Failed to load index buffer: {}", self.core.cache_key());
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

    fn validate(accessor: &AccessorDesc) -> Result<(), LoadError> {
        if accessor.element_type != ElementType::Scalar {
            return Err(LoadError::malformed(format!(
                "index accessor must be SCALAR, got {}",
                accessor.element_type
            )));
        }
        match accessor.component_type {
            ComponentType::U8 | ComponentType::U16 | ComponentType::U32 => Ok(()),
            other => Err(LoadError::malformed(format!("{other:?} is not a valid index component type"))),
        }
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
        let (Some(device), Some(format)) = (self.request.device.clone(), self.index_format()) else {
            self.finish(cache);
            return;
        };
        let Some(data) = self.pending_upload.as_ref().or(self.typed_array.as_ref()) else {
            self.fail(cache, LoadError::malformed("no index data to upload"));
            return;
        };

        let created = run_gpu_job(frame, self.request.time_sliced, JobType::BufferUpload, || {
            if format == IndexFormat::U16 && data.component_type() == ComponentType::U8 {
                let widened: Vec<u16> = data.as_bytes().iter().map(|&index| index as u16).collect();
                GpuBuffer::create_index(&device, bytemuck::cast_slice(&widened), format)
            } else {
                GpuBuffer::create_index(&device, data.as_bytes(), format)
            }
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

impl ResourceLoader for IndexBufferLoader {
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

        if self.request.draco {
            self.fail(cache, LoadError::not_implemented("KHR_draco_mesh_compression index decoding"));
            return;
        }
        if let Err(e) = Self::validate(&self.request.accessor) {
            self.fail(cache, e);
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
        self.buffer = None;
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::SharedBytes;
    use crate::error::LoadErrorKind;
    use crate::gpu::HeadlessDevice;
    use crate::test_utils::{TestContext, file_url};

    fn u8_request(device: Arc<dyn GpuDevice>) -> IndexBufferRequest {
        IndexBufferRequest {
            source: BufferSource::Embedded {
                parent: file_url("/a.glb"),
                index: 0,
            },
            view: ViewDesc {
                byte_offset: 0,
                byte_length: 6,
                byte_stride: None,
            },
            meshopt: false,
            accessor: AccessorDesc {
                byte_offset: 0,
                component_type: ComponentType::U8,
                element_type: ElementType::Scalar,
                count: 6,
                normalized: false,
            },
            draco: false,
            device: Some(device),
            typed_array: true,
            time_sliced: false,
        }
    }

    #[test]
    fn test_u8_indices_widened_without_device_support() {
        let mut ctx = TestContext::new();
        ctx.cache
            .load_embedded_buffer(&file_url("/a.glb"), 0, SharedBytes::new(vec![0, 1, 2, 2, 1, 3]));
        let device = Arc::new(HeadlessDevice::new(5).with_u8_indices(false));

        let handle = ctx.cache.load_index_buffer(u8_request(device.clone()));
        ctx.settle(handle);

        let loader = ctx.cache.index_buffer(handle).unwrap();
        assert_eq!(loader.state(), LoaderState::Ready);
        assert_eq!(loader.index_format(), Some(IndexFormat::U16));
        assert_eq!(loader.gpu_buffer().unwrap().byte_length(), 12);
        assert_eq!(device.last_index_format(), Some(IndexFormat::U16));
        // CPU 数组保持原始类型
        assert_eq!(loader.typed_array().unwrap().read_indices().unwrap(), vec![0, 1, 2, 2, 1, 3]);
        assert_eq!(loader.typed_array().unwrap().component_type(), ComponentType::U8);
    }

    #[test]
    fn test_u8_indices_kept_with_device_support() {
        let mut ctx = TestContext::new();
        ctx.cache
            .load_embedded_buffer(&file_url("/a.glb"), 0, SharedBytes::new(vec![0, 1, 2, 2, 1, 3]));
        let device = Arc::new(HeadlessDevice::new(5));

        let handle = ctx.cache.load_index_buffer(u8_request(device.clone()));
        ctx.settle(handle);

        assert_eq!(ctx.cache.index_buffer(handle).unwrap().gpu_buffer().unwrap().byte_length(), 6);
        assert_eq!(device.last_index_format(), Some(IndexFormat::U8));
    }

    #[test]
    fn test_float_indices_are_malformed() {
        let mut ctx = TestContext::new();
        ctx.cache
            .load_embedded_buffer(&file_url("/a.glb"), 0, SharedBytes::new(vec![0; 24]));
        let mut request = u8_request(ctx.gpu_device());
        request.accessor.component_type = ComponentType::F32;

        let handle = ctx.cache.load_index_buffer(request);

        assert_eq!(ctx.cache.error(handle).unwrap().kind(), LoadErrorKind::MalformedAsset);
        assert_eq!(ctx.device.index_buffers_created(), 0);
    }
}
