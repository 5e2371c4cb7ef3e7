//! 把 glTF 的 primitive 翻译成对 cache 的请求

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::accessor::{AccessorDesc, ViewDesc};
use crate::cache_key::BufferSource;
use crate::error::{LoadError, LoadResult};
use crate::gpu::GpuDevice;
use crate::loaders::gltf_json::buffer_source;
use crate::loaders::{IndexBufferRequest, VertexBufferRequest};

pub const DRACO_EXTENSION: &str = "KHR_draco_mesh_compression";
pub const OUTLINE_EXTENSION: &str = "CESIUM_primitive_outline";
pub const MESHOPT_EXTENSION: &str = "EXT_meshopt_compression";
pub const OUTLINE_SEMANTIC: &str = "_OUTLINE_COORDINATES";

pub struct AttributePlan {
    pub semantic: String,
    pub request: VertexBufferRequest,
}

/// 一个 primitive 需要的全部请求
///
/// 需要 outline 后处理时，所有请求都只要 CPU 数组，GPU buffer 由 AssetLoader 在后处理之后创建。
pub struct PrimitiveLoadPlan {
    pub mesh: usize,
    pub primitive: usize,
    pub mode: gltf::mesh::Mode,
    pub material: Option<usize>,
    pub attributes: Vec<AttributePlan>,
    pub indices: Option<IndexBufferRequest>,
    /// `CESIUM_primitive_outline` 的边
    pub outline: Option<IndexBufferRequest>,
}

impl PrimitiveLoadPlan {
    #[inline]
    pub fn needs_post_processing(&self) -> bool {
        self.outline.is_some()
    }
}

/// 构建 plan 时用到的共享参数
pub struct PlanContext<'a> {
    pub document: &'a gltf::Document,
    pub base: &'a Url,
    pub json: &'a Value,
    pub device: Option<Arc<dyn GpuDevice>>,
    pub keep_typed_arrays: bool,
    pub time_sliced: bool,
    pub generate_outlines: bool,
    pub dequantize: bool,
}

impl PlanContext<'_> {
    pub fn plan_primitive(&self, mesh: &gltf::Mesh<'_>, primitive: &gltf::Primitive<'_>) -> LoadResult<PrimitiveLoadPlan> {
        let extensions = self
            .json
            .pointer(&format!("/meshes/{}/primitives/{}/extensions", mesh.index(), primitive.index()));
        let draco = extensions.and_then(|extensions| extensions.get(DRACO_EXTENSION));
        let outline_accessor = extensions
            .and_then(|extensions| extensions.get(OUTLINE_EXTENSION))
            .and_then(|outline| outline.get("indices"))
            .and_then(Value::as_u64);

        let post_process = self.generate_outlines
            && outline_accessor.is_some()
            && primitive.indices().is_some()
            && primitive.mode() == gltf::mesh::Mode::Triangles
            && draco.is_none();

        // 后处理时只加载 CPU 数组
        let (device, typed_array) = if post_process {
            (None, true)
        } else {
            (self.device.clone(), self.keep_typed_arrays || self.device.is_none())
        };

        let mut attributes = Vec::new();
        for (semantic, accessor) in primitive.attributes() {
            let semantic = semantic.to_string();
            let draco_semantic = draco
                .and_then(|draco| draco.pointer(&format!("/attributes/{semantic}")))
                .map(|_| semantic.clone());
            let (source, view, meshopt) = match draco {
                Some(draco) if draco_semantic.is_some() => self.draco_view(draco)?,
                _ => self.accessor_view(&accessor)?,
            };
            attributes.push(AttributePlan {
                request: VertexBufferRequest {
                    source,
                    view,
                    meshopt,
                    accessor: AccessorDesc::from_gltf(&accessor),
                    draco_semantic,
                    dequantize: self.dequantize,
                    device: device.clone(),
                    typed_array,
                    time_sliced: self.time_sliced,
                },
                semantic,
            });
        }
        if attributes.is_empty() {
            return Err(LoadError::malformed(format!(
                "mesh {} primitive {} has no attributes",
                mesh.index(),
                primitive.index()
            )));
        }

        let indices = match primitive.indices() {
            Some(accessor) => {
                let (source, view, meshopt) = match draco {
                    Some(draco) => self.draco_view(draco)?,
                    None => self.accessor_view(&accessor)?,
                };
                Some(IndexBufferRequest {
                    source,
                    view,
                    meshopt,
                    accessor: AccessorDesc::from_gltf(&accessor),
                    draco: draco.is_some(),
                    device: device.clone(),
                    typed_array,
                    time_sliced: self.time_sliced,
                })
            }
            None => None,
        };

        let outline = match outline_accessor {
            Some(index) if post_process => {
                let accessor = self
                    .document
                    .accessors()
                    .nth(index as usize)
                    .ok_or_else(|| LoadError::malformed(format!("outline accessor {index} does not exist")))?;
                let (source, view, meshopt) = self.accessor_view(&accessor)?;
                Some(IndexBufferRequest {
                    source,
                    view,
                    meshopt,
                    accessor: AccessorDesc::from_gltf(&accessor),
                    draco: false,
                    device: None,
                    typed_array: true,
                    time_sliced: self.time_sliced,
                })
            }
            _ => None,
        };

        Ok(PrimitiveLoadPlan {
            mesh: mesh.index(),
            primitive: primitive.index(),
            mode: primitive.mode(),
            material: primitive.material().index(),
            attributes,
            indices,
            outline,
        })
    }

    /// accessor 引用的 buffer view；稀疏 accessor 和没有 buffer view 的 accessor 都不支持
    fn accessor_view(&self, accessor: &gltf::Accessor<'_>) -> LoadResult<(BufferSource, ViewDesc, bool)> {
        if accessor.sparse().is_some() {
            return Err(LoadError::not_implemented(format!("sparse accessor {}", accessor.index())));
        }
        let view = accessor
            .view()
            .ok_or_else(|| LoadError::not_implemented(format!("accessor {} without a bufferView", accessor.index())))?;
        self.view(&view)
    }

    fn view(&self, view: &gltf::buffer::View<'_>) -> LoadResult<(BufferSource, ViewDesc, bool)> {
        let meshopt = self
            .json
            .pointer(&format!("/bufferViews/{}/extensions/{MESHOPT_EXTENSION}", view.index()))
            .is_some();
        Ok((buffer_source(self.base, &view.buffer())?, ViewDesc::from_gltf(view), meshopt))
    }

    /// Draco 压缩的数据所在的 buffer view
    fn draco_view(&self, draco: &Value) -> LoadResult<(BufferSource, ViewDesc, bool)> {
        let index = draco
            .get("bufferView")
            .and_then(Value::as_u64)
            .ok_or_else(|| LoadError::malformed(format!("{DRACO_EXTENSION} without a bufferView")))?;
        let view = self
            .document
            .views()
            .nth(index as usize)
            .ok_or_else(|| LoadError::malformed(format!("bufferView {index} does not exist")))?;
        self.view(&view)
    }
}
