//! 顶层资源：一个 glTF 资产
//!
//! AssetLoader 不进入 cache，它通过 cache 请求所有子资源：
//! - geometry：vertex / index buffer，以及 outline 后处理
//! - texture：与 geometry 独立，失败不会影响 geometry
//!
//! 两组资源分别汇总为 "ready"（loader 本身的 Ready 状态）和 "textures ready"。

pub mod components;
pub mod outline;
pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;

use glam::Mat4;
use url::Url;

use crate::accessor::{AccessorDesc, ComponentType, ElementType};
use crate::bytes::SharedBytes;
use crate::cache::{LoaderHandle, ResourceCache};
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::frame::FrameState;
use crate::gpu::{GpuBuffer, GpuDevice, IndexFormat};
use crate::job_scheduler::JobType;
use crate::loaders::gltf_json::image_source;
use crate::loaders::{GltfJsonRequest, LoaderCore, ResourceLoader, TextureRequest, run_gpu_job};
use crate::packing::PackedArray;
use crate::sampler::Sampler;
use crate::state::LoaderState;

pub use components::{
    AlphaMode, GeometrySource, LoadedAttribute, LoadedIndices, LoadedPrimitive, Material, SceneNode, TextureRef,
};
pub use outline::{OutlineGeometry, generate_outlines};
pub use plan::{OUTLINE_SEMANTIC, PlanContext, PrimitiveLoadPlan};

/// 加载一个资产的选项
#[derive(Clone)]
pub struct AssetLoadOptions {
    pub uri: Url,
    /// 已经在内存中的文档；None 时通过 fetcher 读取
    pub bytes: Option<SharedBytes>,
    /// None 时只产出 CPU 数组，不请求 texture
    pub device: Option<Arc<dyn GpuDevice>>,
    pub keep_typed_arrays: bool,
    /// GPU 资源创建交给 JobScheduler 按帧切片
    pub asynchronous: bool,
    pub incrementally_load_textures: bool,
    pub generate_outlines: bool,
    pub dequantize: bool,
}
// new & init
impl AssetLoadOptions {
    pub fn new(uri: Url) -> Self {
        Self::from_config(uri, &LoaderConfig::default())
    }

    pub fn from_config(uri: Url, config: &LoaderConfig) -> Self {
        Self {
            uri,
            bytes: None,
            device: None,
            keep_typed_arrays: config.keep_typed_arrays,
            asynchronous: config.asynchronous,
            incrementally_load_textures: config.incrementally_load_textures,
            generate_outlines: config.generate_outlines,
            dequantize: config.dequantize,
        }
    }

    pub fn with_bytes(mut self, bytes: impl Into<SharedBytes>) -> Self {
        self.bytes = Some(bytes.into());
        self
    }

    pub fn with_device(mut self, device: Arc<dyn GpuDevice>) -> Self {
        self.device = Some(device);
        self
    }
}

/// outline 后处理的产物，替换 primitive 中原来的 cache 数据
struct GeneratedGeometry {
    attributes: Vec<GeometrySource>,
    indices: GeometrySource,
    outline_coordinates: GeometrySource,
    vertex_count: usize,
    index_count: usize,
}

pub struct AssetLoader {
    core: LoaderCore,
    options: AssetLoadOptions,

    gltf: Option<LoaderHandle>,
    document: Option<Arc<gltf::Document>>,

    nodes: Vec<SceneNode>,
    primitives: Vec<LoadedPrimitive>,
    /// 与 primitives 一一对应，后处理结束之前持有 outline 边的 loader
    outline_edges: Vec<Option<LoaderHandle>>,
    materials: Vec<Material>,
    /// 每次请求 texture 得到的 handle，unload 时逐个释放
    textures: Vec<LoaderHandle>,

    geometry_settled: bool,
    textures_ready: bool,
    texture_failures: usize,
}
// new & init
impl AssetLoader {
    pub fn new(options: AssetLoadOptions) -> Self {
        Self {
            core: LoaderCore::new(format!("asset:{}", options.uri)),
            options,
            gltf: None,
            document: None,
            nodes: Vec::new(),
            primitives: Vec::new(),
            outline_edges: Vec::new(),
            materials: Vec::new(),
            textures: Vec::new(),
            geometry_settled: false,
            textures_ready: false,
            texture_failures: 0,
        }
    }
}
// getters
impl AssetLoader {
    #[inline]
    pub fn options(&self) -> &AssetLoadOptions {
        &self.options
    }

    #[inline]
    pub fn document(&self) -> Option<&Arc<gltf::Document>> {
        self.document.as_ref()
    }

    #[inline]
    pub fn nodes(&self) -> &[SceneNode] {
        &self.nodes
    }

    #[inline]
    pub fn primitives(&self) -> &[LoadedPrimitive] {
        &self.primitives
    }

    #[inline]
    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    /// geometry 已经就绪
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.core.state().is_ready()
    }

    /// 所有 texture 都已经结束（成功或失败）
    #[inline]
    pub fn is_textures_ready(&self) -> bool {
        self.textures_ready
    }

    #[inline]
    pub fn texture_failures(&self) -> usize {
        self.texture_failures
    }

    /// AssetLoader 独占的 GPU buffer 字节数（outline 后处理生成的数据）
    pub fn generated_bytes(&self) -> usize {
        self.primitives
            .iter()
            .flat_map(LoadedPrimitive::geometry_sources)
            .map(GeometrySource::generated_bytes)
            .sum()
    }
}
// tools
impl AssetLoader {
    /// geometry 失败：只释放 geometry，已经请求的 texture 继续加载
    fn fail(&mut self, cache: &mut ResourceCache, error: LoadError) {
        self.release_geometry(cache);
        if self.textures.is_empty()
            && let Some(gltf) = self.gltf.take()
        {
            cache.unload(gltf);
        }
        let context = format!("Failed to load asset: {}", self.options.uri);
        self.core.fail(error, context);
    }

    fn release_geometry(&mut self, cache: &mut ResourceCache) {
        let mut handles: Vec<LoaderHandle> = self
            .primitives
            .iter()
            .flat_map(LoadedPrimitive::geometry_sources)
            .filter_map(GeometrySource::cached_handle)
            .collect();
        handles.extend(self.outline_edges.drain(..).flatten());
        for handle in handles {
            cache.unload(handle);
        }

        self.primitives.clear();
        self.nodes.clear();
    }

    fn release_all(&mut self, cache: &mut ResourceCache) {
        self.release_geometry(cache);
        let mut handles = std::mem::take(&mut self.textures);
        handles.extend(self.gltf.take());
        for handle in handles {
            cache.unload(handle);
        }
        self.materials.clear();
    }

    fn advance_gltf(&mut self, cache: &mut ResourceCache) {
        let Some(gltf) = self.gltf else {
            return;
        };
        match cache.state(gltf) {
            LoaderState::Ready => {
                if let Err(e) = self.build(cache) {
                    self.fail(cache, e);
                    return;
                }
                self.core.transition(LoaderState::Processing);
            }
            LoaderState::Failed => {
                let error = cache
                    .error(gltf)
                    .cloned()
                    .unwrap_or_else(|| LoadError::malformed("glTF failed without an error"));
                self.fail(cache, error);
            }
            _ => {}
        }
    }

    /// 遍历场景并请求所有子资源
    fn build(&mut self, cache: &mut ResourceCache) -> LoadResult<()> {
        let _span = tracy_client::span!("AssetLoader::build");

        let (document, json) = self
            .gltf
            .and_then(|handle| cache.gltf_json(handle))
            .and_then(|loader| Some((loader.document()?.clone(), loader.json()?.clone())))
            .ok_or_else(|| LoadError::malformed("ready glTF has no document"))?;
        self.document = Some(document.clone());

        let base = self.options.uri.clone();
        let context = PlanContext {
            document: &document,
            base: &base,
            json: &json,
            device: self.options.device.clone(),
            keep_typed_arrays: self.options.keep_typed_arrays,
            time_sliced: self.options.asynchronous,
            generate_outlines: self.options.generate_outlines,
            dequantize: self.options.dequantize,
        };

        // 读取默认场景，否则读取 0 号场景
        let scene = document.default_scene().or_else(|| document.scenes().next());
        let mut mesh_primitives = HashMap::new();
        if let Some(scene) = scene {
            let mut ancestors = Vec::new();
            for node in scene.nodes() {
                self.visit_node(cache, &context, &node, None, Mat4::IDENTITY, &mut ancestors, &mut mesh_primitives)?;
            }
        }

        for (position, material) in document.materials().enumerate() {
            let material = self.build_material(cache, &json, &base, position, &material);
            self.materials.push(material);
        }
        self.textures_ready = self.textures.is_empty();

        log::info!(
            "Asset {}: {} nodes, {} primitives, {} materials, {} textures requested",
            self.options.uri,
            self.nodes.len(),
            self.primitives.len(),
            self.materials.len(),
            self.textures.len()
        );
        Ok(())
    }

    /// 处理 gltf 中的一个 node
    ///
    /// ```json
    /// {
    ///     "children": ...,
    ///     // transform 以 matrix 形式整体指定，或者分别指定
    ///     "matrix": ...,
    ///     "translation": ...,
    ///     "rotation": ...,
    ///     "scale": ...,
    ///     "mesh": 4,
    /// }
    /// ```
    #[allow(clippy::too_many_arguments)]
    fn visit_node(
        &mut self,
        cache: &mut ResourceCache,
        context: &PlanContext<'_>,
        node: &gltf::Node<'_>,
        parent: Option<usize>,
        parent_world: Mat4,
        ancestors: &mut Vec<usize>,
        mesh_primitives: &mut HashMap<usize, Vec<usize>>,
    ) -> LoadResult<()> {
        if ancestors.contains(&node.index()) {
            return Err(LoadError::malformed(format!("node {} is its own ancestor", node.index())));
        }

        // gltf 这个库使用 column major 的方式存放矩阵
        let local = Mat4::from_cols_array_2d(&node.transform().matrix());
        let world = parent_world * local;

        let primitives = match node.mesh() {
            Some(mesh) => match mesh_primitives.get(&mesh.index()) {
                Some(primitives) => Vec::clone(primitives),
                None => {
                    let primitives = self.request_mesh(cache, context, &mesh)?;
                    mesh_primitives.insert(mesh.index(), primitives.clone());
                    primitives
                }
            },
            None => Vec::new(),
        };

        let index = self.nodes.len();
        self.nodes.push(SceneNode {
            index: node.index(),
            name: node.name().map(str::to_string),
            parent,
            local,
            world,
            primitives,
        });

        ancestors.push(node.index());
        for child in node.children() {
            self.visit_node(cache, context, &child, Some(index), world, ancestors, mesh_primitives)?;
        }
        ancestors.pop();
        Ok(())
    }

    /// 先为所有 primitive 生成 plan，全部成功之后才发出请求
    fn request_mesh(
        &mut self,
        cache: &mut ResourceCache,
        context: &PlanContext<'_>,
        mesh: &gltf::Mesh<'_>,
    ) -> LoadResult<Vec<usize>> {
        let plans = mesh
            .primitives()
            .map(|primitive| context.plan_primitive(mesh, &primitive))
            .collect::<LoadResult<Vec<_>>>()?;

        let mut indices = Vec::with_capacity(plans.len());
        for plan in plans {
            indices.push(self.primitives.len());
            self.request_primitive(cache, plan);
        }
        Ok(indices)
    }

    fn request_primitive(&mut self, cache: &mut ResourceCache, plan: PrimitiveLoadPlan) {
        let attributes = plan
            .attributes
            .into_iter()
            .map(|attribute| LoadedAttribute {
                semantic: attribute.semantic,
                accessor: attribute.request.accessor,
                source: GeometrySource::Cached(cache.load_vertex_buffer(attribute.request)),
            })
            .collect();
        let indices = plan.indices.map(|request| LoadedIndices {
            accessor: request.accessor,
            source: GeometrySource::Cached(cache.load_index_buffer(request)),
        });
        let outline_edges = plan.outline.map(|request| cache.load_index_buffer(request));

        self.primitives.push(LoadedPrimitive {
            mesh: plan.mesh,
            primitive: plan.primitive,
            mode: plan.mode,
            material: plan.material,
            attributes,
            indices,
            outline_coordinates: None,
        });
        self.outline_edges.push(outline_edges);
    }

    fn build_material(
        &mut self,
        cache: &mut ResourceCache,
        json: &serde_json::Value,
        base: &Url,
        position: usize,
        material: &gltf::Material<'_>,
    ) -> Material {
        let index = material.index().unwrap_or(position);
        let pbr = material.pbr_metallic_roughness();
        let alpha_mode = match material.alpha_mode() {
            gltf::material::AlphaMode::Opaque => AlphaMode::Opaque,
            gltf::material::AlphaMode::Mask => AlphaMode::Mask {
                cutoff: material.alpha_cutoff().unwrap_or(0.5),
            },
            gltf::material::AlphaMode::Blend => AlphaMode::Blend,
        };

        Material {
            index,
            name: material.name().map(str::to_string),
            base_color_factor: pbr.base_color_factor(),
            metallic_factor: pbr.metallic_factor(),
            roughness_factor: pbr.roughness_factor(),
            emissive_factor: material.emissive_factor(),
            alpha_mode,
            double_sided: material.double_sided(),
            unlit: json
                .pointer(&format!("/materials/{index}/extensions/KHR_materials_unlit"))
                .is_some(),
            base_color_texture: pbr
                .base_color_texture()
                .and_then(|info| self.request_texture(cache, base, &info.texture(), info.tex_coord())),
            metallic_roughness_texture: pbr
                .metallic_roughness_texture()
                .and_then(|info| self.request_texture(cache, base, &info.texture(), info.tex_coord())),
            normal_texture: material
                .normal_texture()
                .and_then(|info| self.request_texture(cache, base, &info.texture(), info.tex_coord())),
            occlusion_texture: material
                .occlusion_texture()
                .and_then(|info| self.request_texture(cache, base, &info.texture(), info.tex_coord())),
            emissive_texture: material
                .emissive_texture()
                .and_then(|info| self.request_texture(cache, base, &info.texture(), info.tex_coord())),
        }
    }

    /// 没有 device 时不请求 texture；uri 无法解析的 texture 计为失败
    fn request_texture(
        &mut self,
        cache: &mut ResourceCache,
        base: &Url,
        texture: &gltf::Texture<'_>,
        tex_coord: u32,
    ) -> Option<TextureRef> {
        let device = self.options.device.clone()?;
        let image = match image_source(base, &texture.source()) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("Skip texture {} of {}: {}", texture.index(), self.options.uri, e);
                self.texture_failures += 1;
                return None;
            }
        };

        let handle = cache.load_texture(TextureRequest {
            image,
            sampler: Sampler::from_gltf(&texture.sampler()),
            device,
            time_sliced: self.options.asynchronous,
        });
        self.textures.push(handle);
        Some(TextureRef {
            texture: handle,
            tex_coord,
        })
    }

    /// 轮询所有 geometry loader；全部结束后返回 true，有失败时直接让资产失败
    fn poll_geometry(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) -> bool {
        if self.geometry_settled {
            return true;
        }

        let handles: Vec<LoaderHandle> = self
            .primitives
            .iter()
            .flat_map(LoadedPrimitive::geometry_sources)
            .filter_map(GeometrySource::cached_handle)
            .chain(self.outline_edges.iter().flatten().copied())
            .collect();

        let mut settled = true;
        for handle in handles {
            cache.process(handle, frame);
            match cache.state(handle) {
                LoaderState::Ready => {}
                LoaderState::Failed => {
                    let error = cache
                        .error(handle)
                        .cloned()
                        .unwrap_or_else(|| LoadError::malformed("geometry failed without an error"));
                    self.fail(cache, error);
                    return false;
                }
                _ => settled = false,
            }
        }
        self.geometry_settled = settled;
        settled
    }

    /// 依次对需要 outline 的 primitive 做后处理，每个 primitive 是一个 BufferUpload job
    ///
    /// 全部完成时返回 true
    fn post_process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) -> bool {
        for index in 0..self.primitives.len() {
            let Some(edges) = self.outline_edges[index] else {
                continue;
            };

            let device = self.options.device.clone();
            let keep_typed_arrays = self.options.keep_typed_arrays || device.is_none();
            let primitive = &self.primitives[index];
            let generated = run_gpu_job(frame, self.options.asynchronous, JobType::BufferUpload, || {
                generate_outline_geometry(&*cache, primitive, edges, device.as_ref(), keep_typed_arrays)
            });

            match generated {
                // 预算用完，下一帧继续
                None => return false,
                Some(Ok(generated)) => self.apply_generated(cache, index, generated),
                Some(Err(e)) => {
                    self.fail(cache, e);
                    return false;
                }
            }
        }
        true
    }

    /// 替换为生成的数据，并释放不再需要的 typed array loader
    fn apply_generated(&mut self, cache: &mut ResourceCache, index: usize, generated: GeneratedGeometry) {
        let mut released = Vec::new();
        released.extend(self.outline_edges[index].take());

        let primitive = &mut self.primitives[index];
        for (attribute, source) in primitive.attributes.iter_mut().zip(generated.attributes) {
            released.extend(std::mem::replace(&mut attribute.source, source).cached_handle());
            attribute.accessor.count = generated.vertex_count;
        }
        if let Some(indices) = &mut primitive.indices {
            released.extend(std::mem::replace(&mut indices.source, generated.indices).cached_handle());
            indices.accessor = AccessorDesc {
                byte_offset: 0,
                component_type: ComponentType::U32,
                element_type: ElementType::Scalar,
                count: generated.index_count,
                normalized: false,
            };
        }
        primitive.outline_coordinates = Some(LoadedAttribute {
            semantic: OUTLINE_SEMANTIC.to_string(),
            accessor: AccessorDesc {
                byte_offset: 0,
                component_type: ComponentType::F32,
                element_type: ElementType::Vec3,
                count: generated.vertex_count,
                normalized: false,
            },
            source: generated.outline_coordinates,
        });

        for handle in released {
            cache.unload(handle);
        }
    }

    /// 文档解析之前没有 texture 可以等待
    fn poll_textures(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        if self.textures_ready || self.document.is_none() {
            return;
        }

        let mut settled = true;
        let mut failures = 0;
        for &handle in &self.textures {
            cache.process(handle, frame);
            match cache.state(handle) {
                LoaderState::Ready => {}
                LoaderState::Failed => failures += 1,
                _ => settled = false,
            }
        }

        if settled {
            self.textures_ready = true;
            self.texture_failures += failures;
            if self.texture_failures > 0 {
                log::warn!(
                    "{} textures of {} failed to load",
                    self.texture_failures,
                    self.options.uri
                );
            }
            log::info!("Textures ready: {}", self.options.uri);
        }
    }
}

/// 读取 typed array，生成 outline，重排所有 attribute 并按需创建 GPU buffer
fn generate_outline_geometry(
    cache: &ResourceCache,
    primitive: &LoadedPrimitive,
    edges: LoaderHandle,
    device: Option<&Arc<dyn GpuDevice>>,
    keep_typed_arrays: bool,
) -> LoadResult<GeneratedGeometry> {
    let _span = tracy_client::span!("generate_outline_geometry");

    fn typed_array<'a>(cache: &'a ResourceCache, source: &'a GeometrySource) -> LoadResult<&'a PackedArray> {
        source
            .typed_array(cache)
            .ok_or_else(|| LoadError::malformed("outline input has no typed array"))
    }
    let triangles = match &primitive.indices {
        Some(indices) => typed_array(cache, &indices.source)?.read_indices()?,
        None => return Err(LoadError::malformed("outline generation requires indices")),
    };
    let outline_indices = cache
        .index_buffer(edges)
        .and_then(|loader| loader.typed_array())
        .ok_or_else(|| LoadError::malformed("outline edges have no typed array"))?
        .read_indices()?;

    let vertex_count = primitive
        .attributes
        .first()
        .map_or(0, |attribute| attribute.accessor.count);
    let outline = generate_outlines(&triangles, vertex_count, &outline_indices)?;

    let finish = |packed: PackedArray, buffer: Option<GpuBuffer>| GeometrySource::Generated {
        buffer,
        typed_array: keep_typed_arrays.then_some(packed),
    };

    let mut attributes = Vec::with_capacity(primitive.attributes.len());
    for attribute in &primitive.attributes {
        let remapped = typed_array(cache, &attribute.source)?.remap(&outline.remap)?;
        let buffer = device
            .map(|device| GpuBuffer::create_vertex(device, remapped.as_bytes()))
            .transpose()?;
        attributes.push(finish(remapped, buffer));
    }

    let coordinates = PackedArray::from_slice(ComponentType::F32, ElementType::Vec3, outline.coordinates.as_flattened());
    let coordinate_buffer = device
        .map(|device| GpuBuffer::create_vertex(device, coordinates.as_bytes()))
        .transpose()?;

    let indices = PackedArray::from_slice(ComponentType::U32, ElementType::Scalar, &outline.indices);
    let index_buffer = device
        .map(|device| GpuBuffer::create_index(device, indices.as_bytes(), IndexFormat::U32))
        .transpose()?;

    Ok(GeneratedGeometry {
        attributes,
        indices: finish(indices, index_buffer),
        outline_coordinates: finish(coordinates, coordinate_buffer),
        vertex_count: outline.vertex_count(),
        index_count: outline.indices.len(),
    })
}

impl ResourceLoader for AssetLoader {
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
        log::info!("Load asset: {}", self.options.uri);
        self.gltf = Some(cache.load_gltf_json(GltfJsonRequest {
            uri: self.options.uri.clone(),
            bytes: self.options.bytes.clone(),
        }));
        self.advance_gltf(cache);
    }

    fn process(&mut self, cache: &mut ResourceCache, frame: &mut FrameState) {
        let _span = tracy_client::span!("AssetLoader::process");

        if self.core.state() == LoaderState::Loading {
            if let Some(gltf) = self.gltf {
                cache.process(gltf, frame);
            }
            self.advance_gltf(cache);
        }

        match self.core.state() {
            LoaderState::Processing => {
                let geometry_done = self.poll_geometry(cache, frame) && self.post_process(cache, frame);
                self.poll_textures(cache, frame);
                if self.core.state() == LoaderState::Processing
                    && geometry_done
                    && (self.options.incrementally_load_textures || self.textures_ready)
                {
                    log::info!("Asset ready: {} {}", self.options.uri, frame.frame_name());
                    self.core.transition(LoaderState::Ready);
                }
            }
            // geometry 失败不影响 texture
            LoaderState::Ready | LoaderState::Failed => self.poll_textures(cache, frame),
            _ => {}
        }
    }

    fn unload(&mut self, cache: &mut ResourceCache) {
        self.release_all(cache);
        self.document = None;
        self.geometry_settled = false;
        self.textures_ready = false;
        self.texture_failures = 0;
        self.core.reset();
    }
}
