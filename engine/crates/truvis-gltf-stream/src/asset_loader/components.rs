//! AssetLoader 的输出：场景节点、primitive、材质

use glam::Mat4;

use crate::accessor::AccessorDesc;
use crate::cache::{LoaderHandle, ResourceCache};
use crate::gpu::GpuBuffer;
use crate::loaders::Loader;
use crate::packing::PackedArray;

/// 一份 geometry 数据的来源
pub enum GeometrySource {
    /// 由 cache 中的 vertex / index buffer loader 持有
    Cached(LoaderHandle),
    /// outline 后处理生成的数据，由 AssetLoader 独占
    Generated {
        buffer: Option<GpuBuffer>,
        typed_array: Option<PackedArray>,
    },
}

impl GeometrySource {
    pub fn gpu_buffer<'a>(&'a self, cache: &'a ResourceCache) -> Option<&'a GpuBuffer> {
        match self {
            Self::Cached(handle) => match cache.loader(*handle)? {
                Loader::VertexBuffer(loader) => loader.gpu_buffer(),
                Loader::IndexBuffer(loader) => loader.gpu_buffer(),
                _ => None,
            },
            Self::Generated { buffer, .. } => buffer.as_ref(),
        }
    }

    pub fn typed_array<'a>(&'a self, cache: &'a ResourceCache) -> Option<&'a PackedArray> {
        match self {
            Self::Cached(handle) => match cache.loader(*handle)? {
                Loader::VertexBuffer(loader) => loader.typed_array(),
                Loader::IndexBuffer(loader) => loader.typed_array(),
                _ => None,
            },
            Self::Generated { typed_array, .. } => typed_array.as_ref(),
        }
    }

    #[inline]
    pub fn cached_handle(&self) -> Option<LoaderHandle> {
        match self {
            Self::Cached(handle) => Some(*handle),
            Self::Generated { .. } => None,
        }
    }

    /// 生成的 GPU buffer 的字节数，cache 中的不计入
    pub fn generated_bytes(&self) -> usize {
        match self {
            Self::Cached(_) => 0,
            Self::Generated { buffer, .. } => buffer.as_ref().map_or(0, GpuBuffer::byte_length),
        }
    }
}

pub struct LoadedAttribute {
    /// `POSITION`、`TEXCOORD_0` 等
    pub semantic: String,
    pub accessor: AccessorDesc,
    pub source: GeometrySource,
}

pub struct LoadedIndices {
    pub accessor: AccessorDesc,
    pub source: GeometrySource,
}

/// 一个可以单独绘制的 primitive
pub struct LoadedPrimitive {
    pub mesh: usize,
    pub primitive: usize,
    pub mode: gltf::mesh::Mode,
    pub material: Option<usize>,
    pub attributes: Vec<LoadedAttribute>,
    pub indices: Option<LoadedIndices>,
    /// `_OUTLINE_COORDINATES`，只有生成了 outline 时存在
    pub outline_coordinates: Option<LoadedAttribute>,
}

impl LoadedPrimitive {
    pub fn attribute(&self, semantic: &str) -> Option<&LoadedAttribute> {
        self.attributes.iter().find(|attribute| attribute.semantic == semantic)
    }

    pub(crate) fn geometry_sources(&self) -> impl Iterator<Item = &GeometrySource> {
        self.attributes
            .iter()
            .map(|attribute| &attribute.source)
            .chain(self.indices.iter().map(|indices| &indices.source))
            .chain(self.outline_coordinates.iter().map(|attribute| &attribute.source))
    }
}

/// 场景中的一个节点
///
/// gltf 的矩阵是 column major 的，`world = parent.world * local`
#[derive(Debug, Clone)]
pub struct SceneNode {
    pub index: usize,
    pub name: Option<String>,
    pub parent: Option<usize>,
    pub local: Mat4,
    pub world: Mat4,
    /// 在 `AssetLoader::primitives()` 中的下标
    pub primitives: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlphaMode {
    Opaque,
    Mask { cutoff: f32 },
    Blend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureRef {
    pub texture: LoaderHandle,
    /// 使用的 `TEXCOORD_n`
    pub tex_coord: u32,
}

/// PBR metallic-roughness 材质
///
/// ```json
/// {
///     "pbrMetallicRoughness": {
///         "baseColorTexture": {},
///         "baseColorFactor": [f32; 4],
///         "metallicRoughnessTexture": {},
///         "metallicFactor": f32,
///         "roughnessFactor": f32,
///     },
///     "normalTexture": {},
///     "occlusionTexture": {},
///     "emissiveTexture": {},
///     "emissiveFactor": [f32; 3],
/// }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub index: usize,
    pub name: Option<String>,
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub emissive_factor: [f32; 3],
    pub alpha_mode: AlphaMode,
    pub double_sided: bool,
    pub unlit: bool,

    pub base_color_texture: Option<TextureRef>,
    pub metallic_roughness_texture: Option<TextureRef>,
    pub normal_texture: Option<TextureRef>,
    pub occlusion_texture: Option<TextureRef>,
    pub emissive_texture: Option<TextureRef>,
}

impl Material {
    pub fn textures(&self) -> impl Iterator<Item = TextureRef> + '_ {
        [
            self.base_color_texture,
            self.metallic_roughness_texture,
            self.normal_texture,
            self.occlusion_texture,
            self.emissive_texture,
        ]
        .into_iter()
        .flatten()
    }
}
