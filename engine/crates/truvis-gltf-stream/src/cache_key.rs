//! cache key 的推导
//!
//! 纯函数。key 中包含所有会影响产出字节或 GPU 格式的参数：
//! 字节来源、byte range、accessor 形状、sampler、GPU context，以及输出形式。

use url::Url;

use crate::accessor::{AccessorDesc, ViewDesc};
use crate::sampler::Sampler;

/// buffer 的来源
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferSource {
    /// 外部 uri，已经解析为绝对路径
    External(Url),
    /// 嵌入在 asset 中的第 `index` 个 buffer（GLB BIN chunk 或 data uri）
    Embedded { parent: Url, index: usize },
}

impl BufferSource {
    /// 其他 key 中引用 buffer 时使用的部分
    pub fn buffer_key(&self) -> String {
        match self {
            Self::External(uri) => uri.to_string(),
            Self::Embedded { parent, index } => format!("{parent}-buffer-id-{index}"),
        }
    }

    /// BufferLoader 自己的 cache key
    pub fn cache_key(&self) -> String {
        match self {
            Self::External(uri) => external_buffer_key(uri),
            Self::Embedded { parent, index } => embedded_buffer_key(parent, *index),
        }
    }
}

pub fn external_buffer_key(uri: &Url) -> String {
    format!("external-buffer:{uri}")
}

pub fn embedded_buffer_key(parent: &Url, index: usize) -> String {
    format!("embedded-buffer:{parent}-buffer-id-{index}")
}

/// stride 不参与：view loader 只切片，stride 由使用方解释
pub fn buffer_view_key(source: &BufferSource, view: &ViewDesc, meshopt: bool) -> String {
    let mut key = format!(
        "buffer-view:{}-range-{}-{}",
        source.buffer_key(),
        view.byte_offset,
        view.byte_end()
    );
    if meshopt {
        key.push_str("-meshopt");
    }
    key
}

pub fn gltf_key(uri: &Url) -> String {
    format!("gltf:{uri}")
}

/// vertex buffer 请求中所有参与 key 的参数
#[derive(Clone, Debug)]
pub struct VertexKeyParams<'a> {
    pub source: &'a BufferSource,
    /// accessor 所在的 buffer view；Draco 压缩时是扩展声明的 view
    pub view: &'a ViewDesc,
    pub accessor: &'a AccessorDesc,
    pub draco_semantic: Option<&'a str>,
    pub dequantize: bool,
    /// 需要 GPU buffer 时为对应的 context id
    pub gpu_context: Option<u64>,
    pub typed_array: bool,
}

pub fn vertex_buffer_key(params: &VertexKeyParams<'_>) -> String {
    let mut key = format!(
        "vertex-buffer:{}-range-{}-{}-stride-{}{}",
        params.source.buffer_key(),
        params.view.byte_offset,
        params.view.byte_end(),
        params.view.byte_stride.unwrap_or(params.accessor.element_size()),
        accessor_segment(params.accessor.byte_offset, params.accessor),
    );
    if let Some(semantic) = params.draco_semantic {
        key.push_str("-draco-");
        key.push_str(semantic);
    }
    if params.dequantize {
        key.push_str("-dequantize");
    }
    push_output_flags(&mut key, params.gpu_context, params.typed_array);
    key
}

/// index buffer 请求中所有参与 key 的参数
#[derive(Clone, Debug)]
pub struct IndexKeyParams<'a> {
    pub source: &'a BufferSource,
    pub view: &'a ViewDesc,
    pub accessor: &'a AccessorDesc,
    pub draco: bool,
    pub gpu_context: Option<u64>,
    pub typed_array: bool,
}

/// index buffer 的 key 使用 accessor 在 buffer 内的绝对偏移
pub fn index_buffer_key(params: &IndexKeyParams<'_>) -> String {
    let absolute_offset = params.view.byte_offset + params.accessor.byte_offset;
    let mut key = format!(
        "index-buffer:{}{}",
        params.source.buffer_key(),
        accessor_segment(absolute_offset, params.accessor),
    );
    if params.draco {
        key.push_str("-draco");
    }
    push_output_flags(&mut key, params.gpu_context, params.typed_array);
    key
}

/// image 的来源
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageSource {
    /// 引用 buffer view 的嵌入图片
    View { source: BufferSource, view: ViewDesc },
    /// 外部图片，已经解析为绝对 uri
    External(Url),
}

impl ImageSource {
    pub fn cache_key(&self) -> String {
        format!("image:{}", self.key_body())
    }

    /// 去掉 `image:` 前缀的部分，texture key 中使用
    pub fn key_body(&self) -> String {
        match self {
            Self::View { source, view } => {
                format!("{}-range-{}-{}", source.buffer_key(), view.byte_offset, view.byte_end())
            }
            Self::External(uri) => uri.to_string(),
        }
    }
}

pub fn texture_key(image: &ImageSource, sampler: &Sampler, context_id: u64) -> String {
    format!(
        "texture:{}-sampler-{}-{}-{}-{}-context-{}",
        image.key_body(),
        sampler.wrap_s.gl_enum(),
        sampler.wrap_t.gl_enum(),
        sampler.min_filter.gl_enum(),
        sampler.mag_filter.gl_enum(),
        context_id
    )
}

fn accessor_segment(byte_offset: usize, accessor: &AccessorDesc) -> String {
    format!(
        "-accessor-{}-{}-{}-{}",
        byte_offset,
        accessor.component_type.gl_enum(),
        accessor.element_type,
        accessor.count
    )
}

fn push_output_flags(key: &mut String, gpu_context: Option<u64>, typed_array: bool) {
    if let Some(context_id) = gpu_context {
        key.push_str(&format!("-buffer-context-{context_id}"));
    }
    if typed_array {
        key.push_str("-typed-array");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{ComponentType, ElementType};
    use crate::sampler::{MinFilter, WrapMode};

    fn parent() -> Url {
        Url::parse("file:///models/box.glb").unwrap()
    }

    fn position() -> AccessorDesc {
        AccessorDesc {
            byte_offset: 0,
            component_type: ComponentType::F32,
            element_type: ElementType::Vec3,
            count: 3,
            normalized: false,
        }
    }

    #[test]
    fn test_buffer_keys() {
        let embedded = BufferSource::Embedded { parent: parent(), index: 0 };
        let external = BufferSource::External(Url::parse("https://example.com/a/data.bin").unwrap());

        assert_eq!(embedded.cache_key(), "embedded-buffer:file:///models/box.glb-buffer-id-0");
        assert_eq!(external.cache_key(), "external-buffer:https://example.com/a/data.bin");

        let view = ViewDesc {
            byte_offset: 16,
            byte_length: 36,
            byte_stride: None,
        };
        assert_eq!(
            buffer_view_key(&embedded, &view, false),
            "buffer-view:file:///models/box.glb-buffer-id-0-range-16-52"
        );
        assert_eq!(
            buffer_view_key(&embedded, &view, true),
            "buffer-view:file:///models/box.glb-buffer-id-0-range-16-52-meshopt"
        );
    }

    #[test]
    fn test_vertex_key_covers_accessor_and_output_shape() {
        let source = BufferSource::Embedded { parent: parent(), index: 0 };
        let view = ViewDesc {
            byte_offset: 0,
            byte_length: 72,
            byte_stride: None,
        };
        let accessor = position();
        let base = VertexKeyParams {
            source: &source,
            view: &view,
            accessor: &accessor,
            draco_semantic: None,
            dequantize: false,
            gpu_context: Some(1),
            typed_array: false,
        };

        assert_eq!(
            vertex_buffer_key(&base),
            "vertex-buffer:file:///models/box.glb-buffer-id-0-range-0-72-stride-12-accessor-0-5126-VEC3-3-buffer-context-1"
        );

        let normal = AccessorDesc {
            byte_offset: 36,
            ..accessor
        };
        let other = VertexKeyParams {
            accessor: &normal,
            ..base.clone()
        };
        assert_ne!(vertex_buffer_key(&base), vertex_buffer_key(&other));

        let typed = VertexKeyParams {
            typed_array: true,
            ..base.clone()
        };
        assert!(vertex_buffer_key(&typed).ends_with("-buffer-context-1-typed-array"));

        let strided_view = ViewDesc {
            byte_stride: Some(16),
            ..view
        };
        let strided = VertexKeyParams {
            view: &strided_view,
            ..base.clone()
        };
        assert!(vertex_buffer_key(&strided).contains("-range-0-72-stride-16-"));
        assert_ne!(vertex_buffer_key(&base), vertex_buffer_key(&strided));
    }

    #[test]
    fn test_index_key_uses_absolute_offset() {
        let source = BufferSource::External(Url::parse("file:///a.bin").unwrap());
        let view = ViewDesc {
            byte_offset: 100,
            byte_length: 12,
            byte_stride: None,
        };
        let accessor = AccessorDesc {
            byte_offset: 4,
            component_type: ComponentType::U16,
            element_type: ElementType::Scalar,
            count: 3,
            normalized: false,
        };
        let key = index_buffer_key(&IndexKeyParams {
            source: &source,
            view: &view,
            accessor: &accessor,
            draco: false,
            gpu_context: None,
            typed_array: true,
        });

        assert_eq!(key, "index-buffer:file:///a.bin-accessor-104-5123-SCALAR-3-typed-array");
    }

    #[test]
    fn test_texture_key() {
        let image = ImageSource::View {
            source: BufferSource::Embedded { parent: parent(), index: 0 },
            view: ViewDesc {
                byte_offset: 8,
                byte_length: 100,
                byte_stride: None,
            },
        };
        let sampler = Sampler {
            wrap_s: WrapMode::ClampToEdge,
            min_filter: MinFilter::LinearMipmapLinear,
            ..Sampler::default()
        };

        assert_eq!(image.cache_key(), "image:file:///models/box.glb-buffer-id-0-range-8-108");
        assert_eq!(
            texture_key(&image, &sampler, 7),
            "texture:file:///models/box.glb-buffer-id-0-range-8-108-sampler-33071-10497-9987-9729-context-7"
        );
    }
}
