use std::sync::Arc;

use url::Url;

use crate::accessor::ViewDesc;
use crate::bytes::SharedBytes;
use crate::cache::{LoaderHandle, ResourceCache};
use crate::cache_key::{BufferSource, ImageSource};
use crate::error::{LoadError, LoadResult};
use crate::frame::FrameState;
use crate::io::fetcher::{decode_data_uri, resolve_uri};
use crate::io::{IoPoll, IoTask};
use crate::loaders::{LoaderCore, ResourceLoader};
use crate::state::LoaderState;

const GLB_MAGIC: &[u8] = b"glTF";
const GLB_HEADER_LENGTH: usize = 12;
const GLB_CHUNK_HEADER_LENGTH: usize = 8;

/// 可以出现在 `extensionsRequired` 中的扩展
///
/// 其中 Draco / meshopt / KTX2 会在对应的 loader 中以 NotImplemented 失败。
const KNOWN_REQUIRED_EXTENSIONS: &[&str] = &[
    "CESIUM_primitive_outline",
    "EXT_meshopt_compression",
    "EXT_texture_webp",
    "KHR_draco_mesh_compression",
    "KHR_materials_unlit",
    "KHR_mesh_quantization",
    "KHR_texture_basisu",
    "KHR_texture_transform",
];

#[derive(Clone, Debug)]
pub struct GltfJsonRequest {
    /// 文档的绝对 uri，也是相对 uri 的解析基准
    pub uri: Url,
    /// 已经在内存中的文档字节；None 时通过 fetcher 读取
    pub bytes: Option<SharedBytes>,
}

/// 解析完成的文档
struct ParsedGltf {
    document: gltf::Document,
    json: serde_json::Value,
    required_extensions: Vec<String>,
    /// buffer index -> 字节；GLB 的 BIN chunk 和 data uri
    embedded_buffers: Vec<(usize, SharedBytes)>,
}

/// 顶层 glTF / GLB 文档
///
/// Ready 时所有嵌入的 buffer 都已经注册到 cache 中，外部 buffer 由 buffer view 按需加载。
pub struct GltfJsonLoader {
    core: LoaderCore,
    request: GltfJsonRequest,
    parse: Option<IoTask<LoadResult<ParsedGltf>>>,

    document: Option<Arc<gltf::Document>>,
    json: Option<Arc<serde_json::Value>>,
    required_extensions: Vec<String>,
    embedded_buffers: Vec<LoaderHandle>,
}
// new & init
impl GltfJsonLoader {
    pub fn new(cache_key: String, request: GltfJsonRequest) -> Self {
        Self {
            core: LoaderCore::new(cache_key),
            request,
            parse: None,
            document: None,
            json: None,
            required_extensions: Vec::new(),
            embedded_buffers: Vec::new(),
        }
    }
}
// getters
impl GltfJsonLoader {
    #[inline]
    pub fn uri(&self) -> &Url {
        &self.request.uri
    }

    /// 经过 `gltf` 校验的文档，Ready 之后可用
    #[inline]
    pub fn document(&self) -> Option<&Arc<gltf::Document>> {
        self.document.as_ref()
    }

    /// 原始 json，用于读取 `gltf` 不认识的扩展
    #[inline]
    pub fn json(&self) -> Option<&Arc<serde_json::Value>> {
        self.json.as_ref()
    }

    #[inline]
    pub fn required_extensions(&self) -> &[String] {
        &self.required_extensions
    }

    #[inline]
    pub fn embedded_buffers(&self) -> &[LoaderHandle] {
        &self.embedded_buffers
    }
}
// tools
impl GltfJsonLoader {
    fn fail(&mut self, cache: &mut ResourceCache, error: LoadError) {
        self.release_buffers(cache);
        self.parse = None;
        let context = format!("Failed to load glTF: {}", self.request.uri);
        self.core.fail(error, context);
    }

    fn release_buffers(&mut self, cache: &mut ResourceCache) {
        for handle in self.embedded_buffers.drain(..) {
            cache.unload(handle);
        }
    }

    fn poll_parse(&mut self, cache: &mut ResourceCache) {
        let Some(task) = &self.parse else {
            return;
        };

        let result = match task.poll() {
            IoPoll::Pending => return,
            IoPoll::Ready(result) => result,
            IoPoll::Lost => Err(LoadError::FetchFailure {
                uri: self.request.uri.to_string(),
                reason: "io worker dropped the request".to_string(),
            }),
        };
        self.parse = None;

        match result {
            Ok(parsed) => self.finish(cache, parsed),
            Err(e) => self.fail(cache, e),
        }
    }

    fn finish(&mut self, cache: &mut ResourceCache, parsed: ParsedGltf) {
        if !self.core.transition(LoaderState::Processing) {
            return;
        }
        for (index, bytes) in parsed.embedded_buffers {
            self.embedded_buffers
                .push(cache.load_embedded_buffer(&self.request.uri, index, bytes));
        }

        log::info!(
            "Parsed glTF {}: {} meshes, {} nodes, {} embedded buffers",
            self.request.uri,
            parsed.document.meshes().len(),
            parsed.document.nodes().len(),
            self.embedded_buffers.len()
        );
        if self.core.transition(LoaderState::Ready) {
            self.document = Some(Arc::new(parsed.document));
            self.json = Some(Arc::new(parsed.json));
            self.required_extensions = parsed.required_extensions;
        }
    }
}

impl ResourceLoader for GltfJsonLoader {
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

        // 内存中的文档直接解析，签名错误时不会发起任何 fetch
        if let Some(bytes) = self.request.bytes.clone() {
            match parse_gltf(&bytes) {
                Ok(parsed) => self.finish(cache, parsed),
                Err(e) => self.fail(cache, e),
            }
            return;
        }

        let fetcher = cache.fetcher().clone();
        let uri = self.request.uri.clone();
        self.parse = Some(cache.io().spawn(move || {
            let bytes = fetcher.fetch(&uri).map_err(|e| LoadError::fetch(&uri, &e))?;
            parse_gltf(&SharedBytes::new(bytes))
        }));
        self.poll_parse(cache);
    }

    fn process(&mut self, cache: &mut ResourceCache, _frame: &mut FrameState) {
        if self.core.state() == LoaderState::Loading {
            self.poll_parse(cache);
        }
    }

    fn unload(&mut self, cache: &mut ResourceCache) {
        self.release_buffers(cache);
        self.parse = None;
        self.document = None;
        self.json = None;
        self.required_extensions.clear();
        self.core.reset();
    }
}

/// glTF 中 buffer 的来源：GLB 的 BIN chunk 和 data uri 视为嵌入，其余解析为外部 uri
pub fn buffer_source(base: &Url, buffer: &gltf::Buffer<'_>) -> LoadResult<BufferSource> {
    match buffer.source() {
        gltf::buffer::Source::Bin => Ok(BufferSource::Embedded {
            parent: base.clone(),
            index: buffer.index(),
        }),
        gltf::buffer::Source::Uri(uri) if uri.starts_with("data:") => Ok(BufferSource::Embedded {
            parent: base.clone(),
            index: buffer.index(),
        }),
        gltf::buffer::Source::Uri(uri) => Ok(BufferSource::External(resolve_uri(base, uri)?)),
    }
}

/// glTF 中 image 的来源；data uri 的图片按外部 uri 处理，由 fetcher 解码
pub fn image_source(base: &Url, image: &gltf::Image<'_>) -> LoadResult<ImageSource> {
    match image.source() {
        gltf::image::Source::View { view, .. } => Ok(ImageSource::View {
            source: buffer_source(base, &view.buffer())?,
            view: ViewDesc::from_gltf(&view),
        }),
        gltf::image::Source::Uri { uri, .. } => Ok(ImageSource::External(resolve_uri(base, uri)?)),
    }
}

/// 识别 GLB / JSON，解析并校验
fn parse_gltf(bytes: &SharedBytes) -> LoadResult<ParsedGltf> {
    let _span = tracy_client::span!("parse_gltf");

    let (json_bytes, bin) = if bytes.starts_with(GLB_MAGIC) {
        split_glb(bytes)?
    } else {
        match bytes.iter().find(|byte| !byte.is_ascii_whitespace()) {
            Some(b'{') => (bytes.as_slice(), None),
            _ => {
                return Err(LoadError::malformed(
                    "document is neither a GLB container nor a JSON object",
                ));
            }
        }
    };

    let mut json: serde_json::Value =
        serde_json::from_slice(json_bytes).map_err(|e| LoadError::malformed(format!("invalid glTF json: {e}")))?;

    match json.pointer("/asset/version").and_then(serde_json::Value::as_str) {
        Some(version) if version.starts_with("2.") => {}
        Some(version) => {
            return Err(LoadError::not_implemented(format!("glTF version {version}")));
        }
        None => return Err(LoadError::malformed("missing asset.version")),
    }

    let required_extensions = take_required_extensions(&mut json)?;

    let root: gltf::json::Root = serde_json::from_value(json.clone())
        .map_err(|e| LoadError::malformed(format!("invalid glTF json: {e}")))?;
    let document =
        gltf::Document::from_json(root).map_err(|e| LoadError::malformed(format!("glTF validation failed: {e}")))?;

    let mut embedded_buffers = Vec::new();
    for buffer in document.buffers() {
        let data = match buffer.source() {
            gltf::buffer::Source::Bin => bin
                .clone()
                .ok_or_else(|| LoadError::malformed(format!("buffer {} refers to a missing BIN chunk", buffer.index())))?,
            gltf::buffer::Source::Uri(uri) if uri.starts_with("data:") => SharedBytes::new(
                decode_data_uri(uri).map_err(|e| LoadError::malformed(format!("buffer {}: {e:#}", buffer.index())))?,
            ),
            gltf::buffer::Source::Uri(_) => continue,
        };
        if data.len() < buffer.length() {
            return Err(LoadError::malformed(format!(
                "buffer {} declares {} bytes but only {} are present",
                buffer.index(),
                buffer.length(),
                data.len()
            )));
        }
        embedded_buffers.push((buffer.index(), data));
    }

    Ok(ParsedGltf {
        document,
        json,
        required_extensions,
        embedded_buffers,
    })
}

/// 拆分 GLB：返回 JSON chunk 和 BIN chunk（与输入共享内存）
fn split_glb(bytes: &SharedBytes) -> LoadResult<(&[u8], Option<SharedBytes>)> {
    let glb = gltf::Glb::from_slice(bytes).map_err(|e| LoadError::malformed(format!("invalid GLB container: {e}")))?;

    let json_length = glb.json.len();
    let json_start = GLB_HEADER_LENGTH + GLB_CHUNK_HEADER_LENGTH;
    let json_bytes = bytes
        .get(json_start..json_start + json_length)
        .ok_or_else(|| LoadError::malformed("GLB json chunk is truncated"))?;

    let bin = match &glb.bin {
        Some(bin_chunk) => {
            let padded_json_length = json_length.next_multiple_of(4);
            let bin_start = json_start + padded_json_length + GLB_CHUNK_HEADER_LENGTH;
            Some(bytes.slice(bin_start, bin_chunk.len())?)
        }
        None => None,
    };
    Ok((json_bytes, bin))
}

/// 取出并清空 `extensionsRequired`，遇到未知扩展时失败
fn take_required_extensions(json: &mut serde_json::Value) -> LoadResult<Vec<String>> {
    let Some(object) = json.as_object_mut() else {
        return Err(LoadError::malformed("glTF root is not a JSON object"));
    };
    let Some(required) = object.remove("extensionsRequired") else {
        return Ok(Vec::new());
    };

    let required: Vec<String> = serde_json::from_value(required)
        .map_err(|e| LoadError::malformed(format!("invalid extensionsRequired: {e}")))?;
    if let Some(unknown) = required
        .iter()
        .find(|extension| !KNOWN_REQUIRED_EXTENSIONS.contains(&extension.as_str()))
    {
        return Err(LoadError::not_implemented(format!("required extension {unknown}")));
    }
    Ok(required)
}
