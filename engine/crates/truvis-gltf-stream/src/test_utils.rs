//! 测试共用的工具：内存 fetcher、headless device，以及可拼装的 glTF 数据

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use base64::Engine;
use serde_json::{Value, json};
use url::Url;

use crate::cache::{LoaderHandle, ResourceCache};
use crate::frame::FrameState;
use crate::gpu::{GpuDevice, HeadlessDevice};
use crate::io::fetcher::decode_data_uri;
use crate::io::{ByteFetcher, IoDispatcher, RasterDecoder};

static INIT: Once = Once::new();

/// 日志 + tracy client；所有会走到 `tracy_client::span!` 的测试都需要先调用
pub fn init_test_env() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Debug).try_init();
        tracy_client::Client::start();
    });
}

pub fn file_url(path: &str) -> Url {
    Url::parse(&format!("file://{path}")).unwrap()
}

/// 从内存中读取文件，并记录 fetch 次数
#[derive(Default)]
pub struct MemoryFetcher {
    files: Mutex<HashMap<Url, Vec<u8>>>,
    fetch_count: AtomicUsize,
}

impl MemoryFetcher {
    pub fn insert(&self, uri: &Url, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(uri.clone(), bytes);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

impl ByteFetcher for MemoryFetcher {
    fn fetch(&self, uri: &Url) -> anyhow::Result<Vec<u8>> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if uri.scheme() == "data" {
            return decode_data_uri(uri.as_str());
        }
        self.files
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404: {uri}"))
    }
}

pub struct TestContext {
    pub cache: ResourceCache,
    pub fetcher: Arc<MemoryFetcher>,
    pub device: Arc<HeadlessDevice>,
    pub frame: FrameState,
}

impl TestContext {
    /// IO 在调用线程上同步执行
    pub fn new() -> Self {
        init_test_env();
        let fetcher = Arc::new(MemoryFetcher::default());
        let cache = ResourceCache::new(IoDispatcher::inline(), fetcher.clone(), Arc::new(RasterDecoder));
        Self {
            cache,
            fetcher,
            device: Arc::new(HeadlessDevice::new(1)),
            frame: FrameState::default(),
        }
    }

    pub fn gpu_device(&self) -> Arc<dyn GpuDevice> {
        self.device.clone()
    }

    /// 逐帧处理，直到 loader 结束
    pub fn settle(&mut self, handle: LoaderHandle) {
        for _ in 0..64 {
            if self.cache.state(handle).is_settled() {
                return;
            }
            self.frame.next_frame();
            self.cache.process(handle, &mut self.frame);
        }
    }
}

/// 纯色 PNG
pub fn encode_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    bytes.into_inner()
}

const FLOAT: u32 = 5126;
const UNSIGNED_SHORT: u32 = 5123;

/// 一个可以逐步添加内容的 glTF
///
/// bin 的布局：
/// - `0..36`：三个 VEC3 position
/// - `36..42`：u16 index，补齐到 44
/// - `with_outline()` 之后，`44..56` 是 u16 的 outline 边
pub struct GltfFixture {
    json: Value,
    bin: Vec<u8>,
}

impl GltfFixture {
    /// 一个带 index 的三角形，node 上有 translation
    pub fn triangle() -> Self {
        let positions: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let mut bin = bytemuck::cast_slice::<[f32; 3], u8>(&positions).to_vec();
        bin.extend_from_slice(bytemuck::cast_slice::<u16, u8>(&[0, 1, 2]));
        bin.extend_from_slice(&[0, 0]);

        let json = json!({
            "asset": {"version": "2.0"},
            "scene": 0,
            "scenes": [{"nodes": [0]}],
            "nodes": [{"mesh": 0, "translation": [1.0, 2.0, 3.0]}],
            "meshes": [{
                "primitives": [{"attributes": {"POSITION": 0}, "indices": 1, "mode": 4}]
            }],
            "accessors": [
                {
                    "bufferView": 0,
                    "componentType": FLOAT,
                    "count": 3,
                    "type": "VEC3",
                    "min": [0.0, 0.0, 0.0],
                    "max": [1.0, 1.0, 0.0]
                },
                {"bufferView": 1, "componentType": UNSIGNED_SHORT, "count": 3, "type": "SCALAR"}
            ],
            "bufferViews": [
                {"buffer": 0, "byteOffset": 0, "byteLength": 36},
                {"buffer": 0, "byteOffset": 36, "byteLength": 6}
            ],
            "buffers": [{"byteLength": 44}]
        });
        Self { json, bin }
    }

    fn push(&mut self, array: &str, value: Value) -> usize {
        let array = self.json[array].as_array_mut().unwrap();
        array.push(value);
        array.len() - 1
    }

    fn first_primitive(&mut self) -> &mut Value {
        &mut self.json["meshes"][0]["primitives"][0]
    }

    fn use_extension(&mut self, name: &str) {
        if self.json.get("extensionsUsed").is_none() {
            self.json["extensionsUsed"] = json!([]);
        }
        self.push("extensionsUsed", json!(name));
    }

    /// 去掉 primitive 的 indices，index 的数据仍然留在 bin 里
    pub fn without_indices(mut self) -> Self {
        if let Some(primitive) = self.first_primitive().as_object_mut() {
            primitive.remove("indices");
        }
        self
    }

    /// 三条边都是 outline
    pub fn with_outline(mut self) -> Self {
        let offset = self.bin.len();
        self.bin
            .extend_from_slice(bytemuck::cast_slice::<u16, u8>(&[0, 1, 1, 2, 2, 0]));
        let view = self.push("bufferViews", json!({"buffer": 0, "byteOffset": offset, "byteLength": 12}));
        let accessor = self.push(
            "accessors",
            json!({"bufferView": view, "componentType": UNSIGNED_SHORT, "count": 6, "type": "SCALAR"}),
        );
        self.first_primitive()["extensions"] = json!({"CESIUM_primitive_outline": {"indices": accessor}});
        self.use_extension("CESIUM_primitive_outline");
        self
    }

    pub fn with_draco(mut self) -> Self {
        self.first_primitive()["extensions"] = json!({
            "KHR_draco_mesh_compression": {"bufferView": 0, "attributes": {"POSITION": 0}}
        });
        self.use_extension("KHR_draco_mesh_compression");
        self
    }

    /// POSITION 带一个稀疏替换
    pub fn with_sparse_positions(mut self) -> Self {
        self.json["accessors"][0]["sparse"] = json!({
            "count": 1,
            "indices": {"bufferView": 1, "componentType": UNSIGNED_SHORT},
            "values": {"bufferView": 0}
        });
        self
    }

    /// base color 使用外部图片 `uri`
    pub fn with_texture(mut self, uri: &str) -> Self {
        self.json["images"] = json!([{"uri": uri}]);
        self.json["samplers"] = json!([{"wrapS": 33071, "wrapT": 33071}]);
        self.json["textures"] = json!([{"source": 0, "sampler": 0}]);
        self.json["materials"] = json!([{
            "name": "textured",
            "pbrMetallicRoughness": {"baseColorTexture": {"index": 0}}
        }]);
        self.first_primitive()["material"] = json!(0);
        self
    }

    /// 第二个 primitive（LINES，没有 index）读取同一个 position buffer view 的后两个顶点
    pub fn with_primitive_on_shared_view(mut self) -> Self {
        let accessor = self.push(
            "accessors",
            json!({
                "bufferView": 0,
                "byteOffset": 12,
                "componentType": FLOAT,
                "count": 2,
                "type": "VEC3",
                "min": [0.0, 0.0, 0.0],
                "max": [1.0, 1.0, 0.0]
            }),
        );
        self.json["meshes"][0]["primitives"]
            .as_array_mut()
            .unwrap()
            .push(json!({"attributes": {"POSITION": accessor}, "mode": 1}));
        self
    }

    pub fn bin(&self) -> &[u8] {
        &self.bin
    }

    fn json_with_buffer(&self, uri: Option<String>) -> Value {
        let mut json = self.json.clone();
        json["buffers"][0]["byteLength"] = json!(self.bin.len());
        if let Some(uri) = uri {
            json["buffers"][0]["uri"] = json!(uri);
        }
        json
    }

    pub fn to_glb(&self) -> Vec<u8> {
        let mut json = serde_json::to_vec(&self.json_with_buffer(None)).unwrap();
        while json.len() % 4 != 0 {
            json.push(b' ');
        }
        let mut bin = self.bin.clone();
        while bin.len() % 4 != 0 {
            bin.push(0);
        }

        let total = 12 + 8 + json.len() + 8 + bin.len();
        let mut glb = Vec::with_capacity(total);
        glb.extend_from_slice(b"glTF");
        glb.extend_from_slice(&2u32.to_le_bytes());
        glb.extend_from_slice(&(total as u32).to_le_bytes());
        glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"JSON");
        glb.extend_from_slice(&json);
        glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"BIN\0");
        glb.extend_from_slice(&bin);
        glb
    }

    /// buffer 以 base64 data uri 嵌入
    pub fn to_embedded_json(&self) -> Vec<u8> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bin);
        let uri = format!("data:application/octet-stream;base64,{encoded}");
        serde_json::to_vec(&self.json_with_buffer(Some(uri))).unwrap()
    }

    /// buffer 引用相对路径 `bin_uri`
    pub fn to_external_json(&self, bin_uri: &str) -> Vec<u8> {
        serde_json::to_vec(&self.json_with_buffer(Some(bin_uri.to_string()))).unwrap()
    }
}
