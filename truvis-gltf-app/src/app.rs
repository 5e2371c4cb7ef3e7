use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use truvis_crate_tools::init_log::init_log;
use truvis_crate_tools::resource::TruvisPath;
use truvis_gltf_stream::{
    AssetLoadOptions, AssetLoader, FrameState, HeadlessDevice, JobScheduler, LoaderConfig, LoaderState, ResourceCache,
    ResourceLoader,
};
use url::Url;

/// 用模拟的帧循环加载 glTF 资产，并输出每帧的进度
#[derive(Parser, Debug)]
#[command(name = "gltf-stream", version)]
pub struct StreamArgs {
    /// 资产的路径或 url，可以指定多个；相同的资源只会加载一次
    #[arg(required = true)]
    pub assets: Vec<String>,

    /// TOML 配置文件
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 最多运行的帧数
    #[arg(long, default_value_t = 600)]
    pub max_frames: u64,

    /// 模拟的帧间隔
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// 模拟只支持 power-of-two texture 的设备
    #[arg(long)]
    pub webgl1: bool,
}

pub struct StreamApp {
    cache: ResourceCache,
    frame: FrameState,
    device: Arc<HeadlessDevice>,
    assets: Vec<AssetLoader>,

    max_frames: u64,
    frame_interval: Duration,
}
// new & init
impl StreamApp {
    pub fn new(args: &StreamArgs) -> anyhow::Result<Self> {
        init_log();
        tracy_client::Client::start();
        tracy_client::set_thread_name!("StreamThread");

        let config = match &args.config {
            Some(path) => LoaderConfig::from_file(path)?,
            None => LoaderConfig::default(),
        };
        log::info!("config: {:?}", config);

        let device = Arc::new(if args.webgl1 {
            HeadlessDevice::webgl1_class(1)
        } else {
            HeadlessDevice::new(1)
        });

        let assets = args
            .assets
            .iter()
            .map(|asset| {
                let uri = Self::asset_url(asset)?;
                Ok(AssetLoader::new(
                    AssetLoadOptions::from_config(uri, &config).with_device(device.clone()),
                ))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            cache: ResourceCache::from_config(&config)?,
            frame: FrameState::new(JobScheduler::new(&config.budgets)),
            device,
            assets,
            max_frames: args.max_frames,
            frame_interval: Duration::from_millis(args.frame_ms),
        })
    }

    /// 带 scheme 的直接解析，否则当作本地路径
    fn asset_url(asset: &str) -> anyhow::Result<Url> {
        if let Ok(url) = Url::parse(asset)
            && matches!(url.scheme(), "file" | "http" | "https" | "data")
        {
            return Ok(url);
        }

        let path = TruvisPath::resolve_asset(asset);
        let path = path
            .canonicalize()
            .with_context(|| format!("asset not found: {}", path.display()))?;
        Url::from_file_path(&path).map_err(|_| anyhow::anyhow!("invalid asset path: {}", path.display()))
    }
}
// update
impl StreamApp {
    pub fn run(&mut self) {
        for asset in &mut self.assets {
            asset.load(&mut self.cache);
        }

        let start = Instant::now();
        while self.frame.frame_id() < self.max_frames && !self.is_finished() {
            let frame_start = Instant::now();
            self.update();
            tracy_client::frame_mark();

            let elapsed = frame_start.elapsed();
            if elapsed < self.frame_interval {
                std::thread::sleep(self.frame_interval - elapsed);
            }
        }

        log::info!(
            "Finished after {} frames in {:.2}s",
            self.frame.frame_id(),
            start.elapsed().as_secs_f64()
        );
        self.report();
    }

    fn is_finished(&self) -> bool {
        self.assets
            .iter()
            .all(|asset| asset.state().is_failed() || (asset.is_ready() && asset.is_textures_ready()))
    }

    fn update(&mut self) {
        let _span = tracy_client::span!("StreamApp::update");
        self.frame.next_frame();

        for asset in &mut self.assets {
            let before = (asset.state(), asset.is_textures_ready());
            asset.process(&mut self.cache, &mut self.frame);
            let after = (asset.state(), asset.is_textures_ready());
            if before != after {
                log::info!(
                    "{} {}: {:?}, textures ready: {}",
                    self.frame.frame_name(),
                    asset.options().uri,
                    after.0,
                    after.1
                );
            }
        }

        let scheduler = self.frame.job_scheduler();
        log::debug!(
            "{} job time {:?} / {:?}",
            self.frame.frame_name(),
            scheduler.total_used_this_frame(),
            scheduler.total_budget()
        );
    }

    fn report(&self) {
        for asset in &self.assets {
            match asset.state() {
                LoaderState::Failed => {
                    let error = asset.error().map(|e| e.chain()).unwrap_or_default();
                    log::error!("{}: {}", asset.options().uri, error);
                }
                state => log::info!(
                    "{}: {:?}, {} nodes, {} primitives, {} materials, {} texture failures, {} generated bytes",
                    asset.options().uri,
                    state,
                    asset.nodes().len(),
                    asset.primitives().len(),
                    asset.materials().len(),
                    asset.texture_failures(),
                    asset.generated_bytes()
                ),
            }
        }

        let statistics = self.cache.statistics();
        log::info!(
            "cache: {} entries, {} hits, {} misses, {} geometry bytes, {} texture bytes",
            statistics.live_entries,
            statistics.hits,
            statistics.misses,
            statistics.geometry_bytes,
            statistics.texture_bytes
        );
        log::info!(
            "device: {} vertex buffers, {} index buffers, {} textures",
            self.device.vertex_buffers_created(),
            self.device.index_buffers_created(),
            self.device.textures_created()
        );
    }
}
// destroy
impl Drop for StreamApp {
    fn drop(&mut self) {
        for asset in &mut self.assets {
            asset.destroy(&mut self.cache);
        }
        log::info!("{} live GPU resources after destroy", self.device.live_resources());
    }
}
