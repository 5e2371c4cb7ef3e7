//! 流式 glTF 资源加载
//!
//! 把 glTF 2.0 资产加载成 GPU 资源（vertex / index buffer、texture）。
//! 同一段字节或同一张图片在一个资产内、或者多个同时加载的资产之间被多次引用时，只加载一次。
//!
//! # 结构
//! - [`ResourceCache`]：以 cache key 去重、带引用计数的 loader 注册表
//! - [`loaders`]：每种资源一个被轮询的状态机，通过 cache 请求子资源
//! - [`AssetLoader`]：遍历场景，汇总 geometry 和 texture 两组资源
//! - [`JobScheduler`]：把 GPU 资源创建按帧切片
//!
//! # 使用
//! ```ignore
//! let mut cache = ResourceCache::from_config(&config)?;
//! let mut frame = FrameState::new(JobScheduler::new(&config.budgets));
//! let mut asset = AssetLoader::new(AssetLoadOptions::from_config(uri, &config).with_device(device));
//! asset.load(&mut cache);
//! while !asset.state().is_settled() {
//!     frame.next_frame();
//!     asset.process(&mut cache, &mut frame);
//! }
//! asset.destroy(&mut cache);
//! ```

pub mod accessor;
pub mod asset_loader;
pub mod bytes;
pub mod cache;
pub mod cache_key;
pub mod config;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod io;
pub mod job_scheduler;
pub mod loaders;
pub mod packing;
pub mod sampler;
pub mod state;

#[cfg(test)]
pub(crate) mod test_utils;

pub use asset_loader::{AssetLoadOptions, AssetLoader};
pub use cache::{CacheStatistics, LoaderHandle, ResourceCache};
pub use config::LoaderConfig;
pub use error::{LoadError, LoadErrorKind, LoadResult};
pub use frame::FrameState;
pub use gpu::{GpuDevice, HeadlessDevice};
pub use job_scheduler::{JobScheduler, JobType};
pub use loaders::ResourceLoader;
pub use state::LoaderState;
