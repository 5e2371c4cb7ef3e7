use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::job_scheduler::JobType;

/// 每种 job 每帧的时间预算（毫秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobBudgetConfig {
    pub texture_ms: u64,
    pub program_ms: u64,
    pub buffer_upload_ms: u64,
}

impl Default for JobBudgetConfig {
    fn default() -> Self {
        Self {
            texture_ms: 10,
            program_ms: 10,
            buffer_upload_ms: 30,
        }
    }
}

impl JobBudgetConfig {
    pub fn budget(&self, job_type: JobType) -> Duration {
        let ms = match job_type {
            JobType::Texture => self.texture_ms,
            JobType::Program => self.program_ms,
            JobType::BufferUpload => self.buffer_upload_ms,
        };
        Duration::from_millis(ms)
    }
}

/// 加载管线的配置，可以从 TOML 文件读取
///
/// ```toml
/// io_worker_threads = 4
/// asynchronous = true
///
/// [budgets]
/// texture_ms = 10
/// buffer_upload_ms = 30
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub budgets: JobBudgetConfig,

    /// IO 线程数，0 表示由 rayon 决定
    pub io_worker_threads: usize,

    /// GPU 资源创建是否按帧切片（交给 JobScheduler）
    pub asynchronous: bool,

    /// 为 false 时 geometry 的 ready 也要等待 texture 结束
    pub incrementally_load_textures: bool,

    /// 处理 `CESIUM_primitive_outline`
    pub generate_outlines: bool,

    /// 加载完成后是否保留 CPU 端的 typed array
    pub keep_typed_arrays: bool,

    /// 对量化过的 attribute 做反量化（目前未实现）
    pub dequantize: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            budgets: JobBudgetConfig::default(),
            io_worker_threads: 0,
            asynchronous: true,
            incrementally_load_textures: true,
            generate_outlines: true,
            keep_typed_arrays: false,
            dequantize: false,
        }
    }
}

impl LoaderConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).with_context(|| format!("failed to read config {:?}", path.as_ref()))?;
        Self::from_toml_str(&content).with_context(|| format!("failed to parse config {:?}", path.as_ref()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_fields() {
        let config = LoaderConfig::from_toml_str(
            r#"
            asynchronous = false

            [budgets]
            texture_ms = 4
            "#,
        )
        .unwrap();

        assert!(!config.asynchronous);
        assert!(config.incrementally_load_textures);
        assert_eq!(config.budgets.texture_ms, 4);
        assert_eq!(config.budgets.buffer_upload_ms, 30);
        assert_eq!(config.budgets.budget(JobType::Program), Duration::from_millis(10));
    }

    #[test]
    fn test_empty_and_invalid() {
        assert_eq!(LoaderConfig::from_toml_str("").unwrap(), LoaderConfig::default());
        assert!(LoaderConfig::from_toml_str("io_worker_threads = \"many\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loader.toml");
        fs::write(&path, "generate_outlines = false\nio_worker_threads = 2\n").unwrap();

        let config = LoaderConfig::from_file(&path).unwrap();
        assert!(!config.generate_outlines);
        assert_eq!(config.io_worker_threads, 2);
        assert!(LoaderConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
