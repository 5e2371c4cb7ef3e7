use anyhow::Context;
use base64::Engine;
use std::io::Read;
use std::sync::OnceLock;
use url::Url;

use crate::error::{LoadError, LoadResult};

/// 把 uri 读取成字节
///
/// 运行在 IO 线程上，因此必须是 `Send + Sync`。
pub trait ByteFetcher: Send + Sync {
    fn fetch(&self, uri: &Url) -> anyhow::Result<Vec<u8>>;
}

/// 默认的 fetcher，支持 `file:`、`data:`（base64）和 `http(s):`
#[derive(Default)]
pub struct UriFetcher {
    /// 第一次遇到 http 请求时才创建
    client: OnceLock<reqwest::blocking::Client>,
}
// new & init
impl UriFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}
// tools
impl UriFetcher {
    fn http_client(&self) -> anyhow::Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .user_agent("Truvis-glTF-Stream/0.1")
            .build()
            .context("failed to create http client")?;
        Ok(self.client.get_or_init(|| client))
    }

    fn fetch_file(uri: &Url) -> anyhow::Result<Vec<u8>> {
        let path = uri.to_file_path().map_err(|_| anyhow::anyhow!("{uri} is not a local file path"))?;
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn fetch_http(&self, uri: &Url) -> anyhow::Result<Vec<u8>> {
        log::debug!("GET {}", uri);
        let response = self.http_client()?.get(uri.clone()).send().context("failed to send http request")?;
        if !response.status().is_success() {
            anyhow::bail!("http request failed: {}", response.status());
        }

        let mut data = Vec::new();
        let mut reader = response;
        reader.read_to_end(&mut data).context("failed to read response body")?;
        Ok(data)
    }
}

impl ByteFetcher for UriFetcher {
    fn fetch(&self, uri: &Url) -> anyhow::Result<Vec<u8>> {
        let _span = tracy_client::span!("UriFetcher::fetch");
        match uri.scheme() {
            "file" => Self::fetch_file(uri),
            "data" => decode_data_uri(uri.as_str()),
            "http" | "https" => self.fetch_http(uri),
            scheme => anyhow::bail!("unsupported uri scheme '{scheme}'"),
        }
    }
}

/// 解码 `data:[<mediatype>];base64,<data>`
pub fn decode_data_uri(uri: &str) -> anyhow::Result<Vec<u8>> {
    let body = uri.strip_prefix("data:").context("not a data uri")?;
    let (header, payload) = body.split_once(',').context("data uri has no ',' separator")?;
    if !header.ends_with(";base64") {
        anyhow::bail!("only base64 data uris are supported, got '{header}'");
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("invalid base64 payload in data uri")
}

/// 以 `base` 为基准解析 glTF 中的相对 uri
pub fn resolve_uri(base: &Url, reference: &str) -> LoadResult<Url> {
    base.join(reference)
        .map_err(|e| LoadError::malformed(format!("invalid uri '{reference}' relative to {base}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_data_uri() {
        let bytes = decode_data_uri("data:application/octet-stream;base64,AAECAw==").unwrap();
        assert_eq!(bytes, vec![0, 1, 2, 3]);
        assert!(decode_data_uri("data:text/plain,hello").is_err());
    }

    #[test]
    fn test_file_uri() {
        crate::test_utils::init_test_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[9, 8, 7]).unwrap();
        let uri = Url::from_file_path(file.path()).unwrap();

        let fetcher = UriFetcher::new();
        assert_eq!(fetcher.fetch(&uri).unwrap(), vec![9, 8, 7]);

        let missing = uri.join("does-not-exist.bin").unwrap();
        let err = fetcher.fetch(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"));
    }

    #[test]
    fn test_resolve_relative() {
        let base = Url::parse("https://example.com/models/box/box.gltf").unwrap();
        assert_eq!(
            resolve_uri(&base, "textures/albedo.png").unwrap().as_str(),
            "https://example.com/models/box/textures/albedo.png"
        );
        assert_eq!(resolve_uri(&base, "data:;base64,AA==").unwrap().scheme(), "data");
    }
}
