/// 错误分类
///
/// `LoadError::kind()` 会穿过 `Context` 包装，返回最底层的分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// 网络 / URI 解析失败
    FetchFailure,
    /// 顶层签名错误、chunk 布局不一致、缺少必需字段、越界的 byte range
    MalformedAsset,
    /// 无法识别的图片签名
    UnsupportedFormat,
    /// 数据没有按元素大小对齐（可恢复，只会以 warning 形式出现）
    UnalignedData,
    /// 明确未实现的路径：Draco、meshopt、KTX2、mesh quantization 解码
    NotImplemented,
    /// GPU 资源创建失败
    Gpu,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to fetch {uri}: {reason}")]
    FetchFailure { uri: String, reason: String },

    #[error("malformed asset: {0}")]
    MalformedAsset(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("unaligned data: {0}")]
    UnalignedData(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("gpu resource creation failed: {0}")]
    Gpu(String),

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<LoadError>,
    },
}

pub type LoadResult<T> = Result<T, LoadError>;

// new & init
impl LoadError {
    /// collaborator 返回的 anyhow 错误，连同 cause chain 一起渲染成字符串
    pub fn fetch(uri: impl ToString, err: &anyhow::Error) -> Self {
        Self::FetchFailure {
            uri: uri.to_string(),
            reason: format!("{err:#}"),
        }
    }

    pub fn gpu(err: &anyhow::Error) -> Self {
        Self::Gpu(format!("{err:#}"))
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedAsset(message.into())
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented(message.into())
    }

    /// 在外面再包一层上下文，保留原始错误作为 source
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}
// getters
impl LoadError {
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            Self::FetchFailure { .. } => LoadErrorKind::FetchFailure,
            Self::MalformedAsset(_) => LoadErrorKind::MalformedAsset,
            Self::UnsupportedFormat(_) => LoadErrorKind::UnsupportedFormat,
            Self::UnalignedData(_) => LoadErrorKind::UnalignedData,
            Self::NotImplemented(_) => LoadErrorKind::NotImplemented,
            Self::Gpu(_) => LoadErrorKind::Gpu,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// 把整条错误链拼成一行，用于日志
    pub fn chain(&self) -> String {
        let mut message = self.to_string();
        let mut current = self;
        while let Self::Context { source, .. } = current {
            message.push_str(": ");
            message.push_str(&source.to_string());
            current = source;
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passes_through_context() {
        let err = LoadError::not_implemented("Draco mesh decoding")
            .context("Failed to load vertex buffer")
            .context("Failed to load glTF");

        assert_eq!(err.kind(), LoadErrorKind::NotImplemented);
        assert_eq!(err.to_string(), "Failed to load glTF");
        assert_eq!(
            err.chain(),
            "Failed to load glTF: Failed to load vertex buffer: not implemented: Draco mesh decoding"
        );
    }

    #[test]
    fn test_fetch_renders_anyhow_chain() {
        let cause = anyhow::anyhow!("connection refused").context("GET http://example.com/a.bin");
        let err = LoadError::fetch("http://example.com/a.bin", &cause);

        assert_eq!(err.kind(), LoadErrorKind::FetchFailure);
        assert!(err.to_string().contains("connection refused"));
    }
}
