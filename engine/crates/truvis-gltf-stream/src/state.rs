/// 资源加载状态机
///
/// 状态流转: Unloaded -> Loading -> (Processing) -> Ready
///                                     \-> Failed
///
/// 只允许向前推进；回到 Unloaded 的唯一途径是显式调用 `unload()`。
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LoaderState {
    /// 初始状态，尚未调用 load
    #[default]
    Unloaded,
    /// 等待依赖：IO 线程读取 / 解码，或者子 loader 还没有就绪
    Loading,
    /// CPU 端数据已经就绪，正在做 repack / 转码 / GPU 资源创建
    Processing,
    /// 输出已经就绪，之后不会再变化
    Ready,
    /// 失败，错误保存在 loader 中
    Failed,
}

impl LoaderState {
    /// 用于判断状态是否单调前进
    #[inline]
    pub fn rank(self) -> u8 {
        match self {
            Self::Unloaded => 0,
            Self::Loading => 1,
            Self::Processing => 2,
            Self::Ready | Self::Failed => 3,
        }
    }

    /// Ready 或 Failed
    #[inline]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    #[inline]
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    #[inline]
    pub fn is_failed(self) -> bool {
        self == Self::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_is_monotonic() {
        let order = [
            LoaderState::Unloaded,
            LoaderState::Loading,
            LoaderState::Processing,
            LoaderState::Ready,
        ];
        assert!(order.windows(2).all(|w| w[0].rank() < w[1].rank()));
        assert_eq!(LoaderState::Ready.rank(), LoaderState::Failed.rank());
        assert!(LoaderState::Failed.is_settled());
        assert!(!LoaderState::Processing.is_settled());
    }
}
