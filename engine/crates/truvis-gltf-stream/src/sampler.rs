//! 纹理采样参数
//!
//! 数值与 glTF / OpenGL 的 enum 一致，直接用于 texture cache key。

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum WrapMode {
    ClampToEdge,
    MirroredRepeat,
    Repeat,
}

impl WrapMode {
    #[inline]
    pub fn gl_enum(self) -> u32 {
        match self {
            Self::ClampToEdge => 33071,
            Self::MirroredRepeat => 33648,
            Self::Repeat => 10497,
        }
    }

    /// REPEAT 和 MIRRORED_REPEAT 在 WebGL1 一类的设备上要求 power-of-two 尺寸
    #[inline]
    pub fn is_repeating(self) -> bool {
        matches!(self, Self::Repeat | Self::MirroredRepeat)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MinFilter {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

impl MinFilter {
    #[inline]
    pub fn gl_enum(self) -> u32 {
        match self {
            Self::Nearest => 9728,
            Self::Linear => 9729,
            Self::NearestMipmapNearest => 9984,
            Self::LinearMipmapNearest => 9985,
            Self::NearestMipmapLinear => 9986,
            Self::LinearMipmapLinear => 9987,
        }
    }

    /// 是否需要 mip chain
    #[inline]
    pub fn uses_mipmaps(self) -> bool {
        !matches!(self, Self::Nearest | Self::Linear)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MagFilter {
    Nearest,
    Linear,
}

impl MagFilter {
    #[inline]
    pub fn gl_enum(self) -> u32 {
        match self {
            Self::Nearest => 9728,
            Self::Linear => 9729,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Sampler {
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub min_filter: MinFilter,
    pub mag_filter: MagFilter,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            wrap_s: WrapMode::Repeat,
            wrap_t: WrapMode::Repeat,
            min_filter: MinFilter::Linear,
            mag_filter: MagFilter::Linear,
        }
    }
}

impl Sampler {
    /// 从 glTF 的 sampler 中读取，未指定的 filter 使用 LINEAR
    pub fn from_gltf(sampler: &gltf::texture::Sampler<'_>) -> Self {
        Self {
            wrap_s: Self::gltf_wrap_mode(sampler.wrap_s()),
            wrap_t: Self::gltf_wrap_mode(sampler.wrap_t()),
            min_filter: sampler.min_filter().map_or(MinFilter::Linear, Self::gltf_min_filter),
            mag_filter: sampler.mag_filter().map_or(MagFilter::Linear, |filter| match filter {
                gltf::texture::MagFilter::Nearest => MagFilter::Nearest,
                gltf::texture::MagFilter::Linear => MagFilter::Linear,
            }),
        }
    }

    #[inline]
    pub fn requires_mipmaps(&self) -> bool {
        self.min_filter.uses_mipmaps()
    }

    #[inline]
    pub fn uses_repeating_wrap(&self) -> bool {
        self.wrap_s.is_repeating() || self.wrap_t.is_repeating()
    }

    fn gltf_wrap_mode(mode: gltf::texture::WrappingMode) -> WrapMode {
        use gltf::texture::WrappingMode;
        match mode {
            WrappingMode::ClampToEdge => WrapMode::ClampToEdge,
            WrappingMode::MirroredRepeat => WrapMode::MirroredRepeat,
            WrappingMode::Repeat => WrapMode::Repeat,
        }
    }

    fn gltf_min_filter(filter: gltf::texture::MinFilter) -> MinFilter {
        use gltf::texture::MinFilter as G;
        match filter {
            G::Nearest => MinFilter::Nearest,
            G::Linear => MinFilter::Linear,
            G::NearestMipmapNearest => MinFilter::NearestMipmapNearest,
            G::LinearMipmapNearest => MinFilter::LinearMipmapNearest,
            G::NearestMipmapLinear => MinFilter::NearestMipmapLinear,
            G::LinearMipmapLinear => MinFilter::LinearMipmapLinear,
        }
    }
}
