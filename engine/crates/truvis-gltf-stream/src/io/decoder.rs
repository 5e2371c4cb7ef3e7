use anyhow::Context;

/// 通过 magic bytes 识别出的图片格式
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Ktx2,
    WebP,
}

impl ImageFormat {
    const JPEG_MAGIC: &'static [u8] = &[0xFF, 0xD8, 0xFF];
    const PNG_MAGIC: &'static [u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    const KTX2_MAGIC: &'static [u8] = &[0xAB, 0x4B, 0x54, 0x58, 0x20, 0x32, 0x30, 0xBB, 0x0D, 0x0A, 0x1A, 0x0A];

    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(Self::JPEG_MAGIC) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(Self::PNG_MAGIC) {
            Some(Self::Png)
        } else if bytes.starts_with(Self::KTX2_MAGIC) {
            Some(Self::Ktx2)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::WebP)
        } else {
            None
        }
    }

    /// 外部图片在 fetch 之前用扩展名做一次判断
    pub fn from_uri_path(path: &str) -> Option<Self> {
        let extension = path.rsplit_once('.')?.1.to_ascii_lowercase();
        match extension.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "ktx2" => Some(Self::Ktx2),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }
}

/// 解码后的 RGBA8 图片
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// level 0，RGBA8
    pub pixels: Vec<u8>,
    /// level 1..N，预先生成的 mip
    pub mip_levels: Vec<Vec<u8>>,
}

impl DecodedImage {
    #[inline]
    pub fn is_power_of_two(&self) -> bool {
        self.width.is_power_of_two() && self.height.is_power_of_two()
    }

    #[inline]
    pub fn has_mipmaps(&self) -> bool {
        !self.mip_levels.is_empty()
    }

    pub fn byte_length(&self) -> usize {
        self.pixels.len() + self.mip_levels.iter().map(Vec::len).sum::<usize>()
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mip_levels", &self.mip_levels.len())
            .finish()
    }
}

/// 把编码后的图片字节解码成 RGBA8
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], format: ImageFormat) -> anyhow::Result<DecodedImage>;
}

/// 基于 `image` crate 的默认解码器
#[derive(Default)]
pub struct RasterDecoder;

impl ImageDecoder for RasterDecoder {
    fn decode(&self, bytes: &[u8], format: ImageFormat) -> anyhow::Result<DecodedImage> {
        let _span = tracy_client::span!("RasterDecoder::decode");
        let image_format = match format {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::WebP => image::ImageFormat::WebP,
            ImageFormat::Ktx2 => anyhow::bail!("KTX2 is not a raster format"),
        };

        let image = image::load_from_memory_with_format(bytes, image_format)
            .with_context(|| format!("failed to decode {format:?} image"))?;
        // 强制转换为 RGBA8
        let image = image.into_rgba8();
        let (width, height) = image.dimensions();

        Ok(DecodedImage {
            width,
            height,
            pixels: image.into_raw(),
            mip_levels: Vec::new(),
        })
    }
}
