//! 后台 IO：字节读取、图片解码，以及执行它们的线程池

pub mod decoder;
pub mod dispatcher;
pub mod fetcher;

pub use decoder::{DecodedImage, ImageDecoder, ImageFormat, RasterDecoder};
pub use dispatcher::{IoDispatcher, IoPoll, IoTask};
pub use fetcher::{ByteFetcher, UriFetcher};
