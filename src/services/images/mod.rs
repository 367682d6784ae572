pub mod cache;
pub mod converter;

pub use cache::{CacheStats, ClaimStarted, ConversionOutcome, ImageConversionCache};
pub use converter::{BackgroundConverterPool, ConvertImage, ImageConverter};
