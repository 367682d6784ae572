pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_image, encode_jpeg, flatten_to_rgb, sniff_heif_family, to_canonical_jpeg_async,
    to_canonical_jpeg_sync, CANONICAL_MEDIA_TYPE,
};
pub use metrics::{Metrics, MetricsSnapshot};
