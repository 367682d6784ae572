use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageError, Rgb, RgbImage};

use crate::core::errors::{ConversionError, ConversionResult};

/// MIME type of the canonical re-encode
pub const CANONICAL_MEDIA_TYPE: &str = "image/jpeg";

/// Detect the HEIF container family (HEIC, HEIF, AVIF) from its `ftyp` box.
///
/// The bundled decoders cannot read these, so they are rejected up front with
/// a precise reason instead of a generic decode error.
pub fn sniff_heif_family(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return None;
    }
    match &bytes[8..12] {
        b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" => Some("heic"),
        b"mif1" | b"msf1" => Some("heif"),
        b"avif" | b"avis" => Some("avif"),
        _ => None,
    }
}

fn map_image_error(error: ImageError) -> ConversionError {
    match error {
        ImageError::Unsupported(e) => ConversionError::UnsupportedFormat(e.to_string()),
        other => ConversionError::Decode(other.to_string()),
    }
}

/// Decode any format the runtime has a decoder for. Animated formats yield
/// their first frame.
pub fn decode_image(bytes: &[u8]) -> ConversionResult<DynamicImage> {
    if let Some(family) = sniff_heif_family(bytes) {
        return Err(ConversionError::UnsupportedFormat(format!(
            "{} (no decoder available)",
            family
        )));
    }
    let format = image::guess_format(bytes).map_err(map_image_error)?;
    image::load_from_memory_with_format(bytes, format).map_err(map_image_error)
}

/// Composite any alpha channel onto white and return 8-bit RGB.
/// Grayscale, palette and 16-bit sources are widened/narrowed to RGB8.
pub fn flatten_to_rgb(img: DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as u32;
        let over_white = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([over_white(r), over_white(g), over_white(b)]));
    }
    out
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> ConversionResult<Vec<u8>> {
    let mut jpeg_bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_bytes, quality);
    encoder
        .encode_image(img)
        .map_err(|e| ConversionError::Encode(e.to_string()))?;
    Ok(jpeg_bytes)
}

/// Decode, flatten and re-encode to JPEG in one blocking step.
pub fn to_canonical_jpeg_sync(bytes: &[u8], quality: u8) -> ConversionResult<Vec<u8>> {
    let decoded = decode_image(bytes)?;
    let rgb = flatten_to_rgb(decoded);
    encode_jpeg(&rgb, quality)
}

/// Same as [`to_canonical_jpeg_sync`] but on the blocking pool, since decode
/// and encode are CPU-bound and would stall the async workers.
pub async fn to_canonical_jpeg_async(bytes: Vec<u8>, quality: u8) -> ConversionResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || to_canonical_jpeg_sync(&bytes, quality))
        .await
        .map_err(|e| ConversionError::Decode(format!("conversion task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    #[test]
    fn test_transparent_pixels_become_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0])));
        let rgb = flatten_to_rgb(img);
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_opaque_pixels_keep_color() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([200, 10, 10, 255])));
        let rgb = flatten_to_rgb(img);
        assert_eq!(rgb.get_pixel(1, 1), &Rgb([200, 10, 10]));
    }

    #[test]
    fn test_half_alpha_blends_toward_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128])));
        let rgb = flatten_to_rgb(img);
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert!(r > 120 && r < 135);
        assert_eq!(r, g);
        assert_eq!(g, b);
    }

    #[test]
    fn test_grayscale_widened_to_rgb() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(3, 3, Luma([77])));
        let rgb = flatten_to_rgb(img);
        assert_eq!(rgb.get_pixel(2, 2), &Rgb([77, 77, 77]));
    }

    #[test]
    fn test_png_with_alpha_converts_to_jpeg() {
        let png = encode(
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba([10, 200, 10, 100]))),
            ImageFormat::Png,
        );
        let jpeg = to_canonical_jpeg_sync(&png, 90).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_heic_container_is_unsupported() {
        let mut bytes = vec![0, 0, 0, 24];
        bytes.extend_from_slice(b"ftypheic");
        bytes.extend_from_slice(&[0; 16]);

        assert_eq!(sniff_heif_family(&bytes), Some("heic"));
        let err = to_canonical_jpeg_sync(&bytes, 90).unwrap_err();
        assert!(err.is_unsupported_format(), "got {:?}", err);
    }

    #[test]
    fn test_unknown_bytes_are_unsupported() {
        let err = decode_image(b"<html>not an image</html>").unwrap_err();
        assert!(err.is_unsupported_format());
    }

    #[test]
    fn test_truncated_png_is_decode_failure() {
        let png = encode(
            DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([1, 2, 3]))),
            ImageFormat::Png,
        );
        let err = decode_image(&png[..40]).unwrap_err();
        assert!(matches!(err, ConversionError::Decode(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_async_conversion() {
        let png = encode(
            DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([9, 9, 9]))),
            ImageFormat::Png,
        );
        let jpeg = to_canonical_jpeg_async(png, 80).await.unwrap();
        assert!(!jpeg.is_empty());
    }
}
