use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use std::collections::HashSet;

use crate::core::types::{Bucket, ClassifiedPost, FormatClass, ImageReference, RawPost};

/// Extensions the vision API consumes directly by URL
pub const STANDARD_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Extensions recognized as images at all; anything else must have a real path
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "bmp", "tif", "tiff", "heic", "heif", "avif", "ico",
    "svg",
];

lazy_static! {
    /// Markdown image embed: `![alt](url)`
    static ref IMAGE_MARKUP: Regex = Regex::new(r"!\[.*?\]\((https?://[^)]+)\)").unwrap();
}

/// Result of classifying one post
#[derive(Debug, Clone)]
pub struct Classification {
    pub bucket: Bucket,
    pub images: Vec<ImageReference>,
    /// References that failed URL screening
    pub dropped: usize,
}

/// Routes posts by media composition. Pure: no network, no cache access.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostClassifier;

impl PostClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, post: &RawPost) -> Classification {
        let mut images = Vec::new();
        let mut seen = HashSet::new();
        let mut dropped = 0;

        for original in extract_image_urls(post.content()) {
            let Some(normalized) = normalize_image_url(original) else {
                dropped += 1;
                continue;
            };
            // One reference per distinct image within a post
            if !seen.insert(normalized.clone()) {
                continue;
            }
            let reference = match format_class(&normalized) {
                FormatClass::Standard => ImageReference::standard(original.to_string(), normalized),
                FormatClass::NonStandard => ImageReference::pending(original.to_string(), normalized),
            };
            images.push(reference);
        }

        let bucket = if images.is_empty() {
            Bucket::TextOnly
        } else if images.iter().all(|r| r.format == FormatClass::Standard) {
            Bucket::ImageReady
        } else {
            Bucket::ImagePending
        };

        Classification {
            bucket,
            images,
            dropped,
        }
    }

    pub fn classify_post(&self, post: RawPost) -> (ClassifiedPost, usize) {
        let Classification {
            bucket,
            images,
            dropped,
        } = self.classify(&post);
        (
            ClassifiedPost {
                post,
                bucket,
                images,
            },
            dropped,
        )
    }
}

/// URLs of embedded markdown images, in order of appearance.
pub fn extract_image_urls(text: &str) -> Vec<&str> {
    IMAGE_MARKUP
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        // `![alt](url "title")`: keep the url part
        .filter_map(|m| m.as_str().split_whitespace().next())
        .collect()
}

/// Keep scheme, host and path; drop credentials, query and fragment.
/// Returns `None` for URLs that fail screening.
pub fn normalize_image_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    if url.host_str().map_or(true, str::is_empty) {
        return None;
    }

    let path = url.path().trim_matches('/');
    let has_image_extension = extension(&url)
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false);
    if !has_image_extension && path.is_empty() {
        return None;
    }

    url.set_query(None);
    url.set_fragment(None);
    url.set_username("").ok()?;
    url.set_password(None).ok()?;
    Some(url.to_string())
}

fn extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

pub fn format_class(normalized_url: &str) -> FormatClass {
    let standard = Url::parse(normalized_url)
        .ok()
        .and_then(|u| extension(&u))
        .map(|ext| STANDARD_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false);
    if standard {
        FormatClass::Standard
    } else {
        FormatClass::NonStandard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ImagePayload, ImageState};

    fn classify(text: &str) -> Classification {
        PostClassifier::new().classify(&RawPost::new(1, text))
    }

    #[test]
    fn test_image_markup_pattern_compiles() {
        assert!(IMAGE_MARKUP.is_match("![a](https://cdn.example.com/a.png)"));
        assert!(!IMAGE_MARKUP.is_match("[link](https://cdn.example.com/a.png)"));
    }

    #[test]
    fn test_plain_text_is_text_only() {
        let c = classify("just some thoughts, see https://example.com/a.png");
        assert_eq!(c.bucket, Bucket::TextOnly);
        assert!(c.images.is_empty());
    }

    #[test]
    fn test_standard_images_are_ready_by_url() {
        let c = classify("two shots ![a](https://cdn.example.com/a.jpg) ![b](https://cdn.example.com/b.PNG?w=100)");
        assert_eq!(c.bucket, Bucket::ImageReady);
        assert_eq!(c.images.len(), 2);
        assert!(c.images.iter().all(|r| r.state == ImageState::Ready));
        assert_eq!(
            c.images[1].payload,
            Some(ImagePayload::UrlRef("https://cdn.example.com/b.PNG".to_string()))
        );
        assert_eq!(c.images[1].original_url, "https://cdn.example.com/b.PNG?w=100");
    }

    #[test]
    fn test_webp_makes_post_pending() {
        let c = classify("![x](https://cdn.example.com/a.jpg)\n![y](https://cdn.example.com/b.webp#frag)");
        assert_eq!(c.bucket, Bucket::ImagePending);
        assert_eq!(c.images[1].format, FormatClass::NonStandard);
        assert_eq!(c.images[1].state, ImageState::Pending);
        assert_eq!(c.images[1].normalized_url, "https://cdn.example.com/b.webp");
    }

    #[test]
    fn test_extensionless_dynamic_url_is_non_standard() {
        let c = classify("![](https://img.example.com/render/8f3a2c)");
        assert_eq!(c.bucket, Bucket::ImagePending);
        assert_eq!(c.images[0].format, FormatClass::NonStandard);
    }

    #[test]
    fn test_screening_drops_bad_references() {
        let c = classify("![a](https://example.com/) ![b](https://example.com) ![c](http:///x.png)");
        assert_eq!(c.bucket, Bucket::TextOnly);
        assert_eq!(c.dropped, 3);
    }

    #[test]
    fn test_duplicate_reference_in_one_post_is_kept_once() {
        let c = classify("![a](https://cdn.example.com/a.gif?v=1) ![b](https://cdn.example.com/a.gif?v=2)");
        assert_eq!(c.images.len(), 1);
        assert_eq!(c.dropped, 0);
    }

    #[test]
    fn test_markdown_title_is_ignored() {
        let urls = extract_image_urls(r#"![a](https://cdn.example.com/a.jpg "caption")"#);
        assert_eq!(urls, vec!["https://cdn.example.com/a.jpg"]);
    }

    #[test]
    fn test_normalize_strips_credentials_query_and_fragment() {
        assert_eq!(
            normalize_image_url("https://user:pw@cdn.example.com/p/a.heic?x=1#y").as_deref(),
            Some("https://cdn.example.com/p/a.heic")
        );
        assert_eq!(normalize_image_url("ftp://cdn.example.com/a.jpg"), None);
    }

    #[test]
    fn test_images_are_found_in_title_fallback() {
        let mut post = RawPost::new(9, "");
        post.title = Some("![t](https://cdn.example.com/t.jpg)".to_string());
        let c = PostClassifier::new().classify(&post);
        assert_eq!(c.bucket, Bucket::ImageReady);
    }
}
