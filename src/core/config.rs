use crate::core::errors::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Retries beyond this only stretch a failing call without changing its outcome
pub const MAX_MODEL_RETRIES: u32 = 10;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Model API configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    /// Text-only model ("fast model")
    pub text_model: String,
    /// Vision-capable model
    pub vision_model: String,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub text_temperature: f32,
    pub vision_temperature: f32,
    /// Upper bound on images attached to a single vision call
    pub max_images_per_call: usize,
}

/// Worker pool sizes. Each pool is bounded independently so a slow vision
/// API cannot starve text dispatch and vice versa.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub text_workers: usize,
    pub vision_workers: usize,
    pub conversion_workers: usize,
}

/// Image download / conversion configuration
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub download_timeout_seconds: u64,
    pub max_bytes: u64,
    pub jpeg_quality: u8,
    /// Bound on how long a post waits for a conversion owned by another task
    pub cache_wait_timeout_seconds: u64,
}

/// Post source and interpretation store locations
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub posts_file: String,
    pub interpretations_file: String,
    pub default_window_hours: u32,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub workers: WorkerConfig,
    pub images: ImageConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8090,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
            },
            llm: LlmConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                text_model: "gpt-4.1".to_string(),
                vision_model: "gpt-4.1".to_string(),
                max_retries: 3,
                timeout_seconds: 120,
                text_temperature: 0.1,
                vision_temperature: 0.3,
                max_images_per_call: 10,
            },
            workers: WorkerConfig {
                text_workers: 10,
                vision_workers: 5,
                // Conversions are mostly network bound; decode is the CPU part
                conversion_workers: std::cmp::max(num_cpus::get() / 2, 4),
            },
            images: ImageConfig {
                download_timeout_seconds: 20,
                max_bytes: 20 * 1024 * 1024,
                jpeg_quality: 90,
                cache_wait_timeout_seconds: 90,
            },
            store: StoreConfig {
                posts_file: "data/posts.json".to_string(),
                interpretations_file: "data/interpretations.json".to_string(),
                default_window_hours: 36,
            },
        }
    }
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(defaults.server.log_level);

        Ok(Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT", defaults.server.port)?,
                host: env_string("SERVER_HOST", defaults.server.host),
                log_level,
            },
            llm: LlmConfig {
                api_key: env_string("OPENAI_API_KEY", defaults.llm.api_key),
                base_url: env_string("OPENAI_BASE_URL", defaults.llm.base_url)
                    .trim_end_matches('/')
                    .to_string(),
                text_model: env_string("FAST_MODEL_NAME", defaults.llm.text_model),
                vision_model: env_string("FAST_VLM_NAME", defaults.llm.vision_model),
                max_retries: env_parse("MODEL_MAX_RETRIES", defaults.llm.max_retries)?,
                timeout_seconds: env_parse("MODEL_TIMEOUT_SECONDS", defaults.llm.timeout_seconds)?,
                text_temperature: env_parse("TEXT_TEMPERATURE", defaults.llm.text_temperature)?,
                vision_temperature: env_parse(
                    "VISION_TEMPERATURE",
                    defaults.llm.vision_temperature,
                )?,
                max_images_per_call: env_parse(
                    "MAX_IMAGES_PER_CALL",
                    defaults.llm.max_images_per_call,
                )?,
            },
            workers: WorkerConfig {
                text_workers: env_parse("TEXT_WORKERS", defaults.workers.text_workers)?,
                vision_workers: env_parse("VISION_WORKERS", defaults.workers.vision_workers)?,
                conversion_workers: env_parse(
                    "CONVERSION_WORKERS",
                    defaults.workers.conversion_workers,
                )?,
            },
            images: ImageConfig {
                download_timeout_seconds: env_parse(
                    "IMAGE_DOWNLOAD_TIMEOUT_SECONDS",
                    defaults.images.download_timeout_seconds,
                )?,
                max_bytes: env_parse("IMAGE_MAX_BYTES", defaults.images.max_bytes)?,
                jpeg_quality: env_parse("IMAGE_JPEG_QUALITY", defaults.images.jpeg_quality)?,
                cache_wait_timeout_seconds: env_parse(
                    "CACHE_WAIT_TIMEOUT_SECONDS",
                    defaults.images.cache_wait_timeout_seconds,
                )?,
            },
            store: StoreConfig {
                posts_file: env_string("POSTS_FILE", defaults.store.posts_file),
                interpretations_file: env_string(
                    "INTERPRETATIONS_FILE",
                    defaults.store.interpretations_file,
                ),
                default_window_hours: env_parse(
                    "DEFAULT_WINDOW_HOURS",
                    defaults.store.default_window_hours,
                )?,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 9] = [
            ("TEXT_WORKERS", self.workers.text_workers as u64),
            ("VISION_WORKERS", self.workers.vision_workers as u64),
            ("CONVERSION_WORKERS", self.workers.conversion_workers as u64),
            ("MAX_IMAGES_PER_CALL", self.llm.max_images_per_call as u64),
            ("MODEL_TIMEOUT_SECONDS", self.llm.timeout_seconds),
            ("IMAGE_DOWNLOAD_TIMEOUT_SECONDS", self.images.download_timeout_seconds),
            ("IMAGE_MAX_BYTES", self.images.max_bytes),
            ("CACHE_WAIT_TIMEOUT_SECONDS", self.images.cache_wait_timeout_seconds),
            ("DEFAULT_WINDOW_HOURS", self.store.default_window_hours as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::ZeroValue { name, value });
            }
        }

        if self.llm.max_retries > MAX_MODEL_RETRIES {
            return Err(ConfigError::AboveLimit {
                name: "MODEL_MAX_RETRIES",
                value: u64::from(self.llm.max_retries),
                limit: u64::from(MAX_MODEL_RETRIES),
            });
        }

        if !(1..=100).contains(&self.images.jpeg_quality) {
            return Err(ConfigError::InvalidJpegQuality(self.images.jpeg_quality));
        }

        if !(self.llm.base_url.starts_with("http://") || self.llm.base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidBaseUrl(self.llm.base_url.clone()));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn text_model(&self) -> &str {
        &self.llm.text_model
    }

    pub fn vision_model(&self) -> &str {
        &self.llm.vision_model
    }

    pub fn max_images_per_call(&self) -> usize {
        self.llm.max_images_per_call
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_seconds)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.images.download_timeout_seconds)
    }

    pub fn cache_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.images.cache_wait_timeout_seconds)
    }

    pub fn default_window_hours(&self) -> u32 {
        self.store.default_window_hours
    }
}

fn env_string(name: &str, default: String) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

/// Unset or blank variables fall back to the default; a set but unparsable
/// value is an error rather than a silent fallback.
fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::EnvVarError { name, value: raw })
        }
        _ => Ok(default),
    }
}
