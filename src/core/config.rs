use crate::core::errors::ConfigError;
use crate::core::types::PrintFlow;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    /// When set, bulk orders must carry this password
    pub bulk_order_password: Option<String>,
}

/// Image generation configuration
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Size of the process-wide generation gate
    pub concurrency: usize,
    /// "titan" or "mock"
    pub backend: String,
    pub bedrock_region: String,
    /// Failure probability of the mock generator
    pub mock_failure_rate: f64,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
}

/// Batch orchestration configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// retry_limit = max(total_items / 2, retry_floor)
    pub retry_floor: usize,
    pub progress_interval: Duration,
}

/// Compositing configuration
#[derive(Debug, Clone)]
pub struct CompositeConfig {
    pub key_color: [u8; 4],
    pub canonical_size: u32,
    pub fetch_timeout: Duration,
    /// DPI for the interactive/cart flow
    pub cart_dpi: u32,
    /// DPI for the legacy/batch flow
    pub batch_dpi: u32,
    pub scratch_dir: PathBuf,
    pub default_mask_path: PathBuf,
}

/// Object storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// "s3" or "memory"
    pub backend: String,
    pub region: String,
    pub generated_bucket: String,
    pub thumbnail_bucket: String,
    pub masked_bucket: String,
    pub presign_ttl: Duration,
    /// JSON array of organizations loaded into the document store at startup
    pub organizations_path: Option<PathBuf>,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub generation: GenerationConfig,
    pub batch: BatchConfig,
    pub composite: CompositeConfig,
    pub storage: StorageConfig,
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
            .unwrap_or(Level::INFO);

        let key_color = match env::var("KEY_COLOR") {
            Ok(raw) => parse_key_color(&raw)?,
            Err(_) => DEFAULT_KEY_COLOR,
        };

        Ok(Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT", 8080),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
                bulk_order_password: env::var("BULK_ORDER_PASSWORD")
                    .ok()
                    .filter(|s| !s.is_empty()),
            },
            generation: GenerationConfig {
                concurrency: env_parse("GENERATION_CONCURRENCY", 100),
                backend: env::var("GENERATION_BACKEND")
                    .map(|s| s.trim().to_lowercase())
                    .unwrap_or_else(|_| "mock".to_string()),
                bedrock_region: env::var("BEDROCK_REGION")
                    .unwrap_or_else(|_| "us-east-1".to_string()),
                mock_failure_rate: env_parse("MOCK_FAILURE_RATE", 0.1),
                openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
                openai_model: env::var("OPENAI_MODEL")
                    .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            },
            batch: BatchConfig {
                retry_floor: env_parse("RETRY_FLOOR", 10),
                progress_interval: Duration::from_secs(env_parse("PROGRESS_INTERVAL_SECS", 5)),
            },
            composite: CompositeConfig {
                key_color,
                canonical_size: env_parse("CANONICAL_SIZE", 512),
                fetch_timeout: Duration::from_secs(env_parse("FETCH_TIMEOUT_SECS", 10)),
                cart_dpi: env_parse("CART_DPI", 400),
                batch_dpi: env_parse("BATCH_DPI", 200),
                scratch_dir: env::var("SCRATCH_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| env::temp_dir()),
                default_mask_path: env::var("DEFAULT_MASK_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("images/masks/rh_mask.png")),
            },
            storage: StorageConfig {
                backend: env::var("STORAGE_BACKEND")
                    .map(|s| s.trim().to_lowercase())
                    .unwrap_or_else(|_| "memory".to_string()),
                region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-2".to_string()),
                generated_bucket: env::var("GENERATED_BUCKET")
                    .unwrap_or_else(|_| "browse-image-v2".to_string()),
                thumbnail_bucket: env::var("THUMBNAIL_BUCKET")
                    .unwrap_or_else(|_| "thumbnails-cart".to_string()),
                masked_bucket: env::var("MASKED_BUCKET")
                    .unwrap_or_else(|_| "masked-images".to_string()),
                presign_ttl: Duration::from_secs(env_parse("PRESIGN_TTL_SECS", 3600)),
                organizations_path: env::var("ORGANIZATIONS_PATH")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
            },
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.concurrency == 0 {
            return Err(ConfigError::NotPositive {
                name: "GENERATION_CONCURRENCY",
                value: 0,
            });
        }

        if !matches!(self.generation.backend.as_str(), "titan" | "mock") {
            return Err(ConfigError::UnknownBackend {
                name: "generation",
                value: self.generation.backend.clone(),
            });
        }

        if !(0.0..=1.0).contains(&self.generation.mock_failure_rate) {
            return Err(ConfigError::InvalidFailureRate(self.generation.mock_failure_rate));
        }

        if !matches!(self.storage.backend.as_str(), "s3" | "memory") {
            return Err(ConfigError::UnknownBackend {
                name: "storage",
                value: self.storage.backend.clone(),
            });
        }

        if self.composite.canonical_size == 0 {
            return Err(ConfigError::NotPositive {
                name: "CANONICAL_SIZE",
                value: 0,
            });
        }

        for (name, dpi) in [("CART_DPI", self.composite.cart_dpi), ("BATCH_DPI", self.composite.batch_dpi)] {
            if dpi == 0 {
                return Err(ConfigError::NotPositive { name, value: 0 });
            }
        }

        if self.batch.progress_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                name: "PROGRESS_INTERVAL_SECS",
                value: 0,
            });
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

    pub fn generation_concurrency(&self) -> usize {
        self.generation.concurrency
    }

    pub fn retry_floor(&self) -> usize {
        self.batch.retry_floor
    }

    pub fn progress_interval(&self) -> Duration {
        self.batch.progress_interval
    }

    pub fn key_color(&self) -> [u8; 4] {
        self.composite.key_color
    }

    pub fn dpi_for(&self, flow: PrintFlow) -> u32 {
        match flow {
            PrintFlow::Cart => self.composite.cart_dpi,
            PrintFlow::Batch => self.composite.batch_dpi,
        }
    }
}

impl Default for Config {
    /// Defaults without reading the environment; used by tests and tools.
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8080,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
                bulk_order_password: None,
            },
            generation: GenerationConfig {
                concurrency: 100,
                backend: "mock".to_string(),
                bedrock_region: "us-east-1".to_string(),
                mock_failure_rate: 0.1,
                openai_api_key: None,
                openai_model: "gpt-3.5-turbo".to_string(),
            },
            batch: BatchConfig {
                retry_floor: 10,
                progress_interval: Duration::from_secs(5),
            },
            composite: CompositeConfig {
                key_color: DEFAULT_KEY_COLOR,
                canonical_size: 512,
                fetch_timeout: Duration::from_secs(10),
                cart_dpi: 400,
                batch_dpi: 200,
                scratch_dir: env::temp_dir(),
                default_mask_path: PathBuf::from("images/masks/rh_mask.png"),
            },
            storage: StorageConfig {
                backend: "memory".to_string(),
                region: "us-east-2".to_string(),
                generated_bucket: "browse-image-v2".to_string(),
                thumbnail_bucket: "thumbnails-cart".to_string(),
                masked_bucket: "masked-images".to_string(),
                presign_ttl: Duration::from_secs(3600),
                organizations_path: None,
            },
        }
    }
}

pub const DEFAULT_KEY_COLOR: [u8; 4] = [82, 178, 38, 255];

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse "r,g,b,a" into an RGBA tuple
pub fn parse_key_color(raw: &str) -> Result<[u8; 4], ConfigError> {
    let parts: Vec<u8> = raw
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| ConfigError::InvalidKeyColor(raw.to_string()))?;

    <[u8; 4]>::try_from(parts).map_err(|_| ConfigError::InvalidKeyColor(raw.to_string()))
}
