use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

/// How the multimodal embedding server expects image payloads to be shaped.
///
/// One format is fixed per configured server; query-time text embedding uses
/// the same format with the image parts omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MultimodalPayloadFormat {
    /// `{content:[{prompt_string, multimodal_data}], parameter:{output_dimension}}`
    PromptString,
    /// `{content:"Image: [img-0]", image_data:[{data, id}]}`
    ImageData,
}

impl FromStr for MultimodalPayloadFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prompt_string" | "prompt-string" => Ok(Self::PromptString),
            "image_data" | "image-data" => Ok(Self::ImageData),
            other => Err(Error::Config(format!(
                "unknown multimodal payload format '{other}': expected prompt_string or image_data"
            ))),
        }
    }
}

/// Multimodal embedder settings. The embedder is considered active when the
/// provider is not `none` and the base path is non-empty.
#[derive(Debug, Clone, Serialize)]
pub struct MultimodalConfig {
    pub provider: String,
    pub base_path: String,
    pub model: String,
    pub dimensions: usize,
    pub payload_format: MultimodalPayloadFormat,
    /// Longest-edge cap applied before image embedding (no upscaling).
    pub max_edge: u32,
}

impl MultimodalConfig {
    pub fn is_active(&self) -> bool {
        self.provider.to_lowercase() != "none" && !self.base_path.trim().is_empty()
    }
}

/// Full configuration for mmdex, loaded from environment / `.env` / defaults.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root for `documents/`, `cache/`, `vector-cache/`, `vectordb/`, `trash/`.
    pub storage_dir: PathBuf,
    pub redis_host: Option<String>,
    pub redis_port: u16,
    pub embedding_base_path: String,
    pub embedding_model_pref: String,
    pub embedding_model_dim: usize,
    pub image2text_base_path: Option<String>,
    pub image2text_model_pref: String,
    pub multimodal: MultimodalConfig,
    pub batch_size: usize,
    pub concurrent_operations: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub resync_concurrency: usize,
    pub resync_large_concurrency: usize,
    pub resync_slow_ms: u64,
    pub max_localfiles_json_bytes: u64,
    /// External RAW decoder binary (TIFF producer).
    pub raw_decoder: String,
}

/// Files at or above this size take the low-concurrency scan lane.
pub const LARGE_FILE_BYTES: u64 = 150 * 1024 * 1024;

/// Hard timeout for a single embedding HTTP call.
pub const EMBED_TIMEOUT_SECS: u64 = 60;

/// Hard timeout for a vision description HTTP call.
pub const VISION_TIMEOUT_SECS: u64 = 600;

impl Config {
    /// Load configuration with priority: shell env > `.env` file > built-in defaults.
    pub fn load() -> Result<Self, Error> {
        // dotenvy does not override existing env vars, so shell env wins.
        let _ = dotenvy::dotenv();

        let storage_dir = match std::env::var("STORAGE_DIR") {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => default_storage_dir(),
        };

        let redis_host = std::env::var("REDIS_HOST")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let redis_port = parse_env::<u16>("REDIS_PORT", 6379)?;

        let embedding_base_path = env_or_default("EMBEDDING_BASE_PATH", "http://localhost:8008");
        let embedding_model_pref = env_or_default("EMBEDDING_MODEL_PREF", "nomic-embed-text");
        let embedding_model_dim = parse_env::<usize>("EMBEDDING_MODEL_DIM", 1024)?;

        let image2text_base_path = std::env::var("IMAGE2TEXT_BASE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let image2text_model_pref = env_or_default("IMAGE2TEXT_MODEL_PREF", "llava");

        let multimodal = MultimodalConfig {
            provider: env_or_default("MULTIMODAL_EMBEDDER_PROVIDER", "none"),
            base_path: env_or_default("MULTIMODAL_EMBEDDER_BASE_PATH", ""),
            model: env_or_default("MULTIMODAL_EMBEDDER_MODEL_PREF", ""),
            dimensions: parse_env::<usize>("MULTIMODAL_EMBEDDER_DIM", 2048)?,
            payload_format: env_or_default("MULTIMODAL_EMBEDDER_PAYLOAD", "prompt_string")
                .parse::<MultimodalPayloadFormat>()?,
            max_edge: parse_env::<u32>("MULTIMODAL_MAX_EDGE", 768)?,
        };

        let batch_size = parse_env::<usize>("BATCH_SIZE", 50)?;
        let concurrent_operations = parse_env::<usize>("CONCURRENT_OPERATIONS", 3)?;
        let chunk_size = parse_env::<usize>("CHUNK_SIZE", 1000)?;
        let chunk_overlap = parse_env::<usize>("CHUNK_OVERLAP", 50)?;
        let resync_concurrency = parse_env::<usize>("RESYNC_CONCURRENCY", 8)?;
        let resync_large_concurrency = parse_env::<usize>("RESYNC_LARGE_CONCURRENCY", 2)?;
        let resync_slow_ms = parse_env::<u64>("RESYNC_SLOW_MS", 2000)?;
        let max_localfiles_json_bytes =
            parse_env::<u64>("MAX_LOCALFILES_JSON_BYTES", 5 * 1024 * 1024)?;
        let raw_decoder = env_or_default("MMDEX_RAW_DECODER", "dcraw_emu");

        let config = Self {
            storage_dir,
            redis_host,
            redis_port,
            embedding_base_path,
            embedding_model_pref,
            embedding_model_dim,
            image2text_base_path,
            image2text_model_pref,
            multimodal,
            batch_size,
            concurrent_operations,
            chunk_size,
            chunk_overlap,
            resync_concurrency,
            resync_large_concurrency,
            resync_slow_ms,
            max_localfiles_json_bytes,
            raw_decoder,
        };

        config.validate()?;
        Ok(config)
    }

    /// Construct a config rooted at an explicit storage directory with all
    /// defaults. Used programmatically and by tests.
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            redis_host: None,
            redis_port: 6379,
            embedding_base_path: "http://localhost:8008".to_string(),
            embedding_model_pref: "nomic-embed-text".to_string(),
            embedding_model_dim: 1024,
            image2text_base_path: None,
            image2text_model_pref: "llava".to_string(),
            multimodal: MultimodalConfig {
                provider: "none".to_string(),
                base_path: String::new(),
                model: String::new(),
                dimensions: 2048,
                payload_format: MultimodalPayloadFormat::PromptString,
                max_edge: 768,
            },
            batch_size: 50,
            concurrent_operations: 3,
            chunk_size: 1000,
            chunk_overlap: 50,
            resync_concurrency: 8,
            resync_large_concurrency: 2,
            resync_slow_ms: 2000,
            max_localfiles_json_bytes: 5 * 1024 * 1024,
            raw_decoder: "dcraw_emu".to_string(),
        }
    }

    /// Validate constraint invariants on the loaded config.
    fn validate(&self) -> Result<(), Error> {
        if self.embedding_model_dim == 0 {
            return Err(Error::Config("EMBEDDING_MODEL_DIM must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("BATCH_SIZE must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "CHUNK_OVERLAP ({}) must be less than CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.resync_concurrency == 0 || self.resync_large_concurrency == 0 {
            return Err(Error::Config("resync concurrency values must be > 0".into()));
        }
        Ok(())
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.storage_dir.join("documents")
    }

    pub fn vector_cache_dir(&self) -> PathBuf {
        self.storage_dir.join("vector-cache")
    }

    pub fn folder_cache_dir(&self) -> PathBuf {
        self.storage_dir.join("cache").join("folders")
    }

    pub fn vectordb_dir(&self) -> PathBuf {
        self.storage_dir.join("vectordb")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.storage_dir.join("trash")
    }

    /// Redis connection URL when a host is configured.
    pub fn redis_url(&self) -> Option<String> {
        self.redis_host
            .as_ref()
            .map(|host| format!("redis://{host}:{}/", self.redis_port))
    }

    /// Make sure the storage layout exists on disk.
    pub fn ensure_storage_layout(&self) -> Result<(), Error> {
        for dir in [
            self.documents_dir(),
            self.vector_cache_dir(),
            self.folder_cache_dir(),
            self.vectordb_dir(),
            self.trash_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mmdex"))
        .unwrap_or_else(|| PathBuf::from("./storage"))
}

/// Read an env var or return a default string value.
fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an env var into a typed value, using a default if not set.
fn parse_env<T>(key: &str, default: T) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| Error::Config(format!("failed to parse {key}='{val}': {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn payload_format_parses_both_spellings() {
        assert_eq!(
            "prompt_string".parse::<MultimodalPayloadFormat>().unwrap(),
            MultimodalPayloadFormat::PromptString
        );
        assert_eq!(
            "image-data".parse::<MultimodalPayloadFormat>().unwrap(),
            MultimodalPayloadFormat::ImageData
        );
        assert!("tensor".parse::<MultimodalPayloadFormat>().is_err());
    }

    #[test]
    fn multimodal_active_requires_provider_and_base() {
        let mut mm = Config::with_storage_dir("/tmp/s").multimodal;
        assert!(!mm.is_active());
        mm.provider = "custom".into();
        assert!(!mm.is_active());
        mm.base_path = "http://localhost:9009".into();
        assert!(mm.is_active());
        mm.provider = "None".into();
        assert!(!mm.is_active());
    }

    #[test]
    #[serial]
    fn default_values_are_stable() {
        for var in [
            "STORAGE_DIR",
            "REDIS_HOST",
            "REDIS_PORT",
            "EMBEDDING_BASE_PATH",
            "EMBEDDING_MODEL_PREF",
            "EMBEDDING_MODEL_DIM",
            "IMAGE2TEXT_BASE_PATH",
            "IMAGE2TEXT_MODEL_PREF",
            "MULTIMODAL_EMBEDDER_PROVIDER",
            "MULTIMODAL_EMBEDDER_BASE_PATH",
            "MULTIMODAL_EMBEDDER_PAYLOAD",
            "BATCH_SIZE",
            "CONCURRENT_OPERATIONS",
            "CHUNK_SIZE",
            "CHUNK_OVERLAP",
            "RESYNC_CONCURRENCY",
            "RESYNC_LARGE_CONCURRENCY",
            "RESYNC_SLOW_MS",
            "MAX_LOCALFILES_JSON_BYTES",
            "MMDEX_RAW_DECODER",
        ] {
            std::env::remove_var(var);
        }

        let config = Config::load().unwrap();
        assert!(config.redis_host.is_none());
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.embedding_model_dim, 1024);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.concurrent_operations, 3);
        assert_eq!(config.resync_concurrency, 8);
        assert_eq!(config.resync_large_concurrency, 2);
        assert_eq!(config.resync_slow_ms, 2000);
        assert_eq!(config.max_localfiles_json_bytes, 5 * 1024 * 1024);
        assert!(!config.multimodal.is_active());
    }

    #[test]
    #[serial]
    fn validation_rejects_overlap_exceeds_chunk_size() {
        std::env::set_var("CHUNK_SIZE", "10");
        std::env::set_var("CHUNK_OVERLAP", "20");
        let result = Config::load();
        std::env::remove_var("CHUNK_SIZE");
        std::env::remove_var("CHUNK_OVERLAP");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CHUNK_OVERLAP"));
    }

    #[test]
    #[serial]
    fn validation_rejects_zero_dimensions() {
        std::env::set_var("EMBEDDING_MODEL_DIM", "0");
        let result = Config::load();
        std::env::remove_var("EMBEDDING_MODEL_DIM");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn parse_error_on_non_numeric() {
        std::env::set_var("BATCH_SIZE", "many");
        let result = Config::load();
        std::env::remove_var("BATCH_SIZE");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("BATCH_SIZE"));
    }

    #[test]
    fn redis_url_built_from_host_and_port() {
        let mut config = Config::with_storage_dir("/tmp/s");
        assert!(config.redis_url().is_none());
        config.redis_host = Some("cache.local".into());
        config.redis_port = 6380;
        assert_eq!(config.redis_url().unwrap(), "redis://cache.local:6380/");
    }

    #[test]
    fn storage_subdirectories_derive_from_root() {
        let config = Config::with_storage_dir("/srv/mmdex");
        assert_eq!(
            config.documents_dir(),
            PathBuf::from("/srv/mmdex/documents")
        );
        assert_eq!(
            config.folder_cache_dir(),
            PathBuf::from("/srv/mmdex/cache/folders")
        );
        assert_eq!(config.vectordb_dir(), PathBuf::from("/srv/mmdex/vectordb"));
    }
}
