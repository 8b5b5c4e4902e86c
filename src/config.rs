//! Environment configuration
//!
//! Reads backend selection, credentials and cache limits from `CHUNKSTORE_*`
//! environment variables. Sizes accept `K`/`M`/`G`/`T` suffixes.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

/// Default root for the local storage backend
const DEFAULT_LOCAL_STORAGE_PATH: &str = "uploads";

/// Default interval between scheduled reauthorizations (3 hours)
const DEFAULT_REAUTH_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);

/// Default S3 region when none is configured
const DEFAULT_S3_REGION: &str = "auto";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid storage type '{0}', should be either 'local', 'b2', or 's3'")]
    InvalidStorageType(String),

    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid size string '{0}'")]
    InvalidSize(String),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Which storage backend is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    B2,
    S3,
}

impl std::str::FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageKind::Local),
            "b2" => Ok(StorageKind::B2),
            "s3" => Ok(StorageKind::S3),
            other => Err(ConfigError::InvalidStorageType(other.to_string())),
        }
    }
}

/// Local disk backend settings
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub root: PathBuf,
    /// Maximum bytes stored, `None` for unlimited
    pub limit: Option<u64>,
}

/// B2 native API credentials
#[derive(Debug, Clone)]
pub struct B2Config {
    pub bucket_id: String,
    pub key_id: String,
    pub key: String,
}

/// S3-compatible endpoint settings
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_key: String,
    pub bucket_name: String,
    pub region: String,
}

/// Disk cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Maximum total bytes held by the cache (files plus reservations)
    pub max_size: u64,
    /// Objects larger than this are never cached
    pub max_file_size: u64,
    /// Read locks older than this no longer protect an entry from eviction
    pub read_lock_ttl: Duration,
}

impl CacheConfig {
    /// A disabled cache rooted at `dir`
    pub fn disabled(dir: PathBuf) -> Self {
        Self {
            enabled: false,
            dir,
            max_size: 0,
            max_file_size: 0,
            read_lock_ttl: Duration::from_secs(60 * 60),
        }
    }

    /// An enabled cache with explicit limits
    pub fn new(dir: PathBuf, max_size: u64, max_file_size: u64) -> Self {
        Self {
            enabled: true,
            dir,
            max_size,
            max_file_size,
            read_lock_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Full process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageKind,
    pub local: LocalConfig,
    pub b2: Option<B2Config>,
    pub s3: Option<S3Config>,
    pub cache: CacheConfig,
    pub metadata_dir: PathBuf,
    pub reauth_interval: Duration,
}

impl Config {
    /// Build configuration from `CHUNKSTORE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage: StorageKind = var_or("CHUNKSTORE_STORAGE", "local").parse()?;

        let local = LocalConfig {
            root: PathBuf::from(var_or(
                "CHUNKSTORE_LOCAL_STORAGE_PATH",
                DEFAULT_LOCAL_STORAGE_PATH,
            )),
            limit: optional_var("CHUNKSTORE_LOCAL_STORAGE_LIMIT")
                .map(|s| parse_size(&s))
                .transpose()?
                .filter(|limit| *limit > 0),
        };

        let b2 = match storage {
            StorageKind::B2 => Some(B2Config {
                bucket_id: required_var("CHUNKSTORE_B2_BUCKET_ID")?,
                key_id: required_var("CHUNKSTORE_B2_BUCKET_KEY_ID")?,
                key: required_var("CHUNKSTORE_B2_BUCKET_KEY")?,
            }),
            _ => None,
        };

        let s3 = match storage {
            StorageKind::S3 => {
                let endpoint = required_var("CHUNKSTORE_S3_ENDPOINT")?;
                Some(S3Config {
                    endpoint: normalize_endpoint(&endpoint),
                    access_key_id: required_var("CHUNKSTORE_S3_ACCESS_KEY_ID")?,
                    secret_key: required_var("CHUNKSTORE_S3_SECRET_KEY")?,
                    bucket_name: required_var("CHUNKSTORE_S3_BUCKET_NAME")?,
                    region: var_or("CHUNKSTORE_S3_REGION_NAME", DEFAULT_S3_REGION),
                })
            }
            _ => None,
        };

        let cache = cache_from_env(storage)?;

        let metadata_dir = optional_var("CHUNKSTORE_METADATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("chunkstore")
                    .join("metadata")
            });

        let reauth_interval = match optional_var("CHUNKSTORE_REAUTH_INTERVAL_SECS") {
            Some(value) => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "CHUNKSTORE_REAUTH_INTERVAL_SECS",
                        value,
                    })
                }
            },
            None => DEFAULT_REAUTH_INTERVAL,
        };

        Ok(Self {
            storage,
            local,
            b2,
            s3,
            cache,
            metadata_dir,
            reauth_interval,
        })
    }
}

/// Cache is enabled only for remote backends with both size limits set
fn cache_from_env(storage: StorageKind) -> Result<CacheConfig, ConfigError> {
    let dir = optional_var("CHUNKSTORE_CACHE_DIR")
        .map(|d| PathBuf::from(d.trim_end_matches('/')))
        .unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("chunkstore")
        });

    if storage == StorageKind::Local {
        return Ok(CacheConfig::disabled(dir));
    }

    let (Some(max_size), Some(max_file_size)) = (
        optional_var("CHUNKSTORE_CACHE_MAX_SIZE"),
        optional_var("CHUNKSTORE_CACHE_MAX_FILE_SIZE"),
    ) else {
        return Ok(CacheConfig::disabled(dir));
    };

    let config = CacheConfig::new(dir, parse_size(&max_size)?, parse_size(&max_file_size)?);
    info!(
        dir = %config.dir.display(),
        max_size = %max_size,
        max_file_size = %max_file_size,
        "Disk cache configured"
    );
    Ok(config)
}

/// Parse a size string such as `25G`, `512M` or `1024`
///
/// Only the first letter of the suffix is significant, so `10GB` and `10g`
/// both mean ten gibibytes.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);

    if digits.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ConfigError::InvalidSize(input.to_string()));
    }

    let num: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(input.to_string()))?;

    let multiplier: u64 = match suffix.chars().next().map(|c| c.to_ascii_uppercase()) {
        None | Some('B') => 1,
        Some('K') => 1024,
        Some('M') => 1024 * 1024,
        Some('G') => 1024 * 1024 * 1024,
        Some('T') => 1024 * 1024 * 1024 * 1024,
        Some(_) => return Err(ConfigError::InvalidSize(input.to_string())),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(input.to_string()))
}

/// Prefix `https://` onto endpoints given without a scheme
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    optional_var(name).unwrap_or_else(|| default.to_string())
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    optional_var(name).ok_or(ConfigError::MissingVar(name))
}
