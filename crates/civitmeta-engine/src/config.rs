use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use civitmeta_contracts::cache::{HashCache, JsonFileBackend};
use tracing::warn;

use crate::batch::Converter;
use crate::container::{ExifCodec, ImageContainer};
use crate::resolver::{CivitaiLookup, HashResolver, OfflineLookup};

pub const DEFAULT_CACHE_PATH: &str = "hash_cache.json";
pub const DEFAULT_LOG_PATH: &str = "debug.log";
pub const DEFAULT_API_BASE: &str = "https://civitai.com/api/v1";
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 15;

pub const ENV_CACHE_PATH: &str = "CIVITMETA_CACHE_PATH";
pub const ENV_LOG_PATH: &str = "CIVITMETA_LOG_PATH";
pub const ENV_API_BASE: &str = "CIVITMETA_API_BASE";
pub const ENV_LOOKUP_TIMEOUT: &str = "CIVITMETA_LOOKUP_TIMEOUT";
pub const ENV_OFFLINE: &str = "CIVITMETA_OFFLINE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterConfig {
    pub cache_path: PathBuf,
    pub log_path: PathBuf,
    pub api_base: String,
    pub lookup_timeout: Duration,
    pub offline: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            api_base: DEFAULT_API_BASE.to_string(),
            lookup_timeout: Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS),
            offline: false,
        }
    }
}

impl ConverterConfig {
    pub fn from_env() -> Self {
        Self::from_vars(non_empty_env)
    }

    /// Defaults overlaid with whatever `var` returns for the `CIVITMETA_*` keys.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = var(ENV_CACHE_PATH) {
            config.cache_path = PathBuf::from(path);
        }
        if let Some(path) = var(ENV_LOG_PATH) {
            config.log_path = PathBuf::from(path);
        }
        if let Some(base) = var(ENV_API_BASE) {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(raw) = var(ENV_LOOKUP_TIMEOUT) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => config.lookup_timeout = Duration::from_secs(secs),
                _ => warn!(value = %raw, "ignoring invalid {ENV_LOOKUP_TIMEOUT}"),
            }
        }
        if let Some(raw) = var(ENV_OFFLINE) {
            config.offline = matches!(
                raw.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        config
    }

    /// Loads the cache and wires the lookup client and EXIF codec.
    pub fn build_converter(&self) -> Result<Converter> {
        let cache = HashCache::load(JsonFileBackend::new(&self.cache_path));
        let resolver = if self.offline {
            HashResolver::new(cache, OfflineLookup)
        } else {
            HashResolver::new(cache, CivitaiLookup::new(&self.api_base, self.lookup_timeout)?)
        };
        Ok(Converter::new(ImageContainer::new(ExifCodec), resolver))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
