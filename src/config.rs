use anyhow::{Context, Result};
use std::path::PathBuf;

pub const CACHE_URL_ENV: &str = "ACTIONS_CACHE_URL";
pub const RESULTS_URL_ENV: &str = "ACTIONS_RESULTS_URL";
pub const RUNTIME_TOKEN_ENV: &str = "ACTIONS_RUNTIME_TOKEN";
pub const RUN_ID_ENV: &str = "GITHUB_RUN_ID";
pub const SERVICE_V2_ENV: &str = "ACTIONS_CACHE_SERVICE_V2";

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_V1_UPLOAD_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_CACHE_VERSION: u64 = 1;

pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    env_var(key)
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("Invalid value for {key} ('{raw}'): {err}")),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProtocol {
    V1,
    V2,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub protocol: CacheProtocol,
    pub base_url: String,
    pub auth_token: Option<String>,
    pub key_prefix: Option<String>,
    pub key_suffix: String,
    pub cache_version: u64,
    pub concurrency: usize,
    pub download_chunk_size: u64,
    pub upload_chunk_size: u64,
    pub local_cache_dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn new(protocol: CacheProtocol, base_url: impl Into<String>, key_suffix: impl Into<String>) -> Self {
        let upload_chunk_size = match protocol {
            CacheProtocol::V1 => DEFAULT_V1_UPLOAD_CHUNK_SIZE,
            CacheProtocol::V2 => DEFAULT_CHUNK_SIZE,
        };

        Self {
            protocol,
            base_url: base_url.into(),
            auth_token: None,
            key_prefix: None,
            key_suffix: key_suffix.into(),
            cache_version: DEFAULT_CACHE_VERSION,
            concurrency: DEFAULT_CONCURRENCY,
            download_chunk_size: DEFAULT_CHUNK_SIZE,
            upload_chunk_size,
            local_cache_dir: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let protocol = if env_flag(SERVICE_V2_ENV) {
            CacheProtocol::V2
        } else {
            CacheProtocol::V1
        };

        let base_url_env = match protocol {
            CacheProtocol::V1 => CACHE_URL_ENV,
            CacheProtocol::V2 => RESULTS_URL_ENV,
        };
        let base_url = env_var(base_url_env)
            .with_context(|| format!("{base_url_env} is not set; is this running in GitHub Actions?"))?;
        let key_suffix = env_var(RUN_ID_ENV).with_context(|| format!("{RUN_ID_ENV} is not set"))?;

        let mut config = Self::new(protocol, base_url, key_suffix);
        config.auth_token = env_var(RUNTIME_TOKEN_ENV);
        config.key_prefix = env_var("LAYERCACHE_KEY_PREFIX");
        config.local_cache_dir = env_var("LAYERCACHE_LOCAL_CACHE_DIR").map(PathBuf::from);

        if let Some(concurrency) = env_parse::<usize>("LAYERCACHE_CONCURRENCY")? {
            config.concurrency = concurrency;
        }
        if let Some(chunk_size) = env_parse::<u64>("LAYERCACHE_CHUNK_SIZE")? {
            config.download_chunk_size = chunk_size;
            config.upload_chunk_size = chunk_size;
        }
        if let Some(version) = env_parse::<u64>("LAYERCACHE_CACHE_VERSION")? {
            config.cache_version = version;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.download_chunk_size = chunk_size;
        self.upload_chunk_size = chunk_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.concurrency > 0, "Cache concurrency must be greater than zero");
        anyhow::ensure!(
            self.download_chunk_size > 0 && self.upload_chunk_size > 0,
            "Cache chunk size must be greater than zero"
        );
        anyhow::ensure!(!self.key_suffix.trim().is_empty(), "Cache key suffix must not be empty");
        anyhow::ensure!(!self.base_url.trim().is_empty(), "Cache service URL must not be empty");
        Ok(())
    }
}
