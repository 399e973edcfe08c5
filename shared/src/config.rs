use std::time::Duration;
use tracing::warn;

/// Storage slot used when no key is configured
pub const DEFAULT_STORAGE_KEY: &str = "REACT_QUERY_OFFLINE_CACHE";
/// Minimum spacing between storage writes when none is configured
pub const DEFAULT_THROTTLE_MS: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sled(String), // data_dir
    Moka,
    None,
}

#[derive(Clone, Debug)]
pub struct PersistConfig {
    pub backend: Backend,
    pub key: String,
    pub throttle_ms: u64,
    pub retry_attempts: Option<u32>,
    pub report_failures: bool,
}

impl PersistConfig {
    const DEFAULT_DATA_DIR: &str = "./data";

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir =
            lookup("PERSIST_DATA_DIR").unwrap_or_else(|| Self::DEFAULT_DATA_DIR.to_string());

        let backend = match lookup("PERSIST_BACKEND")
            .map(|b| b.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("memory") => Backend::Memory,
            Some("moka") => Backend::Moka,
            Some("none") => Backend::None,
            Some("sled") | None => Backend::Sled(data_dir),
            Some(other) => {
                warn!("Unknown PERSIST_BACKEND '{}', falling back to sled", other);
                Backend::Sled(data_dir)
            }
        };

        let throttle_ms = lookup("PERSIST_THROTTLE_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_THROTTLE_MS);

        Self {
            backend,
            key: lookup("PERSIST_KEY").unwrap_or_else(|| DEFAULT_STORAGE_KEY.to_string()),
            throttle_ms,
            retry_attempts: lookup("PERSIST_RETRY_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()),
            report_failures: lookup("PERSIST_REPORT_FAILURES")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }

    pub fn throttle_time(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
