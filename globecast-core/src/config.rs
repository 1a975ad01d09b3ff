use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GlobecastConfig {
    pub proxy: ProxySection,
    pub routing: RoutingSection,
    pub playback: PlaybackSection,
    pub ingest: IngestSection,
    pub preferences: PreferencesSection,
    pub directory: DirectorySection,
}

impl GlobecastConfig {
    /// Resolves a path from the config relative to the directory holding the config file.
    pub fn resolve_path<P: AsRef<Path>>(&self, base_dir: &Path, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.proxy.route.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "proxy.route",
                reason: format!("route must start with '/': {}", self.proxy.route),
            });
        }
        if self.playback.offline_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "playback.offline_timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.ingest.max_buffer_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "ingest.max_buffer_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.ingest.live_sync_secs < 0.0 {
            return Err(ConfigError::Invalid {
                field: "ingest.live_sync_secs",
                reason: "must not be negative".into(),
            });
        }
        if self.ingest.abr.safety_factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "ingest.abr.safety_factor",
                reason: "must be at least 1.0".into(),
            });
        }
        if let Some(base) = &self.routing.proxy_base {
            if url::Url::parse(base).is_err() {
                return Err(ConfigError::Invalid {
                    field: "routing.proxy_base",
                    reason: format!("not an absolute URL: {base}"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub bind: SocketAddr,
    pub route: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            route: "/proxy".into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            connect_timeout_secs: 10,
        }
    }
}

impl ProxySection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub proxy_base: Option<String>,
    pub direct_hosts: Vec<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            proxy_base: None,
            direct_hosts: vec!["youtube.com".into(), "youtube-nocookie.com".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackSection {
    pub offline_timeout_secs: u64,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            offline_timeout_secs: 10,
        }
    }
}

impl PlaybackSection {
    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub max_buffer_secs: f64,
    pub live_sync_secs: f64,
    pub max_network_retries: u32,
    pub network_retry_delay_ms: u64,
    pub max_media_recoveries: u32,
    pub request_timeout_secs: u64,
    pub abr: AbrSection,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            max_buffer_secs: 8.0,
            live_sync_secs: 3.0,
            max_network_retries: 6,
            network_retry_delay_ms: 1000,
            max_media_recoveries: 3,
            request_timeout_secs: 15,
            abr: AbrSection::default(),
        }
    }
}

impl IngestSection {
    pub fn max_buffer(&self) -> Duration {
        Duration::from_secs_f64(self.max_buffer_secs.max(0.0))
    }

    pub fn live_sync(&self) -> Duration {
        Duration::from_secs_f64(self.live_sync_secs.max(0.0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Exponential backoff for the n-th consecutive network failure, capped at 30s.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(5);
        Duration::from_millis(self.network_retry_delay_ms.saturating_mul(factor))
            .min(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AbrSection {
    pub safety_factor: f64,
    pub min_switch_interval_secs: f64,
    pub initial_bandwidth_bps: u64,
}

impl Default for AbrSection {
    fn default() -> Self {
        Self {
            safety_factor: 1.25,
            min_switch_interval_secs: 4.0,
            initial_bandwidth_bps: 1_500_000,
        }
    }
}

impl AbrSection {
    pub fn min_switch_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_switch_interval_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PreferencesSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectorySection {
    pub channels_file: Option<PathBuf>,
}

pub fn load_globecast_config<P: AsRef<Path>>(path: P) -> Result<GlobecastConfig> {
    let config: GlobecastConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

pub(crate) fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
