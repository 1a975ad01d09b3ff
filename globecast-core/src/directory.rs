use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{load_toml, RoutingSection};
use crate::error::ConfigError;

pub const INVALID_STREAM_URL: &str =
    "Invalid stream URL format. Only HTTP/HTTPS streams are supported.";
pub const STREAM_NOT_FOUND: &str = "Stream not found in database";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{}", INVALID_STREAM_URL)]
    InvalidStreamUrl { url: String },
    #[error("{}", STREAM_NOT_FOUND)]
    ChannelNotFound { country: String, channel: String },
    #[error("invalid proxy base {base}: {source}")]
    ProxyBase {
        base: String,
        source: url::ParseError,
    },
    #[error("directory config error: {0}")]
    Config(#[from] ConfigError),
}

pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Country/channel lookup capability consumed by the player.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn lookup(&self, country: &str) -> Vec<Channel>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticChannelDirectory {
    #[serde(default)]
    countries: Vec<CountryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CountryEntry {
    name: String,
    #[serde(default)]
    channels: Vec<Channel>,
}

impl StaticChannelDirectory {
    pub fn from_file<P: AsRef<Path>>(path: P) -> DirectoryResult<Self> {
        Ok(load_toml(path)?)
    }

    pub fn with_country(mut self, name: impl Into<String>, channels: Vec<Channel>) -> Self {
        self.countries.push(CountryEntry {
            name: name.into(),
            channels,
        });
        self
    }

    pub fn countries(&self) -> impl Iterator<Item = &str> {
        self.countries.iter().map(|entry| entry.name.as_str())
    }

    fn channels_for(&self, country: &str) -> Vec<Channel> {
        self.countries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(country.trim()))
            .map(|entry| entry.channels.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChannelDirectory for StaticChannelDirectory {
    async fn lookup(&self, country: &str) -> Vec<Channel> {
        self.channels_for(country)
    }
}

/// Where a stream's requests are sent: straight to the origin or through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRoute {
    Direct,
    Proxied { endpoint: Url },
}

/// An upstream stream URL together with the route used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    upstream: Url,
    route: StreamRoute,
}

impl StreamSource {
    pub fn direct(upstream: Url) -> Self {
        Self {
            upstream,
            route: StreamRoute::Direct,
        }
    }

    pub fn proxied(upstream: Url, endpoint: Url) -> Self {
        Self {
            upstream,
            route: StreamRoute::Proxied { endpoint },
        }
    }

    /// Validates an untrusted channel URL and picks its route.
    pub fn resolve(raw: &str, routing: &RoutingSection, proxy_route: &str) -> DirectoryResult<Self> {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(DirectoryError::InvalidStreamUrl {
                url: trimmed.to_string(),
            });
        }
        let upstream = Url::parse(trimmed).map_err(|_| DirectoryError::InvalidStreamUrl {
            url: trimmed.to_string(),
        })?;

        let direct_host = upstream.host_str().is_some_and(|host| {
            routing
                .direct_hosts
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
        });
        match (&routing.proxy_base, direct_host) {
            (Some(base), false) => {
                let endpoint = Url::parse(base)
                    .and_then(|parsed| parsed.join(proxy_route))
                    .map_err(|source| DirectoryError::ProxyBase {
                        base: base.clone(),
                        source,
                    })?;
                Ok(Self::proxied(upstream, endpoint))
            }
            _ => Ok(Self::direct(upstream)),
        }
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn route(&self) -> &StreamRoute {
        &self.route
    }

    pub fn is_proxied(&self) -> bool {
        matches!(self.route, StreamRoute::Proxied { .. })
    }

    /// Request URL for `target` (an upstream URL) following this source's route.
    pub fn request_url(&self, target: &Url) -> Url {
        match &self.route {
            StreamRoute::Direct => target.clone(),
            StreamRoute::Proxied { endpoint } => {
                let mut url = endpoint.clone();
                url.query_pairs_mut()
                    .clear()
                    .append_pair("url", target.as_str());
                url
            }
        }
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.route {
            StreamRoute::Direct => write!(f, "{}", self.upstream),
            StreamRoute::Proxied { endpoint } => {
                write!(f, "{} via {}", self.upstream, endpoint)
            }
        }
    }
}

/// Looks up `channel` in `country` and validates its URL before any fetch happens.
pub async fn resolve_channel(
    directory: &dyn ChannelDirectory,
    country: &str,
    channel: &str,
    routing: &RoutingSection,
    proxy_route: &str,
) -> DirectoryResult<StreamSource> {
    let channels = directory.lookup(country).await;
    let entry = channels
        .into_iter()
        .find(|candidate| candidate.name == channel)
        .filter(|candidate| !candidate.url.trim().is_empty())
        .ok_or_else(|| DirectoryError::ChannelNotFound {
            country: country.to_string(),
            channel: channel.to_string(),
        })?;
    StreamSource::resolve(&entry.url, routing, proxy_route)
}
