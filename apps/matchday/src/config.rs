use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::normalize::DEFAULT_TICKS_PER_MINUTE;

pub const DEFAULT_HUB_URL: &str = "localhost:5000/hubs/match";
pub const DEFAULT_API_URL: &str = "localhost:5000/api";
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} cannot be empty")]
    Empty { name: &'static str },
    #[error("invalid {name}: {reason}")]
    InvalidUrl { name: &'static str, reason: String },
    #[error("invalid {name}: expected a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Endpoints and tunables for one client process.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hub_url: Url,
    pub api_url: Url,
    pub token: Option<String>,
    pub invoke_timeout: Duration,
    pub ticks_per_minute: u32,
}

impl ClientConfig {
    pub fn new(hub: &str, api: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            hub_url: hub_url(hub)?,
            api_url: api_url(api)?,
            token: None,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            ticks_per_minute: DEFAULT_TICKS_PER_MINUTE,
        })
    }

    /// Reads `MATCHDAY_*` variables, falling back to a local development
    /// server for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hub = non_empty_var("MATCHDAY_HUB_URL").unwrap_or_else(|| DEFAULT_HUB_URL.to_string());
        let api = non_empty_var("MATCHDAY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let mut config = Self::new(&hub, &api)?;
        config.token = non_empty_var("MATCHDAY_TOKEN");
        if let Some(raw) = non_empty_var("MATCHDAY_INVOKE_TIMEOUT_MS") {
            config.invoke_timeout =
                Duration::from_millis(positive("MATCHDAY_INVOKE_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = non_empty_var("MATCHDAY_TICKS_PER_MINUTE") {
            let value = positive("MATCHDAY_TICKS_PER_MINUTE", &raw)?;
            config.ticks_per_minute = u32::try_from(value).map_err(|_| ConfigError::InvalidNumber {
                name: "MATCHDAY_TICKS_PER_MINUTE",
                value: raw.clone(),
            })?;
        }
        Ok(config)
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| ConfigError::InvalidNumber {
            name,
            value: raw.to_string(),
        })
}

/// Push-channel url. Bare hosts get `ws://` or `wss://`; `http(s)` urls are
/// rewritten to their websocket equivalent.
pub fn hub_url(raw: &str) -> Result<Url, ConfigError> {
    let name = "hub url";
    let base = with_scheme(name, raw, |secure| if secure { "wss://" } else { "ws://" })?;
    let mut url = parse(name, &base)?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(ConfigError::InvalidUrl {
                name,
                reason: format!("unsupported scheme {other}"),
            });
        }
    };
    url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        name,
        reason: format!("cannot switch {base} to {scheme}"),
    })?;
    Ok(url)
}

/// REST base url, always ending in `/` so relative joins keep the prefix.
pub fn api_url(raw: &str) -> Result<Url, ConfigError> {
    let name = "api url";
    let base = with_scheme(name, raw, |secure| if secure { "https://" } else { "http://" })?;
    let mut url = parse(name, &base)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            name,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn with_scheme(
    name: &'static str,
    raw: &str,
    scheme: impl Fn(bool) -> &'static str,
) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty { name });
    }
    if trimmed.contains("://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}{trimmed}", scheme(!is_local_host(trimmed))))
    }
}

fn parse(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::InvalidUrl {
        name,
        reason: err.to_string(),
    })
}

/// Loopback and private-range hosts are assumed to run without TLS.
fn is_local_host(base: &str) -> bool {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host = host_part.to_ascii_lowercase();
    host.starts_with("localhost")
        || host.starts_with("0.0.0.0")
        || host.starts_with("127.")
        || host == "::1"
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
}
