//! Translation of the admin configuration into receiver configs.
//!
//! Every configured URL becomes one [`ReceiverConfig`] belonging to the
//! receiver group `config-{index}`. The same group names key the discovery
//! configuration, so discovered targets can be matched back to the config
//! that produced them.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::time::Duration;
use url::Url;

use crate::discovery::{DiscoveryConfig, TargetGroup};
use crate::errors::{Result, SenderError};

/// Timeout applied to every push to a receiver
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Alertmanager API version spoken to receivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApiVersion {
    #[default]
    V2,
}

impl ApiVersion {
    /// Path of the alerts endpoint, relative to the receiver's path prefix
    pub fn alerts_path(self) -> &'static str {
        match self {
            ApiVersion::V2 => "/api/v2/alerts",
        }
    }
}

/// Receiver settings as supplied by an administrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfiguration {
    /// Receiver URLs, `scheme://[user[:pass]@]host[:port][/path]`
    #[serde(default)]
    pub alertmanagers: Vec<String>,
}

impl AdminConfiguration {
    pub fn new<I, S>(alertmanagers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            alertmanagers: alertmanagers.into_iter().map(Into::into).collect(),
        }
    }
}

/// Basic auth credentials taken from a receiver URL
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    /// `None` unless the URL contains a `:` after the username
    pub password: Option<String>,
}

impl Debug for BasicAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<secret>"))
            .finish()
    }
}

/// Delivery and discovery settings for one receiver
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub api_version: ApiVersion,
    pub scheme: String,
    /// URL path without a trailing slash, empty for the root
    pub path_prefix: String,
    pub timeout: Duration,
    pub basic_auth: Option<BasicAuth>,
    pub discovery: DiscoveryConfig,
}

impl ReceiverConfig {
    /// Build the config for a single receiver URL
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or has no host.
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|source| SenderError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| SenderError::MissingHost(raw.to_string()))?;

        let address = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            api_version: ApiVersion::V2,
            scheme: url.scheme().to_string(),
            path_prefix: url.path().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            basic_auth: basic_auth_from_raw(&url, raw),
            discovery: DiscoveryConfig::Static(vec![TargetGroup::new("0", [address])]),
        })
    }

    /// Push URL for a discovered `host[:port]` address of this receiver
    ///
    /// Addresses without a port get the scheme's default port.
    pub fn endpoint_url(&self, address: &str) -> Result<Url> {
        let raw = format!(
            "{}://{}{}{}",
            self.scheme,
            with_default_port(address, &self.scheme),
            self.path_prefix,
            self.api_version.alerts_path()
        );
        Url::parse(&raw).map_err(|source| SenderError::InvalidUrl { url: raw, source })
    }
}

/// Build receiver configs for every URL in the admin configuration
///
/// Either every URL is valid and all configs are returned, or the first
/// invalid URL is reported and nothing is returned.
pub fn build_receiver_configs(cfg: &AdminConfiguration) -> Result<Vec<ReceiverConfig>> {
    cfg.alertmanagers
        .iter()
        .map(|raw| ReceiverConfig::from_url(raw))
        .collect()
}

/// Name of the receiver group for the receiver config at `index`
pub fn receiver_group_name(index: usize) -> String {
    format!("config-{index}")
}

/// Discovery configuration keyed by receiver group name
pub fn discovery_configs(receivers: &[ReceiverConfig]) -> HashMap<String, DiscoveryConfig> {
    receivers
        .iter()
        .enumerate()
        .map(|(i, receiver)| (receiver_group_name(i), receiver.discovery.clone()))
        .collect()
}

/// Credentials from the user-info part of a URL
///
/// [`Url`] decides whether there is user-info at all. The raw string is
/// read because [`Url`] cannot tell `user@` from `user:@`.
fn basic_auth_from_raw(url: &Url, raw: &str) -> Option<BasicAuth> {
    if url.username().is_empty() && url.password().is_none() {
        return None;
    }
    let (_, rest) = raw.split_once("://")?;
    let authority = rest.split(['/', '\\', '?', '#']).next().unwrap_or(rest);
    let (userinfo, _) = authority.rsplit_once('@')?;

    let (username, password) = match userinfo.split_once(':') {
        Some((username, password)) => (username, Some(password)),
        None => (userinfo, None),
    };

    Some(BasicAuth {
        username: percent_decode(username),
        password: password.map(percent_decode),
    })
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

pub(crate) fn with_default_port(address: &str, scheme: &str) -> String {
    if has_port(address) {
        return address.to_string();
    }
    let port = match scheme {
        "https" => 443,
        _ => 80,
    };
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

fn has_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    }
}
