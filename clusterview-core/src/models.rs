//! Domain model shared by the poller and the cluster inspection code

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Health of a single member as reported by its management endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    #[serde(rename = "HEALTH_OK", alias = "OK")]
    Ok,
    #[serde(rename = "HEALTH_WARN", alias = "WARN")]
    Warn,
    #[serde(rename = "HEALTH_CRITICAL", alias = "CRITICAL")]
    Critical,
    #[serde(rename = "HEALTH_FAILED", alias = "FAILED")]
    Failed,
    #[serde(rename = "HEALTH_OVERLOADED", alias = "OVERLOADED")]
    Overloaded,
    #[serde(rename = "HEALTH_UNKNOWN", alias = "UNKNOWN")]
    Unknown,
}

impl HealthState {
    /// Map a numeric management-plane health code.
    ///
    /// Codes outside 0..=4 are reported as `Unknown` instead of being folded into `Warn`.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Warn,
            2 => Self::Critical,
            3 => Self::Failed,
            4 => Self::Overloaded,
            _ => Self::Unknown,
        }
    }

    /// Rank used when reducing many states to one verdict; higher is worse
    #[must_use]
    pub const fn severity(self, tolerate_unknown: bool) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Warn => 1,
            Self::Overloaded => 2,
            Self::Critical => 3,
            Self::Unknown if tolerate_unknown => 0,
            Self::Unknown => 4,
            Self::Failed => 5,
        }
    }

    /// Worst of two states (ties keep `self`)
    #[must_use]
    pub const fn worst(self, other: Self, tolerate_unknown: bool) -> Self {
        if other.severity(tolerate_unknown) > self.severity(tolerate_unknown) {
            other
        } else {
            self
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "HEALTH_OK",
            Self::Warn => "HEALTH_WARN",
            Self::Critical => "HEALTH_CRITICAL",
            Self::Failed => "HEALTH_FAILED",
            Self::Overloaded => "HEALTH_OVERLOADED",
            Self::Unknown => "HEALTH_UNKNOWN",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a member's view of its cluster, valid only at query time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub cluster_name: String,
    pub member_names: Vec<String>,
    pub alive_count: u32,
}

/// Identity of a member; re-fetched on every poll, never mutated
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    #[serde(default)]
    pub cluster: Option<ClusterRef>,
}

impl PeerIdentity {
    #[must_use]
    pub fn standalone(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: None,
        }
    }

    #[must_use]
    pub fn clustered(name: impl Into<String>, cluster: ClusterRef) -> Self {
        Self {
            name: name.into(),
            cluster: Some(cluster),
        }
    }

    #[must_use]
    pub const fn is_clustered(&self) -> bool {
        self.cluster.is_some()
    }
}

/// Credentials presented to a management endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Address of one member's management endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Optional display name; defaults to `host:port`
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            name: None,
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// Endpoint of a domain member, addressed as `<domain>-<server>:<port>`
    #[must_use]
    pub fn domain_member(domain: &str, server: &str, port: u16) -> Self {
        Self::new(format!("{domain}-{server}"), port).with_name(server)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Name used to report this endpoint when its identity cannot be fetched
    #[must_use]
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `host:port` or `name=host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, addr) = match s.split_once('=') {
            Some((name, addr)) if !name.is_empty() => (Some(name.trim()), addr.trim()),
            Some(_) => return Err(Error::InvalidInput(format!("empty endpoint name in '{s}'"))),
            None => (None, s.trim()),
        };

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("endpoint '{s}' is missing a port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidInput(format!("endpoint '{s}' is missing a host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidInput(format!("invalid port in '{s}': {e}")))?;

        let endpoint = Self::new(host, port);
        Ok(match name {
            Some(name) => endpoint.with_name(name),
            None => endpoint,
        })
    }
}
