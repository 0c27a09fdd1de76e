//! Management links over HTTP
//!
//! Each member exposes `GET /identity`, `GET /health` and
//! `GET /clusterMembers` as JSON. A 404 or a `null` body on
//! `/clusterMembers` means the member is standalone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use clusterview_core::config::Config;
use clusterview_core::resilience::retry::should_retry_error;
use clusterview_core::resilience::timeout::TimeoutConfig;
use clusterview_core::{ClusterRef, Credentials, Endpoint, HealthState, PeerIdentity};

use super::link::{ManagementConnector, ManagementLink};
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct HealthResponse {
    state: HealthWire,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HealthWire {
    Named(HealthState),
    Code(i32),
    Other(String),
}

impl HealthWire {
    fn into_state(self) -> HealthState {
        match self {
            Self::Named(state) => state,
            Self::Code(code) => HealthState::from_code(code),
            Self::Other(name) => {
                debug!(state = %name, "Unrecognised health state");
                HealthState::Unknown
            }
        }
    }
}

/// Connects to member management endpoints over HTTP
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    scheme: String,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl HttpConnector {
    /// Connector using the management scheme and the configured timeouts
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.management.scheme.clone(), &config.timeouts())
    }

    /// Plain-HTTP connector with the default 5s connect and 10s query timeouts
    pub fn with_defaults() -> Result<Self> {
        Self::new("http", &TimeoutConfig::default())
    }

    pub fn new(scheme: impl Into<String>, timeouts: &TimeoutConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            scheme: scheme.into(),
            connect_timeout: timeouts.connect,
            query_timeout: timeouts.query,
        })
    }
}

#[async_trait]
impl ManagementConnector for HttpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ManagementLink>> {
        let mut link = HttpManagementLink {
            client: self.client.clone(),
            label: endpoint.label(),
            base_url: format!("{}://{}", self.scheme, endpoint.address()),
            credentials: endpoint.credentials.clone(),
            query_timeout: self.connect_timeout,
            closed: AtomicBool::new(false),
        };

        // An endpoint counts as reachable once it answers the identity query
        let failure = match link.fetch::<PeerIdentity>("/identity").await {
            Ok(Some(_)) => None,
            Ok(None) => Some("identity endpoint not found".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            link.close().await;
            return Err(Error::Connect(format!("{}: {reason}", link.label)));
        }

        link.query_timeout = self.query_timeout;
        debug!(peer = %link.label, url = %link.base_url, "Management link opened");
        Ok(Box::new(link))
    }
}

/// Session with one member's HTTP management endpoint
#[derive(Debug)]
pub struct HttpManagementLink {
    client: Client,
    label: String,
    base_url: String,
    credentials: Option<Credentials>,
    query_timeout: Duration,
    closed: AtomicBool,
}

impl HttpManagementLink {
    /// GET `path` and decode its JSON body; `Ok(None)` on 404
    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connect(format!("management link to {} is closed", self.label)));
        }

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = tokio::time::timeout(self.query_timeout, request.send())
            .await
            .map_err(|_| Error::Timeout(format!("GET {url} timed out")))?
            .map_err(|e| map_request_error(&url, &e))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(Error::Http(format!("GET {url} returned {status}")));
            }
            _ => {}
        }

        let body = tokio::time::timeout(self.query_timeout, response.json::<T>())
            .await
            .map_err(|_| Error::Timeout(format!("Reading {url} timed out")))?
            .map_err(|e| Error::Serialization(format!("Invalid response from {url}: {e}")))?;

        Ok(Some(body))
    }
}

/// Timeouts first, then refused or dropped connections, then any other HTTP failure
fn map_request_error(url: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("GET {url} timed out: {e}"))
    } else if e.is_connect() || should_retry_error(e) {
        Error::Connect(format!("GET {url} failed: {e}"))
    } else {
        Error::Http(format!("GET {url} failed: {e}"))
    }
}

#[async_trait]
impl ManagementLink for HttpManagementLink {
    async fn identity(&self) -> Result<PeerIdentity> {
        self.fetch("/identity")
            .await?
            .ok_or_else(|| Error::Http(format!("{} has no identity endpoint", self.label)))
    }

    async fn health(&self) -> Result<HealthState> {
        let response: Option<HealthResponse> = self.fetch("/health").await?;
        response
            .map(|r| r.state.into_state())
            .ok_or_else(|| Error::Http(format!("{} has no health endpoint", self.label)))
    }

    async fn cluster_ref(&self) -> Result<Option<ClusterRef>> {
        let members: Option<Option<ClusterRef>> = self.fetch("/clusterMembers").await?;
        Ok(members.flatten())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self.label, "Management link closed");
        }
    }
}

impl Drop for HttpManagementLink {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!(peer = %self.label, "Management link dropped without close");
        }
    }
}
