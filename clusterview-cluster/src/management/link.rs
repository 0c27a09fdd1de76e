use async_trait::async_trait;

use clusterview_core::{ClusterRef, Endpoint, HealthState, PeerIdentity};

use crate::error::Result;

/// Opens management sessions to cluster members
#[async_trait]
pub trait ManagementConnector: Send + Sync {
    /// Open a session; fails with [`crate::Error::Connect`] when the member is unreachable
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ManagementLink>>;
}

/// Read-only session with one member's management endpoint
///
/// Every query returns a fresh snapshot. `close` is idempotent, and dropping
/// a link releases it too.
#[async_trait]
pub trait ManagementLink: Send + Sync {
    async fn identity(&self) -> Result<PeerIdentity>;

    async fn health(&self) -> Result<HealthState>;

    /// Cluster the member belongs to; `None` for a standalone member
    async fn cluster_ref(&self) -> Result<Option<ClusterRef>>;

    async fn close(&self);
}
