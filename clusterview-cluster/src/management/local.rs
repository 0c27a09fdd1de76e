//! In-process management plane
//!
//! Holds member state directly in memory so verifications can run without a
//! deployed cluster. Each member can be made unreachable, given a scripted
//! sequence of health states (one consumed per `health` query), or slowed
//! down to exercise timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use clusterview_core::{ClusterRef, Endpoint, HealthState, PeerIdentity};

use super::link::{ManagementConnector, ManagementLink};
use crate::error::{Error, Result};

#[derive(Debug)]
struct PeerState {
    reachable: bool,
    failing: bool,
    health: HealthState,
    script: VecDeque<HealthState>,
    cluster: Option<ClusterRef>,
    query_delay: Option<Duration>,
}

/// One in-process member
#[derive(Debug)]
pub struct LocalPeer {
    name: String,
    state: Mutex<PeerState>,
}

impl LocalPeer {
    #[must_use]
    pub fn standalone(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PeerState {
                reachable: true,
                failing: false,
                health: HealthState::Ok,
                script: VecDeque::new(),
                cluster: None,
                query_delay: None,
            }),
        }
    }

    #[must_use]
    pub fn clustered(name: impl Into<String>, cluster: ClusterRef) -> Self {
        let peer = Self::standalone(name);
        peer.state.lock().cluster = Some(cluster);
        peer
    }

    #[must_use]
    pub fn with_health(self, health: HealthState) -> Self {
        self.set_health(health);
        self
    }

    /// Health states returned by successive queries; the last one sticks
    #[must_use]
    pub fn with_health_script(self, script: impl IntoIterator<Item = HealthState>) -> Self {
        self.state.lock().script = script.into_iter().collect();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_health(&self, health: HealthState) {
        let mut state = self.state.lock();
        state.health = health;
        state.script.clear();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Accept connections but time out every query
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn set_cluster(&self, cluster: Option<ClusterRef>) {
        self.state.lock().cluster = cluster;
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.state.lock().query_delay = delay;
    }

    /// Endpoint that the [`LocalConnector`] resolves to this member
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.name.clone(), 0).with_name(self.name.clone())
    }

    fn next_health(&self) -> HealthState {
        let mut state = self.state.lock();
        if let Some(next) = state.script.pop_front() {
            state.health = next;
        }
        state.health
    }

    async fn before_query(&self) -> Result<()> {
        let (delay, failing) = {
            let state = self.state.lock();
            (state.query_delay, state.failing)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(Error::Timeout(format!("{} did not answer", self.name)));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LinkCounters {
    open: AtomicUsize,
    max_open: AtomicUsize,
    connects: AtomicUsize,
}

impl LinkCounters {
    fn opened(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);
    }

    fn released(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector resolving endpoints to in-process members by label or host
#[derive(Debug, Default, Clone)]
pub struct LocalConnector {
    peers: Arc<RwLock<HashMap<String, Arc<LocalPeer>>>>,
    counters: Arc<LinkCounters>,
}

impl LocalConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member, returning a handle for changing its state later
    pub fn add_peer(&self, peer: LocalPeer) -> Arc<LocalPeer> {
        let peer = Arc::new(peer);
        self.peers.write().insert(peer.name.clone(), Arc::clone(&peer));
        peer
    }

    #[must_use]
    pub fn peer(&self, name: &str) -> Option<Arc<LocalPeer>> {
        self.peers.read().get(name).cloned()
    }

    /// Endpoints of every registered member, sorted by name
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let peers = self.peers.read();
        let mut names: Vec<_> = peers.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| peers.get(&name).map(|peer| peer.endpoint()))
            .collect()
    }

    /// Links currently open
    #[must_use]
    pub fn open_links(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Highest number of links open at the same time
    #[must_use]
    pub fn max_open_links(&self) -> usize {
        self.counters.max_open.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    fn resolve(&self, endpoint: &Endpoint) -> Option<Arc<LocalPeer>> {
        let peers = self.peers.read();
        peers
            .get(&endpoint.label())
            .or_else(|| peers.get(&endpoint.host))
            .cloned()
    }
}

#[async_trait]
impl ManagementConnector for LocalConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ManagementLink>> {
        let peer = self
            .resolve(endpoint)
            .ok_or_else(|| Error::Connect(format!("{}: no such member", endpoint.label())))?;

        if !peer.state.lock().reachable {
            return Err(Error::Connect(format!("{}: connection refused", endpoint.label())));
        }

        self.counters.opened();
        debug!(peer = %peer.name, "Local management link opened");
        Ok(Box::new(LocalLink {
            peer,
            counters: Arc::clone(&self.counters),
            closed: Mutex::new(false),
        }))
    }
}

struct LocalLink {
    peer: Arc<LocalPeer>,
    counters: Arc<LinkCounters>,
    closed: Mutex<bool>,
}

impl LocalLink {
    fn release(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            self.counters.released();
        }
    }

    async fn ready(&self) -> Result<()> {
        let closed = *self.closed.lock();
        if closed {
            return Err(Error::Connect(format!(
                "management link to {} is closed",
                self.peer.name
            )));
        }
        let reachable = self.peer.state.lock().reachable;
        if !reachable {
            return Err(Error::Connect(format!("{}: connection lost", self.peer.name)));
        }
        self.peer.before_query().await
    }
}

#[async_trait]
impl ManagementLink for LocalLink {
    async fn identity(&self) -> Result<PeerIdentity> {
        self.ready().await?;
        let cluster = self.peer.state.lock().cluster.clone();
        Ok(PeerIdentity {
            name: self.peer.name.clone(),
            cluster,
        })
    }

    async fn health(&self) -> Result<HealthState> {
        self.ready().await?;
        Ok(self.peer.next_health())
    }

    async fn cluster_ref(&self) -> Result<Option<ClusterRef>> {
        self.ready().await?;
        Ok(self.peer.state.lock().cluster.clone())
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.release();
    }
}
