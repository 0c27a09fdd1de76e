//! Fan-out health aggregation across cluster members
//!
//! Members are queried concurrently with a bounded number of links in
//! flight. A member that cannot be reached or queried lands in the report's
//! `unreachable` set; only registry failures abort an aggregation.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use clusterview_core::config::Config;
use clusterview_core::resilience::timeout::TimeoutConfig;
use clusterview_core::{Endpoint, HealthState, PeerIdentity};

use super::report::{AggregateHealthReport, ConnectivityReport, MemberVisibility, PeerReport};
use crate::discovery::{bound_key, probe, PeerRegistry};
use crate::error::{Error, Result};
use crate::management::{ManagementConnector, ManagementLink};

/// Aggregation settings
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Links in flight at once
    pub max_concurrency: usize,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    /// Rank `HEALTH_UNKNOWN` like `HEALTH_OK` instead of as a failure
    pub tolerate_unknown: bool,
    /// Bind and unbind a throwaway key before querying members
    pub probe_registry: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let timeouts = TimeoutConfig::default();
        Self {
            max_concurrency: 8,
            connect_timeout: timeouts.connect,
            query_timeout: timeouts.query,
            tolerate_unknown: false,
            probe_registry: true,
        }
    }
}

impl AggregatorConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let timeouts = config.timeouts();
        Self {
            max_concurrency: config.aggregation.max_concurrency,
            connect_timeout: timeouts.connect,
            query_timeout: timeouts.query,
            tolerate_unknown: config.aggregation.tolerate_unknown,
            probe_registry: config.aggregation.probe_registry,
        }
    }
}

/// Per-member outcome before reduction
enum PeerOutcome {
    Reached(PeerReport),
    Unreachable { label: String, reason: String },
}

/// Queries every member and reduces the answers to one report
#[derive(Clone)]
pub struct HealthAggregator {
    connector: Arc<dyn ManagementConnector>,
    registry: Arc<dyn PeerRegistry>,
    config: AggregatorConfig,
}

impl HealthAggregator {
    #[must_use]
    pub fn new(
        connector: Arc<dyn ManagementConnector>,
        registry: Arc<dyn PeerRegistry>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            connector,
            registry,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> Arc<dyn PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Query `peers` and build a cluster-wide report
    ///
    /// # Errors
    ///
    /// [`Error::Aggregation`] when the registry cannot be probed or read. A
    /// failed membership lookup carries the per-peer states gathered so far.
    pub async fn aggregate(&self, peers: &[Endpoint]) -> Result<AggregateHealthReport> {
        if self.config.probe_registry {
            probe(self.registry.as_ref())
                .await
                .map_err(|e| Error::aggregation(format!("Registry probe failed: {e}")))?;
        }

        let queries: Vec<_> = peers.iter().map(|endpoint| self.query_peer(endpoint)).collect();
        let outcomes: Vec<PeerOutcome> = stream::iter(queries)
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut per_peer = BTreeMap::new();
        let mut unreachable = BTreeSet::new();
        let mut failures = BTreeMap::new();
        for outcome in outcomes {
            match outcome {
                PeerOutcome::Reached(report) => {
                    self.record_reached(&mut per_peer, &mut failures, report);
                }
                PeerOutcome::Unreachable { label, reason } => {
                    unreachable.insert(PeerIdentity::standalone(label.clone()));
                    failures.insert(label, reason);
                }
            }
        }

        let overall = reduce_health(&per_peer, self.config.tolerate_unknown);
        let membership = match self.membership(&per_peer).await {
            Ok(membership) => membership,
            Err(e) => {
                return Err(e.with_last_report(AggregateHealthReport {
                    per_peer,
                    overall,
                    unreachable,
                    failures,
                    membership: BTreeMap::new(),
                    observed_at: Utc::now(),
                }));
            }
        };

        info!(
            peers = peers.len(),
            reached = per_peer.len(),
            unreachable = unreachable.len(),
            overall = %overall,
            "Cluster health aggregated"
        );

        Ok(AggregateHealthReport {
            per_peer,
            overall,
            unreachable,
            failures,
            membership,
            observed_at: Utc::now(),
        })
    }

    /// Keep the worse of two answers claiming one member name
    fn record_reached(
        &self,
        per_peer: &mut BTreeMap<String, PeerReport>,
        failures: &mut BTreeMap<String, String>,
        report: PeerReport,
    ) {
        let name = report.identity.name.clone();
        let Some(existing) = per_peer.get(&name) else {
            per_peer.insert(name, report);
            return;
        };

        warn!(peer = %name, "Two endpoints reported the same member name");
        failures.insert(
            name.clone(),
            format!(
                "duplicate member name reported as {} and {}",
                existing.health, report.health
            ),
        );
        let tolerate_unknown = self.config.tolerate_unknown;
        if existing.health.worst(report.health, tolerate_unknown) != existing.health {
            per_peer.insert(name, report);
        }
    }

    /// Connect to each endpoint, read its name and close the link again
    pub async fn test_connections(&self, endpoints: &[Endpoint]) -> ConnectivityReport {
        let attempts: Vec<_> = endpoints.iter().map(|endpoint| self.connect_once(endpoint)).collect();
        let results: Vec<std::result::Result<String, (String, String)>> = stream::iter(attempts)
            .buffer_unordered(self.concurrency())
            .collect()
            .await;

        let mut report = ConnectivityReport::default();
        for result in results {
            match result {
                Ok(name) => report.succeeded.push(name),
                Err((label, reason)) => {
                    report.failed.insert(label, reason);
                }
            }
        }
        report.succeeded.sort();
        report
    }

    async fn connect_once(&self, endpoint: &Endpoint) -> std::result::Result<String, (String, String)> {
        let link = self
            .open(endpoint)
            .await
            .map_err(|e| (endpoint.label(), e.to_string()))?;
        let identity = self.bounded(link.identity(), "identity").await;
        link.close().await;
        identity
            .map(|identity| identity.name)
            .map_err(|e| (endpoint.label(), e.to_string()))
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn ManagementLink>> {
        tokio::time::timeout(self.config.connect_timeout, self.connector.connect(endpoint))
            .await
            .map_err(|_| Error::Timeout(format!("Connecting to {} timed out", endpoint.label())))?
    }

    async fn bounded<T>(&self, query: impl Future<Output = Result<T>>, what: &str) -> Result<T> {
        tokio::time::timeout(self.config.query_timeout, query)
            .await
            .map_err(|_| Error::Timeout(format!("{what} query timed out")))?
    }

    async fn query_peer(&self, endpoint: &Endpoint) -> PeerOutcome {
        let label = endpoint.label();

        let link = match self.open(endpoint).await {
            Ok(link) => link,
            Err(e) => {
                debug!(peer = %label, error = %e, "Member unreachable");
                return PeerOutcome::Unreachable {
                    label,
                    reason: e.to_string(),
                };
            }
        };

        let result = self.read_peer(link.as_ref()).await;
        link.close().await;

        match result {
            Ok(report) => PeerOutcome::Reached(report),
            Err(e) => {
                warn!(peer = %label, error = %e, "Member query failed");
                PeerOutcome::Unreachable {
                    label,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn read_peer(&self, link: &dyn ManagementLink) -> Result<PeerReport> {
        let identity = self.bounded(link.identity(), "identity").await?;
        let health = self.bounded(link.health(), "health").await?;
        let cluster = self.bounded(link.cluster_ref(), "cluster").await?;

        Ok(PeerReport {
            identity: PeerIdentity {
                name: identity.name,
                cluster,
            },
            health,
        })
    }

    async fn membership(
        &self,
        per_peer: &BTreeMap<String, PeerReport>,
    ) -> Result<BTreeMap<String, MemberVisibility>> {
        let members: BTreeSet<&str> = per_peer
            .values()
            .filter_map(|peer| peer.identity.cluster.as_ref())
            .flat_map(|cluster| cluster.member_names.iter().map(String::as_str))
            .collect();

        let lookups: Vec<_> = members
            .into_iter()
            .map(|member| self.visibility(member, per_peer.contains_key(member)))
            .collect();
        stream::iter(lookups)
            .buffer_unordered(self.concurrency())
            .try_collect()
            .await
    }

    async fn visibility(&self, member: &str, reachable: bool) -> Result<(String, MemberVisibility)> {
        let bound = self
            .registry
            .lookup(&bound_key(member))
            .await
            .map_err(|e| Error::aggregation(format!("Registry lookup for {member} failed: {e}")))?
            .is_some();
        Ok((member.to_string(), MemberVisibility { bound, reachable }))
    }
}

/// Worst state among clustered members, else among all reached members
fn reduce_health(per_peer: &BTreeMap<String, PeerReport>, tolerate_unknown: bool) -> HealthState {
    let clustered: Vec<&PeerReport> = per_peer
        .values()
        .filter(|peer| peer.identity.is_clustered())
        .collect();
    let pool = if clustered.is_empty() {
        per_peer.values().collect()
    } else {
        clustered
    };

    if pool.is_empty() {
        return HealthState::Unknown;
    }
    pool.into_iter().fold(HealthState::Ok, |worst, peer| {
        worst.worst(peer.health, tolerate_unknown)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::InMemoryRegistry;
    use crate::management::{LocalConnector, LocalPeer};
    use clusterview_core::ClusterRef;

    fn peer(name: &str, cluster: Option<&ClusterRef>, health: HealthState) -> (String, PeerReport) {
        let identity = match cluster {
            Some(cluster) => PeerIdentity::clustered(name, cluster.clone()),
            None => PeerIdentity::standalone(name),
        };
        (name.to_string(), PeerReport { identity, health })
    }

    fn cluster(members: &[&str]) -> ClusterRef {
        ClusterRef {
            cluster_name: "cluster-1".to_string(),
            member_names: members.iter().map(ToString::to_string).collect(),
            alive_count: u32::try_from(members.len()).unwrap(),
        }
    }

    #[test]
    fn test_reduce_prefers_clustered_members() {
        let c = cluster(&["A", "B"]);
        let per_peer = BTreeMap::from([
            peer("A", Some(&c), HealthState::Warn),
            peer("B", Some(&c), HealthState::Ok),
            peer("admin", None, HealthState::Failed),
        ]);
        assert_eq!(reduce_health(&per_peer, false), HealthState::Warn);
    }

    #[test]
    fn test_reduce_falls_back_to_standalone_members() {
        let per_peer = BTreeMap::from([
            peer("A", None, HealthState::Ok),
            peer("B", None, HealthState::Overloaded),
        ]);
        assert_eq!(reduce_health(&per_peer, false), HealthState::Overloaded);
        assert_eq!(reduce_health(&BTreeMap::new(), false), HealthState::Unknown);
    }

    #[test]
    fn test_reduce_unknown_tolerance() {
        let per_peer = BTreeMap::from([
            peer("A", None, HealthState::Ok),
            peer("B", None, HealthState::Unknown),
        ]);
        assert_eq!(reduce_health(&per_peer, false), HealthState::Unknown);
        assert_eq!(reduce_health(&per_peer, true), HealthState::Ok);
    }

    #[test]
    fn test_duplicate_member_keeps_worse_answer() {
        let aggregator = HealthAggregator::new(
            Arc::new(LocalConnector::new()),
            Arc::new(InMemoryRegistry::new()),
            AggregatorConfig::default(),
        );
        let mut per_peer = BTreeMap::new();
        let mut failures = BTreeMap::new();

        let (_, critical) = peer("A", None, HealthState::Critical);
        let (_, ok) = peer("A", None, HealthState::Ok);
        aggregator.record_reached(&mut per_peer, &mut failures, critical);
        aggregator.record_reached(&mut per_peer, &mut failures, ok);

        assert_eq!(per_peer["A"].health, HealthState::Critical);
        assert!(failures["A"].contains("duplicate member name"));
        assert_eq!(reduce_health(&per_peer, false), HealthState::Critical);
    }

    #[tokio::test]
    async fn test_failing_member_is_unreachable_and_link_closed() {
        let connector = LocalConnector::new();
        let c = cluster(&["A", "B"]);
        connector.add_peer(LocalPeer::clustered("A", c.clone()));
        connector.add_peer(LocalPeer::clustered("B", c)).set_failing(true);

        let aggregator = HealthAggregator::new(
            Arc::new(connector.clone()),
            Arc::new(InMemoryRegistry::new()),
            AggregatorConfig::default(),
        );
        let report = aggregator.aggregate(&connector.endpoints()).await.unwrap();

        assert_eq!(report.overall, HealthState::Ok);
        assert!(report.unreachable.contains(&PeerIdentity::standalone("B")));
        assert!(report.failures["B"].contains("did not answer"));
        assert_eq!(report.membership["B"], MemberVisibility { bound: false, reachable: false });
        assert_eq!(connector.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_member_hits_query_timeout() {
        let connector = LocalConnector::new();
        connector.add_peer(LocalPeer::standalone("A"));
        connector
            .add_peer(LocalPeer::standalone("slow"))
            .set_query_delay(Some(Duration::from_secs(60)));

        let config = AggregatorConfig {
            query_timeout: Duration::from_secs(2),
            ..AggregatorConfig::default()
        };
        let aggregator =
            HealthAggregator::new(Arc::new(connector.clone()), Arc::new(InMemoryRegistry::new()), config);
        let report = aggregator.aggregate(&connector.endpoints()).await.unwrap();

        assert_eq!(report.per_peer.len(), 1);
        assert!(report.failures["slow"].contains("timed out"));
        assert_eq!(connector.open_links(), 0);
    }

    #[tokio::test]
    async fn test_connections_report() {
        let connector = LocalConnector::new();
        connector.add_peer(LocalPeer::standalone("ms2"));
        connector.add_peer(LocalPeer::standalone("ms1"));
        connector.add_peer(LocalPeer::standalone("ms3")).set_reachable(false);

        let aggregator = HealthAggregator::new(
            Arc::new(connector.clone()),
            Arc::new(InMemoryRegistry::new()),
            AggregatorConfig::default(),
        );
        let report = aggregator.test_connections(&connector.endpoints()).await;

        assert_eq!(report.succeeded, vec!["ms1", "ms2"]);
        assert!(report.failed.contains_key("ms3"));
        assert_eq!(connector.open_links(), 0);
        assert_eq!(connector.connect_count(), 2);
    }
}
