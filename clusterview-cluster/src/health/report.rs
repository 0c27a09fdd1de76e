//! Cluster-wide health reports

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clusterview_core::{ClusterRef, HealthState, PeerIdentity};

/// What one reachable member reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReport {
    pub identity: PeerIdentity,
    pub health: HealthState,
}

/// Whether a cluster member is visible in the registry and was reached directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberVisibility {
    pub bound: bool,
    pub reachable: bool,
}

/// Snapshot produced by one aggregation; never updated afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateHealthReport {
    /// Reachable members keyed by reported name
    pub per_peer: BTreeMap<String, PeerReport>,
    pub overall: HealthState,
    /// Members that could not be connected to or queried, by endpoint label
    pub unreachable: BTreeSet<PeerIdentity>,
    /// Failure reason per unreachable member, or per member name reported twice
    pub failures: BTreeMap<String, String>,
    /// Every member named in a reported cluster view
    pub membership: BTreeMap<String, MemberVisibility>,
    pub observed_at: DateTime<Utc>,
}

impl AggregateHealthReport {
    /// Overall health is OK and every queried member answered
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.overall == HealthState::Ok && self.unreachable.is_empty()
    }

    /// [`Self::is_healthy`], and every expected member reported `HEALTH_OK`
    #[must_use]
    pub fn is_healthy_for(&self, expected_members: &[String]) -> bool {
        self.is_healthy() && self.unhealthy_members(expected_members).is_empty()
    }

    /// Expected members that are missing or not OK
    #[must_use]
    pub fn unhealthy_members(&self, expected_members: &[String]) -> Vec<String> {
        expected_members
            .iter()
            .filter(|member| {
                self.per_peer
                    .get(member.as_str())
                    .is_none_or(|peer| peer.health != HealthState::Ok)
            })
            .cloned()
            .collect()
    }

    /// Health of a member, if it was reached
    #[must_use]
    pub fn health_of(&self, member: &str) -> Option<HealthState> {
        self.per_peer.get(member).map(|peer| peer.health)
    }

    /// First cluster view reported, in member-name order
    #[must_use]
    pub fn cluster(&self) -> Option<&ClusterRef> {
        self.per_peer
            .values()
            .find_map(|peer| peer.identity.cluster.as_ref())
    }

    /// Plain-text view, one `Key:value` per line
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        if let Some(cluster) = self.cluster() {
            let _ = writeln!(out, "Cluster:{}", cluster.cluster_name);
            let _ = writeln!(out, "Alive:{}", cluster.alive_count);
        }
        let _ = writeln!(out, "Health:{}", self.overall);
        if let Some(cluster) = self.cluster() {
            let _ = writeln!(out, "Members:{}", cluster.member_names.join(","));
        }
        for (member, visibility) in &self.membership {
            if visibility.bound {
                let _ = writeln!(out, "Bound:{member}");
            }
        }
        for (name, peer) in &self.per_peer {
            let _ = writeln!(out, "ServerName:{name}");
            let _ = writeln!(out, "{name}:{}", peer.health);
        }
        for peer in &self.unreachable {
            let reason = self
                .failures
                .get(&peer.name)
                .map_or("unreachable", String::as_str);
            let _ = writeln!(out, "Unreachable:{}:{reason}", peer.name);
        }

        out
    }
}

/// Outcome of connecting to a set of members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    /// Names reported by members that answered, sorted
    pub succeeded: Vec<String>,
    /// Failure reason by endpoint label
    pub failed: BTreeMap<String, String>,
}

impl ConnectivityReport {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for name in &self.succeeded {
            let _ = writeln!(out, "Success:{name}");
        }
        for (label, reason) in &self.failed {
            let _ = writeln!(out, "Failed:{label}:{reason}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterRef {
        ClusterRef {
            cluster_name: "cluster-1".to_string(),
            member_names: vec!["ms1".to_string(), "ms2".to_string()],
            alive_count: 2,
        }
    }

    fn report() -> AggregateHealthReport {
        let mut per_peer = BTreeMap::new();
        for (name, health) in [("ms1", HealthState::Ok), ("ms2", HealthState::Warn)] {
            per_peer.insert(
                name.to_string(),
                PeerReport {
                    identity: PeerIdentity::clustered(name, cluster()),
                    health,
                },
            );
        }

        let mut membership = BTreeMap::new();
        membership.insert("ms1".to_string(), MemberVisibility { bound: true, reachable: true });
        membership.insert("ms2".to_string(), MemberVisibility { bound: false, reachable: true });

        AggregateHealthReport {
            per_peer,
            overall: HealthState::Warn,
            unreachable: BTreeSet::from([PeerIdentity::standalone("ms3")]),
            failures: BTreeMap::from([("ms3".to_string(), "connection refused".to_string())]),
            membership,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_unhealthy_members() {
        let report = report();
        let expected = vec!["ms1".to_string(), "ms2".to_string(), "ms4".to_string()];

        assert_eq!(report.unhealthy_members(&expected), vec!["ms2", "ms4"]);
        assert!(!report.is_healthy_for(&expected));
        assert_eq!(report.health_of("ms1"), Some(HealthState::Ok));
        assert_eq!(report.health_of("ms3"), None);
    }

    #[test]
    fn test_healthy_report() {
        let mut report = report();
        report.overall = HealthState::Ok;
        report.unreachable.clear();
        report.failures.clear();
        if let Some(peer) = report.per_peer.get_mut("ms2") {
            peer.health = HealthState::Ok;
        }

        assert!(report.is_healthy());
        assert!(report.is_healthy_for(&["ms1".to_string(), "ms2".to_string()]));
    }

    #[test]
    fn test_render_text() {
        let text = report().render_text();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(
            lines,
            vec![
                "Cluster:cluster-1",
                "Alive:2",
                "Health:HEALTH_WARN",
                "Members:ms1,ms2",
                "Bound:ms1",
                "ServerName:ms1",
                "ms1:HEALTH_OK",
                "ServerName:ms2",
                "ms2:HEALTH_WARN",
                "Unreachable:ms3:connection refused",
            ]
        );
    }

    #[test]
    fn test_connectivity_render() {
        let report = ConnectivityReport {
            succeeded: vec!["ms1".to_string()],
            failed: BTreeMap::from([("ms2".to_string(), "refused".to_string())]),
        };
        assert!(!report.all_succeeded());
        assert_eq!(report.render_text(), "Success:ms1\nFailed:ms2:refused\n");
    }

    #[test]
    fn test_report_json_shape() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["overall"], "HEALTH_WARN");
        assert_eq!(json["per_peer"]["ms1"]["health"], "HEALTH_OK");
        assert_eq!(json["unreachable"][0]["name"], "ms3");
    }
}
