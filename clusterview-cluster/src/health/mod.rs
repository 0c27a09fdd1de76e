//! Cluster health aggregation

pub mod aggregator;
pub mod report;

pub use aggregator::{AggregatorConfig, HealthAggregator};
pub use report::{AggregateHealthReport, ConnectivityReport, MemberVisibility, PeerReport};
