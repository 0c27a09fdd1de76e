//! Error types for cluster inspection

use clusterview_core::Transient;
use thiserror::Error;

use crate::health::AggregateHealthReport;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Already bound: {0}")]
    AlreadyBound(String),

    #[error("Directory error: {0}")]
    Directory(String),

    /// Registry failure during aggregation, with the latest per-peer states
    #[error("Aggregation error: {reason}")]
    Aggregation {
        reason: String,
        last_report: Option<Box<AggregateHealthReport>>,
    },

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] clusterview_core::Error),
}

impl Transient for Error {
    /// Network-level failures mean "not ready yet"; everything else is fatal
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_) | Self::Http(_))
    }
}

impl Error {
    pub fn aggregation(reason: impl Into<String>) -> Self {
        Self::Aggregation {
            reason: reason.into(),
            last_report: None,
        }
    }

    /// Attach `report` to an aggregation error that carries none yet
    #[must_use]
    pub fn with_last_report(self, report: AggregateHealthReport) -> Self {
        match self {
            Self::Aggregation {
                reason,
                last_report: None,
            } => Self::Aggregation {
                reason,
                last_report: Some(Box::new(report)),
            },
            other => other,
        }
    }

    /// Per-peer states known when the error was raised
    #[must_use]
    pub fn last_report(&self) -> Option<&AggregateHealthReport> {
        match self {
            Self::Aggregation {
                last_report: Some(report),
                ..
            } => Some(report),
            _ => None,
        }
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clusterview_core::HealthState;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_transient_classification() {
        assert!(Error::Connect("refused".into()).is_transient());
        assert!(Error::Timeout("identity".into()).is_transient());
        assert!(Error::Http("503".into()).is_transient());

        assert!(!Error::aggregation("registry down").is_transient());
        assert!(!Error::AlreadyBound("ms1".into()).is_transient());
        assert!(!Error::Directory("closed".into()).is_transient());
        assert!(!Error::Configuration("no peers".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    fn report_with_failure(member: &str) -> AggregateHealthReport {
        AggregateHealthReport {
            per_peer: BTreeMap::new(),
            overall: HealthState::Unknown,
            unreachable: BTreeSet::new(),
            failures: BTreeMap::from([(member.to_string(), "refused".to_string())]),
            membership: BTreeMap::new(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_last_report_is_kept_once_attached() {
        let err = Error::aggregation("registry down")
            .with_last_report(report_with_failure("B"))
            .with_last_report(report_with_failure("C"));
        let report = err.last_report().unwrap();
        assert!(report.failures.contains_key("B"));
        assert!(!report.failures.contains_key("C"));

        let err = Error::Directory("closed".into()).with_last_report(report_with_failure("B"));
        assert!(err.last_report().is_none());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: Error = clusterview_core::Error::Configuration("poll interval".into()).into();
        assert!(matches!(err, Error::Core(_)));
        assert!(err.to_string().contains("poll interval"));
    }
}
