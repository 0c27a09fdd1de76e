//! Verification sessions used by test drivers
//!
//! A session owns the cancellation scope for its waits and remembers every
//! registry key it bound, so `close` leaves the registry as it found it.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument, Span};

use clusterview_core::logging::{generate_session_id, session_span};
use clusterview_core::{
    Clock, ConditionPoller, Endpoint, LastObservation, Observation, PollOutcome, PollPolicy,
    TokioClock,
};

use crate::discovery::{announce, PeerRegistry};
use crate::error::{Error, Result};
use crate::health::{AggregateHealthReport, HealthAggregator};

pub struct VerificationSession {
    id: String,
    span: Span,
    aggregator: HealthAggregator,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    bound_keys: Mutex<Vec<String>>,
}

impl VerificationSession {
    #[must_use]
    pub fn new(aggregator: HealthAggregator) -> Self {
        let id = generate_session_id();
        Self {
            span: session_span(&id),
            id,
            aggregator,
            clock: Arc::new(TokioClock),
            cancel: CancellationToken::new(),
            bound_keys: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn aggregator(&self) -> &HealthAggregator {
        &self.aggregator
    }

    /// Token whose cancellation stops every wait of this session
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn poller(&self, policy: &PollPolicy, description: &str) -> Result<ConditionPoller> {
        Ok(ConditionPoller::new(*policy)?
            .with_clock(Arc::clone(&self.clock))
            .with_cancellation(self.cancel.child_token())
            .describe(description))
    }

    /// Poll until every peer answers, overall health is OK and each expected member reports `HEALTH_OK`
    ///
    /// On timeout the outcome carries the last report seen. Registry failures
    /// abort the wait and are returned as `Err`, carrying the latest per-peer
    /// states when any member was reached.
    pub async fn verify_cluster_healthy(
        &self,
        peers: &[Endpoint],
        expected_members: &[String],
        policy: &PollPolicy,
    ) -> Result<PollOutcome<AggregateHealthReport, Error>> {
        let poller = self.poller(policy, "cluster healthy")?;
        let aggregator = &self.aggregator;
        let last_report = Mutex::new(None::<AggregateHealthReport>);
        let last = &last_report;

        let outcome = poller
            .until(move || async move {
                let report = aggregator.aggregate(peers).await?;
                *last.lock() = Some(report.clone());
                let observation = if report.is_healthy_for(expected_members) {
                    Observation::Satisfied(report)
                } else {
                    Observation::Unsatisfied(report)
                };
                Ok::<_, Error>(observation)
            })
            .instrument(info_span!(parent: &self.span, "verify_cluster_healthy"))
            .await
            .map_err(|e| match last_report.lock().take() {
                Some(report) => e.with_last_report(report),
                None => e,
            })?;

        match &outcome {
            PollOutcome::Succeeded(report) => {
                info!(session = %self.id, members = report.per_peer.len(), "Cluster verified healthy");
            }
            PollOutcome::TimedOut(Some(LastObservation::Value(report))) => {
                warn!(
                    session = %self.id,
                    overall = %report.overall,
                    unreachable = report.unreachable.len(),
                    unhealthy = ?report.unhealthy_members(expected_members),
                    "Cluster did not become healthy"
                );
            }
            PollOutcome::TimedOut(Some(LastObservation::Error(e))) => {
                warn!(session = %self.id, error = %e, "Cluster did not become healthy");
            }
            PollOutcome::TimedOut(None) => {
                warn!(session = %self.id, "Cluster was never checked within the budget");
            }
            PollOutcome::Cancelled => {
                info!(session = %self.id, "Cluster verification cancelled");
            }
        }

        Ok(outcome)
    }

    /// Poll an arbitrary driver check under this session's cancellation scope
    pub async fn await_condition<T, F, Fut>(
        &self,
        description: &str,
        policy: &PollPolicy,
        check: F,
    ) -> Result<PollOutcome<T, Error>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observation<T>>>,
    {
        let poller = self.poller(policy, description)?;
        poller
            .until(check)
            .instrument(info_span!(parent: &self.span, "await_condition", condition = description))
            .await
    }

    /// Announce `member` in the registry; the key is unbound on [`Self::close`]
    ///
    /// Fails with [`Error::Cancelled`] once the session is closed.
    pub async fn announce(&self, member: &str) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let registry = self.aggregator.registry();
        let key = announce(registry.as_ref(), member).await?;
        self.bound_keys.lock().push(key.clone());
        Ok(key)
    }

    /// Cancel outstanding waits and unbind every key this session bound
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();

        let keys = std::mem::take(&mut *self.bound_keys.lock());
        let registry = self.aggregator.registry();
        let mut last_error = None;
        for key in keys {
            if let Err(e) = registry.unbind(&key).await {
                warn!(session = %self.id, key = %key, error = %e, "Failed to unbind key");
                last_error = Some(e);
            }
        }

        info!(session = %self.id, "Verification session closed");
        last_error.map_or(Ok(()), Err)
    }
}
