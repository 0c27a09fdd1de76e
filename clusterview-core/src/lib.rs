pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod poller;
pub mod resilience;

pub use config::Config;
pub use error::{Error, Result, Transient};
pub use models::{ClusterRef, Credentials, Endpoint, HealthState, PeerIdentity};
pub use poller::{
    Clock, ConditionPoller, LastObservation, ManualClock, Observation, PollOutcome, PollPolicy,
    TokioClock,
};
