pub mod discovery;
pub mod error;
pub mod health;
pub mod management;
pub mod session;

pub use discovery::{InMemoryRegistry, Marker, PeerRegistry, RedisRegistry};
pub use error::{Error, Result};
pub use health::{AggregateHealthReport, AggregatorConfig, ConnectivityReport, HealthAggregator};
pub use management::{HttpConnector, LocalConnector, LocalPeer, ManagementConnector, ManagementLink};
pub use session::VerificationSession;
