//! Peer discovery through a shared naming registry

pub mod peer_registry;
pub mod redis_registry;

use std::sync::Arc;

use clusterview_core::config::Config;

use crate::error::{Error, Result};

pub use peer_registry::{
    announce, bound_key, ensure_bound, is_announced, probe, BindOutcome, InMemoryRegistry, Marker,
    PeerRegistry,
};
pub use redis_registry::RedisRegistry;

/// Build the registry backend named in the configuration
pub fn registry_from_config(config: &Config) -> Result<Arc<dyn PeerRegistry>> {
    let registry = &config.registry;
    match registry.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryRegistry::new())),
        "redis" => Ok(Arc::new(
            RedisRegistry::new(&registry.url, registry.key_prefix.clone())?
                .with_operation_timeout(config.timeouts().registry),
        )),
        other => Err(Error::Configuration(format!(
            "Unknown registry backend: {other}"
        ))),
    }
}
