//! Shared naming registry used for membership visibility
//!
//! Members announce themselves by binding `Bound<name>`; the aggregator looks
//! those keys up to decide which members are visible cluster-wide.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};

/// Opaque value stored under a registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marker(pub String);

impl Marker {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of [`ensure_bound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    FreshlyBound,
    AlreadyPresent,
}

/// Key a member binds when it announces itself
#[must_use]
pub fn bound_key(member: &str) -> String {
    format!("Bound{member}")
}

/// Concurrent-safe key/marker directory
///
/// `bind` never overwrites: binding a key that is already present fails with
/// [`Error::AlreadyBound`] until the key is unbound.
#[async_trait]
pub trait PeerRegistry: Send + Sync {
    async fn bind(&self, name: &str, marker: Marker) -> Result<()>;

    async fn lookup(&self, name: &str) -> Result<Option<Marker>>;

    /// Remove a key; removing a missing key is a no-op
    async fn unbind(&self, name: &str) -> Result<()>;
}

/// Bind `Bound<member>` on behalf of a member; returns the key bound
pub async fn announce<R: PeerRegistry + ?Sized>(registry: &R, member: &str) -> Result<String> {
    let key = bound_key(member);
    registry.bind(&key, Marker::new(member)).await?;
    debug!(member, key = %key, "Member announced");
    Ok(key)
}

/// Whether `member` has announced itself
pub async fn is_announced<R: PeerRegistry + ?Sized>(registry: &R, member: &str) -> Result<bool> {
    Ok(registry.lookup(&bound_key(member)).await?.is_some())
}

/// Bind `name` unless it is already present
pub async fn ensure_bound<R: PeerRegistry + ?Sized>(
    registry: &R,
    name: &str,
    marker: Marker,
) -> Result<BindOutcome> {
    match registry.bind(name, marker).await {
        Ok(()) => Ok(BindOutcome::FreshlyBound),
        Err(Error::AlreadyBound(_)) => Ok(BindOutcome::AlreadyPresent),
        Err(e) => Err(e),
    }
}

/// Bind and unbind a throwaway key to check the directory is usable
pub async fn probe<R: PeerRegistry + ?Sized>(registry: &R) -> Result<()> {
    let key = format!("probe-{}", nanoid::nanoid!(10));
    registry.bind(&key, Marker::new("probe")).await?;
    registry.unbind(&key).await?;
    debug!(key = %key, "Registry probe succeeded");
    Ok(())
}

/// In-process registry backed by a sharded concurrent map
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: DashMap<String, Marker>,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PeerRegistry for InMemoryRegistry {
    async fn bind(&self, name: &str, marker: Marker) -> Result<()> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyBound(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(marker);
                Ok(())
            }
        }
    }

    async fn lookup(&self, name: &str) -> Result<Option<Marker>> {
        Ok(self.entries.get(name).map(|entry| entry.value().clone()))
    }

    async fn unbind(&self, name: &str) -> Result<()> {
        self.entries.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bind_then_lookup() {
        let registry = InMemoryRegistry::new();
        registry.bind("ms42", Marker::new("x")).await.unwrap();

        assert_eq!(registry.lookup("ms42").await.unwrap(), Some(Marker::new("x")));
        assert_eq!(registry.lookup("ms43").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rebind_always_rejected() {
        let registry = InMemoryRegistry::new();
        registry.bind("ms1", Marker::new("first")).await.unwrap();

        for _ in 0..3 {
            let err = registry.bind("ms1", Marker::new("second")).await.unwrap_err();
            assert!(matches!(err, Error::AlreadyBound(ref key) if key == "ms1"));
        }
        assert_eq!(registry.lookup("ms1").await.unwrap(), Some(Marker::new("first")));
    }

    #[tokio::test]
    async fn test_unbind_missing_is_noop() {
        let registry = InMemoryRegistry::new();
        registry.unbind("nothing").await.unwrap();

        registry.bind("ms1", Marker::new("m")).await.unwrap();
        registry.unbind("ms1").await.unwrap();
        assert!(registry.is_empty());

        // Freed keys can be bound again
        registry.bind("ms1", Marker::new("again")).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_announce_and_ensure_bound() {
        let registry = InMemoryRegistry::new();

        let key = announce(&registry, "managed-server1").await.unwrap();
        assert_eq!(key, "Boundmanaged-server1");
        assert!(is_announced(&registry, "managed-server1").await.unwrap());
        assert!(!is_announced(&registry, "managed-server2").await.unwrap());

        let first = ensure_bound(&registry, "domain1", Marker::new("d")).await.unwrap();
        let second = ensure_bound(&registry, "domain1", Marker::new("d")).await.unwrap();
        assert_eq!(first, BindOutcome::FreshlyBound);
        assert_eq!(second, BindOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_probe_leaves_no_keys() {
        let registry = InMemoryRegistry::new();
        probe(&registry).await.unwrap();
        probe(&registry).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_binds_on_one_key() {
        let registry = Arc::new(InMemoryRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.bind("contended", Marker::new(i.to_string())).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
