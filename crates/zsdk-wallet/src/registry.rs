//! Single active synchronizer per wallet identity
//!
//! The registry is an explicit object owned by the composition root. A
//! claim either waits for a predecessor that is shutting down or fails with
//! [`Error::AlreadyActive`]; it never shares an identity between two live
//! instances.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use zsdk_params::NetworkType;

/// A wallet identity: network plus alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SynchronizerIdentity {
    /// Network
    pub network: NetworkType,
    /// Alias, validated by [`crate::config::validate_alias`]
    pub alias: String,
}

impl SynchronizerIdentity {
    /// Identity for `alias` on `network`; fails on an invalid alias
    pub fn new(network: NetworkType, alias: &str) -> Result<Self> {
        crate::config::validate_alias(alias)?;
        Ok(Self {
            network,
            alias: alias.to_string(),
        })
    }
}

impl fmt::Display for SynchronizerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.alias)
    }
}

/// Public view of a registered identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// An instance is running
    Active,
    /// An instance is closing; new claims wait for it
    ShuttingDown,
}

enum InstanceState {
    Active,
    ShuttingDown(watch::Receiver<bool>),
}

type Instances = Arc<Mutex<HashMap<SynchronizerIdentity, InstanceState>>>;

/// Tracks which identities have a live synchronizer
#[derive(Clone, Default)]
pub struct SynchronizerRegistry {
    instances: Instances,
}

impl SynchronizerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `identity`.
    ///
    /// Waits while a previous instance is shutting down, then claims
    /// atomically. Fails with [`Error::AlreadyActive`] if an instance is
    /// running.
    pub async fn claim(&self, identity: SynchronizerIdentity) -> Result<InstanceLease> {
        loop {
            let mut waiter = {
                let mut instances = self.instances.lock();
                match instances.get(&identity) {
                    None => {
                        instances.insert(identity.clone(), InstanceState::Active);
                        info!(event = "identity_claimed", identity = %identity, "Claimed synchronizer identity");
                        let (done, _) = watch::channel(false);
                        return Ok(InstanceLease {
                            instances: Arc::clone(&self.instances),
                            identity,
                            done,
                            released: false,
                        });
                    }
                    Some(InstanceState::Active) => {
                        return Err(Error::AlreadyActive {
                            network: identity.network,
                            alias: identity.alias.clone(),
                        });
                    }
                    Some(InstanceState::ShuttingDown(rx)) => rx.clone(),
                }
            };

            debug!("Waiting for {} to finish shutting down", identity);
            // A dropped sender also means the entry is gone; re-check either way.
            let _ = waiter.wait_for(|done| *done).await;
        }
    }

    /// Current status of `identity`, if registered
    pub fn status(&self, identity: &SynchronizerIdentity) -> Option<InstanceStatus> {
        self.instances
            .lock()
            .get(identity)
            .map(|state| match state {
                InstanceState::Active => InstanceStatus::Active,
                InstanceState::ShuttingDown(_) => InstanceStatus::ShuttingDown,
            })
    }

    /// Whether `identity` is registered in any state
    pub fn is_registered(&self, identity: &SynchronizerIdentity) -> bool {
        self.instances.lock().contains_key(identity)
    }

    /// Number of registered identities
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// Whether no identity is registered
    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}

impl fmt::Debug for SynchronizerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizerRegistry")
            .field("registered", &self.len())
            .finish()
    }
}

/// Proof of a claimed identity. Released on [`InstanceLease::release`] or drop.
pub struct InstanceLease {
    instances: Instances,
    identity: SynchronizerIdentity,
    done: watch::Sender<bool>,
    released: bool,
}

impl InstanceLease {
    /// The claimed identity
    pub fn identity(&self) -> &SynchronizerIdentity {
        &self.identity
    }

    /// Mark the instance as shutting down; new claims wait instead of failing
    pub fn begin_shutdown(&self) {
        let mut instances = self.instances.lock();
        if let Some(state) = instances.get_mut(&self.identity) {
            *state = InstanceState::ShuttingDown(self.done.subscribe());
        }
    }

    /// Free the identity and wake any waiting claim
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.instances.lock().remove(&self.identity);
        self.done.send_replace(true);
        info!(event = "identity_released", identity = %self.identity, "Released synchronizer identity");
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLease")
            .field("identity", &self.identity)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(alias: &str) -> SynchronizerIdentity {
        SynchronizerIdentity::new(NetworkType::Testnet, alias).unwrap()
    }

    #[tokio::test]
    async fn test_second_claim_fails_while_active() {
        let registry = SynchronizerRegistry::new();
        let lease = registry.claim(identity("alias1")).await.unwrap();

        let err = registry.claim(identity("alias1")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyActive { .. }));

        lease.release();
        assert!(registry.claim(identity("alias1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let registry = SynchronizerRegistry::new();
        let _a = registry.claim(identity("alias1")).await.unwrap();
        let _b = registry.claim(identity("alias2")).await.unwrap();
        let _c = registry
            .claim(SynchronizerIdentity::new(NetworkType::Mainnet, "alias1").unwrap())
            .await
            .unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_drop_releases_identity() {
        let registry = SynchronizerRegistry::new();
        {
            let _lease = registry.claim(identity("alias1")).await.unwrap();
            assert_eq!(registry.status(&identity("alias1")), Some(InstanceStatus::Active));
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_waits_for_shutdown() {
        let registry = SynchronizerRegistry::new();
        let lease = registry.claim(identity("alias1")).await.unwrap();
        lease.begin_shutdown();
        assert_eq!(
            registry.status(&identity("alias1")),
            Some(InstanceStatus::ShuttingDown)
        );

        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.claim(identity("alias1")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        lease.release();
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second.identity(), &identity("alias1"));
        assert_eq!(registry.status(&identity("alias1")), Some(InstanceStatus::Active));
    }
}
