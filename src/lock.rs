// src/lock.rs

//! Cluster-wide advisory locking (C2, §4.2): `SET key 1 NX EX 10`, renewed
//! every 5 seconds by a background task. Releasing deletes the key and
//! stops the renewal task. Re-acquiring the same identifier from this
//! process is rejected; holding two different locks is fine.

use crate::error::{MirrorbitsError, Result};
use crate::store::Store;
use dashmap::DashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const LOCK_TTL: Duration = Duration::from_secs(10);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Process-wide registry of identifiers currently held by this process, so
/// a second `acquire` for the same identifier is rejected locally before
/// even touching the store.
#[derive(Clone)]
pub struct ClusterLock {
    store: Store,
    held_locally: Arc<DashSet<String>>,
}

/// A held lock. Dropping it does not release the lock — call
/// [`LockHandle::release`] explicitly, or the lock will simply expire after
/// its TTL once the renewal task is gone.
pub struct LockHandle {
    key: String,
    store: Store,
    held_locally: Arc<DashSet<String>>,
    valid: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl LockHandle {
    /// Whether the background renewal task still believes this lock is
    /// held. Becomes `false` once a renewal attempt observes the key is
    /// missing or the store returns an error.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.held_locally.remove(&self.key);
        self.store.del(&self.key).await
    }
}

impl ClusterLock {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            held_locally: Arc::new(DashSet::new()),
        }
    }

    /// Attempts to acquire the cluster-wide lock identified by `key`.
    /// `identifier` is the caller's logical identity; re-acquiring the same
    /// identifier for the same key from this process returns
    /// [`MirrorbitsError::PreconditionFailed`].
    pub async fn acquire(&self, key: &str, identifier: &str) -> Result<LockHandle> {
        let local_token = format!("{key}:{identifier}");
        if !self.held_locally.insert(local_token.clone()) {
            return Err(MirrorbitsError::PreconditionFailed(format!(
                "identifier '{identifier}' already holds lock '{key}' in this process"
            )));
        }

        let acquired = self
            .store
            .set_nx_ex(key, identifier, LOCK_TTL.as_secs())
            .await;
        let acquired = match acquired {
            Ok(v) => v,
            Err(e) => {
                self.held_locally.remove(&local_token);
                return Err(e);
            }
        };

        if !acquired {
            self.held_locally.remove(&local_token);
            return Err(MirrorbitsError::ScanInProgress);
        }

        let valid = Arc::new(AtomicBool::new(true));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let renew_store = self.store.clone();
        let renew_key = key.to_string();
        let renew_valid = valid.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RENEW_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it.
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!(key = %renew_key, "lock renewal task stopped on release");
                        return;
                    }
                    _ = ticker.tick() => {
                        match renew_store.expire(&renew_key, LOCK_TTL.as_secs()).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(key = %renew_key, "lock key vanished during renewal");
                                renew_valid.store(false, Ordering::SeqCst);
                                return;
                            }
                            Err(e) => {
                                error!(key = %renew_key, error = %e, "lock renewal failed");
                                renew_valid.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
            }
        });

        info!(key, identifier, "cluster lock acquired");
        Ok(LockHandle {
            key: key.to_string(),
            store: self.store.clone(),
            held_locally: self.held_locally.clone(),
            valid,
            stop_tx: Some(stop_tx),
        })
    }
}
