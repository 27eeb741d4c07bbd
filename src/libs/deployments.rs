//! The single flight guard around ARM deployments
//!
//! At most one deployment may be in flight per process. The guard also
//! remembers the pool size vector the last deployment was meant to produce,
//! which suppresses double requests while freshly deployed nodes are still
//! registering with the cluster.

use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{event, Level};

use super::errors::Error;

/// The guarded deployment state
#[derive(Debug, Default)]
struct DeployState {
    /// The pool size vector the current/last deployment targets
    requested_pool_sizes: Option<BTreeMap<String, u64>>,
    /// Whether a deployment is currently in flight
    in_flight: bool,
}

/// Serializes ARM deployments and tracks the requested pool sizes
#[derive(Debug, Default)]
pub struct Deployments {
    /// The deployment state shared with the scale in workers
    inner: Mutex<DeployState>,
}

impl Deployments {
    /// Create a new deployment guard
    pub fn new() -> Self {
        Deployments::default()
    }

    /// Submit a deployment unless one is in flight or nothing changed
    ///
    /// The deployment future is started and awaited to completion while the
    /// in flight flag is held, so concurrent submitters only ever observe a
    /// busy guard and back off to the next tick.
    ///
    /// # Arguments
    ///
    /// * `deploy` - The closure starting the deployment
    /// * `new_sizes` - The pool size vector this deployment produces
    pub async fn submit<F, Fut>(
        &self,
        deploy: F,
        new_sizes: BTreeMap<String, u64>,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        {
            let mut state = self.inner.lock().await;
            if state.in_flight {
                event!(Level::INFO, "another deployment is already in progress");
                return Ok(());
            }
            // a new node may have registered between ticks making the scaler
            // briefly re-request the sizes it already asked for
            if state.requested_pool_sizes.as_ref() == Some(&new_sizes) {
                event!(Level::INFO, "requested pool sizes unchanged, skipping");
                return Ok(());
            }
            state.requested_pool_sizes = Some(new_sizes);
            state.in_flight = true;
        }
        // run the deployment to completion without holding the lock
        let result = deploy().await;
        {
            let mut state = self.inner.lock().await;
            state.in_flight = false;
        }
        match result {
            Ok(()) => {
                event!(Level::INFO, "deployment finished");
                Ok(())
            }
            Err(error) => {
                event!(Level::ERROR, error = %error, "deployment failed");
                Err(error)
            }
        }
    }

    /// Record a scale in decision so a concurrent scale up sees the target
    ///
    /// Starts from the last requested vector when one exists so parallel
    /// deletions in the same pool compound instead of overwriting each
    /// other.
    ///
    /// # Arguments
    ///
    /// * `actual` - The observed size of every pool
    /// * `pool` - The pool a node is being deleted from
    pub async fn record_scale_in(&self, actual: BTreeMap<String, u64>, pool: &str) {
        let mut state = self.inner.lock().await;
        let mut sizes = state.requested_pool_sizes.take().unwrap_or(actual);
        if let Some(size) = sizes.get_mut(pool) {
            *size = size.saturating_sub(1);
        }
        state.requested_pool_sizes = Some(sizes);
    }

    /// Get the currently requested pool sizes
    pub async fn requested_pool_sizes(&self) -> Option<BTreeMap<String, u64>> {
        self.inner.lock().await.requested_pool_sizes.clone()
    }
}
