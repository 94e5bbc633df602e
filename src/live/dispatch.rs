//! In-flight callback tracking
//!
//! Deliveries are fire-and-forget and may overlap. Each one runs as its own
//! task under a fresh token and leaves the set on completion; `drain` refuses
//! new deliveries and joins the outstanding ones.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::error;

#[derive(Default)]
struct InFlightState {
    next_token: u64,
    tasks: HashMap<u64, JoinHandle<()>>,
    closed: bool,
}

#[derive(Default)]
pub struct InFlight {
    state: Mutex<InFlightState>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `delivery` in the background. Returns false once draining has begun.
    pub fn dispatch(self: &Arc<Self>, delivery: BoxFuture<'static, ()>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let token = state.next_token;
        state.next_token += 1;

        let owner: Weak<InFlight> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(delivery).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(token, panic = %message, "Subscription callback panicked");
            }
            if let Some(owner) = owner.upgrade() {
                owner.state.lock().tasks.remove(&token);
            }
        });
        state.tasks.insert(token, handle);
        true
    }

    /// Stop accepting deliveries and wait for every outstanding one.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Subscription callback task failed");
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }
}
