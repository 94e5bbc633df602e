//! One-shot reads on top of subscriptions.

use crate::error::EngineError;
use crate::live::callback::{Callback, Source};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// First value delivered by `start`.
pub async fn once<T>(start: Source<T>) -> Result<T, EngineError>
where
    T: Send + 'static,
{
    once_matching(start, |_: &T| true).await
}

/// First delivered value satisfying `predicate`; the subscription is torn down
/// before returning.
pub async fn once_matching<T, P>(start: Source<T>, predicate: P) -> Result<T, EngineError>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(tx)));
    let callback = Callback::sync(move |value: T| {
        if predicate(&value) {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(value);
            }
        }
    });

    let forget = start(callback).await?;
    let value = rx.await;
    forget.forget().await;
    value.map_err(|_| EngineError::Cancelled("subscription ended before delivering a value".to_string()))
}
