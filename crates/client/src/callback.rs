//! Callback adapters over the async API
//!
//! For callers that prefer success/error callbacks to awaiting futures, and
//! listener closures to broadcast receivers.

use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::StudyResult;

/// Drive `operation` on a task and hand its result to `done`.
pub fn with_callback<T, F, C>(operation: F, done: C) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = StudyResult<T>> + Send + 'static,
    C: FnOnce(StudyResult<T>) + Send + 'static,
{
    tokio::spawn(async move { done(operation.await) })
}

/// Split form with separate success and error callbacks.
pub fn with_callbacks<T, F, S, E>(operation: F, on_success: S, on_error: E) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = StudyResult<T>> + Send + 'static,
    S: FnOnce(T) + Send + 'static,
    E: FnOnce(crate::error::StudyError) + Send + 'static,
{
    with_callback(operation, move |result| match result {
        Ok(value) => on_success(value),
        Err(err) => on_error(err),
    })
}

/// Call `listener` for every event until the sender goes away.
pub fn spawn_listener<E, L>(mut events: broadcast::Receiver<E>, mut listener: L) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    L: FnMut(E) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => listener(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "callback",
                        event = "callback.listener.lagged",
                        skipped,
                        "Listener fell behind, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StudyError;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn callbacks_receive_the_result() {
        let (tx, rx) = oneshot::channel();
        with_callbacks(
            async { Err::<(), _>(StudyError::NotInitialized) },
            |_| panic!("unexpected success"),
            move |err| {
                let _ = tx.send(err);
            },
        )
        .await
        .expect("callback task");
        assert_eq!(rx.await.expect("error delivered"), StudyError::NotInitialized);
    }

    #[tokio::test]
    async fn listener_sees_events_until_close() {
        let (tx, rx) = broadcast::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let task = spawn_listener(rx, move |n: u32| sink.lock().expect("seen lock").push(n));

        tx.send(1).expect("send");
        tx.send(2).expect("send");
        drop(tx);
        task.await.expect("listener task");

        assert_eq!(*seen.lock().expect("seen lock"), vec![1, 2]);
    }
}
