//! Per-transport supervisor for the encoder and decoder workers.
//!
//! Mirrors the state machine and message set the spec describes for the OS-thread version,
//! but workers are `tokio` tasks cancelled cooperatively through a [CancelSignal] rather than
//! OS-level thread cancellation — the task-based rewrite the design notes call for directly.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex, Notify};

/// Lifecycle state of one worker (encoder or decoder), reported by the worker itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    None,
    Starting,
    Running,
    Stopping,
}

/// Handed to a worker's async body so it can report its own state transitions; only the thread
/// manager ever requests cancellation, but only the worker ever reports "running"/"stopping".
#[derive(Clone)]
pub struct WorkerHandle {
    state: Arc<Mutex<WorkerState>>,
    notify: Arc<Notify>,
    cancel: watch::Receiver<bool>,
}

impl WorkerHandle {
    pub async fn mark_running(&self) {
        *self.state.lock().await = WorkerState::Running;
        self.notify.notify_waiters();
    }

    /// Resolves once the manager has requested cancellation; workers `select!` on this beside
    /// their BT socket/FIFO polls, exactly like the spec's notification-pipe cancellation point.
    pub async fn cancelled(&mut self) {
        let _ = self.cancel.changed().await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

struct Worker {
    state: Arc<Mutex<WorkerState>>,
    notify: Arc<Notify>,
    cancel_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Worker {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WorkerState::None)),
            notify: Arc::new(Notify::new()),
            cancel_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    async fn state(&self) -> WorkerState {
        *self.state.lock().await
    }

    async fn start<F, Fut>(&self, body: F)
    where
        F: FnOnce(WorkerHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !matches!(self.state().await, WorkerState::None) {
            return; // idempotent: already starting/running
        }
        *self.state.lock().await = WorkerState::Starting;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let worker_handle = WorkerHandle { state: self.state.clone(), notify: self.notify.clone(), cancel: cancel_rx };
        *self.cancel_tx.lock().await = Some(cancel_tx);
        let state = self.state.clone();
        let notify = self.notify.clone();
        let join = tokio::spawn(async move {
            body(worker_handle).await;
            *state.lock().await = WorkerState::None;
            notify.notify_waiters();
        });
        *self.handle.lock().await = Some(join);
    }

    async fn stop(&self) {
        if let Some(tx) = self.cancel_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        if matches!(self.state().await, WorkerState::Starting | WorkerState::Running) {
            *self.state.lock().await = WorkerState::Stopping;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Supervises a transport's encoder and decoder workers: starts both idempotently, stops both
/// (unconditionally or only when no PCM client is active), and coalesces keep-alive timing.
pub struct ThreadManager {
    encoder: Worker,
    decoder: Worker,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        Self { encoder: Worker::new(), decoder: Worker::new() }
    }

    /// Starts the encoder worker if it is not already starting/running.
    pub async fn start_encoder<F, Fut>(&self, body: F)
    where
        F: FnOnce(WorkerHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.encoder.start(body).await;
    }

    /// Starts the decoder worker if it is not already starting/running.
    pub async fn start_decoder<F, Fut>(&self, body: F)
    where
        F: FnOnce(WorkerHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.decoder.start(body).await;
    }

    /// Unconditionally cancels both workers and waits for them to finish.
    pub async fn stop(&self) {
        tokio::join!(self.encoder.stop(), self.decoder.stop());
    }

    /// Cancels both workers only if `has_clients` reports `false`, after waiting out
    /// `keep_alive` to coalesce rapid open/close churn into a single acquire, per §4.2.
    pub async fn stop_if_no_clients(&self, keep_alive: Duration, has_clients: impl Fn() -> bool) {
        tokio::time::sleep(keep_alive).await;
        if !has_clients() {
            self.stop().await;
        }
    }

    pub async fn encoder_state(&self) -> WorkerState {
        self.encoder.state().await
    }

    pub async fn decoder_state(&self) -> WorkerState {
        self.decoder.state().await
    }
}

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let manager = ThreadManager::new();
        manager
            .start_encoder(|mut h| async move {
                h.mark_running().await;
                h.cancelled().await;
            })
            .await;
        assert_eq!(manager.encoder_state().await, WorkerState::Starting);
        // A second start call while already starting/running must be a no-op, not a double-spawn.
        manager.start_encoder(|mut h| async move { h.cancelled().await }).await;
        manager.stop().await;
        assert_eq!(manager.encoder_state().await, WorkerState::None);
    }

    #[tokio::test]
    async fn stop_waits_for_worker_to_observe_cancellation() {
        let manager = ThreadManager::new();
        manager
            .start_decoder(|mut h| async move {
                h.mark_running().await;
                h.cancelled().await;
            })
            .await;
        manager.stop().await;
        assert_eq!(manager.decoder_state().await, WorkerState::None);
    }

    #[tokio::test]
    async fn keep_alive_cancels_only_when_no_clients_remain() {
        let manager = ThreadManager::new();
        manager
            .start_encoder(|mut h| async move {
                h.mark_running().await;
                h.cancelled().await;
            })
            .await;
        manager.stop_if_no_clients(Duration::from_millis(1), || false).await;
        assert_eq!(manager.encoder_state().await, WorkerState::None);
    }
}
