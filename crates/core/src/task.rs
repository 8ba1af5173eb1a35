use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A periodic callback running on its own task, with an explicit stop handle.
///
/// The loop ends when [`RepeatingTask::stop`] is called, when the handle is
/// dropped, or when the callback returns [`ControlFlow::Break`].
pub struct RepeatingTask {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn spawn<F>(first_tick: Instant, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first_tick, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    // Resolves on an explicit stop and when the handle is dropped.
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        if tick().is_break() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Stops the loop and waits until the callback can no longer run.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            if e.is_panic() {
                tracing::warn!("repeating task panicked: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
