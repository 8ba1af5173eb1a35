use crate::error::Result;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;

/// A recognized fragment of user speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Continuous speech recognition that can be switched on and off.
///
/// `start` and `stop` are idempotent. Sources that cannot run on this host
/// report `is_supported() == false` and treat both as no-ops.
pub trait TranscriptionSource: Send + Sync {
    fn is_supported(&self) -> bool;

    fn is_listening(&self) -> bool;

    /// A supported source whose backend has since gone away. Stays set.
    fn has_failed(&self) -> bool {
        false
    }

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Every transcript emitted from now on. May be called more than once.
    fn transcripts(&self) -> BoxStream<'static, TranscriptEvent>;
}

/// Adapts a broadcast receiver into a transcript stream. Lagged events are
/// skipped and the stream ends when the sender is gone.
pub fn broadcast_stream(
    rx: broadcast::Receiver<TranscriptEvent>,
) -> BoxStream<'static, TranscriptEvent> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("transcript stream lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_stream_skips_lag_and_ends_on_close() {
        let (tx, rx) = broadcast::channel(2);
        let mut events = broadcast_stream(rx);

        tx.send(TranscriptEvent::interim("a")).unwrap();
        tx.send(TranscriptEvent::interim("b")).unwrap();
        tx.send(TranscriptEvent::final_text("c")).unwrap();
        drop(tx);

        let received: Vec<_> = events.by_ref().collect().await;
        assert_eq!(
            received,
            vec![TranscriptEvent::interim("b"), TranscriptEvent::final_text("c")]
        );
    }
}
