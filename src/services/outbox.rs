//! One-way "process outbox" trigger for the external reconciler.
//!
//! The reconciler itself lives elsewhere; this side only nudges it. A signal
//! carries no payload: the pending work is whatever sits in the `outbox`
//! table.

use tokio::sync::mpsc;
use tracing::debug;

pub trait OutboxSignal: Send + Sync {
    /// Fire and forget. Must not block.
    fn notify(&self);
}

#[derive(Clone)]
pub struct ChannelOutboxSignal {
    tx: mpsc::Sender<()>,
}

impl ChannelOutboxSignal {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl OutboxSignal for ChannelOutboxSignal {
    fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) => debug!("outbox signalled"),
            // a signal is already pending, the reconciler will see our work too
            Err(mpsc::error::TrySendError::Full(())) => debug!("outbox signal already pending"),
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!("outbox reconciler gone, signal dropped")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesces_when_full_and_survives_a_closed_receiver() {
        let (signal, mut rx) = ChannelOutboxSignal::new(1);
        signal.notify();
        signal.notify();
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());

        drop(rx);
        signal.notify();
    }
}
