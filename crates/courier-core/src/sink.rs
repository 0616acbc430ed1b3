//! Durable sink hand-off.
//!
//! Every routed message is forwarded to a [`MessageSink`] regardless of
//! whether any live connection received it. The forward is a non-blocking
//! hand-off; delivery and retry guarantees belong to whatever sits behind
//! the sink.
//!
//! [`QueueSink`] is the in-process stand-in for an external at-least-once
//! queue: a bounded channel drained by a [`QueueConsumer`] task that
//! processes messages in batches and acknowledges each one.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::RelayMessage;

/// Default number of messages the consumer takes per batch.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Failure to hand a message to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The sink cannot accept more messages right now
    #[error("sink is full")]
    Full,
    /// The sink's consumer has shut down
    #[error("sink is closed")]
    Closed,
}

/// Fire-and-forget destination for routed messages.
pub trait MessageSink: Send + Sync {
    /// Hand off a copy of `message`. Must not block.
    fn forward(&self, message: &RelayMessage) -> Result<(), SinkError>;
}

/// Bounded in-process queue feeding a [`QueueConsumer`].
#[derive(Debug, Clone)]
pub struct QueueSink {
    sender: mpsc::Sender<RelayMessage>,
}

impl QueueSink {
    /// Create a queue with the given capacity and the consumer that drains it.
    pub fn channel(capacity: usize) -> (Self, QueueConsumer) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self { sender },
            QueueConsumer {
                receiver,
                batch_size: DEFAULT_BATCH_SIZE,
            },
        )
    }
}

impl MessageSink for QueueSink {
    fn forward(&self, message: &RelayMessage) -> Result<(), SinkError> {
        self.sender.try_send(message.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Drains a [`QueueSink`] in batches.
#[derive(Debug)]
pub struct QueueConsumer {
    receiver: mpsc::Receiver<RelayMessage>,
    batch_size: usize,
}

impl QueueConsumer {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Process batches until `shutdown` fires or every producer is dropped.
    ///
    /// On shutdown, messages already buffered are still processed.
    /// Returns the number of messages acknowledged.
    pub async fn run(mut self, shutdown: CancellationToken) -> usize {
        info!(batch_size = self.batch_size, "Queue consumer started");
        let mut acked = 0;
        let mut batch = Vec::with_capacity(self.batch_size);

        loop {
            let received = tokio::select! {
                n = self.receiver.recv_many(&mut batch, self.batch_size) => n,
                _ = shutdown.cancelled() => {
                    self.receiver.close();
                    while let Ok(message) = self.receiver.try_recv() {
                        batch.push(message);
                    }
                    acked += process_batch(&mut batch);
                    break;
                }
            };

            if received == 0 {
                // All producers dropped and the buffer is empty.
                break;
            }
            acked += process_batch(&mut batch);
        }

        info!(acked, "Queue consumer stopped");
        acked
    }
}

fn process_batch(batch: &mut Vec<RelayMessage>) -> usize {
    if batch.is_empty() {
        return 0;
    }
    debug!(size = batch.len(), "Processing queue batch");
    let count = batch.len();
    for message in batch.drain(..) {
        info!(
            from = %message.from,
            to = %message.to,
            content_len = message.content.len(),
            "Message acknowledged"
        );
    }
    count
}
