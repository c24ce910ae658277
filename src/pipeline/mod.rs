//! Bounded FIFO between the bus poller and the publisher.
//!
//! The producer waits at most [`ENQUEUE_TIMEOUT`] for a free slot, after that
//! the newest reading is dropped and counted. The consumer waits forever.

use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

use crate::models::Reading;

pub const QUEUE_CAPACITY: usize = 50;
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug, PartialEq)]
pub enum QueueFullError {
    #[error("Reading queue full, reading dropped")]
    Full(Reading),
    #[error("Reading queue closed, reading dropped")]
    Closed(Reading),
}

#[derive(Clone)]
pub struct ReadingProducer {
    sender: mpsc::Sender<Reading>,
    dropped: Arc<AtomicU64>,
}

pub struct ReadingConsumer {
    receiver: mpsc::Receiver<Reading>,
}

pub fn channel() -> (ReadingProducer, ReadingConsumer) {
    let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
    return (
        ReadingProducer { sender, dropped: Arc::new(AtomicU64::new(0)) },
        ReadingConsumer { receiver },
    );
}

impl ReadingProducer {
    pub async fn enqueue(&self, reading: Reading) -> Result<(), QueueFullError> {
        match self.sender.send_timeout(reading, ENQUEUE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(r)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Queue full, dropping reading of channel {}", r.channel);
                Err(QueueFullError::Full(r))
            }
            Err(SendTimeoutError::Closed(r)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Queue closed, dropping reading of channel {}", r.channel);
                Err(QueueFullError::Closed(r))
            }
        }
    }

    /// Number of readings lost since start
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ReadingConsumer {
    /// Blocks until a reading is available, `None` once every producer is gone
    pub async fn dequeue(&mut self) -> Option<Reading> {
        self.receiver.recv().await
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
