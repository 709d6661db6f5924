//! Channels between pipeline stages.
//!
//! Parse/enrich workers publish normalized records; the store writer (or a
//! test harness) consumes them. Publishing never blocks; it fails only once
//! every consumer is gone, and the caller drops the record with a log line.

use crossbeam::channel::{unbounded, Receiver, RecvError, Sender};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PublishError {
    #[error("no consumer left for this pipeline stage: {0}")]
    Disconnected(String),
}

/// Sending half of a stage; clone one per producer thread.
pub struct EventPublisher<E>(Sender<E>);

/// Receiving half of a stage, owned by the downstream consumer.
pub struct EventConsumer<E>(Receiver<E>);

/// Creates the unbounded publisher/consumer pair for one pipeline stage.
pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (tx, rx) = unbounded();
    (EventPublisher(tx), EventConsumer(rx))
}

impl<E> EventPublisher<E> {
    pub fn publish(&self, event: E) -> Result<(), PublishError> {
        self.0
            .send(event)
            .map_err(|err| PublishError::Disconnected(err.to_string()))
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> EventConsumer<E> {
    /// Blocks for the next record; errors once every publisher is gone,
    /// which is the consumer thread's shutdown signal.
    pub fn recv(&self) -> Result<E, RecvError> {
        self.0.recv()
    }

    /// Takes whatever is queued without blocking.
    pub fn drain(&self) -> Vec<E> {
        self.0.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_flow_in_publish_order() {
        let (publisher, consumer) = pub_sub();
        publisher.publish(1).unwrap();
        publisher.clone().publish(2).unwrap();
        assert_eq!(consumer.drain(), vec![1, 2]);
        assert!(consumer.drain().is_empty());
    }

    #[test]
    fn publish_fails_once_the_consumer_is_dropped() {
        let (publisher, consumer) = pub_sub();
        drop(consumer);
        assert!(matches!(
            publisher.publish(1),
            Err(PublishError::Disconnected(_))
        ));
    }

    #[test]
    fn recv_ends_when_the_last_publisher_is_gone() {
        let (publisher, consumer) = pub_sub::<u8>();
        let clone = publisher.clone();
        drop(publisher);
        clone.publish(9).unwrap();
        drop(clone);
        assert_eq!(consumer.recv(), Ok(9));
        assert!(consumer.recv().is_err());
    }
}
