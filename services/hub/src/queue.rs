//! Queue consumer (C4): the hub's programming-against-an-interface seam for
//! the external work queue. The trait in this module is what `§1`/`§6`
//! describe as out of scope — this crate defines the contract and ships one
//! concrete, dependency-free adapter over a `tokio::sync::mpsc` channel,
//! suitable for embedding the hub in a single process and for the
//! integration tests in `tests/`. Wiring a real broker (a Redis stream, a
//! message broker client) means implementing `QueueConsumer` against it.

use std::sync::Arc;

use hub_protocol::QueueMessage;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::hub::Hub;

/// What the consumer calls back into for each delivered message: `ack`
/// drops it permanently, `reject` asks the backend to retry (or not).
#[async_trait::async_trait]
pub trait QueueConsumer: Send + Sync {
    async fn ack(&self, msg: &QueueMessage);
    async fn reject(&self, msg: &QueueMessage, retryable: bool);
}

/// Runs the consumer loop: for each delivered message, calls
/// `hub.broadcast`, then `ack`s it; if broadcast fails, reports to the
/// error sink and `reject`s with `retryable = true`. Malformed payloads
/// never reach this loop — the transport adapter that decodes raw bytes
/// into `QueueMessage` acks and drops them before they arrive here, since
/// they can never be processed (see `MpscChannelQueue` below for that
/// boundary in the reference adapter).
pub async fn run_consumer_loop(
    hub: Arc<Hub>,
    consumer: Arc<dyn QueueConsumer>,
    mut messages: mpsc::Receiver<QueueMessage>,
    on_error: impl Fn(&QueueMessage, &str) + Send + 'static,
) {
    while let Some(msg) = messages.recv().await {
        match hub.broadcast(msg.payload.clone()).await {
            Ok(()) => consumer.ack(&msg).await,
            Err(err) => {
                on_error(&msg, &err.to_string());
                error!(error = %err, "broadcast failed, rejecting message for retry");
                consumer.reject(&msg, true).await;
            }
        }
    }
    warn!("queue consumer loop exiting: channel closed");
}

/// Reference `QueueConsumer` + transport adapter over a bounded
/// `tokio::sync::mpsc` channel: dependency-free, suitable for embedding the
/// hub in a single process and for driving the integration test suite
/// without an external broker. `ack`/`reject` here are no-ops beyond
/// logging, since an in-process channel has no backend to acknowledge
/// against; a real adapter (e.g. a consumer-group-based stream client)
/// would re-claim or delete on the broker side instead.
pub struct MpscChannelQueue;

#[async_trait::async_trait]
impl QueueConsumer for MpscChannelQueue {
    async fn ack(&self, _msg: &QueueMessage) {}

    async fn reject(&self, msg: &QueueMessage, retryable: bool) {
        warn!(retryable, id = ?msg.id, "in-process channel queue cannot re-deliver a rejected message");
    }
}

/// Decodes raw JSON bytes into a `QueueMessage`, acking and dropping (not
/// reporting as a handler error) anything that fails to parse, per the
/// "queue malformed payload" row of the error taxonomy: it can never be
/// processed, so it is not retried.
pub fn decode_or_drop(raw: &str) -> Option<QueueMessage> {
    match serde_json::from_str::<QueueMessage>(raw) {
        Ok(msg) => Some(msg),
        Err(err) => {
            warn!(error = %err, "dropping malformed queue payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_protocol::{Envelope, MsgPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingConsumer {
        acked: AtomicUsize,
        rejected: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl QueueConsumer for CountingConsumer {
        async fn ack(&self, _msg: &QueueMessage) {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }

        async fn reject(&self, _msg: &QueueMessage, _retryable: bool) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample_message() -> QueueMessage {
        QueueMessage {
            id: Some("q-1".to_owned()),
            payload: Envelope::Msg {
                id: Uuid::new_v4(),
                size: 5,
                payload: MsgPayload { seq: 1, data: None },
            },
            raw: None,
        }
    }

    #[tokio::test]
    async fn successful_broadcast_acks_the_message() {
        let hub = crate::hub::test_support::empty_hub();
        let consumer = Arc::new(CountingConsumer { acked: AtomicUsize::new(0), rejected: AtomicUsize::new(0) });
        let (tx, rx) = mpsc::channel(4);
        tx.send(sample_message()).await.unwrap();
        drop(tx);
        run_consumer_loop(hub, consumer.clone(), rx, |_, _| {}).await;
        assert_eq!(consumer.acked.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.rejected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn decode_or_drop_returns_none_for_malformed_json() {
        assert!(decode_or_drop("not json").is_none());
    }

    #[test]
    fn decode_or_drop_parses_a_well_formed_queue_message() {
        let raw = serde_json::to_string(&sample_message()).unwrap();
        assert!(decode_or_drop(&raw).is_some());
    }
}
