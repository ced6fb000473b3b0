use crate::error::AppError;
use crate::pipeline::overlay::OverlayMessage;
use std::future::Future;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::broadcast;
use tower::Service;

pub const DEFAULT_CAPACITY: usize = 16;

/// Delivery of overlay messages to display clients. Must never block the caller.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, message: OverlayMessage);
}

/// Bounded fan-out over a tokio broadcast channel. Slow subscribers lag and
/// lose the oldest messages instead of stalling the producer.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    overlay_tx: broadcast::Sender<OverlayMessage>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<OverlayMessage>) {
        let (overlay_tx, overlay_rx) = broadcast::channel(capacity.max(1));
        (Self { overlay_tx }, overlay_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayMessage> {
        self.overlay_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.overlay_tx.receiver_count()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, message: OverlayMessage) {
        // No subscribers is not an error; the message is simply dropped.
        let _ = self.overlay_tx.send(message);
    }
}

impl Service<OverlayMessage> for ChannelBroadcaster {
    type Response = usize;
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: OverlayMessage) -> Self::Future {
        let delivered = self.overlay_tx.send(message).unwrap_or(0);
        Box::pin(async move { Ok(delivered) })
    }
}
