//! Pub/sub messages and per-subscription sinks.

use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Kind of an inbound pub/sub message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `message` — published directly to a subscribed channel.
    Message,
    /// `pmessage` — matched by a subscribed pattern.
    PMessage,
    /// `smessage` — sharded pub/sub delivery.
    SMessage,
}

/// Whether a subscription is keyed by channel name or by pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// `SUBSCRIBE` / `UNSUBSCRIBE`.
    Channel,
    /// `PSUBSCRIBE` / `PUNSUBSCRIBE`.
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

/// A single pub/sub message delivered to a subscription sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// How the message was delivered.
    pub kind: MessageKind,
    /// Channel the message was published to.
    pub channel: Vec<u8>,
    /// The matching pattern, for `pmessage` deliveries.
    pub pattern: Option<Vec<u8>>,
    /// Message payload.
    pub payload: Vec<u8>,
}

/// Consumer end of a subscription sink.
///
/// Messages arrive lossless and in decode order. The stream ends when
/// the matching unsubscribe is acknowledged or the connection closes.
#[derive(Debug)]
pub struct MessageStream {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<Message>) -> MessageStream {
        MessageStream { receiver }
    }

    /// Waits for the next message. `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// Registry entry for one subscribed channel or pattern. A subscription
/// fans out to one sink per subscribe call; sinks whose consumer went
/// away are pruned on delivery.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) kind: SubscriptionKind,
    pub(crate) senders: Vec<mpsc::UnboundedSender<Message>>,
}

impl Subscription {
    pub(crate) fn new(kind: SubscriptionKind) -> Subscription {
        Subscription {
            kind,
            senders: Vec::new(),
        }
    }

    pub(crate) fn deliver(&mut self, message: Message) {
        self.senders
            .retain(|sender| sender.send(message.clone()).is_ok());
    }
}
