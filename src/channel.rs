//! Per-instance message pipe between the host realm and a worklet realm.
//!
//! A channel is a pair of endpoints with one FIFO queue per direction and a
//! shared open flag. Nothing but [`ChannelMessage`] values crosses it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel {0} is closed")]
pub struct ChannelClosedError(pub ChannelId);

/// One `(name, old, new)` entry of an attribute batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "(String, Option<String>, Option<String>)",
    into = "(String, Option<String>, Option<String>)"
)]
pub struct AttributeChange {
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl AttributeChange {
    pub fn new(name: impl Into<String>, old_value: Option<&str>, new_value: Option<&str>) -> Self {
        Self {
            name: name.into(),
            old_value: old_value.map(str::to_string),
            new_value: new_value.map(str::to_string),
        }
    }
}

impl From<(String, Option<String>, Option<String>)> for AttributeChange {
    fn from((name, old_value, new_value): (String, Option<String>, Option<String>)) -> Self {
        Self {
            name,
            old_value,
            new_value,
        }
    }
}

impl From<AttributeChange> for (String, Option<String>, Option<String>) {
    fn from(change: AttributeChange) -> Self {
        (change.name, change.old_value, change.new_value)
    }
}

/// Wire contract of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChannelMessage {
    AttrBatch { entries: Vec<AttributeChange> },
    Connect,
    Disconnect,
    /// Opaque payload; `serde_json::Value` stands in for a structured clone.
    UserMessage { payload: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AttrBatch,
    Connect,
    Disconnect,
    UserMessage,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AttrBatch => "attrBatch",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::UserMessage => "userMessage",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ChannelMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AttrBatch { .. } => MessageKind::AttrBatch,
            Self::Connect => MessageKind::Connect,
            Self::Disconnect => MessageKind::Disconnect,
            Self::UserMessage { .. } => MessageKind::UserMessage,
        }
    }
}

#[derive(Debug)]
struct ChannelShared {
    id: ChannelId,
    open: AtomicBool,
}

/// Sending half of an endpoint. Cloning it does not keep the channel open.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    shared: Arc<ChannelShared>,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelSender {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Queue a message for the peer. Never waits for delivery.
    pub fn send(&self, message: ChannelMessage) -> Result<(), ChannelClosedError> {
        if !self.is_open() {
            return Err(ChannelClosedError(self.id()));
        }
        self.tx.send(message).map_err(|_| {
            self.close();
            ChannelClosedError(self.id())
        })
    }

    pub fn close(&self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(channel = %self.shared.id, "channel closed");
        }
    }
}

/// Receiving half of an endpoint. Dropping it closes the channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    shared: Arc<ChannelShared>,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl ChannelReceiver {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        if !self.shared.open.load(Ordering::Acquire) {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Wait for the next message. Returns `None` once the channel is closed;
    /// messages still queued at that point are discarded.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        let message = self.rx.recv().await?;
        self.shared
            .open
            .load(Ordering::Acquire)
            .then_some(message)
    }

    pub fn into_stream(self) -> BoxStream<'static, ChannelMessage> {
        stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        })
        .boxed()
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        self.shared.open.store(false, Ordering::Release);
    }
}

/// One side of a channel.
#[derive(Debug)]
pub struct ChannelEndpoint {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl ChannelEndpoint {
    pub fn id(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub fn send(&self, message: ChannelMessage) -> Result<(), ChannelClosedError> {
        self.sender.send(message)
    }

    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        self.receiver.try_recv()
    }

    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Open a fresh channel, returning `(host_endpoint, realm_endpoint)`.
pub fn open() -> (ChannelEndpoint, ChannelEndpoint) {
    let shared = Arc::new(ChannelShared {
        id: ChannelId(Uuid::new_v4()),
        open: AtomicBool::new(true),
    });
    let (to_realm, from_host) = mpsc::unbounded_channel();
    let (to_host, from_realm) = mpsc::unbounded_channel();

    let host = ChannelEndpoint {
        sender: ChannelSender {
            shared: Arc::clone(&shared),
            tx: to_realm,
        },
        receiver: ChannelReceiver {
            shared: Arc::clone(&shared),
            rx: from_realm,
        },
    };
    let realm = ChannelEndpoint {
        sender: ChannelSender {
            shared: Arc::clone(&shared),
            tx: to_host,
        },
        receiver: ChannelReceiver {
            shared,
            rx: from_host,
        },
    };
    (host, realm)
}
