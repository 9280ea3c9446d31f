//! Channel: the contract every signaling transport implements, plus an in-process loopback pair.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::protocol::SignalingMessage;

/// Capacity of each channel's inbound message stream.
pub const MESSAGE_BUFFER: usize = 256;

/// Connection state reported by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// A signaling transport.
///
/// `connect` returns promptly; progress and failure are only visible on `state()`.
/// `send_message` is best effort and never fails: without a link it logs and drops.
/// `messages()` is at-least-once and may repeat a message.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn connect(&self);

    /// Idempotent; safe on a channel that never connected.
    async fn disconnect(&self);

    fn state(&self) -> watch::Receiver<ChannelState>;

    fn messages(&self) -> broadcast::Receiver<SignalingMessage>;

    async fn send_message(&self, msg: SignalingMessage);

    /// Send over every available path. Single-path channels just send.
    async fn broadcast_message(&self, msg: SignalingMessage) {
        self.send_message(msg).await;
    }
}

/// Producer side of a channel's state and message streams.
#[derive(Clone)]
pub struct ChannelEvents {
    state: Arc<watch::Sender<ChannelState>>,
    messages: broadcast::Sender<SignalingMessage>,
}

impl ChannelEvents {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            state: Arc::new(state),
            messages,
        }
    }

    /// Publish a new state. Returns false if it was already current.
    pub fn set_state(&self, next: ChannelState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub fn current(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Push an inbound message to every subscriber. Dropped if nobody listens.
    pub fn deliver(&self, msg: SignalingMessage) {
        let _ = self.messages.send(msg);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.messages.subscribe()
    }
}

impl Default for ChannelEvents {
    fn default() -> Self {
        Self::new()
    }
}

struct Endpoint {
    events: ChannelEvents,
    sent: Mutex<Vec<SignalingMessage>>,
}

/// In-process channel. `pair()` links two ends so that a message sent on one arrives on the
/// other while both are connected. Also records everything sent, for tests and demos.
pub struct LoopbackChannel {
    local: Arc<Endpoint>,
    remote: Weak<Endpoint>,
}

impl LoopbackChannel {
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Endpoint {
            events: ChannelEvents::new(),
            sent: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Endpoint {
            events: ChannelEvents::new(),
            sent: Mutex::new(Vec::new()),
        });
        (
            Self {
                local: a.clone(),
                remote: Arc::downgrade(&b),
            },
            Self {
                local: b,
                remote: Arc::downgrade(&a),
            },
        )
    }

    /// A channel with no far end: sends are recorded and go nowhere.
    pub fn unpaired() -> Self {
        Self {
            local: Arc::new(Endpoint {
                events: ChannelEvents::new(),
                sent: Mutex::new(Vec::new()),
            }),
            remote: Weak::new(),
        }
    }

    /// Force the reported state (simulates link changes).
    pub fn set_state(&self, state: ChannelState) {
        self.local.events.set_state(state);
    }

    /// Simulate an inbound message.
    pub fn inject(&self, msg: SignalingMessage) {
        self.local.events.deliver(msg);
    }

    /// Everything passed to `send_message` so far, including dropped messages.
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.local
            .sent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn connect(&self) {
        self.local.events.set_state(ChannelState::Connected);
    }

    async fn disconnect(&self) {
        if self.local.events.current() != ChannelState::Idle {
            self.local.events.set_state(ChannelState::Disconnected);
        }
    }

    fn state(&self) -> watch::Receiver<ChannelState> {
        self.local.events.subscribe_state()
    }

    fn messages(&self) -> broadcast::Receiver<SignalingMessage> {
        self.local.events.subscribe()
    }

    async fn send_message(&self, msg: SignalingMessage) {
        if let Ok(mut sent) = self.local.sent.lock() {
            sent.push(msg.clone());
        }
        if self.local.events.current() != ChannelState::Connected {
            debug!(kind = %msg.kind(), "loopback not connected, dropping");
            return;
        }
        match self.remote.upgrade() {
            Some(remote) if remote.events.current() == ChannelState::Connected => {
                remote.events.deliver(msg)
            }
            _ => debug!(kind = %msg.kind(), "no loopback peer, dropping"),
        }
    }
}
