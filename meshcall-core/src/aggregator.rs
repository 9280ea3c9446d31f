//! Transport aggregator: several prioritized channels presented as one, with failover.
//!
//! An actor task owns the candidate list and the recorded state of each candidate. Every
//! candidate gets its own observer task that forwards state changes to the actor and re-emits
//! inbound messages on the aggregator's stream. Sends ask the actor for recipients and run on the
//! caller's task, so a slow transport never stalls routing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvents, ChannelState};
use crate::protocol::SignalingMessage;

const CHANGE_BUFFER: usize = 16;

/// Transport class. Lower ordinal is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportPriority {
    Lan,
    WifiDirect,
    Ble,
    Cloud,
}

impl TransportPriority {
    /// Suggested media bitrate ceiling for this class, in kbps.
    pub fn bitrate_hint_kbps(self) -> u32 {
        match self {
            TransportPriority::Lan => 5000,
            TransportPriority::WifiDirect => 4000,
            TransportPriority::Ble => 200,
            TransportPriority::Cloud => 1500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportPriority::Lan => "lan",
            TransportPriority::WifiDirect => "wifi-direct",
            TransportPriority::Ble => "ble",
            TransportPriority::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for TransportPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fired when the best transport changes to a connected candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportChanged {
    pub previous: Option<TransportPriority>,
    pub current: TransportPriority,
    pub bitrate_hint_kbps: u32,
}

struct TransportCandidate {
    priority: TransportPriority,
    channel: Arc<dyn Channel>,
    state: ChannelState,
    observer: JoinHandle<()>,
}

enum Route {
    Best,
    AllConnected,
    Everyone,
}

enum Command {
    Add {
        priority: TransportPriority,
        channel: Arc<dyn Channel>,
    },
    StateChanged {
        index: usize,
        state: ChannelState,
    },
    Recipients {
        route: Route,
        reply: oneshot::Sender<Vec<Arc<dyn Channel>>>,
    },
}

/// Prioritized multi-transport `Channel`.
pub struct TransportAggregator {
    commands: mpsc::UnboundedSender<Command>,
    events: ChannelEvents,
    best: watch::Receiver<Option<TransportPriority>>,
    changes: broadcast::Sender<TransportChanged>,
    actor: JoinHandle<()>,
}

impl TransportAggregator {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let events = ChannelEvents::new();
        let (best_tx, best) = watch::channel(None);
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let actor = AggregatorActor {
            candidates: Vec::new(),
            best: None,
            best_tx,
            changes: changes.clone(),
            events: events.clone(),
            commands: commands.clone(),
        };
        let actor = tokio::spawn(actor.run(inbox));
        Self {
            commands,
            events,
            best,
            changes,
            actor,
        }
    }

    /// Start observing `channel` right away. Candidates are never removed or re-prioritized.
    pub fn add_transport(&self, priority: TransportPriority, channel: Arc<dyn Channel>) {
        if self.commands.send(Command::Add { priority, channel }).is_err() {
            warn!(%priority, "aggregator stopped, transport not added");
        }
    }

    /// Currently selected transport class, if any candidate is connected.
    pub fn best_transport(&self) -> watch::Receiver<Option<TransportPriority>> {
        self.best.clone()
    }

    pub fn transport_changes(&self) -> broadcast::Receiver<TransportChanged> {
        self.changes.subscribe()
    }

    async fn recipients(&self, route: Route) -> Vec<Arc<dyn Channel>> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Recipients { route, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

impl Default for TransportAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransportAggregator {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

#[async_trait]
impl Channel for TransportAggregator {
    async fn connect(&self) {
        for channel in self.recipients(Route::Everyone).await {
            channel.connect().await;
        }
    }

    async fn disconnect(&self) {
        for channel in self.recipients(Route::Everyone).await {
            channel.disconnect().await;
        }
    }

    fn state(&self) -> watch::Receiver<ChannelState> {
        self.events.subscribe_state()
    }

    fn messages(&self) -> broadcast::Receiver<SignalingMessage> {
        self.events.subscribe()
    }

    /// Sends on the best transport. During a gap with no best transport, sends on every
    /// connected candidate; with none connected the message is dropped.
    async fn send_message(&self, msg: SignalingMessage) {
        let targets = self.recipients(Route::Best).await;
        if targets.is_empty() {
            debug!(kind = %msg.kind(), "no connected transport, dropping");
            return;
        }
        for channel in targets {
            channel.send_message(msg.clone()).await;
        }
    }

    async fn broadcast_message(&self, msg: SignalingMessage) {
        let targets = self.recipients(Route::AllConnected).await;
        if targets.is_empty() {
            debug!(kind = %msg.kind(), "no connected transport, dropping broadcast");
            return;
        }
        for channel in targets {
            channel.send_message(msg.clone()).await;
        }
    }
}

struct AggregatorActor {
    candidates: Vec<TransportCandidate>,
    /// Index of the best candidate.
    best: Option<usize>,
    best_tx: watch::Sender<Option<TransportPriority>>,
    changes: broadcast::Sender<TransportChanged>,
    events: ChannelEvents,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for AggregatorActor {
    fn drop(&mut self) {
        for candidate in &self.candidates {
            candidate.observer.abort();
        }
    }
}

impl AggregatorActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            match command {
                Command::Add { priority, channel } => self.add(priority, channel),
                Command::StateChanged { index, state } => {
                    if let Some(candidate) = self.candidates.get_mut(index) {
                        debug!(transport = %candidate.priority, ?state, "transport state");
                        candidate.state = state;
                        self.evaluate();
                    }
                }
                Command::Recipients { route, reply } => {
                    let _ = reply.send(self.route(route));
                }
            }
        }
    }

    fn add(&mut self, priority: TransportPriority, channel: Arc<dyn Channel>) {
        let index = self.candidates.len();
        let mut state_rx = channel.state();
        let state = *state_rx.borrow_and_update();
        let observer = tokio::spawn(observe(
            index,
            state_rx,
            channel.messages(),
            self.commands.clone(),
            self.events.clone(),
        ));
        info!(%priority, ?state, "transport added");
        self.candidates.push(TransportCandidate {
            priority,
            channel,
            state,
            observer,
        });
        self.evaluate();
    }

    fn evaluate(&mut self) {
        let best = self
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state == ChannelState::Connected)
            .min_by_key(|(_, c)| c.priority)
            .map(|(i, _)| i);

        if best != self.best {
            let previous = self.best.map(|i| self.candidates[i].priority);
            self.best = best;
            let current = best.map(|i| self.candidates[i].priority);
            self.best_tx.send_replace(current);
            match current {
                Some(current) => {
                    info!(?previous, %current, "best transport changed");
                    let _ = self.changes.send(TransportChanged {
                        previous,
                        current,
                        bitrate_hint_kbps: current.bitrate_hint_kbps(),
                    });
                }
                None => info!(?previous, "no connected transport"),
            }
        }

        let any = |want: ChannelState| self.candidates.iter().any(|c| c.state == want);
        let aggregate = if any(ChannelState::Connected) {
            ChannelState::Connected
        } else if any(ChannelState::Connecting) {
            ChannelState::Connecting
        } else {
            ChannelState::Idle
        };
        self.events.set_state(aggregate);
    }

    fn route(&self, route: Route) -> Vec<Arc<dyn Channel>> {
        let live_connected = |c: &&TransportCandidate| *c.channel.state().borrow() == ChannelState::Connected;
        match route {
            Route::Best => match self.best {
                Some(i) => vec![self.candidates[i].channel.clone()],
                None => self
                    .candidates
                    .iter()
                    .filter(live_connected)
                    .map(|c| c.channel.clone())
                    .collect(),
            },
            Route::AllConnected => self
                .candidates
                .iter()
                .filter(live_connected)
                .map(|c| c.channel.clone())
                .collect(),
            Route::Everyone => self.candidates.iter().map(|c| c.channel.clone()).collect(),
        }
    }
}

/// One task per candidate: state changes go to the actor, messages straight to subscribers.
async fn observe(
    index: usize,
    mut state: watch::Receiver<ChannelState>,
    mut messages: broadcast::Receiver<SignalingMessage>,
    commands: mpsc::UnboundedSender<Command>,
    events: ChannelEvents,
) {
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *state.borrow_and_update();
                if commands.send(Command::StateChanged { index, state: next }).is_err() {
                    break;
                }
            }
            msg = messages.recv() => match msg {
                Ok(msg) => events.deliver(msg),
                Err(RecvError::Lagged(n)) => warn!(index, skipped = n, "transport messages lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
