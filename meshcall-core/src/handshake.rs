//! Call handshake: turns signaling messages from one channel into an established media link.
//!
//! Each binding runs a single session task that owns the negotiation state and selects over
//! the channel's state and messages, the engine's state and local candidates, chat commands and
//! the recovery watchdog. Rebinding aborts the old task before the new one starts; the old
//! channel is disconnected only after the new one is bound.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelState};
use crate::config::HandshakeConfig;
use crate::identity::{self, EnvelopeError, Keypair, PublicKey, WireCryptoError};
use crate::media::{EngineState, MediaEngine, SdpKind};
use crate::protocol::{CallMode, IceCandidate, MessageKind, Signal, SignalingMessage};

const EVENT_BUFFER: usize = 64;

/// Progress of the call setup, in order, plus the `Reconnecting` and `Failed` side paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStage {
    Idle,
    InitializingHardware,
    StartingDiscovery,
    PeerFound,
    ExchangingSdpOffer,
    ExchangingSdpAnswer,
    GatheringIceCandidates,
    WaitingForRemoteVideo,
    LinkEstablished,
    Reconnecting,
    Failed,
}

impl HandshakeStage {
    pub fn is_pre_negotiation(self) -> bool {
        matches!(
            self,
            HandshakeStage::Idle
                | HandshakeStage::InitializingHardware
                | HandshakeStage::StartingDiscovery
                | HandshakeStage::PeerFound
        )
    }

    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            HandshakeStage::ExchangingSdpOffer
                | HandshakeStage::ExchangingSdpAnswer
                | HandshakeStage::GatheringIceCandidates
                | HandshakeStage::WaitingForRemoteVideo
        )
    }
}

/// Fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Joiner,
}

/// Things the surrounding application is told about besides stage changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    Chat { from: String, text: String },
    Failed { cause: String },
    ModeSelected(CallMode),
    PeerIdentified { sender_id: String },
    /// Host is re-offering after the watchdog fired.
    Handover,
}

enum SessionCommand {
    Chat(String),
}

struct Binding {
    channel: Arc<dyn Channel>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

struct Shared {
    role: Role,
    sender_id: String,
    keypair: Arc<Keypair>,
    engine: Arc<dyn MediaEngine>,
    config: HandshakeConfig,
    stage: watch::Sender<HandshakeStage>,
    events: broadcast::Sender<HandshakeEvent>,
}

impl Shared {
    fn set_stage(&self, next: HandshakeStage) {
        let changed = self.stage.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(role = ?self.role, stage = ?next, "handshake stage");
        }
    }

    fn stage(&self) -> HandshakeStage {
        *self.stage.borrow()
    }

    fn emit(&self, event: HandshakeEvent) {
        let _ = self.events.send(event);
    }

    fn engine_state(&self) -> EngineState {
        *self.engine.connection_state().borrow()
    }
}

/// Host or joiner side of a call.
pub struct CallHandshake {
    shared: Arc<Shared>,
    binding: Mutex<Option<Binding>>,
}

impl CallHandshake {
    pub fn new(
        role: Role,
        sender_id: impl Into<String>,
        keypair: Arc<Keypair>,
        engine: Arc<dyn MediaEngine>,
        config: HandshakeConfig,
    ) -> Self {
        let (stage, _) = watch::channel(HandshakeStage::Idle);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                role,
                sender_id: sender_id.into(),
                keypair,
                engine,
                config,
                stage,
                events,
            }),
            binding: Mutex::new(None),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn sender_id(&self) -> &str {
        &self.shared.sender_id
    }

    pub fn stage(&self) -> watch::Receiver<HandshakeStage> {
        self.shared.stage.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<HandshakeEvent> {
        self.shared.events.subscribe()
    }

    /// Bind to `channel`: initialize media, start the session task, connect. A previous
    /// binding is cancelled first and its channel disconnected last.
    pub async fn bind(&self, channel: Arc<dyn Channel>) {
        let previous = self.take_binding();
        if let Some(previous) = &previous {
            previous.task.abort();
        }

        let shared = self.shared.clone();
        let mode = if shared.config.video {
            CallMode::Video
        } else {
            CallMode::Voice
        };
        shared.set_stage(HandshakeStage::InitializingHardware);
        let initialized = shared.engine.initialize(mode.video_enabled()).await;

        let (commands, inbox) = mpsc::unbounded_channel();
        let streams = Streams {
            channel_state: channel.state(),
            messages: channel.messages(),
            engine_state: shared.engine.connection_state(),
            local_candidates: shared.engine.local_candidates(),
            commands: inbox,
        };
        let mut session = Session {
            shared: shared.clone(),
            channel: channel.clone(),
            mode,
            peer_key: None,
            offer_sent_at: None,
            last_join: None,
            watchdog: None,
        };
        match initialized {
            Ok(()) => shared.set_stage(HandshakeStage::StartingDiscovery),
            Err(e) => session.fail(format!("initializing media: {e}")),
        }
        let task = tokio::spawn(session.run(streams));
        if let Ok(mut binding) = self.binding.lock() {
            *binding = Some(Binding {
                channel: channel.clone(),
                commands,
                task,
            });
        }

        channel.connect().await;

        if let Some(previous) = previous {
            if !same_channel(&previous.channel, &channel) {
                previous.channel.disconnect().await;
            }
        }
    }

    /// Send a chat message to the peer over the bound channel.
    pub fn send_chat(&self, text: impl Into<String>) {
        let sent = self
            .binding
            .lock()
            .ok()
            .and_then(|b| b.as_ref().map(|b| b.commands.send(SessionCommand::Chat(text.into())).is_ok()));
        if sent != Some(true) {
            debug!("no bound channel, chat dropped");
        }
    }

    /// Hang up: BYE (best effort), disconnect, close media, back to `Idle`.
    pub async fn end_call(&self) {
        if let Some(binding) = self.take_binding() {
            binding.task.abort();
            binding
                .channel
                .send_message(SignalingMessage::new(self.shared.sender_id.clone(), Signal::Bye))
                .await;
            binding.channel.disconnect().await;
        }
        self.shared.engine.close().await;
        self.shared.set_stage(HandshakeStage::Idle);
        info!(role = ?self.shared.role, "call ended");
    }

    fn take_binding(&self) -> Option<Binding> {
        self.binding.lock().ok().and_then(|mut b| b.take())
    }
}

impl Drop for CallHandshake {
    fn drop(&mut self) {
        if let Some(binding) = self.take_binding() {
            binding.task.abort();
        }
    }
}

fn same_channel(a: &Arc<dyn Channel>, b: &Arc<dyn Channel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct Streams {
    channel_state: watch::Receiver<ChannelState>,
    messages: broadcast::Receiver<SignalingMessage>,
    engine_state: watch::Receiver<EngineState>,
    local_candidates: broadcast::Receiver<IceCandidate>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

struct Session {
    shared: Arc<Shared>,
    channel: Arc<dyn Channel>,
    mode: CallMode,
    peer_key: Option<PublicKey>,
    /// When the host last sent an offer; a JOIN within the grace period does not re-offer.
    offer_sent_at: Option<Instant>,
    last_join: Option<Instant>,
    watchdog: Option<Instant>,
}

async fn watchdog_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(mut self, mut streams: Streams) {
        if *streams.engine_state.borrow_and_update() == EngineState::Connected {
            self.on_engine_state(EngineState::Connected);
        }
        if *streams.channel_state.borrow_and_update() == ChannelState::Connected {
            self.on_channel_connected().await;
        }
        let mut engine_open = true;
        let mut candidates_open = true;
        loop {
            let deadline = self.watchdog;
            tokio::select! {
                changed = streams.channel_state.changed() => {
                    if changed.is_err() {
                        debug!("channel dropped, session ends");
                        break;
                    }
                    let state = *streams.channel_state.borrow_and_update();
                    self.on_channel_state(state).await;
                }
                msg = streams.messages.recv() => match msg {
                    Ok(msg) => self.on_message(msg).await,
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "signaling messages lagged"),
                    Err(RecvError::Closed) => break,
                },
                changed = streams.engine_state.changed(), if engine_open => {
                    if changed.is_err() {
                        engine_open = false;
                    } else {
                        let state = *streams.engine_state.borrow_and_update();
                        self.on_engine_state(state);
                    }
                }
                candidate = streams.local_candidates.recv(), if candidates_open => match candidate {
                    Ok(candidate) => self.send_or_fail(Signal::IceCandidate(candidate)).await,
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "local candidates lagged"),
                    Err(RecvError::Closed) => candidates_open = false,
                },
                Some(command) = streams.commands.recv() => match command {
                    SessionCommand::Chat(text) => self.send_or_fail(Signal::Chat { text }).await,
                },
                _ = watchdog_elapsed(deadline) => self.on_watchdog().await,
            }
        }
    }

    async fn on_channel_state(&mut self, state: ChannelState) {
        match state {
            ChannelState::Connected => self.on_channel_connected().await,
            ChannelState::Connecting | ChannelState::Disconnected | ChannelState::Error | ChannelState::Idle => {
                if self.shared.stage().is_negotiating() {
                    info!(?state, "signaling lost mid-negotiation");
                    self.shared.set_stage(HandshakeStage::Reconnecting);
                }
            }
        }
    }

    async fn on_channel_connected(&mut self) {
        let stage = self.shared.stage();
        if stage.is_pre_negotiation() || stage == HandshakeStage::Reconnecting {
            self.shared.set_stage(HandshakeStage::PeerFound);
        }
        if self.shared.config.encrypt_signaling {
            self.send_identity().await;
        }
        self.announce().await;
        if let Some(text) = self.shared.config.ready_message.clone() {
            self.send_or_fail(Signal::Chat { text }).await;
        }
    }

    async fn on_message(&mut self, msg: SignalingMessage) {
        if msg.sender_id == self.shared.sender_id {
            return;
        }
        if let Err(e) = self.dispatch(msg).await {
            self.fail(format!("{e:#}"));
        }
    }

    async fn dispatch(&mut self, msg: SignalingMessage) -> anyhow::Result<()> {
        let msg = if msg.kind() == MessageKind::Encrypted {
            match identity::open(&self.shared.keypair, &msg) {
                Ok(inner) => inner,
                // Sealed for another node; relays and fan-in deliver those to everyone.
                Err(EnvelopeError::Crypto(WireCryptoError::Decrypt) | EnvelopeError::SenderMismatch) => {
                    debug!(from = %msg.sender_id, "dropping envelope not addressed to us");
                    return Ok(());
                }
                Err(e) => return Err(e).with_context(|| format!("opening envelope from {}", msg.sender_id)),
            }
        } else {
            msg
        };
        debug!(from = %msg.sender_id, kind = %msg.kind(), "signaling message");
        let SignalingMessage { sender_id: from, signal } = msg;
        match signal {
            Signal::Join => self.on_join(&from).await,
            Signal::SelectMode(mode) => self.on_mode(mode).await,
            Signal::Offer { sdp } => self.on_offer(&sdp).await,
            Signal::Answer { sdp } => self.on_answer(&sdp).await,
            Signal::IceCandidate(candidate) => self
                .shared
                .engine
                .add_ice_candidate(&candidate)
                .await
                .context("adding remote ICE candidate"),
            Signal::Bye => {
                self.on_bye().await;
                Ok(())
            }
            Signal::Chat { text } => {
                self.shared.emit(HandshakeEvent::Chat { from, text });
                Ok(())
            }
            Signal::Identity { public_key } => {
                self.on_identity(from, public_key).await;
                Ok(())
            }
            Signal::Encrypted { .. } => bail!("nested envelope from {from}"),
            Signal::Unknown => {
                debug!(%from, "ignoring unknown signaling message");
                Ok(())
            }
        }
    }

    async fn on_join(&mut self, from: &str) -> anyhow::Result<()> {
        match self.shared.role {
            Role::Host => self.start_offer(from).await,
            Role::Joiner => {
                if !self.shared.stage().is_pre_negotiation() {
                    return Ok(());
                }
                let recently = self
                    .last_join
                    .is_some_and(|at| at.elapsed() < self.shared.config.rejoin_interval());
                if !recently {
                    self.announce().await;
                }
                Ok(())
            }
        }
    }

    async fn start_offer(&mut self, from: &str) -> anyhow::Result<()> {
        if self.shared.stage() == HandshakeStage::LinkEstablished {
            info!(%from, "call already established, ignoring JOIN");
            return Ok(());
        }
        let engine_state = self.shared.engine_state();
        if !matches!(engine_state, EngineState::Idle | EngineState::Ready | EngineState::Closed) {
            debug!(%from, ?engine_state, "media busy, ignoring JOIN");
            return Ok(());
        }
        let grace = self.shared.config.watchdog_grace();
        if self.offer_sent_at.is_some_and(|at| at.elapsed() < grace) {
            debug!(%from, "offer already in flight, ignoring JOIN");
            return Ok(());
        }

        info!(%from, mode = ?self.mode, "peer joined, offering");
        let engine = self.shared.engine.clone();
        if !engine.has_session() {
            engine
                .initialize(self.mode.video_enabled())
                .await
                .context("initializing media for offer")?;
        }
        self.send(Signal::SelectMode(self.mode), false).await?;
        self.shared.set_stage(HandshakeStage::ExchangingSdpOffer);
        let sdp = engine.create_offer().await.context("creating offer")?;
        self.send(Signal::Offer { sdp }, false).await?;
        self.offer_sent_at = Some(Instant::now());
        self.shared.set_stage(HandshakeStage::GatheringIceCandidates);
        Ok(())
    }

    async fn on_mode(&mut self, mode: CallMode) -> anyhow::Result<()> {
        if self.shared.role == Role::Host {
            debug!(?mode, "host ignores mode select");
            return Ok(());
        }
        self.mode = mode;
        self.shared.emit(HandshakeEvent::ModeSelected(mode));
        self.shared
            .engine
            .initialize(mode.video_enabled())
            .await
            .context("re-initializing media for selected mode")
    }

    async fn on_offer(&mut self, sdp: &str) -> anyhow::Result<()> {
        let engine = self.shared.engine.clone();
        self.shared.set_stage(HandshakeStage::ExchangingSdpOffer);
        if !engine.has_session() {
            engine
                .initialize(self.mode.video_enabled())
                .await
                .context("initializing media for offer")?;
        }
        engine
            .set_remote_description(sdp, SdpKind::Offer)
            .await
            .context("applying remote offer")?;
        self.shared.set_stage(HandshakeStage::ExchangingSdpAnswer);
        let answer = engine.create_answer().await.context("creating answer")?;
        self.send(Signal::Answer { sdp: answer }, false).await?;
        self.shared.set_stage(HandshakeStage::GatheringIceCandidates);
        self.settle();
        Ok(())
    }

    async fn on_answer(&mut self, sdp: &str) -> anyhow::Result<()> {
        self.shared.set_stage(HandshakeStage::ExchangingSdpAnswer);
        self.shared.set_stage(HandshakeStage::WaitingForRemoteVideo);
        self.shared
            .engine
            .set_remote_description(sdp, SdpKind::Answer)
            .await
            .context("applying remote answer")?;
        self.settle();
        Ok(())
    }

    async fn on_bye(&mut self) {
        info!("peer hung up");
        self.shared.engine.close().await;
        self.watchdog = None;
        self.offer_sent_at = None;
        self.last_join = None;
        self.shared.set_stage(HandshakeStage::Idle);
    }

    async fn on_identity(&mut self, from: String, public_key: PublicKey) {
        if self.peer_key.as_ref() == Some(&public_key) {
            return;
        }
        self.peer_key = Some(public_key);
        self.shared.emit(HandshakeEvent::PeerIdentified { sender_id: from });
        if self.shared.config.encrypt_signaling {
            self.send_identity().await;
        }
    }

    fn on_engine_state(&mut self, state: EngineState) {
        match state {
            EngineState::Connected => {
                self.watchdog = None;
                self.shared.set_stage(HandshakeStage::LinkEstablished);
            }
            EngineState::Failed => self.fail("media engine reported failure".to_string()),
            other => debug!(state = ?other, "media engine state"),
        }
    }

    async fn on_watchdog(&mut self) {
        self.watchdog = None;
        if self.shared.engine_state() == EngineState::Connected {
            self.settle();
            return;
        }
        match self.shared.role {
            Role::Host => {
                info!("no media link after grace period, handing over");
                self.shared.set_stage(HandshakeStage::Reconnecting);
                self.shared.emit(HandshakeEvent::Handover);
                let result = match self.shared.engine.restart_ice().await {
                    Ok(sdp) => self.send(Signal::Offer { sdp }, true).await,
                    Err(e) => Err(anyhow::Error::new(e).context("restarting ICE")),
                };
                match result {
                    Ok(()) => self.offer_sent_at = Some(Instant::now()),
                    Err(e) => self.fail(format!("{e:#}")),
                }
            }
            Role::Joiner => info!("no media link after grace period, waiting for host"),
        }
    }

    /// Record a failure. The session stays bound; the watchdog gets one grace period.
    fn fail(&mut self, cause: String) {
        warn!(role = ?self.shared.role, %cause, "handshake failed");
        self.shared.set_stage(HandshakeStage::Failed);
        self.shared.emit(HandshakeEvent::Failed { cause });
        if self.watchdog.is_none() {
            self.watchdog = Some(Instant::now() + self.shared.config.watchdog_grace());
        }
    }

    /// Jump to `LinkEstablished` if media connected while we were negotiating.
    fn settle(&mut self) {
        if self.shared.engine_state() == EngineState::Connected {
            self.on_engine_state(EngineState::Connected);
        }
    }

    async fn announce(&mut self) {
        self.last_join = Some(Instant::now());
        self.send_or_fail(Signal::Join).await;
    }

    async fn send_identity(&mut self) {
        let public_key = self.shared.keypair.public_key().clone();
        self.send_or_fail(Signal::Identity { public_key }).await;
    }

    async fn send_or_fail(&mut self, signal: Signal) {
        if let Err(e) = self.send(signal, false).await {
            self.fail(format!("{e:#}"));
        }
    }

    /// Negotiation payloads and chat are sealed once the peer's key is known and sealing is on.
    async fn send(&self, signal: Signal, everywhere: bool) -> anyhow::Result<()> {
        let msg = SignalingMessage::new(self.shared.sender_id.clone(), signal);
        let sealable = matches!(
            msg.kind(),
            MessageKind::Offer | MessageKind::Answer | MessageKind::IceCandidate | MessageKind::Message
        );
        let msg = match &self.peer_key {
            Some(key) if sealable && self.shared.config.encrypt_signaling => {
                identity::seal(key, &msg).context("sealing signaling message")?
            }
            _ => msg,
        };
        if everywhere {
            self.channel.broadcast_message(msg).await;
        } else {
            self.channel.send_message(msg).await;
        }
        Ok(())
    }
}
