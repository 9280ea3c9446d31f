//! Cloud channel: WebSocket to a room-keyed signaling relay. Text frames carry the JSON wire
//! form of a signaling message. Reconnects with exponential backoff until disconnected.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use meshcall_core::{Backoff, Channel, ChannelEvents, ChannelState, SignalingMessage};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Outbound queue of the live socket, if any.
type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

pub struct CloudChannel {
    url: String,
    events: ChannelEvents,
    outbound: Outbound,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// `<base>/<room>`, tolerating a trailing slash on the base.
pub fn room_url(base: &str, room: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), room)
}

impl CloudChannel {
    pub fn new(base_url: &str, room: &str) -> Self {
        Self {
            url: room_url(base_url, room),
            events: ChannelEvents::new(),
            outbound: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Channel for CloudChannel {
    async fn connect(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }
        self.events.set_state(ChannelState::Connecting);
        *task = Some(tokio::spawn(run(
            self.url.clone(),
            self.events.clone(),
            self.outbound.clone(),
            Backoff::default(),
        )));
    }

    async fn disconnect(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        let Some(task) = task else {
            return;
        };
        task.abort();
        if let Ok(mut out) = self.outbound.lock() {
            *out = None;
        }
        self.events.set_state(ChannelState::Disconnected);
        info!(url = %self.url, "cloud channel disconnected");
    }

    fn state(&self) -> watch::Receiver<ChannelState> {
        self.events.subscribe_state()
    }

    fn messages(&self) -> broadcast::Receiver<SignalingMessage> {
        self.events.subscribe()
    }

    async fn send_message(&self, msg: SignalingMessage) {
        let text = match msg.to_json() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot encode cloud message");
                return;
            }
        };
        let sent = self
            .outbound
            .lock()
            .ok()
            .and_then(|out| out.as_ref().map(|tx| tx.send(text).is_ok()))
            .unwrap_or(false);
        if !sent {
            debug!(kind = %msg.kind(), "cloud socket down, dropping");
        }
    }
}

impl Drop for CloudChannel {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn run(url: String, events: ChannelEvents, outbound: Outbound, mut backoff: Backoff) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                backoff.reset();
                info!(%url, "cloud channel connected");
                let (mut write, mut read) = socket.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                if let Ok(mut out) = outbound.lock() {
                    *out = Some(tx);
                }
                events.set_state(ChannelState::Connected);
                loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                                Ok(msg) => events.deliver(msg),
                                Err(e) => debug!(error = %e, "ignoring cloud frame"),
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                info!(%url, "cloud socket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "cloud socket error");
                                break;
                            }
                        },
                        Some(text) = rx.recv() => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!(error = %e, "cloud send failed");
                                break;
                            }
                        }
                    }
                }
                if let Ok(mut out) = outbound.lock() {
                    *out = None;
                }
                events.set_state(ChannelState::Connecting);
            }
            Err(e) => {
                warn!(%url, error = %e, "cloud connect failed");
                events.set_state(ChannelState::Error);
            }
        }
        let delay = backoff.next_delay();
        debug!(?delay, "cloud reconnect scheduled");
        tokio::time::sleep(delay).await;
        events.set_state(ChannelState::Connecting);
    }
}
