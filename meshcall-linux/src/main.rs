// MeshCall Linux: signaling daemon (LAN, UDP mesh, cloud relay) and out-of-band code tool.

mod cloud;
mod config;
mod discovery;
mod lan;
mod probe;
mod udp_mesh;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use meshcall_core::{
    CallHandshake, Channel, CompactCodec, HandshakeEvent, Keypair, MediaEngine, MeshRelay, SdpKind,
    TransportAggregator, TransportPriority,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: meshcall-linux [run | encode [--answer] <sdp-file> | decode <code> | --version]";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run,
    Encode { kind: SdpKind, path: PathBuf },
    Decode { code: String },
    Version,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut it = args.iter().map(String::as_str);
    match it.next() {
        None | Some("run") => Ok(Command::Run),
        Some("--version") | Some("-V") => Ok(Command::Version),
        Some("encode") => {
            let mut kind = SdpKind::Offer;
            let mut path = None;
            for arg in it {
                match arg {
                    "--answer" => kind = SdpKind::Answer,
                    "--offer" => kind = SdpKind::Offer,
                    p if path.is_none() => path = Some(PathBuf::from(p)),
                    extra => bail!("unexpected argument {extra:?}\n{USAGE}"),
                }
            }
            let path = path.with_context(|| format!("encode needs an SDP file\n{USAGE}"))?;
            Ok(Command::Encode { kind, path })
        }
        Some("decode") => {
            let code = it.next().with_context(|| format!("decode needs a code\n{USAGE}"))?;
            Ok(Command::Decode {
                code: code.to_string(),
            })
        }
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Command::Version => {
            println!("meshcall-linux {}", VERSION);
            Ok(())
        }
        Command::Encode { kind, path } => {
            let sdp = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let codec = CompactCodec::new(&config::load().core.codec);
            println!("{}", codec.encode(kind, &sdp));
            Ok(())
        }
        Command::Decode { code } => {
            let codec = CompactCodec::new(&config::load().core.codec);
            let decoded = codec.decode(&code).context("invalid code")?;
            println!("{}", decoded.kind);
            print!("{}", decoded.sdp);
            Ok(())
        }
        Command::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(config::load()))
        }
    }
}

async fn run(cfg: config::Config) -> Result<()> {
    let keypair = Arc::new(Keypair::generate());
    let sender_id = keypair.sender_id();
    info!(%sender_id, role = ?cfg.role, room = %cfg.room, "meshcall starting");

    let aggregator = Arc::new(TransportAggregator::new());
    let lan = Arc::new(lan::LanChannel::new(
        keypair.clone(),
        cfg.room.clone(),
        cfg.discovery_port,
        cfg.transport_port,
    ));
    aggregator.add_transport(TransportPriority::Lan, lan);

    match udp_mesh::UdpPacketTransport::bind(sender_id.clone(), cfg.mesh_port, cfg.mesh_beacon_port) {
        Ok(radio) => {
            let relay = Arc::new(MeshRelay::new(sender_id.clone(), Arc::new(radio), cfg.core.mesh.clone()));
            aggregator.add_transport(TransportPriority::Ble, relay);
        }
        Err(e) => warn!(port = cfg.mesh_port, error = %e, "mesh transport unavailable"),
    }

    if let Some(url) = &cfg.signaling_url {
        let cloud = Arc::new(cloud::CloudChannel::new(url, &cfg.room));
        info!(url = %cloud.url(), "cloud signaling enabled");
        aggregator.add_transport(TransportPriority::Cloud, cloud);
    }

    let engine = Arc::new(probe::ProbeEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let handshake = CallHandshake::new(
        cfg.role.into(),
        sender_id,
        keypair,
        engine.clone(),
        cfg.core.handshake.clone(),
    );

    let watchers = [
        tokio::spawn(log_stages(handshake.stage())),
        tokio::spawn(log_events(handshake.events())),
        tokio::spawn(follow_transport(aggregator.transport_changes(), engine)),
    ];

    let channel: Arc<dyn Channel> = aggregator.clone();
    handshake.bind(channel).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            res = shutdown_signal() => {
                res?;
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) if !text.trim().is_empty() => handshake.send_chat(text),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    info!("shutting down");
    handshake.end_call().await;
    for w in watchers {
        w.abort();
    }
    Ok(())
}

async fn log_stages(mut stage: tokio::sync::watch::Receiver<meshcall_core::HandshakeStage>) {
    while stage.changed().await.is_ok() {
        let current = *stage.borrow_and_update();
        println!("stage: {current:?}");
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<HandshakeEvent>) {
    loop {
        match events.recv().await {
            Ok(HandshakeEvent::Chat { from, text }) => println!("<{from}> {text}"),
            Ok(HandshakeEvent::Failed { cause }) => warn!(%cause, "call failed"),
            Ok(HandshakeEvent::ModeSelected(mode)) => info!(?mode, "call mode selected"),
            Ok(HandshakeEvent::PeerIdentified { sender_id }) => info!(peer = %sender_id, "peer identified"),
            Ok(HandshakeEvent::Handover) => info!("re-offering after media failure"),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Log transport switches and cap the media bitrate to what the new transport carries.
async fn follow_transport(
    mut changes: tokio::sync::broadcast::Receiver<meshcall_core::TransportChanged>,
    engine: Arc<probe::ProbeEngine>,
) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                info!(
                    from = ?change.previous,
                    to = %change.current,
                    kbps = change.bitrate_hint_kbps,
                    "transport changed"
                );
                engine.set_bitrate_ceiling(change.bitrate_hint_kbps).await;
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_args(&[]).unwrap(), Command::Run);
        assert_eq!(parse_args(&args(&["-V"])).unwrap(), Command::Version);
        assert_eq!(
            parse_args(&args(&["encode", "--answer", "a.sdp"])).unwrap(),
            Command::Encode {
                kind: SdpKind::Answer,
                path: PathBuf::from("a.sdp")
            }
        );
        assert_eq!(
            parse_args(&args(&["encode", "o.sdp"])).unwrap(),
            Command::Encode {
                kind: SdpKind::Offer,
                path: PathBuf::from("o.sdp")
            }
        );
        assert_eq!(
            parse_args(&args(&["decode", "AbC"])).unwrap(),
            Command::Decode { code: "AbC".into() }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["encode"])).is_err());
        assert!(parse_args(&args(&["encode", "a", "b"])).is_err());
        assert!(parse_args(&args(&["decode"])).is_err());
        assert!(parse_args(&args(&["proxy"])).is_err());
    }
}
