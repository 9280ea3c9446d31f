//! Out-of-band codes: a negotiation payload squeezed into one short printable string for optical
//! codes and manual entry.
//!
//! Pipeline: minify the SDP, substitute common prefixes with `~x` markers, wrap with a version and
//! kind in bincode, raw deflate, URL-safe base64 without padding. Decoding reverses it and falls
//! back to the legacy JSON form `{"type":"offer","sdp":"v=0..."}`.

use std::io::{Read, Write};

use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::CodecConfig;
use crate::media::SdpKind;

/// Version byte of the compact payload.
pub const CODE_VERSION: u8 = 1;

/// Upper bound on the inflated payload, so a crafted code cannot balloon.
const MAX_INFLATED: u64 = 64 * 1024;

/// Codec payload types kept by the minifier (PCMU, PCMA, VP8, its RTX, H264, Opus).
const ALLOWED_PAYLOAD_TYPES: [&str; 6] = ["0", "8", "96", "97", "102", "111"];

const KEPT_PREFIXES: [&str; 18] = [
    "v=",
    "o=",
    "s=",
    "t=",
    "c=",
    "a=group:",
    "a=ice-ufrag:",
    "a=ice-pwd:",
    "a=ice-options:",
    "a=fingerprint:",
    "a=setup:",
    "a=mid:",
    "a=sendrecv",
    "a=sendonly",
    "a=recvonly",
    "a=rtcp-mux",
    "a=sctp-port:",
    "a=max-message-size:",
];

/// Marker letter and the text it stands for. `~~` is a literal tilde.
const TOKENS: [(char, &str); 24] = [
    ('C', "a=candidate:"),
    ('F', "a=fingerprint:sha-256 "),
    ('U', "a=ice-ufrag:"),
    ('P', "a=ice-pwd:"),
    ('O', "a=ice-options:"),
    ('R', "a=rtpmap:"),
    ('M', "a=fmtp:"),
    ('B', "a=group:BUNDLE"),
    ('S', "a=setup:"),
    ('I', "a=mid:"),
    ('A', "a=sendrecv"),
    ('X', "a=rtcp-mux"),
    ('V', "m=video "),
    ('D', "m=audio "),
    ('W', "m=application "),
    ('T', "UDP/TLS/RTP/SAVPF"),
    ('N', "IN IP4 "),
    ('h', " typ host"),
    ('s', " typ srflx"),
    ('r', " typ relay"),
    ('u', " udp "),
    ('o', "opus/48000/2"),
    ('p', "a=sctp-port:"),
    ('x', "a=max-message-size:"),
];

#[derive(Debug, Serialize, Deserialize)]
struct CompactPayload {
    version: u8,
    kind: SdpKind,
    body: String,
}

#[derive(Debug, Deserialize)]
struct LegacyCode {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

/// A decoded code: what it is and the (minified) SDP it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty code")]
    Empty,
    #[error("unsupported code version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid code: {0}")]
    Invalid(&'static str),
}

/// Encoder/decoder for out-of-band codes.
#[derive(Debug, Clone)]
pub struct CompactCodec {
    max_candidates: usize,
}

impl CompactCodec {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            max_candidates: config.max_candidates,
        }
    }

    /// Never fails; falls back to the legacy form if the compact pipeline does.
    pub fn encode(&self, kind: SdpKind, sdp: &str) -> String {
        match self.encode_compact(kind, sdp) {
            Ok(code) => code,
            Err(e) => {
                let cause = format!("{e:#}");
                warn!(error = %cause, "compact encoding failed, using legacy code");
                legacy_encode(kind, sdp)
            }
        }
    }

    pub fn decode(&self, code: &str) -> Result<DecodedCode, DecodeError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(DecodeError::Empty);
        }
        match decode_compact(code) {
            Ok(decoded) => Ok(decoded),
            Err(e) => decode_legacy(code).ok_or(e),
        }
    }

    fn encode_compact(&self, kind: SdpKind, sdp: &str) -> anyhow::Result<String> {
        let payload = CompactPayload {
            version: CODE_VERSION,
            kind,
            body: substitute(&minify(sdp, self.max_candidates)),
        };
        let packed = bincode::serialize(&payload).context("packing payload")?;
        let mut deflate = DeflateEncoder::new(Vec::new(), Compression::best());
        deflate.write_all(&packed).context("compressing payload")?;
        let compressed = deflate.finish().context("compressing payload")?;
        Ok(URL_SAFE_NO_PAD.encode(compressed))
    }
}

impl Default for CompactCodec {
    fn default() -> Self {
        Self::new(&CodecConfig::default())
    }
}

/// Keep what a peer needs to connect: session lines, media lines trimmed to allowed payload
/// types, transport attributes, at most `max_candidates` UDP candidates and the allowed codecs.
/// Lines are joined with `\n`. A leading byte-order mark is dropped.
pub fn minify(sdp: &str, max_candidates: usize) -> String {
    let sdp = sdp.strip_prefix('\u{feff}').unwrap_or(sdp);
    let mut kept = Vec::new();
    let mut candidates = 0;
    for line in sdp.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("a=candidate:") {
            let udp = rest
                .split_whitespace()
                .nth(2)
                .is_some_and(|t| t.eq_ignore_ascii_case("udp"));
            if udp && candidates < max_candidates {
                candidates += 1;
                kept.push(line.to_string());
            }
        } else if line.starts_with("m=") {
            kept.push(trim_media_line(line));
        } else if let Some(rest) = line
            .strip_prefix("a=rtpmap:")
            .or_else(|| line.strip_prefix("a=fmtp:"))
        {
            let pt = rest.split_whitespace().next().unwrap_or_default();
            if ALLOWED_PAYLOAD_TYPES.contains(&pt) {
                kept.push(line.to_string());
            }
        } else if KEPT_PREFIXES.iter().any(|p| line.starts_with(p)) {
            kept.push(line.to_string());
        }
    }
    kept.join("\n")
}

/// `m=<media> <port> <proto> <fmt>...`: keep allowed formats. Application lines and lines
/// with no allowed format are left alone.
fn trim_media_line(line: &str) -> String {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() <= 3 || line.starts_with("m=application") {
        return line.to_string();
    }
    let formats: Vec<&str> = fields[3..]
        .iter()
        .copied()
        .filter(|f| ALLOWED_PAYLOAD_TYPES.contains(f))
        .collect();
    if formats.is_empty() {
        return line.to_string();
    }
    let mut out = fields[..3].join(" ");
    for f in formats {
        out.push(' ');
        out.push_str(f);
    }
    out
}

/// Replace known prefixes with markers, longest match first, in one pass.
fn substitute(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if c == '~' {
            out.push_str("~~");
            rest = &rest[1..];
            continue;
        }
        let best = TOKENS
            .iter()
            .filter(|(_, t)| rest.starts_with(t))
            .max_by_key(|(_, t)| t.len());
        match best {
            Some((marker, t)) => {
                out.push('~');
                out.push(*marker);
                rest = &rest[t.len()..];
            }
            None => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    out
}

fn restore(text: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(text.len() * 2);
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('~') => out.push('~'),
            Some(marker) => {
                let (_, t) = TOKENS
                    .iter()
                    .find(|(m, _)| *m == marker)
                    .ok_or(DecodeError::Invalid("unknown marker"))?;
                out.push_str(t);
            }
            None => return Err(DecodeError::Invalid("dangling marker")),
        }
    }
    Ok(out)
}

fn decode_compact(code: &str) -> Result<DecodedCode, DecodeError> {
    let compressed = URL_SAFE_NO_PAD
        .decode(code)
        .map_err(|_| DecodeError::Invalid("not base64"))?;
    let mut packed = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_INFLATED)
        .read_to_end(&mut packed)
        .map_err(|_| DecodeError::Invalid("not deflate"))?;
    let payload: CompactPayload =
        bincode::deserialize(&packed).map_err(|_| DecodeError::Invalid("bad payload"))?;
    if payload.version != CODE_VERSION {
        return Err(DecodeError::UnsupportedVersion(payload.version));
    }
    let body = restore(&payload.body)?;
    let mut sdp = String::with_capacity(body.len() + 64);
    for line in body.split('\n').filter(|l| !l.is_empty()) {
        sdp.push_str(line);
        sdp.push_str("\r\n");
    }
    Ok(DecodedCode {
        kind: payload.kind,
        sdp,
    })
}

fn legacy_encode(kind: SdpKind, sdp: &str) -> String {
    serde_json::json!({ "type": kind.as_str(), "sdp": sdp }).to_string()
}

fn decode_legacy(code: &str) -> Option<DecodedCode> {
    let legacy: LegacyCode = serde_json::from_str(code).ok()?;
    let kind = match legacy.kind.to_ascii_lowercase().as_str() {
        "offer" => SdpKind::Offer,
        "answer" => SdpKind::Answer,
        _ => return None,
    };
    if !legacy.sdp.starts_with("v=") {
        return None;
    }
    Some(DecodedCode {
        kind,
        sdp: legacy.sdp,
    })
}
