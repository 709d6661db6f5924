//! Syslog framing and per-buffer processing.
//!
//! A buffer may hold one plain datagram, one RFC 5424 message, or a
//! concatenation of octet-counted frames. Octet counting survives datagram
//! boundaries through the per-peer residual buffer owned by the session
//! layer: whatever tail cannot be consumed is stashed there and prepended on
//! the next call.

pub mod enrich;
pub mod parser;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::forward::{ForwardedMessage, Forwarder};
use super::registry::ConfigRegistry;
use super::session_cache::SessionCounterCache;
use super::StatRecord;
use crate::event::channel::EventPublisher;

/// Shared state one processing call needs: the configuration snapshot, the
/// session counters, the downstream publisher and the optional forwarder.
pub struct SyslogContext {
    registry: Arc<ConfigRegistry>,
    session_cache: Arc<SessionCounterCache>,
    publisher: EventPublisher<StatRecord>,
    forwarder: Option<Arc<dyn Forwarder>>,
}

impl SyslogContext {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        session_cache: Arc<SessionCounterCache>,
        publisher: EventPublisher<StatRecord>,
    ) -> Self {
        Self {
            registry,
            session_cache,
            publisher,
            forwarder: None,
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    pub(crate) fn session_cache(&self) -> &SessionCounterCache {
        &self.session_cache
    }

    pub(crate) fn emit(&self, record: StatRecord) {
        if let Err(err) = self.publisher.publish(record) {
            warn!(%err, "dropping stat record, downstream consumer is gone");
        }
    }

    pub(crate) fn forward(&self, message: ForwardedMessage) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.forward(message);
        }
    }
}

/// Processes one received buffer, prepending `residual` first and leaving
/// any partial trailing frame in it. Returns false when any frame failed.
pub fn process_buffer(
    ctx: &SyslogContext,
    data: &[u8],
    peer: IpAddr,
    residual: &mut String,
) -> bool {
    let mut buf = Vec::with_capacity(residual.len() + data.len());
    buf.extend_from_slice(residual.as_bytes());
    buf.extend_from_slice(data);
    residual.clear();

    let now = Utc::now();
    let mut ok = true;
    let mut pos = 0;
    while pos < buf.len() {
        match buf[pos] {
            b'<' => {
                // plain datagram: one frame spans the rest of the buffer
                ok &= handle_frame(ctx, &buf[pos..], peer, now, true);
                pos = buf.len();
            }
            b'0'..=b'9' => {
                let digits_end = buf[pos..]
                    .iter()
                    .position(|b| !b.is_ascii_digit())
                    .map(|p| pos + p)
                    .unwrap_or(buf.len());
                if digits_end == buf.len() {
                    // length prefix cut by the datagram boundary
                    *residual = String::from_utf8_lossy(&buf[pos..]).into_owned();
                    break;
                }
                let digits = std::str::from_utf8(&buf[pos..digits_end])
                    .expect("ascii digits are valid utf-8");
                let Ok(frame_len) = digits.parse::<usize>() else {
                    warn!(%peer, digits, "octet count overflows, resynchronizing");
                    ok = false;
                    pos = resync(&buf, digits_end);
                    continue;
                };
                let body_start = if buf[digits_end] == b' ' {
                    digits_end + 1
                } else {
                    digits_end
                };
                if buf.len() - body_start < frame_len {
                    // mid-frame: keep prefix and partial payload for the
                    // next datagram
                    *residual = String::from_utf8_lossy(&buf[pos..]).into_owned();
                    break;
                }
                let frame = &buf[body_start..body_start + frame_len];
                if frame.first() == Some(&b'<') {
                    ok &= handle_frame(ctx, frame, peer, now, true);
                } else {
                    warn!(%peer, frame_len, "octet count does not resolve to a frame");
                    ok = false;
                }
                pos = body_start + frame_len;
            }
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            _ => {
                // leading garbage: salvage the first frame-looking suffix,
                // demoted to unstructured
                match buf[pos..].iter().position(|&b| b == b'<') {
                    Some(p) => {
                        handle_frame(ctx, &buf[pos + p..], peer, now, false);
                    }
                    None => {
                        warn!(%peer, "buffer holds no syslog frame");
                        enrich::emit_unparsed(ctx, peer, now);
                        ok = false;
                    }
                }
                pos = buf.len();
            }
        }
    }
    ok
}

fn resync(buf: &[u8], from: usize) -> usize {
    buf[from..]
        .iter()
        .position(|&b| b == b'<')
        .map(|p| from + p)
        .unwrap_or(buf.len())
}

fn handle_frame(
    ctx: &SyslogContext,
    frame: &[u8],
    peer: IpAddr,
    now: DateTime<Utc>,
    allow_structured: bool,
) -> bool {
    let text = String::from_utf8_lossy(frame);
    match parser::parse_frame(&text, now) {
        Ok(mut parsed) => {
            if !allow_structured {
                parsed.is_structured = false;
                parsed.fields.clear();
                parsed.hardware.clear();
            }
            enrich::process_frame(ctx, parsed, peer, frame)
        }
        Err(err) => {
            warn!(%err, %peer, "failed to parse syslog frame");
            enrich::emit_unparsed(ctx, peer, now);
            false
        }
    }
}
