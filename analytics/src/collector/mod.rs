//! Structured syslog ingest and enrichment.
//!
//! Datagrams arrive from the socket server, are decoded into frames, and are
//! normalized into tagged stat records per the message rules held by the
//! [`registry::ConfigRegistry`]. Enrichment decorates each record from the
//! hostname / tenant / application / SLA records and resolves peer locations
//! through the [`network_index::NetworkIndex`].

pub mod config;
pub mod forward;
pub mod network_index;
pub mod records;
pub mod registry;
pub mod session_cache;
pub mod syslog;

use std::collections::BTreeMap;
use std::thread::JoinHandle;

use crate::event::channel::EventConsumer;
use crate::utils::threads::spawn_named_thread;

/// A normalized attribute value: rule-declared integer fields are u64,
/// everything else is a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttribValue {
    Str(String),
    U64(u64),
}

impl AttribValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttribValue::Str(s) => Some(s),
            AttribValue::U64(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttribValue::U64(n) => Some(*n),
            AttribValue::Str(_) => None,
        }
    }
}

pub type AttribMap = BTreeMap<String, AttribValue>;

/// The record emitted downstream for every stored message.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRecord {
    pub timestamp_us: u64,
    pub stat_name: String,
    pub stat_attr: String,
    /// Indexable subset of the attributes.
    pub tags: AttribMap,
    pub attribs: AttribMap,
}

/// Drains emitted stat records on a dedicated thread and hands each to
/// `handler` (typically the store writer). The thread ends when every
/// publisher is gone.
pub fn spawn_stat_consumer<F>(
    name: &str,
    consumer: EventConsumer<StatRecord>,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(StatRecord) + Send + 'static,
{
    spawn_named_thread(name, move || {
        while let Ok(record) = consumer.recv() {
            handler(record);
        }
    })
}
