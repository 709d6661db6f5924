//! Configuration feed interface.
//!
//! The platform's configuration service delivers JSON documents per record
//! class together with an add/change flag. Consumers register a section name
//! and a callback; delivery, transport and ordering are the feed's concern.

pub type ConfigCallback = Box<dyn Fn(&serde_json::Value, bool) + Send + Sync>;

pub trait ConfigFeed {
    /// Registers `callback` for documents of `section`. The boolean passed
    /// to the callback is true for add/update events, false for removals.
    fn register(&self, section: &str, callback: ConfigCallback);
}

/// Feed section carrying the structured-syslog record classes.
pub const STRUCTURED_SYSLOG_SECTION: &str = "structured-syslog";
