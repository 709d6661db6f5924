//! Record classes delivered by the configuration feed.
//!
//! Records are held behind `Arc` in the registry maps; an update swaps the
//! `Arc` in place so enrichment paths that already captured a handle keep
//! seeing their snapshot for the rest of the message.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;

/// Per-device record keyed by syslog hostname.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostnameRecord {
    pub name: String,
    pub host_address: String,
    pub tenant: String,
    pub location: String,
    pub device: String,
    pub tags: String,
    /// overlay link name to `underlay@type@destination@metadata`.
    pub linkmap: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantRecord {
    pub name: String,
    pub tenant_address: String,
    pub tenant: String,
    pub tags: String,
    pub dscp_map_ipv4: BTreeMap<String, String>,
    pub dscp_map_ipv6: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationRecord {
    pub name: String,
    pub category: String,
    pub subcategory: String,
    pub groups: String,
    pub risk: String,
    pub service_tags: String,
}

/// Tenant-scoped SLA profile, keyed `"<tenant>/<name>"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlaProfileRecord {
    pub name: String,
    pub params: String,
}

/// Forwarding directive of a message rule.
pub const FORWARD_UNPROCESSED: &str = "forward-unprocessed";
pub const FORWARD_PROCESSED: &str = "forward-processed";

/// Routing and normalization rule for one message type.
///
/// `name` is either a literal `<program>_<tag>` key or a regex pattern; the
/// pattern is compiled once here so lookup never pays compilation.
#[derive(Debug)]
pub struct MessageRule {
    pub name: String,
    pub tagged_fields: Vec<String>,
    pub integer_fields: Vec<String>,
    pub store: bool,
    pub forward: bool,
    pub process_before_forward: bool,
    pub summarize: bool,
    pub summarize_user: bool,
    pattern: Option<Regex>,
}

impl MessageRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        tagged_fields: Vec<String>,
        integer_fields: Vec<String>,
        store: bool,
        forward_action: &str,
        summarize: bool,
        summarize_user: bool,
    ) -> Self {
        let forward =
            forward_action == FORWARD_UNPROCESSED || forward_action == FORWARD_PROCESSED;
        let process_before_forward = forward_action == FORWARD_PROCESSED;
        let pattern = match Regex::new(&name) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!(rule = %name, %err, "message rule name does not compile as a pattern");
                None
            }
        };
        Self {
            name,
            tagged_fields,
            integer_fields,
            store,
            forward,
            process_before_forward,
            summarize,
            summarize_user,
            pattern,
        }
    }

    /// Unanchored pattern match against a message key. Rules whose name
    /// failed to compile never match.
    pub fn matches(&self, key: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(key))
    }

    pub fn has_tagged_field(&self, field: &str) -> bool {
        self.tagged_fields.iter().any(|f| f == field)
    }

    pub fn has_integer_field(&self, field: &str) -> bool {
        self.integer_fields.iter().any(|f| f == field)
    }
}
