//! Rule application and enrichment of parsed frames.
//!
//! The message rule decides routing (drop / store / summarize / forward) and
//! which fields are tags or integers; the configuration records decorate the
//! record with tenant, location, device, application and SLA context.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::parser::ParsedFrame;
use super::SyslogContext;
use crate::collector::forward::ForwardedMessage;
use crate::collector::records::MessageRule;
use crate::collector::session_cache::SessionCounters;
use crate::collector::{AttribValue, StatRecord};

/// Stat stream identity of every emitted record; the schema catalog
/// registers the matching static schema under `StatTable.StructuredLog.data`.
pub const STAT_NAME: &str = "StructuredLog";
pub const STAT_ATTR: &str = "data";

const FIELD_APPLICATION: &str = "application";
const FIELD_NESTED_APPLICATION: &str = "nested-application";
const FIELD_SLA_PROFILE: &str = "sla-profile";
const FIELD_ROUTING_INSTANCE: &str = "routing-instance";
const FIELD_SOURCE_ADDRESS: &str = "source-address";
const FIELD_DESTINATION_ADDRESS: &str = "destination-address";
const FIELD_DSCP_VALUE: &str = "dscp-value";
const FIELD_SESSION_ID: &str = "session-id-32";
const FIELD_INTERFACE: &str = "interface-name";
const UNKNOWN_APPLICATION: &str = "UNKNOWN";
const DEFAULT_VPN: &str = "default";

/// Normalizes, enriches and routes one decoded frame.
pub(crate) fn process_frame(
    ctx: &SyslogContext,
    parsed: ParsedFrame,
    peer: IpAddr,
    raw: &[u8],
) -> bool {
    let rule_key = if parsed.tag.is_empty() {
        parsed.program.clone()
    } else {
        format!("{}_{}", parsed.program, parsed.tag)
    };
    let rule = ctx.registry().message_rule(&rule_key);

    let mut record = base_record(&parsed, peer);
    normalize_fields(&parsed, rule.as_deref(), &mut record);
    enrich(ctx, &parsed, &mut record);

    let Some(rule) = rule else {
        // no rule for this message type: emit the generic record
        ctx.emit(record);
        return true;
    };
    debug!(rule = %rule.name, "applying message rule");
    if rule.summarize {
        fold_session_counters(ctx, &parsed, &rule, &record);
    }
    if rule.forward {
        let message = ForwardedMessage {
            raw: raw.to_vec(),
            record: rule.process_before_forward.then(|| record.clone()),
            peer,
        };
        ctx.forward(message);
    }
    if rule.store {
        ctx.emit(record);
    }
    true
}

/// Emits the minimal record for a buffer nothing could be decoded from.
pub(crate) fn emit_unparsed(ctx: &SyslogContext, peer: IpAddr, now: DateTime<Utc>) {
    let mut record = StatRecord {
        timestamp_us: now.timestamp_micros() as u64,
        stat_name: STAT_NAME.to_string(),
        stat_attr: STAT_ATTR.to_string(),
        tags: Default::default(),
        attribs: Default::default(),
    };
    record
        .tags
        .insert("Source".to_string(), AttribValue::Str(peer.to_string()));
    record
        .attribs
        .insert("Source".to_string(), AttribValue::Str(peer.to_string()));
    record.attribs.insert(
        "data.timestamp".to_string(),
        AttribValue::U64(record.timestamp_us),
    );
    ctx.emit(record);
}

fn base_record(parsed: &ParsedFrame, peer: IpAddr) -> StatRecord {
    let mut record = StatRecord {
        timestamp_us: parsed.timestamp_us,
        stat_name: STAT_NAME.to_string(),
        stat_attr: STAT_ATTR.to_string(),
        tags: Default::default(),
        attribs: Default::default(),
    };
    let peer_addr = AttribValue::Str(peer.to_string());
    record.tags.insert("Source".to_string(), peer_addr.clone());
    record.attribs.insert("Source".to_string(), peer_addr);

    let hostname = AttribValue::Str(parsed.hostname.clone());
    record
        .tags
        .insert("data.hostname".to_string(), hostname.clone());
    record.attribs.insert("data.hostname".to_string(), hostname);
    record.attribs.insert(
        "data.prog".to_string(),
        AttribValue::Str(parsed.program.clone()),
    );
    record.attribs.insert(
        "data.timestamp".to_string(),
        AttribValue::U64(parsed.timestamp_us),
    );
    if parsed.is_structured {
        let tag = AttribValue::Str(parsed.tag.clone());
        record.tags.insert("data.tag".to_string(), tag.clone());
        record.attribs.insert("data.tag".to_string(), tag);
        record.attribs.insert(
            "data.hardware".to_string(),
            AttribValue::Str(parsed.hardware.clone()),
        );
    }
    record
}

fn normalize_fields(parsed: &ParsedFrame, rule: Option<&MessageRule>, record: &mut StatRecord) {
    for (key, value) in &parsed.fields {
        let attr_key = format!("data.{key}");
        let attrib = match rule {
            Some(rule) if rule.has_integer_field(key) => {
                AttribValue::U64(value.parse().unwrap_or_else(|_| {
                    warn!(field = %key, %value, "integer field does not parse, storing 0");
                    0
                }))
            }
            Some(_) => AttribValue::Str(value.clone()),
            // without a rule, digit-only values are still numbers
            None if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                AttribValue::U64(value.parse().unwrap_or(0))
            }
            None => AttribValue::Str(value.clone()),
        };
        let tagged = rule.map_or(key == FIELD_SOURCE_ADDRESS, |r| r.has_tagged_field(key));
        if tagged {
            record.tags.insert(attr_key.clone(), attrib.clone());
        }
        record.attribs.insert(attr_key, attrib);
    }
}

fn enrich(ctx: &SyslogContext, parsed: &ParsedFrame, record: &mut StatRecord) {
    let Some(host) = ctx.registry().hostname_record(&parsed.hostname) else {
        return;
    };
    let tenant = AttribValue::Str(host.tenant.clone());
    record.tags.insert("data.tenant".to_string(), tenant.clone());
    record.attribs.insert("data.tenant".to_string(), tenant);
    let location = AttribValue::Str(host.location.clone());
    record
        .tags
        .insert("data.location".to_string(), location.clone());
    record.attribs.insert("data.location".to_string(), location);
    record.attribs.insert(
        "data.device".to_string(),
        AttribValue::Str(host.device.clone()),
    );

    if let Some(app_name) = application_field(parsed) {
        if let Some(app) = ctx.registry().application_record(&host.tenant, app_name) {
            record.attribs.insert(
                "data.app-category".to_string(),
                AttribValue::Str(app.category.clone()),
            );
            record.attribs.insert(
                "data.app-subcategory".to_string(),
                AttribValue::Str(app.subcategory.clone()),
            );
            record.attribs.insert(
                "data.app-groups".to_string(),
                AttribValue::Str(app.groups.clone()),
            );
            record.attribs.insert(
                "data.app-risk".to_string(),
                AttribValue::Str(app.risk.clone()),
            );
            record.attribs.insert(
                "data.app-service-tags".to_string(),
                AttribValue::Str(app.service_tags.clone()),
            );
        }
    }

    if let Some(sla) = field(parsed, FIELD_SLA_PROFILE) {
        let key = format!("{}/{sla}", host.tenant);
        if let Some(profile) = ctx.registry().sla_profile_record(&key) {
            record.attribs.insert(
                "data.sla-params".to_string(),
                AttribValue::Str(profile.params.clone()),
            );
        }
    }

    if let Some(interface) = field(parsed, FIELD_INTERFACE) {
        if let Some(underlay) = host.linkmap.get(interface) {
            record.attribs.insert(
                "data.underlay".to_string(),
                AttribValue::Str(underlay.clone()),
            );
        }
    }

    if let Some(dscp) = field(parsed, FIELD_DSCP_VALUE) {
        if let Some(tenant_record) = ctx.registry().tenant_record(&host.tenant) {
            if let Some(alias) = tenant_record.dscp_map_ipv4.get(dscp) {
                record.attribs.insert(
                    "data.dscp-alias".to_string(),
                    AttribValue::Str(alias.clone()),
                );
            }
        }
    }

    let vpn = field(parsed, FIELD_ROUTING_INSTANCE).unwrap_or(DEFAULT_VPN);
    let network_key = format!("{}::{vpn}", host.tenant);
    if let Some(source) = field(parsed, FIELD_SOURCE_ADDRESS) {
        let found = ctx
            .registry()
            .networks()
            .find(source, &network_key, &host.location);
        if !found.is_empty() {
            let value = AttribValue::Str(found);
            record
                .tags
                .insert("data.source-location".to_string(), value.clone());
            record
                .attribs
                .insert("data.source-location".to_string(), value);
        }
    }
    if let Some(dest) = field(parsed, FIELD_DESTINATION_ADDRESS) {
        let found = ctx
            .registry()
            .networks()
            .find(dest, &network_key, &host.location);
        if !found.is_empty() {
            let value = AttribValue::Str(found);
            record
                .tags
                .insert("data.destination-location".to_string(), value.clone());
            record
                .attribs
                .insert("data.destination-location".to_string(), value);
        }
    }
}

fn fold_session_counters(
    ctx: &SyslogContext,
    parsed: &ParsedFrame,
    rule: &MessageRule,
    record: &StatRecord,
) {
    let session_key = match field(parsed, FIELD_SESSION_ID) {
        Some(id) => format!("{}:{id}", parsed.hostname),
        None => format!("{}:{}", parsed.hostname, parsed.tag),
    };
    let mut counters = SessionCounters::new();
    for name in &rule.integer_fields {
        let attr_key = format!("data.{name}");
        if let Some(value) = record.attribs.get(&attr_key).and_then(|v| v.as_u64()) {
            counters.insert(name.clone(), value);
        }
    }
    if !ctx.session_cache().put(&session_key, counters) {
        warn!(%session_key, "session counter map is full, dropping counters");
    }
}

fn field<'a>(parsed: &'a ParsedFrame, name: &str) -> Option<&'a str> {
    parsed
        .fields
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn application_field(parsed: &ParsedFrame) -> Option<&str> {
    match field(parsed, FIELD_NESTED_APPLICATION) {
        Some(nested) if nested != UNKNOWN_APPLICATION => Some(nested),
        _ => field(parsed, FIELD_APPLICATION).filter(|app| *app != UNKNOWN_APPLICATION),
    }
}
