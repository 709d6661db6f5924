//! Configuration registry fed by the platform's JSON config feed.
//!
//! Five record classes arrive as documents with an `add_change` flag:
//! hostname records, tenant records, application records, SLA profiles and
//! message rules. The registry owns the record maps and the IP-network
//! index; enrichment holds read-only shared access.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::network_index::NetworkIndex;
use super::records::{
    ApplicationRecord, HostnameRecord, MessageRule, SlaProfileRecord, TenantRecord,
};
use crate::config_feed::{ConfigFeed, STRUCTURED_SYSLOG_SECTION};

/// Application records owned by this tenant are globally addressable.
pub const DEFAULT_GLOBAL_TENANT: &str = "default-global-analytics";

const HOSTNAME_RECORD_KEY: &str = "hostname_record";
const TENANT_RECORD_KEY: &str = "tenant_record";
const APPLICATION_RECORD_KEY: &str = "application_record";
const SLA_PROFILE_KEY: &str = "sla_profile";
const MESSAGE_RULE_KEY: &str = "message_rule";

#[derive(Debug, Deserialize)]
struct HostnameRecordDoc {
    fq_name: Vec<String>,
    #[serde(default)]
    host_address: String,
    #[serde(default)]
    tenant: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    device: String,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    linkmap: Option<LinkMapDoc>,
    #[serde(default)]
    lan_segment_list: Option<LanSegmentListDoc>,
}

#[derive(Debug, Deserialize)]
struct LinkMapDoc {
    links: Vec<LinkDoc>,
}

#[derive(Debug, Deserialize)]
struct LinkDoc {
    overlay: String,
    underlay: String,
    link_type: String,
    traffic_destination: String,
    metadata: String,
}

#[derive(Debug, Deserialize)]
struct LanSegmentListDoc {
    segments: Vec<LanSegmentDoc>,
}

#[derive(Debug, Deserialize)]
struct LanSegmentDoc {
    vpn: String,
    /// Comma-separated CIDR list.
    network_ranges: String,
}

#[derive(Debug, Deserialize)]
struct TenantRecordDoc {
    fq_name: Vec<String>,
    #[serde(default)]
    tenant_address: String,
    #[serde(default)]
    tenant: String,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    dscp_map: Option<DscpMapDoc>,
}

#[derive(Debug, Deserialize)]
struct DscpMapDoc {
    #[serde(default)]
    ipv4: Vec<DscpEntryDoc>,
    #[serde(default)]
    ipv6: Vec<DscpEntryDoc>,
}

#[derive(Debug, Deserialize)]
struct DscpEntryDoc {
    dscp_value: String,
    alias_code: String,
}

#[derive(Debug, Deserialize)]
struct ApplicationRecordDoc {
    fq_name: Vec<String>,
    #[serde(default)]
    category: String,
    #[serde(default)]
    subcategory: String,
    #[serde(default)]
    groups: String,
    #[serde(default)]
    risk: String,
    #[serde(default)]
    service_tags: String,
}

#[derive(Debug, Deserialize)]
struct SlaProfileDoc {
    fq_name: Vec<String>,
    #[serde(default)]
    sla_params: String,
}

#[derive(Debug, Deserialize)]
struct MessageRuleDoc {
    fq_name: Vec<String>,
    #[serde(default)]
    tagged_fields: Vec<String>,
    #[serde(default)]
    integer_fields: Vec<String>,
    #[serde(default)]
    process_and_store: bool,
    #[serde(default)]
    forward: String,
    #[serde(default)]
    process_and_summarize: bool,
    #[serde(default)]
    process_and_summarize_user: bool,
}

type RecordMap<T> = RwLock<HashMap<String, Arc<T>>>;

#[derive(Debug, Default)]
pub struct ConfigRegistry {
    hostname_records: RecordMap<HostnameRecord>,
    tenant_records: RecordMap<TenantRecord>,
    application_records: RecordMap<ApplicationRecord>,
    tenant_application_records: RecordMap<ApplicationRecord>,
    sla_profile_records: RecordMap<SlaProfileRecord>,
    message_rules: RecordMap<MessageRule>,
    networks: NetworkIndex,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers this registry on the configuration feed.
    pub fn subscribe(self: &Arc<Self>, feed: &dyn ConfigFeed) {
        let registry = Arc::clone(self);
        feed.register(
            STRUCTURED_SYSLOG_SECTION,
            Box::new(move |doc, add_change| registry.receive(doc, add_change)),
        );
    }

    /// Dispatches one feed document. A document carries exactly one record
    /// class; anything else is ignored with a log entry.
    pub fn receive(&self, doc: &Value, add_change: bool) {
        let Some(obj) = doc.as_object() else {
            warn!("dropping non-object config document");
            return;
        };
        if let Some(payload) = obj.get(HOSTNAME_RECORD_KEY) {
            self.handle_hostname_record(payload, add_change);
        } else if let Some(payload) = obj.get(TENANT_RECORD_KEY) {
            self.handle_tenant_record(payload, add_change);
        } else if let Some(payload) = obj.get(APPLICATION_RECORD_KEY) {
            self.handle_application_record(payload, add_change);
        } else if let Some(payload) = obj.get(SLA_PROFILE_KEY) {
            self.handle_sla_profile(payload, add_change);
        } else if let Some(payload) = obj.get(MESSAGE_RULE_KEY) {
            self.handle_message_rule(payload, add_change);
        } else {
            debug!("ignoring config document with unknown record class");
        }
    }

    pub fn networks(&self) -> &NetworkIndex {
        &self.networks
    }

    pub fn hostname_record(&self, name: &str) -> Option<Arc<HostnameRecord>> {
        self.hostname_records
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn tenant_record(&self, name: &str) -> Option<Arc<TenantRecord>> {
        self.tenant_records
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Tenant-scoped lookup first, then the global scope.
    pub fn application_record(&self, tenant: &str, name: &str) -> Option<Arc<ApplicationRecord>> {
        let scoped = format!("{tenant}/{name}");
        if let Some(record) = self
            .tenant_application_records
            .read()
            .expect("registry lock poisoned")
            .get(&scoped)
        {
            return Some(Arc::clone(record));
        }
        self.application_records
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn sla_profile_record(&self, name: &str) -> Option<Arc<SlaProfileRecord>> {
        self.sla_profile_records
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Exact rule lookup, falling back to a pattern search where the
    /// longest stored pattern that matches wins.
    pub fn message_rule(&self, name: &str) -> Option<Arc<MessageRule>> {
        let rules = self.message_rules.read().expect("registry lock poisoned");
        if let Some(rule) = rules.get(name) {
            return Some(Arc::clone(rule));
        }
        let mut best: Option<&Arc<MessageRule>> = None;
        for rule in rules.values() {
            if !rule.matches(name) {
                continue;
            }
            if best.map_or(true, |b| b.name.len() < rule.name.len()) {
                best = Some(rule);
            }
        }
        best.cloned()
    }

    pub fn hostname_record_count(&self) -> usize {
        self.hostname_records
            .read()
            .expect("registry lock poisoned")
            .len()
    }

    fn handle_hostname_record(&self, payload: &Value, add_change: bool) {
        let doc: HostnameRecordDoc = match serde_json::from_value(payload.clone()) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "dropping malformed hostname record event");
                return;
            }
        };
        let Some(name) = doc.fq_name.last().cloned() else {
            warn!("dropping hostname record event with empty fq_name");
            return;
        };
        if !add_change {
            let removed = self
                .hostname_records
                .write()
                .expect("registry lock poisoned")
                .remove(&name);
            if let Some(record) = removed {
                debug!(name = %record.name, "removed hostname record");
                if !record.location.is_empty() {
                    self.networks.purge(&record.location);
                }
            }
            return;
        }

        if let Some(lan) = &doc.lan_segment_list {
            // A location is re-advertised when any record already carries
            // it; its stale ranges must go before the fresh list lands.
            let readvertised = !doc.location.is_empty()
                && self
                    .hostname_records
                    .read()
                    .expect("registry lock poisoned")
                    .values()
                    .any(|record| record.location == doc.location);
            if readvertised {
                debug!(location = %doc.location, "location re-advertised, refreshing network index");
                self.networks.purge(&doc.location);
            }
            for segment in &lan.segments {
                let key = format!("{}::{}", doc.tenant, segment.vpn);
                for cidr in segment.network_ranges.split(',') {
                    let cidr = cidr.trim();
                    if !cidr.is_empty() {
                        self.networks.add(&key, cidr, &doc.location);
                    }
                }
            }
        }

        let mut linkmap = BTreeMap::new();
        if let Some(links) = &doc.linkmap {
            for link in &links.links {
                let underlay_data = format!(
                    "{}@{}@{}@{}",
                    link.underlay, link.link_type, link.traffic_destination, link.metadata
                );
                linkmap.insert(link.overlay.clone(), underlay_data);
            }
        }
        let record = HostnameRecord {
            name: name.clone(),
            host_address: doc.host_address,
            tenant: doc.tenant,
            location: doc.location,
            device: doc.device,
            tags: doc.tags,
            linkmap,
        };
        debug!(%name, "adding hostname record");
        self.hostname_records
            .write()
            .expect("registry lock poisoned")
            .insert(name, Arc::new(record));
    }

    fn handle_tenant_record(&self, payload: &Value, add_change: bool) {
        let doc: TenantRecordDoc = match serde_json::from_value(payload.clone()) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "dropping malformed tenant record event");
                return;
            }
        };
        let Some(name) = doc.fq_name.last().cloned() else {
            warn!("dropping tenant record event with empty fq_name");
            return;
        };
        if !add_change {
            self.tenant_records
                .write()
                .expect("registry lock poisoned")
                .remove(&name);
            return;
        }
        let (mut dscp_map_ipv4, mut dscp_map_ipv6) = (BTreeMap::new(), BTreeMap::new());
        if let Some(dscp) = &doc.dscp_map {
            for entry in &dscp.ipv4 {
                dscp_map_ipv4.insert(entry.dscp_value.clone(), entry.alias_code.clone());
            }
            for entry in &dscp.ipv6 {
                dscp_map_ipv6.insert(entry.dscp_value.clone(), entry.alias_code.clone());
            }
        }
        let record = TenantRecord {
            name: name.clone(),
            tenant_address: doc.tenant_address,
            tenant: doc.tenant,
            tags: doc.tags,
            dscp_map_ipv4,
            dscp_map_ipv6,
        };
        debug!(%name, "adding tenant record");
        self.tenant_records
            .write()
            .expect("registry lock poisoned")
            .insert(name, Arc::new(record));
    }

    fn handle_application_record(&self, payload: &Value, add_change: bool) {
        let doc: ApplicationRecordDoc = match serde_json::from_value(payload.clone()) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "dropping malformed application record event");
                return;
            }
        };
        let Some(name) = doc.fq_name.last().cloned() else {
            warn!("dropping application record event with empty fq_name");
            return;
        };
        let tenant = doc.fq_name.get(1).cloned().unwrap_or_default();
        let (map, key) = if tenant == DEFAULT_GLOBAL_TENANT {
            (&self.application_records, name.clone())
        } else {
            (
                &self.tenant_application_records,
                format!("{tenant}/{name}"),
            )
        };
        if !add_change {
            map.write().expect("registry lock poisoned").remove(&key);
            return;
        }
        let record = ApplicationRecord {
            name: key.clone(),
            category: doc.category,
            subcategory: doc.subcategory,
            groups: doc.groups,
            risk: doc.risk,
            service_tags: doc.service_tags,
        };
        debug!(name = %key, "adding application record");
        map.write()
            .expect("registry lock poisoned")
            .insert(key, Arc::new(record));
    }

    fn handle_sla_profile(&self, payload: &Value, add_change: bool) {
        let doc: SlaProfileDoc = match serde_json::from_value(payload.clone()) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "dropping malformed sla profile event");
                return;
            }
        };
        let Some(name) = doc.fq_name.last() else {
            warn!("dropping sla profile event with empty fq_name");
            return;
        };
        let tenant = doc.fq_name.get(1).cloned().unwrap_or_default();
        let key = format!("{tenant}/{name}");
        if !add_change {
            self.sla_profile_records
                .write()
                .expect("registry lock poisoned")
                .remove(&key);
            return;
        }
        let record = SlaProfileRecord {
            name: key.clone(),
            params: doc.sla_params,
        };
        debug!(name = %key, "adding sla profile record");
        self.sla_profile_records
            .write()
            .expect("registry lock poisoned")
            .insert(key, Arc::new(record));
    }

    fn handle_message_rule(&self, payload: &Value, add_change: bool) {
        let doc: MessageRuleDoc = match serde_json::from_value(payload.clone()) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "dropping malformed message rule event");
                return;
            }
        };
        let Some(name) = doc.fq_name.last().cloned() else {
            warn!("dropping message rule event with empty fq_name");
            return;
        };
        if !add_change {
            self.message_rules
                .write()
                .expect("registry lock poisoned")
                .remove(&name);
            return;
        }
        let rule = MessageRule::new(
            name.clone(),
            doc.tagged_fields,
            doc.integer_fields,
            doc.process_and_store,
            &doc.forward,
            doc.process_and_summarize,
            doc.process_and_summarize_user,
        );
        debug!(%name, "adding message rule");
        self.message_rules
            .write()
            .expect("registry lock poisoned")
            .insert(name, Arc::new(rule));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hostname_event(name: &str, location: &str, ranges: &str) -> Value {
        json!({
            "hostname_record": {
                "fq_name": ["default-domain", "t1", name],
                "host_address": "10.9.9.1",
                "tenant": "t1",
                "location": location,
                "device": "mx-80",
                "tags": "edge",
                "lan_segment_list": {
                    "segments": [{"vpn": "v1", "network_ranges": ranges}]
                }
            }
        })
    }

    #[test]
    fn hostname_record_add_and_lookup() {
        let registry = ConfigRegistry::new();
        registry.receive(&hostname_event("dev1", "siteA", "10.0.0.0/24"), true);
        let record = registry.hostname_record("dev1").unwrap();
        assert_eq!(record.tenant, "t1");
        assert_eq!(record.location, "siteA");
        assert_eq!(registry.networks().find("10.0.0.7", "t1::v1", ""), "siteA");
    }

    #[test]
    fn hostname_refresh_is_idempotent() {
        let registry = ConfigRegistry::new();
        let event = hostname_event("dev1", "siteA", "10.0.0.0/24,10.1.0.0/24");
        registry.receive(&event, true);
        registry.receive(&event, true);
        // re-advertising the same location purges before re-adding, so the
        // index holds exactly one entry per range
        assert_eq!(registry.networks().range_count("t1::v1"), 2);
        assert_eq!(registry.hostname_record_count(), 1);
    }

    #[test]
    fn location_change_purges_old_entries() {
        let registry = ConfigRegistry::new();
        registry.receive(&hostname_event("dev1", "siteA", "10.0.0.0/24"), true);
        // another device re-advertises siteA with a different segment list
        registry.receive(&hostname_event("dev2", "siteA", "10.5.0.0/24"), true);
        assert_eq!(registry.networks().find("10.0.0.7", "t1::v1", ""), "");
        assert_eq!(registry.networks().find("10.5.0.7", "t1::v1", ""), "siteA");
    }

    #[test]
    fn hostname_remove_purges_its_location() {
        let registry = ConfigRegistry::new();
        registry.receive(&hostname_event("dev1", "siteA", "10.0.0.0/24"), true);
        registry.receive(&hostname_event("dev1", "siteA", ""), false);
        assert!(registry.hostname_record("dev1").is_none());
        assert_eq!(registry.networks().find("10.0.0.7", "t1::v1", ""), "");
    }

    #[test]
    fn linkmap_is_flattened() {
        let registry = ConfigRegistry::new();
        let event = json!({
            "hostname_record": {
                "fq_name": ["default-domain", "t1", "dev1"],
                "tenant": "t1",
                "linkmap": {"links": [{
                    "overlay": "ge-0/0/0.0",
                    "underlay": "ge-0/0/0",
                    "link_type": "mpls",
                    "traffic_destination": "internet",
                    "metadata": "primary"
                }]}
            }
        });
        registry.receive(&event, true);
        let record = registry.hostname_record("dev1").unwrap();
        assert_eq!(
            record.linkmap.get("ge-0/0/0.0").map(String::as_str),
            Some("ge-0/0/0@mpls@internet@primary")
        );
    }

    #[test]
    fn application_records_scope_by_tenant() {
        let registry = ConfigRegistry::new();
        registry.receive(
            &json!({"application_record": {
                "fq_name": ["default-domain", DEFAULT_GLOBAL_TENANT, "dns"],
                "category": "network"
            }}),
            true,
        );
        registry.receive(
            &json!({"application_record": {
                "fq_name": ["default-domain", "t1", "dns"],
                "category": "custom-network"
            }}),
            true,
        );
        // tenant scope wins over the global scope
        let record = registry.application_record("t1", "dns").unwrap();
        assert_eq!(record.category, "custom-network");
        // other tenants fall back to the global record
        let record = registry.application_record("t2", "dns").unwrap();
        assert_eq!(record.category, "network");
        registry.receive(
            &json!({"application_record": {
                "fq_name": ["default-domain", "t1", "dns"]
            }}),
            false,
        );
        let record = registry.application_record("t1", "dns").unwrap();
        assert_eq!(record.category, "network");
    }

    #[test]
    fn sla_profiles_are_tenant_keyed() {
        let registry = ConfigRegistry::new();
        registry.receive(
            &json!({"sla_profile": {
                "fq_name": ["default-domain", "t1", "gold"],
                "sla_params": "latency=5ms"
            }}),
            true,
        );
        assert!(registry.sla_profile_record("t1/gold").is_some());
        assert!(registry.sla_profile_record("gold").is_none());
    }

    #[test]
    fn message_rule_lookup_prefers_exact_then_longest_pattern() {
        let registry = ConfigRegistry::new();
        for (name, category) in [
            ("RT_FLOW_APPTRACK_SESSION_CLOSE", "exact"),
            ("RT_FLOW_APPTRACK.*", "short"),
            ("RT_FLOW_APPTRACK_SESSION.*", "long"),
        ] {
            registry.receive(
                &json!({"message_rule": {
                    "fq_name": ["default-domain", "t1", name],
                    "tagged_fields": [category],
                    "process_and_store": true
                }}),
                true,
            );
        }
        let rule = registry.message_rule("RT_FLOW_APPTRACK_SESSION_CLOSE").unwrap();
        assert_eq!(rule.name, "RT_FLOW_APPTRACK_SESSION_CLOSE");
        // no exact match: the longest matching pattern wins
        let rule = registry.message_rule("RT_FLOW_APPTRACK_SESSION_VOL_UPDATE").unwrap();
        assert_eq!(rule.name, "RT_FLOW_APPTRACK_SESSION.*");
        assert!(registry.message_rule("OTHER_EVENT").is_none());
    }

    #[test]
    fn malformed_event_does_not_poison_the_feed() {
        let registry = ConfigRegistry::new();
        registry.receive(&json!({"hostname_record": {"fq_name": "not-an-array"}}), true);
        registry.receive(&json!({"hostname_record": 42}), true);
        registry.receive(&json!("not an object"), true);
        registry.receive(&hostname_event("dev1", "siteA", "10.0.0.0/24"), true);
        assert!(registry.hostname_record("dev1").is_some());
    }

    #[test]
    fn tenant_record_dscp_maps() {
        let registry = ConfigRegistry::new();
        registry.receive(
            &json!({"tenant_record": {
                "fq_name": ["default-domain", "t1"],
                "tenant": "t1",
                "dscp_map": {
                    "ipv4": [{"dscp_value": "46", "alias_code": "EF"}],
                    "ipv6": [{"dscp_value": "0", "alias_code": "BE"}]
                }
            }}),
            true,
        );
        let record = registry.tenant_record("t1").unwrap();
        assert_eq!(record.dscp_map_ipv4.get("46").map(String::as_str), Some("EF"));
        assert_eq!(record.dscp_map_ipv6.get("0").map(String::as_str), Some("BE"));
    }
}
