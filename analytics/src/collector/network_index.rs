//! Per-(tenant, VPN) IP range index used to resolve peer locations.
//!
//! Overlapping ranges are expected: a site /24 typically nests under a
//! region /16. `find` therefore returns the smallest enclosing range, and
//! callers pass their own location to exclude so a device never resolves a
//! peer into its own site.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct IpNetwork {
    begin: u32,
    end: u32,
    location: String,
}

/// Ordered CIDR ranges keyed by `"<tenant>::<vpn>"`.
#[derive(Debug, Default)]
pub struct NetworkIndex {
    networks: RwLock<HashMap<String, Vec<IpNetwork>>>,
}

impl NetworkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `cidr` (either `addr/len` or `addr/dotted-mask`) tagged with
    /// `location`. Returns false on an unparseable network.
    pub fn add(&self, key: &str, cidr: &str, location: &str) -> bool {
        let Some((begin, end)) = parse_cidr(cidr) else {
            warn!(key, cidr, "ignoring unparseable network range");
            return false;
        };
        let net = IpNetwork {
            begin,
            end,
            location: location.to_string(),
        };
        let mut networks = self.networks.write().expect("network index lock poisoned");
        let ranges = networks.entry(key.to_string()).or_default();
        // keep the vector ordered by range start
        let pos = ranges.partition_point(|n| n.begin <= begin);
        ranges.insert(pos, net);
        debug!(key, cidr, location, "added network range");
        true
    }

    /// Location of the smallest range containing `ip` under `key`, skipping
    /// ranges tagged `exclude_location`. Empty string when nothing matches.
    pub fn find(&self, ip: &str, key: &str, exclude_location: &str) -> String {
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            return String::new();
        };
        let target = u32::from(addr);
        let networks = self.networks.read().expect("network index lock poisoned");
        let Some(ranges) = networks.get(key) else {
            debug!(key, "tenant::vpn not present in network index");
            return String::new();
        };
        let idx = ranges.partition_point(|n| n.begin <= target);
        let mut best: Option<&IpNetwork> = None;
        let mut min_span = u32::MAX;
        // every range starting at or before the target is a candidate;
        // overlap means we cannot stop at the first hit
        for candidate in ranges[..idx].iter().rev() {
            if target < candidate.begin || target > candidate.end {
                continue;
            }
            let span = candidate.end - candidate.begin;
            if span < min_span && candidate.location != exclude_location {
                best = Some(candidate);
                min_span = span;
            }
        }
        best.map(|n| n.location.clone()).unwrap_or_default()
    }

    /// Removes every range tagged with `location`, across all keys.
    pub fn purge(&self, location: &str) {
        let mut networks = self.networks.write().expect("network index lock poisoned");
        for ranges in networks.values_mut() {
            ranges.retain(|n| n.location != location);
        }
        debug!(location, "purged location from network index");
    }

    pub fn range_count(&self, key: &str) -> usize {
        self.networks
            .read()
            .expect("network index lock poisoned")
            .get(key)
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

fn parse_cidr(cidr: &str) -> Option<(u32, u32)> {
    let (addr_part, mask_part) = cidr.trim().split_once('/')?;
    let addr = u32::from(addr_part.parse::<Ipv4Addr>().ok()?);
    let mask = if let Ok(len) = mask_part.parse::<u8>() {
        if len > 32 {
            return None;
        }
        if len == 0 {
            0
        } else {
            u32::MAX << (32 - len as u32)
        }
    } else {
        u32::from(mask_part.parse::<Ipv4Addr>().ok()?)
    };
    let begin = addr & mask;
    let end = begin | !mask;
    Some((begin, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "t::v";

    #[test]
    fn round_trip_add_find_purge() {
        let index = NetworkIndex::new();
        assert!(index.add(KEY, "10.0.0.0/24", "siteA"));
        assert_eq!(index.find("10.0.0.5", KEY, ""), "siteA");
        index.purge("siteA");
        assert_eq!(index.find("10.0.0.5", KEY, ""), "");
    }

    #[test]
    fn most_specific_range_wins() {
        let index = NetworkIndex::new();
        index.add(KEY, "10.0.0.0/8", "regionA");
        index.add(KEY, "10.1.0.0/16", "siteX");
        index.add(KEY, "10.1.2.0/24", "rackY");
        assert_eq!(index.find("10.1.2.7", KEY, ""), "rackY");
        // excluding the most specific match falls back to the next larger range
        assert_eq!(index.find("10.1.2.7", KEY, "rackY"), "siteX");
        // outside the nested ranges only the /8 applies
        assert_eq!(index.find("10.200.0.1", KEY, ""), "regionA");
    }

    #[test]
    fn dotted_mask_form_is_accepted() {
        let index = NetworkIndex::new();
        assert!(index.add(KEY, "192.168.1.0/255.255.255.0", "lan"));
        assert_eq!(index.find("192.168.1.77", KEY, ""), "lan");
        assert_eq!(index.find("192.168.2.1", KEY, ""), "");
    }

    #[rstest::rstest]
    #[case("10.0.0.0")]
    #[case("10.0.0.0/33")]
    #[case("banana/8")]
    #[case("10.0.0.0/255.255.banana.0")]
    fn unparseable_ranges_are_ignored(#[case] cidr: &str) {
        let index = NetworkIndex::new();
        assert!(!index.add(KEY, cidr, "x"));
        assert_eq!(index.range_count(KEY), 0);
    }

    #[test]
    fn keys_are_isolated() {
        let index = NetworkIndex::new();
        index.add("t::red", "10.0.0.0/24", "siteA");
        assert_eq!(index.find("10.0.0.1", "t::blue", ""), "");
    }

    #[test]
    fn purge_spans_all_keys() {
        let index = NetworkIndex::new();
        index.add("t::red", "10.0.0.0/24", "siteA");
        index.add("t::blue", "10.9.0.0/24", "siteA");
        index.add("t::blue", "10.8.0.0/24", "siteB");
        index.purge("siteA");
        assert_eq!(index.range_count("t::red"), 0);
        assert_eq!(index.range_count("t::blue"), 1);
        assert_eq!(index.find("10.8.0.1", "t::blue", ""), "siteB");
    }

    #[test]
    fn excluded_location_is_never_returned() {
        let index = NetworkIndex::new();
        index.add(KEY, "10.0.0.0/24", "own");
        assert_eq!(index.find("10.0.0.5", KEY, "own"), "");
    }
}
