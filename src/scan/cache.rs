use prefix_trie::{Prefix, PrefixMap};

use crate::zebra::codec::Nexthop;

/// One cached resolution of a BGP nexthop against the IGP.
///
/// An unreachable nexthop is cached too, as an invalid entry with no next
/// hops, so repeat lookups within one scan are also spared a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheEntry {
    pub valid: bool,
    pub metric: u32,
    pub nexthops: Vec<Nexthop>,
    pub changed: bool,
    pub metric_changed: bool,
}

impl CacheEntry {
    pub fn resolved(metric: u32, nexthops: Vec<Nexthop>) -> Self {
        CacheEntry {
            valid: true,
            metric,
            nexthops,
            changed: false,
            metric_changed: false,
        }
    }

    /// Sentinel for a nexthop the daemon had no route for
    pub fn unresolved() -> Self {
        CacheEntry::default()
    }

    /// Positional comparison of the nexthop lists; wire order is preserved
    /// on decode, so index i of one generation lines up with index i of
    /// the next.
    pub fn differs_from(&self, other: &CacheEntry) -> bool {
        self.nexthops != other.nexthops
    }

    /// The gateway the FIB install would use
    pub fn first_gate_v4(&self) -> Option<std::net::Ipv4Addr> {
        self.nexthops.iter().find_map(|nexthop| nexthop.gate_v4())
    }
}

/// Double-buffered per-family nexthop cache. One table is active and
/// collects the running scan's resolutions; the other still holds the
/// previous generation for change comparison, and is reset once the scan
/// completes.
pub struct NexthopCache<P: Prefix> {
    tables: [PrefixMap<P, CacheEntry>; 2],
    active: usize,
}

impl<P: Prefix + Copy> NexthopCache<P> {
    pub fn new() -> Self {
        NexthopCache {
            tables: [PrefixMap::new(), PrefixMap::new()],
            active: 0,
        }
    }

    pub fn swap(&mut self) {
        self.active ^= 1;
    }

    pub fn active(&self) -> &PrefixMap<P, CacheEntry> {
        &self.tables[self.active]
    }

    pub fn previous(&self) -> &PrefixMap<P, CacheEntry> {
        &self.tables[self.active ^ 1]
    }

    pub fn get(&self, key: &P) -> Option<&CacheEntry> {
        self.tables[self.active].get(key)
    }

    pub fn insert(&mut self, key: P, entry: CacheEntry) {
        self.tables[self.active].insert(key, entry);
    }

    pub fn lookup_previous(&self, key: &P) -> Option<&CacheEntry> {
        self.tables[self.active ^ 1].get(key)
    }

    /// Release the previous generation once a scan is done with it
    pub fn reset_previous(&mut self) {
        self.tables[self.active ^ 1] = PrefixMap::new();
    }

    /// Release both generations at shutdown
    pub fn finish(&mut self) {
        self.tables[0] = PrefixMap::new();
        self.tables[1] = PrefixMap::new();
    }
}
