use ipnet::Ipv4Net;
use log::warn;
use prefix_trie::PrefixMap;

use super::cache::CacheEntry;
use crate::zebra::codec::RgatePair;
use crate::zebra::LookupClient;

/// Prefixes the daemon reported as installed through a stale recursive
/// gateway. Lives for one IPv4 scan pass.
pub struct DesyncSet {
    map: PrefixMap<Ipv4Net, ()>,
}

impl DesyncSet {
    pub fn new() -> Self {
        DesyncSet {
            map: PrefixMap::new(),
        }
    }

    /// Idempotent; a daemon repeating itself is worth a warning but
    /// nothing more
    pub fn insert(&mut self, prefix: Ipv4Net) {
        if self.map.insert(prefix, ()).is_some() {
            warn!("Duplicate prefix {} in verify reply", prefix);
        }
    }

    /// Does any reported prefix cover this RIB prefix
    pub fn covers(&self, prefix: &Ipv4Net) -> bool {
        self.map.get_lpm(prefix).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.map.iter().next().is_none()
    }
}

/// One verify record per still-valid cache entry: the cached nexthop and
/// the gateway its FIB entry was installed with. Only the first IPv4 hop
/// matters; that is the one the FIB install used.
pub(crate) fn harvest_pairs(previous: &PrefixMap<Ipv4Net, CacheEntry>) -> Vec<RgatePair> {
    previous
        .iter()
        .filter(|(_, entry)| entry.valid)
        .filter_map(|(prefix, entry)| {
            entry.first_gate_v4().map(|rgate| RgatePair {
                gate: prefix.addr(),
                rgate,
            })
        })
        .collect()
}

/// Feed the previous generation to the daemon and collect the prefixes it
/// reports out of sync. With the session down the set stays empty and no
/// refresh is forced this cycle.
pub(crate) async fn verify_rgates(
    client: &mut LookupClient,
    previous: &PrefixMap<Ipv4Net, CacheEntry>,
) -> DesyncSet {
    let mut desync = DesyncSet::new();
    if !client.is_connected() {
        return desync;
    }
    let pairs = harvest_pairs(previous);
    client
        .verify_rgates_v4(&pairs, |prefix| desync.insert(prefix))
        .await;
    desync
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zebra::codec::Nexthop;
    use std::net::Ipv4Addr;

    fn host(addr: &str) -> Ipv4Net {
        Ipv4Net::new(addr.parse().unwrap(), 32).unwrap()
    }

    #[test]
    fn test_harvest_takes_first_gate_of_valid_entries() {
        let mut previous: PrefixMap<Ipv4Net, CacheEntry> = PrefixMap::new();
        previous.insert(
            host("203.0.113.9"),
            CacheEntry::resolved(
                10,
                vec![
                    Nexthop::Ifindex(2),
                    Nexthop::Ipv4(Ipv4Addr::new(198, 51, 100, 1)),
                    Nexthop::Ipv4(Ipv4Addr::new(198, 51, 100, 2)),
                ],
            ),
        );
        // invalid entries and entries without an IPv4 gate are skipped
        previous.insert(host("203.0.113.10"), CacheEntry::unresolved());
        previous.insert(
            host("203.0.113.11"),
            CacheEntry::resolved(5, vec![Nexthop::Ifindex(4)]),
        );

        let pairs = harvest_pairs(&previous);
        assert_eq!(
            pairs,
            vec![RgatePair {
                gate: Ipv4Addr::new(203, 0, 113, 9),
                rgate: Ipv4Addr::new(198, 51, 100, 1),
            }]
        );
    }

    #[test]
    fn test_desync_set_covers_by_longest_match() {
        let mut desync = DesyncSet::new();
        desync.insert("10.3.0.0/16".parse().unwrap());
        assert!(desync.covers(&"10.3.0.0/16".parse().unwrap()));
        assert!(desync.covers(&"10.3.7.0/24".parse().unwrap()));
        assert!(!desync.covers(&"10.4.0.0/16".parse().unwrap()));
    }

    #[test]
    fn test_desync_set_duplicates_are_idempotent() {
        let mut desync = DesyncSet::new();
        desync.insert("10.3.0.0/16".parse().unwrap());
        desync.insert("10.3.0.0/16".parse().unwrap());
        assert!(desync.covers(&"10.3.0.0/16".parse().unwrap()));
        assert_eq!(desync.map.iter().count(), 1);
    }
}
