use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use bgp_rs::{AFI, SAFI};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use log::debug;
use serde::{self, Deserialize, Deserializer};

use crate::config::ScanConfig;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Family {
    pub afi: AFI,
    pub safi: SAFI,
}

impl Family {
    pub fn new(afi: AFI, safi: SAFI) -> Self {
        Self { afi, safi }
    }

    pub fn v4_unicast() -> Self {
        Self::new(AFI::IPV4, SAFI::Unicast)
    }

    pub fn v6_unicast() -> Self {
        Self::new(AFI::IPV6, SAFI::Unicast)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.afi, self.safi)
    }
}

impl Ord for Family {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.afi as u16, self.safi as u8).cmp(&(other.afi as u16, other.safi as u8))
    }
}

impl PartialOrd for Family {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'de> Deserialize<'de> for Family {
    fn deserialize<D>(deserializer: D) -> Result<Family, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let parts: Vec<&str> = s.trim().split_whitespace().collect();
        if parts.len() != 2 {
            return Err(serde::de::Error::custom(format!(
                "Incorrect family format: '{}'",
                s
            )));
        }
        let afi = match parts[0] {
            "ipv4" => AFI::IPV4,
            "ipv6" => AFI::IPV6,
            family => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported AFI: '{}'",
                    family
                )))
            }
        };
        let safi = match parts[1] {
            "unicast" => SAFI::Unicast,
            "multicast" => SAFI::Multicast,
            sfamily => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported SAFI: '{}'",
                    sfamily
                )))
            }
        };
        Ok(Family::new(afi, safi))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            PeerStatus::Idle => "Idle",
            PeerStatus::Connect => "Connect",
            PeerStatus::Active => "Active",
            PeerStatus::OpenSent => "OpenSent",
            PeerStatus::OpenConfirm => "OpenConfirm",
            PeerStatus::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

/// The slice of peer state the scanner reads: session standing, the
/// single-hop test and the negotiated families.
#[derive(Clone, Debug)]
pub struct Peer {
    pub remote_ip: std::net::IpAddr,
    pub remote_as: u32,
    pub local_as: u32,
    pub ttl: u8,
    pub status: PeerStatus,
    pub families: Vec<Family>,
}

impl Peer {
    // Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Peer {} remote_as={} {}>",
            self.remote_ip, self.remote_as, self.status
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteType {
    Bgp,
    Connected,
    Static,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteSubType {
    Normal,
    Static,
    Aggregate,
}

/// Nexthop attribute of a received route. IPv6 routes may carry a
/// link-local address alongside the global one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteNexthop {
    V4(Ipv4Addr),
    V6 {
        global: Ipv6Addr,
        link_local: Option<Ipv6Addr>,
    },
}

impl RouteNexthop {
    pub fn v4(&self) -> Option<Ipv4Addr> {
        match self {
            RouteNexthop::V4(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// Flap damping record owned by the damping machinery; the scanner only
/// cares whether a route carries one.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DampInfo {
    pub penalty: u32,
}

/// One path in the BGP RIB as the scanner sees it
#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub route_type: RouteType,
    pub sub_type: RouteSubType,
    pub peer: Arc<Peer>,
    pub nexthop: RouteNexthop,
    /// Nexthop currently resolves through the IGP
    pub valid: bool,
    /// Resolution changed this scan; forces a forwarding refresh
    pub igp_changed: bool,
    pub igp_metric: u32,
    pub damp_info: Option<DampInfo>,
}

impl RouteEntry {
    pub fn new(peer: Arc<Peer>, nexthop: RouteNexthop) -> Self {
        RouteEntry {
            route_type: RouteType::Bgp,
            sub_type: RouteSubType::Normal,
            peer,
            nexthop,
            valid: false,
            igp_changed: false,
            igp_metric: 0,
            damp_info: None,
        }
    }
}

/// A network statement subject to periodic IGP import checking
#[derive(Clone, Debug)]
pub struct StaticRoute {
    pub backdoor: bool,
    pub valid: bool,
    pub igp_metric: u32,
    pub igp_nexthop: Ipv4Addr,
    pub route_map: Option<String>,
}

impl StaticRoute {
    pub fn new(backdoor: bool, route_map: Option<String>) -> Self {
        StaticRoute {
            backdoor,
            valid: false,
            igp_metric: 0,
            igp_nexthop: Ipv4Addr::UNSPECIFIED,
            route_map,
        }
    }
}

/// Route-side effects the scanner and importer trigger in the enclosing
/// speaker. The daemon installs a logging implementation; an embedding
/// speaker wires these into its aggregate, damping and decision machinery.
pub trait RouteHooks {
    fn aggregate_increment(&mut self, family: Family, prefix: IpNet, entry: &RouteEntry);
    fn aggregate_decrement(&mut self, family: Family, prefix: IpNet, entry: &RouteEntry);
    /// Re-evaluate a damped route; true means it reactivated
    fn damp_scan(&mut self, family: Family, prefix: IpNet, entry: &mut RouteEntry) -> bool;
    /// Run the decision process for a prefix
    fn process(&mut self, family: Family, prefix: IpNet);
    fn max_prefix_overflow(&mut self, peer: &Peer, family: Family);
    fn static_update(&mut self, family: Family, prefix: IpNet, route: &StaticRoute);
    fn static_withdraw(&mut self, family: Family, prefix: IpNet);
}

/// Default hooks for the standalone daemon: trace what the surrounding
/// speaker would have been asked to do.
#[derive(Debug, Default)]
pub struct LogHooks;

impl RouteHooks for LogHooks {
    fn aggregate_increment(&mut self, family: Family, prefix: IpNet, _entry: &RouteEntry) {
        debug!("[{}] {} became valid, aggregates incremented", family, prefix);
    }

    fn aggregate_decrement(&mut self, family: Family, prefix: IpNet, _entry: &RouteEntry) {
        debug!("[{}] {} became invalid, aggregates decremented", family, prefix);
    }

    fn damp_scan(&mut self, _family: Family, _prefix: IpNet, _entry: &mut RouteEntry) -> bool {
        false
    }

    fn process(&mut self, family: Family, prefix: IpNet) {
        debug!("[{}] processing {}", family, prefix);
    }

    fn max_prefix_overflow(&mut self, peer: &Peer, family: Family) {
        debug!("[{}] maximum prefix check for {}", family, peer);
    }

    fn static_update(&mut self, family: Family, prefix: IpNet, route: &StaticRoute) {
        debug!(
            "[{}] static update {} [metric {} nexthop {}]",
            family, prefix, route.igp_metric, route.igp_nexthop
        );
    }

    fn static_withdraw(&mut self, family: Family, prefix: IpNet) {
        debug!("[{}] static withdraw {}", family, prefix);
    }
}

/// One BGP instance: the tables the scanner walks and the per-family
/// flags that steer it. Peering and route ingestion live elsewhere; this
/// is the shape they leave behind for scanning.
#[derive(Debug)]
pub struct Bgp {
    pub router_id: Ipv4Addr,
    pub local_as: u32,
    pub peers: Vec<Arc<Peer>>,
    pub rib4: BTreeMap<Ipv4Net, Vec<RouteEntry>>,
    pub rib6: BTreeMap<Ipv6Net, Vec<RouteEntry>>,
    /// Network statements per family, fed to the import engine
    pub statics: BTreeMap<Family, BTreeMap<IpNet, StaticRoute>>,
    pub import_check: bool,
    /// Families with flap damping configured
    pub dampening: HashSet<Family>,
}

impl Default for Bgp {
    fn default() -> Self {
        Bgp {
            router_id: Ipv4Addr::UNSPECIFIED,
            local_as: 0,
            peers: Vec::new(),
            rib4: BTreeMap::new(),
            rib6: BTreeMap::new(),
            statics: BTreeMap::new(),
            import_check: false,
            dampening: HashSet::new(),
        }
    }
}

impl Bgp {
    pub fn from_config(config: &ScanConfig) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|peer| {
                Arc::new(Peer {
                    remote_ip: peer.remote_ip,
                    remote_as: peer.remote_as,
                    local_as: peer.local_as.unwrap_or(config.default_as),
                    ttl: peer.ttl,
                    status: PeerStatus::Idle,
                    families: peer.families.clone(),
                })
            })
            .collect();

        let mut statics: BTreeMap<Family, BTreeMap<IpNet, StaticRoute>> = BTreeMap::new();
        for route in &config.static_routes {
            let family = match route.prefix {
                IpNet::V4(_) => Family::v4_unicast(),
                IpNet::V6(_) => Family::v6_unicast(),
            };
            statics.entry(family).or_insert_with(BTreeMap::new).insert(
                route.prefix,
                StaticRoute::new(route.backdoor, route.route_map.clone()),
            );
        }

        Bgp {
            router_id: config.router_id,
            local_as: config.default_as,
            peers,
            rib4: BTreeMap::new(),
            rib6: BTreeMap::new(),
            statics,
            import_check: config.import_check,
            dampening: config.dampening.iter().cloned().collect(),
        }
    }

    pub fn insert_v4(&mut self, prefix: Ipv4Net, entry: RouteEntry) {
        self.rib4.entry(prefix).or_insert_with(Vec::new).push(entry);
    }

    pub fn insert_v6(&mut self, prefix: Ipv6Net, entry: RouteEntry) {
        self.rib6.entry(prefix).or_insert_with(Vec::new).push(entry);
    }

    pub fn insert_static(&mut self, family: Family, prefix: IpNet, route: StaticRoute) {
        self.statics
            .entry(family)
            .or_insert_with(BTreeMap::new)
            .insert(prefix, route);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_ordering() {
        let mut families = vec![
            Family::v6_unicast(),
            Family::new(AFI::IPV4, SAFI::Multicast),
            Family::v4_unicast(),
        ];
        families.sort();
        assert_eq!(
            families,
            vec![
                Family::v4_unicast(),
                Family::new(AFI::IPV4, SAFI::Multicast),
                Family::v6_unicast(),
            ]
        );
    }

    #[test]
    fn test_peer_sort() {
        assert!(testing::ebgp_single_hop_peer().is_ebgp());
        assert!(!testing::ibgp_peer().is_ebgp());
    }

    #[test]
    fn test_deserialize_family() {
        use serde::de::value::{Error, StrDeserializer};
        use serde::de::IntoDeserializer;

        let deserializer: StrDeserializer<Error> = "ipv4 unicast".into_deserializer();
        let family = Family::deserialize(deserializer).unwrap();
        assert_eq!(family, Family::v4_unicast());

        let deserializer: StrDeserializer<Error> = "ipv6 multicast".into_deserializer();
        let family = Family::deserialize(deserializer).unwrap();
        assert_eq!(family, Family::new(AFI::IPV6, SAFI::Multicast));

        let deserializer: StrDeserializer<Error> = "l2vpn evpn".into_deserializer();
        assert!(Family::deserialize(deserializer).is_err());
    }
}
