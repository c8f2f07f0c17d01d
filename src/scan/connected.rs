use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::{Prefix, PrefixMap};

use crate::utils::ipv6_link_local;

/// A connected address event from the interface pipeline
#[derive(Clone, Debug)]
pub struct ConnectedAddr {
    pub ifname: String,
    pub loopback: bool,
    /// Interface address with its mask, e.g. 192.0.2.1/24
    pub address: IpNet,
}

#[derive(Debug)]
struct ConnectedRef {
    refcnt: u32,
}

/// Refcounted set of connected networks for one family. The same network
/// may be reachable over several interfaces or secondary addresses; the
/// entry stays until the last reference is gone.
pub struct ConnectedTable<P: Prefix> {
    map: PrefixMap<P, ConnectedRef>,
}

impl<P: Prefix + Copy + PartialEq> ConnectedTable<P> {
    fn new() -> Self {
        ConnectedTable {
            map: PrefixMap::new(),
        }
    }

    fn add(&mut self, prefix: P) {
        match self.map.get_mut(&prefix) {
            Some(entry) => entry.refcnt += 1,
            None => {
                self.map.insert(prefix, ConnectedRef { refcnt: 1 });
            }
        }
    }

    fn delete(&mut self, prefix: P) {
        if let Some(entry) = self.map.get_mut(&prefix) {
            entry.refcnt -= 1;
            if entry.refcnt == 0 {
                self.map.remove(&prefix);
            }
        }
    }

    /// Longest connected prefix covering the address, if any
    fn covering(&self, host: &P) -> Option<&P> {
        self.map.get_lpm(host).map(|(prefix, _)| prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.map.iter().map(|(prefix, _)| prefix)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.iter().count()
    }
}

fn host_v4(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::new(addr, 32).expect("/32 is a valid IPv4 prefix length")
}

fn host_v6(addr: Ipv6Addr) -> Ipv6Net {
    Ipv6Net::new(addr, 128).expect("/128 is a valid IPv6 prefix length")
}

/// Both per-family connected tables plus the raw interface address list
/// used for the local-address check.
pub struct ConnectedTables {
    pub(crate) v4: ConnectedTable<Ipv4Net>,
    pub(crate) v6: ConnectedTable<Ipv6Net>,
    addrs: Vec<IpAddr>,
}

impl ConnectedTables {
    pub fn new() -> Self {
        ConnectedTables {
            v4: ConnectedTable::new(),
            v6: ConnectedTable::new(),
            addrs: Vec::new(),
        }
    }

    /// The network an address event maps to, or `None` for addresses the
    /// tables deliberately ignore
    fn network_of(ifc: &ConnectedAddr) -> Option<IpNet> {
        if ifc.loopback {
            return None;
        }
        match ifc.address {
            IpNet::V4(addr) => {
                let network = addr.trunc();
                if network.addr().is_unspecified() {
                    return None;
                }
                Some(IpNet::V4(network))
            }
            IpNet::V6(addr) => {
                let network = addr.trunc();
                if network.addr().is_unspecified() {
                    return None;
                }
                if ipv6_link_local(&network.addr()) {
                    return None;
                }
                Some(IpNet::V6(network))
            }
        }
    }

    pub fn add(&mut self, ifc: &ConnectedAddr) {
        self.addrs.push(ifc.address.addr());
        match Self::network_of(ifc) {
            Some(IpNet::V4(network)) => self.v4.add(network),
            Some(IpNet::V6(network)) => self.v6.add(network),
            None => (),
        }
    }

    pub fn delete(&mut self, ifc: &ConnectedAddr) {
        let addr = ifc.address.addr();
        if let Some(pos) = self.addrs.iter().position(|known| *known == addr) {
            self.addrs.remove(pos);
        }
        match Self::network_of(ifc) {
            Some(IpNet::V4(network)) => self.v4.delete(network),
            Some(IpNet::V6(network)) => self.v6.delete(network),
            None => (),
        }
    }

    pub fn onlink_v4(&self, addr: Ipv4Addr) -> bool {
        self.v4.covering(&host_v4(addr)).is_some()
    }

    /// An IPv6 nexthop paired with a link-local address, or itself
    /// link-local, is on-link by definition.
    pub fn onlink_v6(&self, global: Ipv6Addr, link_local: Option<Ipv6Addr>) -> bool {
        if link_local.is_some() || ipv6_link_local(&global) {
            return true;
        }
        self.v6.covering(&host_v6(global)).is_some()
    }

    /// Both addresses fall inside the same connected network
    pub fn same_network_v4(&self, a: Ipv4Addr, b: Ipv4Addr) -> bool {
        match (self.v4.covering(&host_v4(a)), self.v4.covering(&host_v4(b))) {
            (Some(net_a), Some(net_b)) => net_a == net_b,
            _ => false,
        }
    }

    /// The address is one of this router's own interface addresses
    pub fn nexthop_self_v4(&self, addr: Ipv4Addr) -> bool {
        self.addrs.iter().any(|known| *known == IpAddr::V4(addr))
    }

    /// Drop every table at shutdown
    pub fn finish(&mut self) {
        self.v4 = ConnectedTable::new();
        self.v6 = ConnectedTable::new();
        self.addrs.clear();
    }
}
