mod file;

use std::io::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use ipnet::IpNet;

use crate::rib::Family;
use crate::scan::connected::ConnectedAddr;

/// Parse a TOML config file and return a ScanConfig
pub fn from_file(path: &str) -> Result<ScanConfig> {
    let spec = file::ScanConfigSpec::from_file(path)?;
    Ok(ScanConfig::from_spec(spec))
}

/// In-memory daemon configuration, with missing spec items defaulted
#[derive(Debug)]
pub struct ScanConfig {
    pub router_id: Ipv4Addr,
    pub default_as: u32,
    pub zserv_path: PathBuf,
    pub scan_time: u16,
    pub import_time: u16,
    pub import_check: bool,
    pub dampening: Vec<Family>,
    pub peers: Vec<PeerConfig>,
    pub static_routes: Vec<StaticRouteConfig>,
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug)]
pub struct PeerConfig {
    pub remote_ip: IpAddr,
    pub remote_as: u32,
    pub local_as: Option<u32>,
    pub ttl: u8,
    pub families: Vec<Family>,
}

#[derive(Debug)]
pub struct StaticRouteConfig {
    pub prefix: IpNet,
    pub backdoor: bool,
    pub route_map: Option<String>,
}

#[derive(Debug)]
pub struct InterfaceConfig {
    pub name: String,
    pub loopback: bool,
    pub addresses: Vec<IpNet>,
}

impl InterfaceConfig {
    /// Connected address events this interface would have delivered
    pub fn connected_addrs(&self) -> Vec<ConnectedAddr> {
        self.addresses
            .iter()
            .map(|address| ConnectedAddr {
                ifname: self.name.clone(),
                loopback: self.loopback,
                address: *address,
            })
            .collect()
    }
}

impl ScanConfig {
    fn from_spec(spec: file::ScanConfigSpec) -> Self {
        let peers = spec
            .peers
            .iter()
            .map(|peer| PeerConfig {
                remote_ip: peer.remote_ip,
                remote_as: peer.remote_as,
                local_as: peer.local_as,
                ttl: peer.ttl,
                families: peer.families.clone(),
            })
            .collect();
        let static_routes = spec
            .static_routes
            .iter()
            .map(|route| StaticRouteConfig {
                prefix: route.prefix,
                backdoor: route.backdoor,
                route_map: route.route_map.clone(),
            })
            .collect();
        let interfaces = spec
            .interfaces
            .iter()
            .map(|ifp| InterfaceConfig {
                name: ifp.name.clone(),
                loopback: ifp.loopback,
                addresses: ifp.addresses.clone(),
            })
            .collect();

        Self {
            router_id: spec.router_id,
            default_as: spec.default_as,
            zserv_path: spec.zserv_path,
            scan_time: spec.scan_time,
            import_time: spec.import_time,
            import_check: spec.import_check,
            dampening: spec.dampening,
            peers,
            static_routes,
            interfaces,
        }
    }

    #[cfg(test)]
    pub(crate) fn test_default() -> Self {
        ScanConfig {
            router_id: Ipv4Addr::new(1, 1, 1, 1),
            default_as: 65000,
            zserv_path: PathBuf::from("/nonexistent/zserv.api"),
            scan_time: crate::scan::BGP_SCAN_INTERVAL_DEFAULT,
            import_time: crate::scan::BGP_IMPORT_INTERVAL_DEFAULT,
            import_check: false,
            dampening: Vec::new(),
            peers: Vec::new(),
            static_routes: Vec::new(),
            interfaces: Vec::new(),
        }
    }
}
