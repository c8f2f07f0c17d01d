use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use ipnet::IpNet;
use serde::Deserialize;

use crate::rib::Family;

struct Defaults {}

impl Defaults {
    fn zserv_path() -> PathBuf {
        PathBuf::from("/var/run/zserv.api")
    }

    fn scan_time() -> u16 {
        crate::scan::BGP_SCAN_INTERVAL_DEFAULT
    }

    fn import_time() -> u16 {
        crate::scan::BGP_IMPORT_INTERVAL_DEFAULT
    }

    fn ttl() -> u8 {
        255
    }

    fn families() -> Vec<Family> {
        vec![Family::v4_unicast(), Family::v6_unicast()]
    }
}

/// Config (toml) representation of a peer the scanner should know about
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerSpec {
    pub(super) remote_ip: IpAddr,
    pub(super) remote_as: u32,
    pub(super) local_as: Option<u32>,

    // Single-hop eBGP peers get the on-link shortcut
    #[serde(default = "Defaults::ttl")]
    pub(super) ttl: u8,

    // AFI/SAFI families negotiated with this peer
    #[serde(default = "Defaults::families")]
    pub(super) families: Vec<Family>,
}

/// Config (toml) representation of a network statement
#[derive(Clone, Debug, Deserialize)]
pub(super) struct StaticRouteSpec {
    pub(super) prefix: IpNet,

    // Backdoor routes are never import-checked
    #[serde(default)]
    pub(super) backdoor: bool,

    pub(super) route_map: Option<String>,
}

/// Config (toml) representation of a local interface and its addresses
#[derive(Clone, Debug, Deserialize)]
pub(super) struct InterfaceSpec {
    pub(super) name: String,

    #[serde(default)]
    pub(super) loopback: bool,

    #[serde(default = "Vec::new")]
    pub(super) addresses: Vec<IpNet>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ScanConfigSpec {
    pub(super) router_id: Ipv4Addr,
    pub(super) default_as: u32,

    // Stream socket of the routing daemon's lookup service
    #[serde(default = "Defaults::zserv_path")]
    pub(super) zserv_path: PathBuf,

    // Background scanner interval, seconds
    #[serde(default = "Defaults::scan_time")]
    pub(super) scan_time: u16,

    // Static import re-check interval, seconds
    #[serde(default = "Defaults::import_time")]
    pub(super) import_time: u16,

    // Withdraw network statements absent from the IGP
    #[serde(default)]
    pub(super) import_check: bool,

    // Families with flap damping configured
    #[serde(default = "Vec::new")]
    pub(super) dampening: Vec<Family>,

    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerSpec>,

    #[serde(default = "Vec::new")]
    pub(super) static_routes: Vec<StaticRouteSpec>,

    #[serde(default = "Vec::new")]
    pub(super) interfaces: Vec<InterfaceSpec>,
}

impl ScanConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ScanConfigSpec = toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> io::Result<()> {
        if self.scan_time < 5 || self.scan_time > 60 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("scan_time {} outside <5-60>", self.scan_time),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_rs::{AFI, SAFI};

    const EXAMPLE: &str = r#"
router_id = "1.1.1.1"
default_as = 65000
zserv_path = "/run/zserv.api"
scan_time = 30
import_check = true
dampening = ["ipv4 unicast"]

[[peers]]
remote_ip = "192.0.2.1"
remote_as = 65001
ttl = 1
families = ["ipv4 unicast"]

[[peers]]
remote_ip = "10.0.0.2"
remote_as = 65000

[[static_routes]]
prefix = "198.51.100.0/24"

[[static_routes]]
prefix = "203.0.113.0/24"
backdoor = true
route_map = "import-map"

[[interfaces]]
name = "eth0"
addresses = ["192.0.2.7/24", "2001:db8:1::1/64"]

[[interfaces]]
name = "lo"
loopback = true
addresses = ["127.0.0.1/8"]
"#;

    #[test]
    fn test_parse_config() {
        let config: ScanConfigSpec = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.router_id, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(config.default_as, 65000);
        assert_eq!(config.scan_time, 30);
        assert_eq!(config.import_time, 15);
        assert!(config.import_check);
        assert_eq!(config.dampening, vec![Family::v4_unicast()]);

        assert_eq!(config.peers.len(), 2);
        let ebgp = &config.peers[0];
        assert_eq!(ebgp.ttl, 1);
        assert_eq!(ebgp.families, vec![Family::new(AFI::IPV4, SAFI::Unicast)]);
        let ibgp = &config.peers[1];
        assert_eq!(ibgp.ttl, 255);
        assert_eq!(ibgp.families.len(), 2);

        assert_eq!(config.static_routes.len(), 2);
        assert!(config.static_routes[1].backdoor);
        assert_eq!(
            config.static_routes[1].route_map.as_deref(),
            Some("import-map")
        );

        assert_eq!(config.interfaces.len(), 2);
        assert!(config.interfaces[1].loopback);
    }

    #[test]
    fn test_scan_time_range_is_enforced() {
        let config: ScanConfigSpec =
            toml::from_str("router_id = \"1.1.1.1\"\ndefault_as = 65000\nscan_time = 3\n").unwrap();
        assert!(config.validate().is_err());
    }
}
