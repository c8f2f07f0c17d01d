use bgp_rs::{AFI, SAFI};
use ipnet::IpNet;
use log::debug;
use std::net::Ipv4Addr;

use super::Scanner;
use crate::rib::{Bgp, RouteHooks};

/// One pass of the import engine: check every network statement against
/// the IGP and push updates or withdrawals through the speaker.
///
/// Only (IPv4, unicast) statements are actually queried, and only with
/// import checking configured; everything else is forced valid with a
/// zero metric and nexthop. MPLS-VPN tables are never imported.
pub(crate) async fn run<H: RouteHooks>(scanner: &mut Scanner, bgp: &mut Bgp, hooks: &mut H) {
    debug!("Import timer expired.");

    let import_check = bgp.import_check;
    for (family, table) in bgp.statics.iter_mut() {
        if family.safi != SAFI::Unicast && family.safi != SAFI::Multicast {
            continue;
        }
        for (prefix, route) in table.iter_mut() {
            if route.backdoor {
                continue;
            }

            let was_valid = route.valid;
            let old_metric = route.igp_metric;
            let old_nexthop = route.igp_nexthop;

            let checkable = import_check
                && family.afi == AFI::IPV4
                && family.safi == SAFI::Unicast;
            match (checkable, prefix) {
                (true, IpNet::V4(p4)) => match scanner.zlookup.import_check_v4(*p4).await {
                    Some(check) => {
                        route.valid = check.active;
                        route.igp_metric = check.metric;
                        route.igp_nexthop = check.nexthop;
                    }
                    // the query died on the write: keep the last known
                    // metric and nexthop rather than a zeroed view
                    None => route.valid = true,
                },
                _ => {
                    route.valid = true;
                    route.igp_metric = 0;
                    route.igp_nexthop = Ipv4Addr::UNSPECIFIED;
                }
            }

            if route.valid != was_valid {
                if route.valid {
                    hooks.static_update(*family, *prefix, route);
                } else {
                    hooks.static_withdraw(*family, *prefix);
                }
            } else if route.valid
                && (route.igp_metric != old_metric
                    || route.igp_nexthop != old_nexthop
                    || route.route_map.is_some())
            {
                hooks.static_update(*family, *prefix, route);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::rib::testing::MockHooks;
    use crate::rib::{Family, StaticRoute};
    use crate::zebra::codec::Nexthop;
    use crate::zebra::testserver::TestZebra;

    fn test_scanner(path: &std::path::Path) -> Scanner {
        let mut config = ScanConfig::test_default();
        config.zserv_path = path.to_path_buf();
        Scanner::new(&config)
    }

    fn net(prefix: &str) -> IpNet {
        prefix.parse().unwrap()
    }

    #[tokio::test]
    async fn test_import_check_disabled_forces_valid() {
        let server = TestZebra::spawn().await;
        let mut scanner = test_scanner(&server.path);
        scanner.zlookup.connect().await.unwrap();

        let mut bgp = Bgp::default();
        bgp.import_check = false;
        bgp.insert_static(
            Family::v4_unicast(),
            net("198.51.100.0/24"),
            StaticRoute::new(false, None),
        );

        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        // first pass flips invalid -> valid
        assert_eq!(hooks.static_updates, vec![net("198.51.100.0/24")]);

        let route = &bgp.statics[&Family::v4_unicast()][&net("198.51.100.0/24")];
        assert!(route.valid);
        assert_eq!(route.igp_metric, 0);
        assert_eq!(route.igp_nexthop, Ipv4Addr::UNSPECIFIED);

        // steady state: no further updates
        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        assert!(hooks.static_updates.is_empty());
        assert!(hooks.static_withdraws.is_empty());
        // no queries were ever issued
        assert_eq!(server.state.lock().unwrap().lookups, 0);
    }

    #[tokio::test]
    async fn test_import_check_drives_update_and_withdraw() {
        let server = TestZebra::spawn().await;
        server.state.lock().unwrap().import_routes.insert(
            "198.51.100.0/24".parse().unwrap(),
            (30, vec![Nexthop::Ipv4(Ipv4Addr::new(10, 0, 0, 1))]),
        );
        let mut scanner = test_scanner(&server.path);
        scanner.zlookup.connect().await.unwrap();

        let mut bgp = Bgp::default();
        bgp.import_check = true;
        bgp.insert_static(
            Family::v4_unicast(),
            net("198.51.100.0/24"),
            StaticRoute::new(false, None),
        );

        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        assert_eq!(hooks.static_updates, vec![net("198.51.100.0/24")]);
        {
            let route = &bgp.statics[&Family::v4_unicast()][&net("198.51.100.0/24")];
            assert!(route.valid);
            assert_eq!(route.igp_metric, 30);
            assert_eq!(route.igp_nexthop, Ipv4Addr::new(10, 0, 0, 1));
        }

        // metric moves: refresh while staying valid
        server
            .state
            .lock()
            .unwrap()
            .import_routes
            .insert(
                "198.51.100.0/24".parse().unwrap(),
                (40, vec![Nexthop::Ipv4(Ipv4Addr::new(10, 0, 0, 1))]),
            );
        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        assert_eq!(hooks.static_updates, vec![net("198.51.100.0/24")]);
        assert!(hooks.static_withdraws.is_empty());

        // route disappears from the IGP: withdraw
        server.state.lock().unwrap().import_routes.clear();
        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        assert!(hooks.static_updates.is_empty());
        assert_eq!(hooks.static_withdraws, vec![net("198.51.100.0/24")]);
        assert!(!bgp.statics[&Family::v4_unicast()][&net("198.51.100.0/24")].valid);
    }

    #[tokio::test]
    async fn test_backdoor_routes_are_skipped() {
        let server = TestZebra::spawn().await;
        let mut scanner = test_scanner(&server.path);
        scanner.zlookup.connect().await.unwrap();

        let mut bgp = Bgp::default();
        bgp.import_check = true;
        bgp.insert_static(
            Family::v4_unicast(),
            net("198.51.100.0/24"),
            StaticRoute::new(true, None),
        );

        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        assert!(hooks.static_updates.is_empty());
        assert!(hooks.static_withdraws.is_empty());
    }

    #[tokio::test]
    async fn test_route_map_forces_refresh() {
        let server = TestZebra::spawn().await;
        let mut scanner = test_scanner(&server.path);

        let mut bgp = Bgp::default();
        bgp.insert_static(
            Family::v4_unicast(),
            net("203.0.113.0/24"),
            StaticRoute::new(false, Some("import-map".to_string())),
        );

        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        // a configured route-map keeps refreshing the still-valid route
        assert_eq!(hooks.static_updates, vec![net("203.0.113.0/24")]);
    }

    #[tokio::test]
    async fn test_oracle_down_keeps_imports_valid() {
        let mut scanner = {
            let config = ScanConfig::test_default();
            Scanner::new(&config)
        };
        let mut bgp = Bgp::default();
        bgp.import_check = true;
        bgp.insert_static(
            Family::v4_unicast(),
            net("198.51.100.0/24"),
            StaticRoute::new(false, None),
        );

        let mut hooks = MockHooks::default();
        run(&mut scanner, &mut bgp, &mut hooks).await;
        let route = &bgp.statics[&Family::v4_unicast()][&net("198.51.100.0/24")];
        assert!(route.valid);
        assert_eq!(route.igp_metric, 0);
        assert_eq!(hooks.static_updates, vec![net("198.51.100.0/24")]);
    }
}
