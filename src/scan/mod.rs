pub mod cache;
pub mod connected;
mod import;
mod show;
mod verify;

pub use show::ScanTables;

use std::net::Ipv4Addr;
use std::time::Duration;

use bgp_rs::AFI;
use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, Instant};

use crate::config::ScanConfig;
use crate::rib::{Bgp, Family, RouteEntry, RouteHooks, RouteNexthop, RouteSubType, RouteType};
use crate::utils::ipv6_link_local;
use crate::zebra::LookupClient;
use cache::{CacheEntry, NexthopCache};
use connected::{ConnectedAddr, ConnectedTables};

pub const BGP_SCAN_INTERVAL_DEFAULT: u16 = 60;
pub const BGP_IMPORT_INTERVAL_DEFAULT: u16 = 15;

/// How often a downed lookup session is re-dialled
const RECONNECT_INTERVAL_SECS: u64 = 10;

/// Outcome of resolving one route's nexthop this scan
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Resolution {
    valid: bool,
    changed: bool,
    metric_changed: bool,
}

impl Resolution {
    /// Trivially reachable, nothing to diff
    fn onlink(valid: bool) -> Self {
        Resolution {
            valid,
            changed: false,
            metric_changed: false,
        }
    }
}

/// The nexthop reachability engine: owns both generations of the per-family
/// caches, the connected tables and the lookup session, and periodically
/// re-derives route validity for the whole RIB.
pub struct Scanner {
    pub(crate) cache4: NexthopCache<Ipv4Net>,
    pub(crate) cache6: NexthopCache<Ipv6Net>,
    pub(crate) connected: ConnectedTables,
    pub(crate) zlookup: LookupClient,
    pub(crate) scan_interval: u16,
    pub(crate) import_interval: u16,
    pub(crate) running: bool,
    pub(crate) last_scan: Option<DateTime<Utc>>,
}

impl Scanner {
    pub fn new(config: &ScanConfig) -> Self {
        Scanner {
            cache4: NexthopCache::new(),
            cache6: NexthopCache::new(),
            connected: ConnectedTables::new(),
            zlookup: LookupClient::new(&config.zserv_path),
            scan_interval: config.scan_time,
            import_interval: config.import_time,
            running: false,
            last_scan: None,
        }
    }

    /// Re-derive reachability for every BGP route, both families
    pub async fn scan<H: RouteHooks>(&mut self, bgp: &mut Bgp, hooks: &mut H) {
        debug!("Performing BGP general scanning");
        self.scan_v4(bgp, hooks).await;
        self.scan_v6(bgp, hooks).await;
        self.last_scan = Some(Utc::now());
    }

    fn max_prefix_housekeeping<H: RouteHooks>(bgp: &Bgp, afi: AFI, hooks: &mut H) {
        for peer in &bgp.peers {
            if peer.status != crate::rib::PeerStatus::Established {
                continue;
            }
            for family in peer.families.iter().filter(|family| family.afi == afi) {
                hooks.max_prefix_overflow(peer, *family);
            }
        }
    }

    /// Fold one resolution into the route entry and let the speaker know
    /// about validity flips and damping comebacks
    fn apply_resolution<H: RouteHooks>(
        family: Family,
        prefix: IpNet,
        entry: &mut RouteEntry,
        result: Resolution,
        dampening: bool,
        hooks: &mut H,
    ) {
        entry.igp_changed = result.changed;
        if result.metric_changed {
            debug!("IGP metric changed for {} nexthop", prefix);
        }

        if result.valid != entry.valid {
            if entry.valid {
                hooks.aggregate_decrement(family, prefix, entry);
                entry.valid = false;
            } else {
                entry.valid = true;
                hooks.aggregate_increment(family, prefix, entry);
            }
        }

        if dampening && entry.damp_info.is_some() && hooks.damp_scan(family, prefix, entry) {
            hooks.aggregate_increment(family, prefix, entry);
        }
    }

    fn fold_metric(entry: &mut RouteEntry, cached: &CacheEntry) -> Resolution {
        if cached.valid && cached.metric != 0 {
            entry.igp_metric = cached.metric;
        } else {
            entry.igp_metric = 0;
        }
        Resolution {
            valid: cached.valid,
            changed: cached.changed,
            metric_changed: cached.metric_changed,
        }
    }

    /// Cached resolution of an IPv4 nexthop. A miss queries the daemon and
    /// diffs the fresh answer against the previous generation; an
    /// unanswerable query is cached as invalid until the next scan.
    async fn resolve_v4(&mut self, addr: Ipv4Addr, entry: &mut RouteEntry) -> Resolution {
        let key = Ipv4Net::new(addr, 32).expect("/32 is a valid IPv4 prefix length");
        if let Some(cached) = self.cache4.get(&key) {
            return Self::fold_metric(entry, cached);
        }

        let fresh = match self.zlookup.resolve_v4(addr).await {
            None => CacheEntry::unresolved(),
            Some(mut fresh) => {
                if let Some(old) = self.cache4.lookup_previous(&key) {
                    fresh.changed = fresh.differs_from(old);
                    if fresh.metric != old.metric {
                        fresh.metric_changed = true;
                    }
                }
                fresh
            }
        };
        let result = Self::fold_metric(entry, &fresh);
        self.cache4.insert(key, fresh);
        result
    }

    async fn resolve_v6(
        &mut self,
        global: std::net::Ipv6Addr,
        entry: &mut RouteEntry,
    ) -> Resolution {
        let key = Ipv6Net::new(global, 128).expect("/128 is a valid IPv6 prefix length");
        if let Some(cached) = self.cache6.get(&key) {
            return Self::fold_metric(entry, cached);
        }

        let fresh = match self.zlookup.resolve_v6(global).await {
            None => CacheEntry::unresolved(),
            Some(mut fresh) => {
                if let Some(old) = self.cache6.lookup_previous(&key) {
                    fresh.changed = fresh.differs_from(old);
                    if fresh.metric != old.metric {
                        fresh.metric_changed = true;
                    }
                }
                fresh
            }
        };
        let result = Self::fold_metric(entry, &fresh);
        self.cache6.insert(key, fresh);
        result
    }

    async fn scan_v4<H: RouteHooks>(&mut self, bgp: &mut Bgp, hooks: &mut H) {
        self.cache4.swap();
        debug!("Scanning IPv4 Unicast routing tables");

        Self::max_prefix_housekeeping(bgp, AFI::IPV4, hooks);

        let desync = verify::verify_rgates(&mut self.zlookup, self.cache4.previous()).await;
        if !desync.is_empty() {
            debug!("Some installed recursive gateways are out of sync");
        }

        let family = Family::v4_unicast();
        let dampening = bgp.dampening.contains(&family);
        for (prefix, entries) in bgp.rib4.iter_mut() {
            for entry in entries.iter_mut() {
                if entry.route_type != RouteType::Bgp || entry.sub_type != RouteSubType::Normal {
                    continue;
                }

                if desync.covers(prefix) {
                    // The daemon already told us this forwarding entry is
                    // stale; force the refresh and skip re-resolution.
                    debug!("Recursive gate out of sync for {}", prefix);
                    entry.igp_changed = true;
                    continue;
                }

                let nexthop = match entry.nexthop.v4() {
                    Some(addr) => addr,
                    None => {
                        warn!("IPv4 route {} without an IPv4 nexthop", prefix);
                        continue;
                    }
                };

                let result = if entry.peer.is_ebgp() && entry.peer.ttl == 1 {
                    Resolution::onlink(self.connected.onlink_v4(nexthop))
                } else {
                    self.resolve_v4(nexthop, entry).await
                };

                Self::apply_resolution(family, IpNet::V4(*prefix), entry, result, dampening, hooks);
            }
            hooks.process(family, IpNet::V4(*prefix));
        }

        self.cache4.reset_previous();
    }

    async fn scan_v6<H: RouteHooks>(&mut self, bgp: &mut Bgp, hooks: &mut H) {
        self.cache6.swap();
        debug!("Scanning IPv6 Unicast routing tables");

        Self::max_prefix_housekeeping(bgp, AFI::IPV6, hooks);

        let family = Family::v6_unicast();
        let dampening = bgp.dampening.contains(&family);
        for (prefix, entries) in bgp.rib6.iter_mut() {
            for entry in entries.iter_mut() {
                if entry.route_type != RouteType::Bgp || entry.sub_type != RouteSubType::Normal {
                    continue;
                }

                let (global, link_local) = match entry.nexthop {
                    RouteNexthop::V6 { global, link_local } => (global, link_local),
                    RouteNexthop::V4(_) => {
                        warn!("IPv6 route {} without an IPv6 nexthop", prefix);
                        continue;
                    }
                };

                let result = if entry.peer.is_ebgp() && entry.peer.ttl == 1 {
                    Resolution::onlink(self.connected.onlink_v6(global, link_local))
                } else if link_local.is_some() || ipv6_link_local(&global) {
                    // a link-local or paired nexthop is on-link, no cache
                    Resolution::onlink(true)
                } else {
                    self.resolve_v6(global, entry).await
                };

                Self::apply_resolution(family, IpNet::V6(*prefix), entry, result, dampening, hooks);
            }
            hooks.process(family, IpNet::V6(*prefix));
        }

        self.cache6.reset_previous();
    }

    /// One pass of the static-route import engine
    pub async fn import<H: RouteHooks>(&mut self, bgp: &mut Bgp, hooks: &mut H) {
        import::run(self, bgp, hooks).await;
    }

    pub fn connected_add(&mut self, ifc: &ConnectedAddr) {
        self.connected.add(ifc);
    }

    pub fn connected_delete(&mut self, ifc: &ConnectedAddr) {
        self.connected.delete(ifc);
    }

    /// Do the nexthop and the peer address share a connected network.
    /// Without the lookup session the scanner has no opinion.
    pub fn multiaccess_check_v4(&self, nexthop: Ipv4Addr, peer: Ipv4Addr) -> bool {
        if !self.zlookup.is_connected() {
            return false;
        }
        self.connected.same_network_v4(nexthop, peer)
    }

    /// Is the nexthop one of this router's own addresses
    pub fn nexthop_self_v4(&self, addr: Ipv4Addr) -> bool {
        self.connected.nexthop_self_v4(addr)
    }

    pub fn set_scan_interval(&mut self, seconds: Option<u16>) {
        self.scan_interval = seconds.unwrap_or(BGP_SCAN_INTERVAL_DEFAULT);
    }

    /// Emit the non-default part of the running config
    pub fn config_write(&self) -> Option<String> {
        if self.scan_interval != BGP_SCAN_INTERVAL_DEFAULT {
            Some(format!("bgp scan-time {}", self.scan_interval))
        } else {
            None
        }
    }

    /// Release every table at shutdown
    pub fn finish(&mut self) {
        self.running = false;
        self.cache4.finish();
        self.cache6.finish();
        self.connected.finish();
        self.zlookup.close();
    }

    /// Drive the scan, import and reconnect timers plus the command
    /// channel until told to shut down. Everything runs on this one task;
    /// a scan pass and a command never interleave.
    pub async fn serve<H>(mut self, mut bgp: Bgp, mut hooks: H, mut rx: CommandRx)
    where
        H: RouteHooks,
    {
        if let Err(err) = self.zlookup.connect().await {
            warn!("Lookup service not reachable yet: {}", err);
        }
        self.running = true;

        let scan_period = Duration::from_secs(self.scan_interval as u64);
        let mut scan_timer = interval_at(Instant::now() + scan_period, scan_period);
        let mut import_timer = interval(Duration::from_secs(self.import_interval.max(1) as u64));
        let mut reconnect_timer = interval(Duration::from_secs(RECONNECT_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = scan_timer.tick() => {
                    self.scan(&mut bgp, &mut hooks).await;
                }
                _ = import_timer.tick() => {
                    self.import(&mut bgp, &mut hooks).await;
                }
                _ = reconnect_timer.tick(), if !self.zlookup.is_connected() => {
                    if let Err(err) = self.zlookup.connect().await {
                        debug!("Lookup reconnect failed: {}", err);
                    }
                }
                command = rx.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::SetScanTime(seconds)) => {
                        self.set_scan_interval(seconds);
                        let period = Duration::from_secs(self.scan_interval as u64);
                        scan_timer = interval_at(Instant::now() + period, period);
                        info!("BGP scan interval set to {}s", self.scan_interval);
                    }
                    Some(Command::Show { detail, reply }) => {
                        let _ = reply.send(self.show(detail));
                    }
                    Some(Command::ConnectedAdd(ifc)) => self.connected_add(&ifc),
                    Some(Command::ConnectedDelete(ifc)) => self.connected_delete(&ifc),
                },
            }
        }

        info!("Stopping BGP scanner...");
        self.finish();
    }
}

/// Control surface of a running scanner
#[derive(Debug)]
pub enum Command {
    /// Change the scan interval; `None` restores the default
    SetScanTime(Option<u16>),
    Show {
        detail: bool,
        reply: oneshot::Sender<String>,
    },
    ConnectedAdd(ConnectedAddr),
    ConnectedDelete(ConnectedAddr),
    Shutdown,
}

pub type CommandRx = mpsc::UnboundedReceiver<Command>;

#[derive(Clone, Debug)]
pub struct ScannerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ScannerHandle {
    pub fn set_scan_time(&self, seconds: Option<u16>) {
        let _ = self.tx.send(Command::SetScanTime(seconds));
    }

    pub async fn show(&self, detail: bool) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Show { detail, reply }).ok()?;
        rx.await.ok()
    }

    pub fn connected_add(&self, ifc: ConnectedAddr) {
        let _ = self.tx.send(Command::ConnectedAdd(ifc));
    }

    pub fn connected_delete(&self, ifc: ConnectedAddr) {
        let _ = self.tx.send(Command::ConnectedDelete(ifc));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

pub fn command_channel() -> (ScannerHandle, CommandRx) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ScannerHandle { tx }, rx)
}
