pub mod codec;
#[cfg(test)]
pub(crate) mod testserver;

use std::io::{self, Cursor};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use ipnet::Ipv4Net;
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::scan::cache::CacheEntry;
use codec::{Command, RgatePair, VERIFY_PAIRS_PER_MSG, ZEBRA_HEADER_SIZE};

/// Result of an IPv4 import check. With the daemon unreachable the route
/// is reported active so a zebra restart does not withdraw every static
/// import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportCheck {
    pub active: bool,
    pub metric: u32,
    pub nexthop: Ipv4Addr,
}

impl ImportCheck {
    fn assumed_active() -> Self {
        ImportCheck {
            active: true,
            metric: 0,
            nexthop: Ipv4Addr::UNSPECIFIED,
        }
    }

    fn inactive() -> Self {
        ImportCheck {
            active: false,
            metric: 0,
            nexthop: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Request/response client for the routing daemon's lookup service.
///
/// The stream is `None` whenever the session is down; every fault closes
/// the socket and the serve loop re-arms a connect attempt. Calls made
/// while disconnected degrade to "no data" instead of failing the scan.
pub struct LookupClient {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl LookupClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LookupClient {
            path: path.into(),
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> io::Result<()> {
        let stream = UnixStream::connect(&self.path).await?;
        info!("Connected to lookup service at {}", self.path.display());
        self.stream = Some(stream);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Lookup session closed");
        }
    }

    /// Write one framed message; any fault closes the session
    async fn send_message(&mut self, msg: &[u8]) -> bool {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return false,
        };
        match stream.write_all(msg).await {
            Ok(()) => true,
            Err(err) => {
                error!("Writing lookup packet failed: {}", err);
                self.close();
                false
            }
        }
    }

    /// Read one framed message and return its body (marker onward)
    async fn read_message(&mut self) -> Option<Vec<u8>> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return None,
        };
        let result = async {
            let mut word = [0u8; 2];
            stream.read_exact(&mut word).await?;
            let length = u16::from_be_bytes(word) as usize;
            if length < ZEBRA_HEADER_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("message length {} below header size", length),
                ));
            }
            let mut body = vec![0u8; length - 2];
            stream.read_exact(&mut body).await?;
            Ok(body)
        }
        .await;
        match result {
            Ok(body) => Some(body),
            Err(err) => {
                error!("Reading lookup packet failed: {}", err);
                self.close();
                None
            }
        }
    }

    async fn request(&mut self, msg: &[u8]) -> Option<Vec<u8>> {
        if !self.send_message(msg).await {
            return None;
        }
        self.read_message().await
    }

    /// Validate a reply body against the command we expect, close the
    /// session on any codec fault
    fn checked_body<'a>(&mut self, body: &'a [u8], expect: Command) -> Option<Cursor<&'a [u8]>> {
        let mut cur = Cursor::new(body);
        match codec::parse_reply_header(&mut cur) {
            Ok(command) if command == expect => Some(cur),
            Ok(command) => {
                error!("Unexpected reply {:?} while waiting for {:?}", command, expect);
                self.close();
                None
            }
            Err(err) => {
                error!("Lookup reply rejected: {}", err);
                self.close();
                None
            }
        }
    }

    /// Ask the daemon to resolve an IPv4 BGP nexthop against the IGP.
    /// `None` means unreachable or oracle unavailable.
    pub async fn resolve_v4(&mut self, addr: Ipv4Addr) -> Option<CacheEntry> {
        if !self.is_connected() {
            return None;
        }
        let body = self.request(&codec::nexthop_lookup_v4(addr)).await?;
        let mut cur = self.checked_body(&body, Command::Ipv4NexthopLookup)?;
        let reply = match codec::parse_nexthop_reply_v4(&mut cur) {
            Ok(reply) => reply,
            Err(err) => {
                error!("Lookup reply rejected: {}", err);
                self.close();
                return None;
            }
        };
        if reply.nexthops.is_empty() {
            return None;
        }
        Some(CacheEntry::resolved(reply.metric, reply.nexthops))
    }

    pub async fn resolve_v6(&mut self, addr: Ipv6Addr) -> Option<CacheEntry> {
        if !self.is_connected() {
            return None;
        }
        let body = self.request(&codec::nexthop_lookup_v6(addr)).await?;
        let mut cur = self.checked_body(&body, Command::Ipv6NexthopLookup)?;
        let reply = match codec::parse_nexthop_reply_v6(&mut cur) {
            Ok(reply) => reply,
            Err(err) => {
                error!("Lookup reply rejected: {}", err);
                self.close();
                return None;
            }
        };
        if reply.nexthops.is_empty() {
            return None;
        }
        Some(CacheEntry::resolved(reply.metric, reply.nexthops))
    }

    /// Check whether a statically configured prefix is present in the IGP.
    ///
    /// A reply fault reports the route inactive; an active route with a
    /// non-IPv4 first hop keeps the all-zero nexthop. `None` means the
    /// query died on the write: the daemon never saw it, and the caller
    /// keeps its previous view of the route instead of a zeroed one.
    pub async fn import_check_v4(&mut self, prefix: Ipv4Net) -> Option<ImportCheck> {
        if !self.is_connected() {
            return Some(ImportCheck::assumed_active());
        }
        if !self.send_message(&codec::import_lookup_v4(prefix)).await {
            return None;
        }
        let body = match self.read_message().await {
            Some(body) => body,
            None => return Some(ImportCheck::inactive()),
        };
        let mut cur = match self.checked_body(&body, Command::Ipv4ImportLookup) {
            Some(cur) => cur,
            None => return Some(ImportCheck::inactive()),
        };
        let reply = match codec::parse_import_reply(&mut cur) {
            Ok(reply) => reply,
            Err(err) => {
                error!("Lookup reply rejected: {}", err);
                self.close();
                return Some(ImportCheck::inactive());
            }
        };
        if reply.nexthop_count == 0 {
            return Some(ImportCheck {
                active: false,
                metric: reply.metric,
                nexthop: Ipv4Addr::UNSPECIFIED,
            });
        }
        let nexthop = reply
            .nexthop
            .and_then(|nexthop| nexthop.gate_v4())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Some(ImportCheck {
            active: true,
            metric: reply.metric,
            nexthop,
        })
    }

    /// Submit gate/rgate pairs for verification in wire-sized batches and
    /// feed every reported out-of-sync prefix to `on_desync`. An aborted
    /// exchange simply reports fewer prefixes; the scan then falls back to
    /// per-prefix resolution.
    pub async fn verify_rgates_v4<F>(&mut self, pairs: &[RgatePair], mut on_desync: F)
    where
        F: FnMut(Ipv4Net),
    {
        if !self.is_connected() {
            return;
        }
        let full_batches = pairs.len() / VERIFY_PAIRS_PER_MSG;
        for batch in 0..full_batches {
            let chunk = &pairs[batch * VERIFY_PAIRS_PER_MSG..(batch + 1) * VERIFY_PAIRS_PER_MSG];
            debug!("Sent {} IPv4 nexthops to verify", chunk.len());
            if !self.send_message(&codec::rgate_verify(chunk, true)).await {
                return;
            }
        }
        let tail = &pairs[full_batches * VERIFY_PAIRS_PER_MSG..];
        debug!("Sent last {} IPv4 nexthops to verify", tail.len());
        if !self.send_message(&codec::rgate_verify(tail, false)).await {
            return;
        }

        loop {
            let body = match self.read_message().await {
                Some(body) => body,
                None => return,
            };
            let mut cur = match self.checked_body(&body, Command::Ipv4RgateVerify) {
                Some(cur) => cur,
                None => return,
            };
            let reply = match codec::parse_verify_reply(&mut cur) {
                Ok(reply) => reply,
                Err(err) => {
                    error!("Lookup reply rejected: {}", err);
                    self.close();
                    return;
                }
            };
            debug!(
                "Receiving {}{} IPv4 prefixes",
                if reply.more_follows { "" } else { "last " },
                reply.prefixes.len()
            );
            for prefix in reply.prefixes {
                on_desync(prefix);
            }
            if !reply.more_follows {
                return;
            }
        }
    }
}

impl std::fmt::Display for LookupClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "<LookupClient path={} connected={}>",
            self.path.display(),
            self.is_connected()
        )
    }
}
