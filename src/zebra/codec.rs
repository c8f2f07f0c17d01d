use std::convert::TryFrom;
use std::error;
use std::fmt;
use std::io::{self, Cursor, Read};
use std::net::{Ipv4Addr, Ipv6Addr};

use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use ipnet::Ipv4Net;

/// First byte after the length word of every zserv message
pub const ZEBRA_HEADER_MARKER: u8 = 0xFF;
/// Protocol revision; a peer speaking anything else aborts the exchange
pub const ZSERV_VERSION: u8 = 2;
/// Length word + marker + version + command
pub const ZEBRA_HEADER_SIZE: usize = 6;
pub const ZEBRA_MAX_PACKET_SIZE: usize = 4096;

/// Gate/rgate pairs that fit in one verify message alongside the header,
/// the more-follows byte and the record count
pub const VERIFY_PAIRS_PER_MSG: usize = (ZEBRA_MAX_PACKET_SIZE - ZEBRA_HEADER_SIZE - 1 - 2) / 8;

const NEXTHOP_TYPE_IFINDEX: u8 = 1;
const NEXTHOP_TYPE_IFNAME: u8 = 2;
const NEXTHOP_TYPE_IPV4: u8 = 3;
const NEXTHOP_TYPE_IPV6: u8 = 6;
const NEXTHOP_TYPE_IPV6_IFINDEX: u8 = 7;
const NEXTHOP_TYPE_IPV6_IFNAME: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Ipv4NexthopLookup = 15,
    Ipv6NexthopLookup = 16,
    Ipv4ImportLookup = 17,
    Ipv4RgateVerify = 24,
}

impl TryFrom<u16> for Command {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            15 => Ok(Command::Ipv4NexthopLookup),
            16 => Ok(Command::Ipv6NexthopLookup),
            17 => Ok(Command::Ipv4ImportLookup),
            24 => Ok(Command::Ipv4RgateVerify),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    /// Message ended before its advertised payload did
    Truncated,
    /// Peer is not speaking our zserv revision. [marker, version]
    VersionMismatch(u8, u8),
    /// Command word we have no parser for. [command]
    UnknownCommand(u16),
    /// Prefix length beyond the address family maximum. [prefixlen]
    InvalidPrefixLength(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CodecError::*;
        match self {
            Truncated => write!(f, "truncated message"),
            VersionMismatch(marker, version) => {
                write!(f, "version mismatch, marker {}, version {}", marker, version)
            }
            UnknownCommand(command) => write!(f, "unknown command {}", command),
            InvalidPrefixLength(len) => write!(f, "invalid prefix length {}", len),
        }
    }
}

impl error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(_: io::Error) -> Self {
        CodecError::Truncated
    }
}

/// One next hop as reported by the routing daemon. Tags without a parser
/// are kept as `Unknown` with an empty payload; dropping them would throw
/// off the entry count of the enclosing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nexthop {
    Ifindex(u32),
    Ifname(u32),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Ipv6Ifindex(Ipv6Addr, u32),
    Ipv6Ifname(Ipv6Addr, u32),
    Unknown(u8),
}

impl Nexthop {
    /// The IPv4 gateway, for next hops that carry one
    pub fn gate_v4(&self) -> Option<Ipv4Addr> {
        match self {
            Nexthop::Ipv4(gate) => Some(*gate),
            _ => None,
        }
    }
}

impl fmt::Display for Nexthop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Nexthop::Ifindex(idx) | Nexthop::Ifname(idx) => write!(f, "ifidx {}", idx),
            Nexthop::Ipv4(gate) => write!(f, "gate {}", gate),
            Nexthop::Ipv6(gate) => write!(f, "gate {}", gate),
            Nexthop::Ipv6Ifindex(gate, idx) | Nexthop::Ipv6Ifname(gate, idx) => {
                write!(f, "gate {} ifidx {}", gate, idx)
            }
            Nexthop::Unknown(tag) => write!(f, "invalid nexthop type {}", tag),
        }
    }
}

#[derive(Debug)]
pub struct NexthopReply {
    pub metric: u32,
    pub nexthops: Vec<Nexthop>,
}

#[derive(Debug)]
pub struct ImportReply {
    pub metric: u32,
    pub nexthop_count: u8,
    /// First next hop of an active route, whatever its type
    pub nexthop: Option<Nexthop>,
}

#[derive(Debug)]
pub struct VerifyReply {
    pub more_follows: bool,
    pub prefixes: Vec<Ipv4Net>,
}

/// One gate/rgate record of a verify query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgatePair {
    /// The BGP nexthop being verified
    pub gate: Ipv4Addr,
    /// The recursive gateway the FIB entry was installed with
    pub rgate: Ipv4Addr,
}

fn create_header(cmd: Command) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ZEBRA_HEADER_SIZE);
    buf.put_u16(0); // patched by finish_message
    buf.put_u8(ZEBRA_HEADER_MARKER);
    buf.put_u8(ZSERV_VERSION);
    buf.put_u16(cmd as u16);
    buf
}

/// Back-patch the length word with the final stream end
fn finish_message(buf: &mut BytesMut) {
    let total = buf.len() as u16;
    let word = total.to_be_bytes();
    buf[0] = word[0];
    buf[1] = word[1];
}

pub fn nexthop_lookup_v4(addr: Ipv4Addr) -> BytesMut {
    let mut buf = create_header(Command::Ipv4NexthopLookup);
    buf.put_slice(&addr.octets());
    finish_message(&mut buf);
    buf
}

pub fn nexthop_lookup_v6(addr: Ipv6Addr) -> BytesMut {
    let mut buf = create_header(Command::Ipv6NexthopLookup);
    buf.put_slice(&addr.octets());
    finish_message(&mut buf);
    buf
}

pub fn import_lookup_v4(prefix: Ipv4Net) -> BytesMut {
    let mut buf = create_header(Command::Ipv4ImportLookup);
    buf.put_u8(prefix.prefix_len());
    buf.put_slice(&prefix.addr().octets());
    finish_message(&mut buf);
    buf
}

pub fn rgate_verify(pairs: &[RgatePair], more_follows: bool) -> BytesMut {
    let mut buf = create_header(Command::Ipv4RgateVerify);
    buf.put_u8(more_follows as u8);
    buf.put_u16(pairs.len() as u16);
    for pair in pairs {
        buf.put_slice(&pair.gate.octets());
        buf.put_slice(&pair.rgate.octets());
    }
    finish_message(&mut buf);
    buf
}

fn read_ipv4(cur: &mut Cursor<&[u8]>) -> Result<Ipv4Addr, CodecError> {
    let mut octets = [0u8; 4];
    cur.read_exact(&mut octets)?;
    Ok(Ipv4Addr::from(octets))
}

fn read_ipv6(cur: &mut Cursor<&[u8]>) -> Result<Ipv6Addr, CodecError> {
    let mut octets = [0u8; 16];
    cur.read_exact(&mut octets)?;
    Ok(Ipv6Addr::from(octets))
}

/// Validate marker and version on a reply body (everything after the
/// length word) and return the command it carries
pub fn parse_reply_header(cur: &mut Cursor<&[u8]>) -> Result<Command, CodecError> {
    let marker = cur.read_u8()?;
    let version = cur.read_u8()?;
    if version != ZSERV_VERSION || marker != ZEBRA_HEADER_MARKER {
        return Err(CodecError::VersionMismatch(marker, version));
    }
    Command::try_from(cur.read_u16::<NetworkEndian>()?)
}

fn read_nexthop_v4(cur: &mut Cursor<&[u8]>) -> Result<Nexthop, CodecError> {
    let tag = cur.read_u8()?;
    let nexthop = match tag {
        NEXTHOP_TYPE_IPV4 => Nexthop::Ipv4(read_ipv4(cur)?),
        NEXTHOP_TYPE_IFINDEX => Nexthop::Ifindex(cur.read_u32::<NetworkEndian>()?),
        NEXTHOP_TYPE_IFNAME => Nexthop::Ifname(cur.read_u32::<NetworkEndian>()?),
        other => Nexthop::Unknown(other),
    };
    Ok(nexthop)
}

fn read_nexthop_v6(cur: &mut Cursor<&[u8]>) -> Result<Nexthop, CodecError> {
    let tag = cur.read_u8()?;
    let nexthop = match tag {
        NEXTHOP_TYPE_IPV6 => Nexthop::Ipv6(read_ipv6(cur)?),
        NEXTHOP_TYPE_IPV6_IFINDEX => {
            Nexthop::Ipv6Ifindex(read_ipv6(cur)?, cur.read_u32::<NetworkEndian>()?)
        }
        NEXTHOP_TYPE_IPV6_IFNAME => {
            Nexthop::Ipv6Ifname(read_ipv6(cur)?, cur.read_u32::<NetworkEndian>()?)
        }
        NEXTHOP_TYPE_IFINDEX => Nexthop::Ifindex(cur.read_u32::<NetworkEndian>()?),
        NEXTHOP_TYPE_IFNAME => Nexthop::Ifname(cur.read_u32::<NetworkEndian>()?),
        other => Nexthop::Unknown(other),
    };
    Ok(nexthop)
}

/// Body of an IPv4 nexthop lookup reply: echoed address, metric, entries
pub fn parse_nexthop_reply_v4(cur: &mut Cursor<&[u8]>) -> Result<NexthopReply, CodecError> {
    let _echoed = read_ipv4(cur)?;
    let metric = cur.read_u32::<NetworkEndian>()?;
    let count = cur.read_u8()?;
    let mut nexthops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        nexthops.push(read_nexthop_v4(cur)?);
    }
    Ok(NexthopReply { metric, nexthops })
}

pub fn parse_nexthop_reply_v6(cur: &mut Cursor<&[u8]>) -> Result<NexthopReply, CodecError> {
    let _echoed = read_ipv6(cur)?;
    let metric = cur.read_u32::<NetworkEndian>()?;
    let count = cur.read_u8()?;
    let mut nexthops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        nexthops.push(read_nexthop_v6(cur)?);
    }
    Ok(NexthopReply { metric, nexthops })
}

/// Body of an import lookup reply. Only the first next hop is of interest
/// and only an IPv4 gateway is usable by the import engine.
pub fn parse_import_reply(cur: &mut Cursor<&[u8]>) -> Result<ImportReply, CodecError> {
    let _echoed = read_ipv4(cur)?;
    let metric = cur.read_u32::<NetworkEndian>()?;
    let nexthop_count = cur.read_u8()?;
    let nexthop = if nexthop_count > 0 {
        Some(read_nexthop_v4(cur)?)
    } else {
        None
    };
    Ok(ImportReply {
        metric,
        nexthop_count,
        nexthop,
    })
}

/// Body of one verify reply message: out-of-sync prefixes
pub fn parse_verify_reply(cur: &mut Cursor<&[u8]>) -> Result<VerifyReply, CodecError> {
    let more_follows = cur.read_u8()? != 0;
    let count = cur.read_u16::<NetworkEndian>()?;
    let mut prefixes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let addr = read_ipv4(cur)?;
        let len = cur.read_u8()?;
        let prefix = Ipv4Net::new(addr, len).map_err(|_| CodecError::InvalidPrefixLength(len))?;
        prefixes.push(prefix);
    }
    Ok(VerifyReply {
        more_follows,
        prefixes,
    })
}
