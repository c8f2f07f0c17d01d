//! Canned zserv endpoint backing the lookup and scanner tests.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use ipnet::Ipv4Net;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use super::codec::{
    Command, Nexthop, ZEBRA_HEADER_MARKER, ZSERV_VERSION,
};

static NEXT_SOCKET: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
pub(crate) struct ZebraState {
    pub v4_routes: HashMap<Ipv4Addr, (u32, Vec<Nexthop>)>,
    pub v6_routes: HashMap<Ipv6Addr, (u32, Vec<Nexthop>)>,
    pub import_routes: HashMap<Ipv4Net, (u32, Vec<Nexthop>)>,
    /// Reply messages for the next verify exchange, sent in order; empty
    /// means a single empty terminal reply
    pub verify_replies: Vec<Vec<Ipv4Net>>,
    /// `(more_follows, count)` of every verify query received
    pub verify_batches: Vec<(bool, u16)>,
    /// Served nexthop lookup queries
    pub lookups: usize,
    /// Close every new connection immediately
    pub drop_connections: bool,
}

pub(crate) struct TestZebra {
    pub path: PathBuf,
    pub state: Arc<Mutex<ZebraState>>,
    handle: JoinHandle<()>,
}

impl TestZebra {
    pub async fn spawn() -> Self {
        let path = std::env::temp_dir().join(format!(
            "bgp-scand-test-{}-{}.sock",
            std::process::id(),
            NEXT_SOCKET.fetch_add(1, Ordering::SeqCst),
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("binding test socket");
        let state = Arc::new(Mutex::new(ZebraState::default()));
        let server_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                if server_state.lock().unwrap().drop_connections {
                    drop(stream);
                    continue;
                }
                let conn_state = Arc::clone(&server_state);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, conn_state).await;
                });
            }
        });
        TestZebra {
            path,
            state,
            handle,
        }
    }
}

impl Drop for TestZebra {
    fn drop(&mut self) {
        self.handle.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 2];
    match stream.read_exact(&mut word).await {
        Ok(_) => (),
        Err(ref err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let length = u16::from_be_bytes(word) as usize;
    let mut body = vec![0u8; length - 2];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn reply_header(cmd: Command) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u16(0);
    buf.put_u8(ZEBRA_HEADER_MARKER);
    buf.put_u8(ZSERV_VERSION);
    buf.put_u16(cmd as u16);
    buf
}

fn seal(mut buf: BytesMut) -> BytesMut {
    let total = (buf.len() as u16).to_be_bytes();
    buf[0] = total[0];
    buf[1] = total[1];
    buf
}

fn put_nexthop_v4(buf: &mut BytesMut, nexthop: &Nexthop) {
    match nexthop {
        Nexthop::Ipv4(gate) => {
            buf.put_u8(3);
            buf.put_slice(&gate.octets());
        }
        Nexthop::Ifindex(idx) => {
            buf.put_u8(1);
            buf.put_u32(*idx);
        }
        Nexthop::Ifname(idx) => {
            buf.put_u8(2);
            buf.put_u32(*idx);
        }
        Nexthop::Unknown(tag) => buf.put_u8(*tag),
        other => panic!("nexthop {:?} has no IPv4 wire form", other),
    }
}

fn put_nexthop_v6(buf: &mut BytesMut, nexthop: &Nexthop) {
    match nexthop {
        Nexthop::Ipv6(gate) => {
            buf.put_u8(6);
            buf.put_slice(&gate.octets());
        }
        Nexthop::Ipv6Ifindex(gate, idx) => {
            buf.put_u8(7);
            buf.put_slice(&gate.octets());
            buf.put_u32(*idx);
        }
        Nexthop::Ipv6Ifname(gate, idx) => {
            buf.put_u8(8);
            buf.put_slice(&gate.octets());
            buf.put_u32(*idx);
        }
        Nexthop::Ifindex(idx) => {
            buf.put_u8(1);
            buf.put_u32(*idx);
        }
        Nexthop::Ifname(idx) => {
            buf.put_u8(2);
            buf.put_u32(*idx);
        }
        Nexthop::Unknown(tag) => buf.put_u8(*tag),
        other => panic!("nexthop {:?} has no IPv6 wire form", other),
    }
}

fn verify_reply(prefixes: &[Ipv4Net], more_follows: bool) -> BytesMut {
    let mut buf = reply_header(Command::Ipv4RgateVerify);
    buf.put_u8(more_follows as u8);
    buf.put_u16(prefixes.len() as u16);
    for prefix in prefixes {
        buf.put_slice(&prefix.addr().octets());
        buf.put_u8(prefix.prefix_len());
    }
    seal(buf)
}

async fn serve_connection(
    mut stream: UnixStream,
    state: Arc<Mutex<ZebraState>>,
) -> std::io::Result<()> {
    while let Some(body) = read_frame(&mut stream).await? {
        assert_eq!(body[0], ZEBRA_HEADER_MARKER);
        assert_eq!(body[1], ZSERV_VERSION);
        let command = u16::from_be_bytes([body[2], body[3]]);
        let payload = &body[4..];

        let replies: Vec<BytesMut> = match command {
            15 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&payload[..4]);
                let addr = Ipv4Addr::from(octets);
                let mut state = state.lock().unwrap();
                state.lookups += 1;
                let mut buf = reply_header(Command::Ipv4NexthopLookup);
                buf.put_slice(&addr.octets());
                match state.v4_routes.get(&addr) {
                    Some((metric, nexthops)) => {
                        buf.put_u32(*metric);
                        buf.put_u8(nexthops.len() as u8);
                        for nexthop in nexthops {
                            put_nexthop_v4(&mut buf, nexthop);
                        }
                    }
                    None => {
                        buf.put_u32(0);
                        buf.put_u8(0);
                    }
                }
                vec![seal(buf)]
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[..16]);
                let addr = Ipv6Addr::from(octets);
                let mut state = state.lock().unwrap();
                state.lookups += 1;
                let mut buf = reply_header(Command::Ipv6NexthopLookup);
                buf.put_slice(&addr.octets());
                match state.v6_routes.get(&addr) {
                    Some((metric, nexthops)) => {
                        buf.put_u32(*metric);
                        buf.put_u8(nexthops.len() as u8);
                        for nexthop in nexthops {
                            put_nexthop_v6(&mut buf, nexthop);
                        }
                    }
                    None => {
                        buf.put_u32(0);
                        buf.put_u8(0);
                    }
                }
                vec![seal(buf)]
            }
            17 => {
                let len = payload[0];
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&payload[1..5]);
                let prefix = Ipv4Net::new(Ipv4Addr::from(octets), len).unwrap();
                let state = state.lock().unwrap();
                let mut buf = reply_header(Command::Ipv4ImportLookup);
                buf.put_slice(&prefix.addr().octets());
                match state.import_routes.get(&prefix) {
                    Some((metric, nexthops)) => {
                        buf.put_u32(*metric);
                        buf.put_u8(nexthops.len() as u8);
                        if let Some(first) = nexthops.first() {
                            put_nexthop_v4(&mut buf, first);
                        }
                    }
                    None => {
                        buf.put_u32(0);
                        buf.put_u8(0);
                    }
                }
                vec![seal(buf)]
            }
            24 => {
                let more_follows = payload[0] != 0;
                let count = u16::from_be_bytes([payload[1], payload[2]]);
                let mut state = state.lock().unwrap();
                state.verify_batches.push((more_follows, count));
                if more_follows {
                    vec![]
                } else if state.verify_replies.is_empty() {
                    vec![verify_reply(&[], false)]
                } else {
                    let batches = std::mem::take(&mut state.verify_replies);
                    let last = batches.len() - 1;
                    batches
                        .iter()
                        .enumerate()
                        .map(|(i, prefixes)| verify_reply(prefixes, i != last))
                        .collect()
                }
            }
            other => panic!("test server got unexpected command {}", other),
        };

        for reply in replies {
            stream.write_all(&reply).await?;
        }
    }
    Ok(())
}
