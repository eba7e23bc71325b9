//! Typed protocol messages and their payload codecs.
//!
//! All integers little-endian except network addresses, which keep the
//! protocol's big-endian IP/port layout. Hashes go over the wire in raw
//! storage order. Every HEADERS element is followed by a CompactSize zero
//! (the legacy transaction count); anything else is malformed.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::block::BlockHeader;
use crate::net::wire::{
    write_compact_size, Reader, WireError, MAX_ADDR_ENTRIES, MAX_HEADERS_RESULTS, MAX_INV_ENTRIES,
    MAX_LOCATOR_ENTRIES, MAX_USER_AGENT_LEN,
};
use crate::primitives::Hash256;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: i32 = 70001;

/// Oldest protocol version still accepted.
pub const MIN_PROTOCOL_VERSION: i32 = 70001;

/// Service bit: node serves headers.
pub const NODE_NETWORK: u64 = 1;

/// Inventory type for a block header announcement.
pub const INV_BLOCK: u32 = 2;

/// One advertised address with its last-seen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub time: u32,
    pub services: u64,
    pub addr: SocketAddr,
}

/// One inventory vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: u32,
    pub hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: SocketAddr,
    pub addr_from: SocketAddr,
    pub nonce: u64,
    pub user_agent: String,
    /// Peer's tip height; negative values are tolerated per protocol.
    pub start_height: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<AddrEntry>),
    GetAddr,
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetHeaders {
        version: i32,
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Headers(Vec<BlockHeader>),
    SendHeaders,
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::SendHeaders => "sendheaders",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Version(v) => {
                out.extend_from_slice(&v.version.to_le_bytes());
                out.extend_from_slice(&v.services.to_le_bytes());
                out.extend_from_slice(&v.timestamp.to_le_bytes());
                encode_net_addr(&mut out, v.services, &v.addr_recv);
                encode_net_addr(&mut out, v.services, &v.addr_from);
                out.extend_from_slice(&v.nonce.to_le_bytes());
                write_compact_size(&mut out, v.user_agent.len() as u64);
                out.extend_from_slice(v.user_agent.as_bytes());
                out.extend_from_slice(&v.start_height.to_le_bytes());
            }
            Message::Verack | Message::GetAddr | Message::SendHeaders => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                out.extend_from_slice(&nonce.to_le_bytes());
            }
            Message::Addr(entries) => {
                write_compact_size(&mut out, entries.len() as u64);
                for e in entries {
                    out.extend_from_slice(&e.time.to_le_bytes());
                    encode_net_addr(&mut out, e.services, &e.addr);
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                write_compact_size(&mut out, items.len() as u64);
                for item in items {
                    out.extend_from_slice(&item.kind.to_le_bytes());
                    out.extend_from_slice(item.hash.as_bytes());
                }
            }
            Message::GetHeaders {
                version,
                locator,
                stop,
            } => {
                out.extend_from_slice(&version.to_le_bytes());
                write_compact_size(&mut out, locator.len() as u64);
                for hash in locator {
                    out.extend_from_slice(hash.as_bytes());
                }
                out.extend_from_slice(stop.as_bytes());
            }
            Message::Headers(headers) => {
                write_compact_size(&mut out, headers.len() as u64);
                for header in headers {
                    out.extend_from_slice(&header.encode());
                    // Legacy transaction count; always zero on this chain.
                    write_compact_size(&mut out, 0);
                }
            }
        }
        out
    }

    /// Decodes the payload for `command`, enforcing the per-message entry
    /// caps before any allocation.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, WireError> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => {
                let version = r.i32_le()?;
                let services = r.u64_le()?;
                let timestamp = r.i64_le()?;
                let (_, addr_recv) = decode_net_addr(&mut r)?;
                let (_, addr_from) = decode_net_addr(&mut r)?;
                let nonce = r.u64_le()?;
                let user_agent = r.var_string(MAX_USER_AGENT_LEN)?;
                let start_height = r.i32_le()?;
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv,
                    addr_from,
                    nonce,
                    user_agent,
                    start_height,
                })
            }
            "verack" => Message::Verack,
            "ping" => Message::Ping(r.u64_le()?),
            "pong" => Message::Pong(r.u64_le()?),
            "addr" => {
                let count = r.bounded_count(MAX_ADDR_ENTRIES)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let time = r.u32_le()?;
                    let (services, addr) = decode_net_addr(&mut r)?;
                    entries.push(AddrEntry {
                        time,
                        services,
                        addr,
                    });
                }
                Message::Addr(entries)
            }
            "getaddr" => Message::GetAddr,
            "inv" | "getdata" | "notfound" => {
                let count = r.bounded_count(MAX_INV_ENTRIES)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(InvItem {
                        kind: r.u32_le()?,
                        hash: r.hash256()?,
                    });
                }
                match command {
                    "inv" => Message::Inv(items),
                    "getdata" => Message::GetData(items),
                    _ => Message::NotFound(items),
                }
            }
            "getheaders" => {
                let version = r.i32_le()?;
                let count = r.bounded_count(MAX_LOCATOR_ENTRIES)?;
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(r.hash256()?);
                }
                let stop = r.hash256()?;
                Message::GetHeaders {
                    version,
                    locator,
                    stop,
                }
            }
            "headers" => {
                let count = r.bounded_count(MAX_HEADERS_RESULTS)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    let bytes = r.take(BlockHeader::SIZE)?;
                    let mut buf = [0u8; BlockHeader::SIZE];
                    buf.copy_from_slice(bytes);
                    headers.push(BlockHeader::decode(&buf));
                    if r.compact_size()? != 0 {
                        return Err(WireError::Malformed("non-zero txn count"));
                    }
                }
                Message::Headers(headers)
            }
            "sendheaders" => Message::SendHeaders,
            other => return Err(WireError::UnknownCommand(other.to_string())),
        };
        if !r.is_done() {
            return Err(WireError::Malformed("trailing bytes"));
        }
        Ok(message)
    }
}

/// Protocol network address: services (8 LE) | IPv6-mapped IP (16 BE) |
/// port (2 BE).
fn encode_net_addr(out: &mut Vec<u8>, services: u64, addr: &SocketAddr) {
    out.extend_from_slice(&services.to_le_bytes());
    let v6 = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    out.extend_from_slice(&v6.octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
}

fn decode_net_addr(r: &mut Reader<'_>) -> Result<(u64, SocketAddr), WireError> {
    let services = r.u64_le()?;
    let mut octets = [0u8; 16];
    octets.copy_from_slice(r.take(16)?);
    let v6 = Ipv6Addr::from(octets);
    let port = r.u16_be()?;
    let ip = match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    };
    Ok((services, SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Hash160;

    fn round_trip(message: Message) -> Message {
        let payload = message.encode_payload();
        Message::decode(message.command(), &payload).unwrap()
    }

    fn sample_version(start_height: i32) -> VersionMessage {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: 1_700_000_000,
            addr_recv: "203.0.113.7:7372".parse().unwrap(),
            addr_from: "[2001:db8::1]:7372".parse().unwrap(),
            nonce: 0xdead_beef_cafe_f00d,
            user_agent: "/ember:1.0.0/".into(),
            start_height,
        }
    }

    #[test]
    fn version_round_trip_including_negative_height() {
        for height in [0, 2500, -1] {
            let v = sample_version(height);
            match round_trip(Message::Version(v.clone())) {
                Message::Version(got) => assert_eq!(got, v),
                other => panic!("wrong message: {other:?}"),
            }
        }
    }

    #[test]
    fn empty_payload_messages() {
        for m in [Message::Verack, Message::GetAddr, Message::SendHeaders] {
            assert!(m.encode_payload().is_empty());
            assert_eq!(round_trip(m.clone()), m);
        }
    }

    #[test]
    fn ping_pong_nonce() {
        assert_eq!(round_trip(Message::Ping(42)), Message::Ping(42));
        assert_eq!(round_trip(Message::Pong(u64::MAX)), Message::Pong(u64::MAX));
    }

    #[test]
    fn addr_round_trip_and_cap() {
        let entries: Vec<AddrEntry> = (0..5)
            .map(|i| AddrEntry {
                time: 1_700_000_000 + i,
                services: NODE_NETWORK,
                addr: format!("10.0.0.{i}:7372").parse().unwrap(),
            })
            .collect();
        assert_eq!(round_trip(Message::Addr(entries.clone())), Message::Addr(entries));

        // Count over the cap is rejected before allocation.
        let mut payload = Vec::new();
        write_compact_size(&mut payload, MAX_ADDR_ENTRIES as u64 + 1);
        assert!(matches!(
            Message::decode("addr", &payload),
            Err(WireError::Oversized(_))
        ));
    }

    #[test]
    fn inv_cap_enforced() {
        let mut payload = Vec::new();
        write_compact_size(&mut payload, MAX_INV_ENTRIES as u64 + 1);
        assert!(matches!(
            Message::decode("inv", &payload),
            Err(WireError::Oversized(_))
        ));
    }

    #[test]
    fn getheaders_round_trip_and_locator_cap() {
        let locator: Vec<Hash256> = (0u8..3).map(|i| Hash256::new([i; 32])).collect();
        let m = Message::GetHeaders {
            version: PROTOCOL_VERSION,
            locator: locator.clone(),
            stop: Hash256::ZERO,
        };
        assert_eq!(round_trip(m.clone()), m);

        let mut payload = Vec::new();
        payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        write_compact_size(&mut payload, MAX_LOCATOR_ENTRIES as u64 + 1);
        assert!(matches!(
            Message::decode("getheaders", &payload),
            Err(WireError::Oversized(_))
        ));
    }

    #[test]
    fn headers_round_trip_with_zero_txn_counts() {
        let headers: Vec<BlockHeader> = (0u8..4)
            .map(|i| BlockHeader {
                version: 1,
                prev_hash: Hash256::new([i; 32]),
                miner_address: Hash160::ZERO,
                time: 1_700_000_000,
                bits: 0x1e00ffff,
                nonce: i as u32,
                randomx_hash: Hash256::new([0xaa; 32]),
            })
            .collect();
        let m = Message::Headers(headers.clone());
        let payload = m.encode_payload();
        // Each element is 100 bytes + 1 byte txn count.
        assert_eq!(payload.len(), 1 + headers.len() * 101);
        assert_eq!(round_trip(m.clone()), m);
    }

    #[test]
    fn headers_with_nonzero_txn_count_rejected() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            miner_address: Hash160::ZERO,
            time: 0,
            bits: 0x1e00ffff,
            nonce: 0,
            randomx_hash: Hash256::ZERO,
        };
        let mut payload = Vec::new();
        write_compact_size(&mut payload, 1);
        payload.extend_from_slice(&header.encode());
        write_compact_size(&mut payload, 1); // bogus txn count
        assert!(matches!(
            Message::decode("headers", &payload),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut payload = Message::Ping(7).encode_payload();
        payload.push(0);
        assert!(matches!(
            Message::decode("ping", &payload),
            Err(WireError::Malformed("trailing bytes"))
        ));
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(matches!(
            Message::decode("mempool", &[]),
            Err(WireError::UnknownCommand(_))
        ));
    }

    #[test]
    fn net_addr_v4_and_v6_round_trip() {
        let v = sample_version(9);
        let payload = Message::Version(v.clone()).encode_payload();
        match Message::decode("version", &payload).unwrap() {
            Message::Version(got) => {
                assert_eq!(got.addr_recv, v.addr_recv);
                assert_eq!(got.addr_from, v.addr_from);
            }
            _ => unreachable!(),
        }
    }
}
