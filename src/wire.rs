//! Packed endpoint and node record codecs.
//!
//! Endpoints travel as 4+2 (v4) or 16+2 (v6) bytes, port big-endian.
//! Node sets travel as a `nodes` blob of concatenated 26-byte records
//! (ID + v4 endpoint) plus, when v6 nodes are present, a `nodes2` list
//! of 38-byte records (ID + v6 endpoint).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::id::{NodeId, ID_LEN};

pub const ENDPOINT_V4_LEN: usize = 6;
pub const ENDPOINT_V6_LEN: usize = 18;
pub const NODE_V4_LEN: usize = ID_LEN + ENDPOINT_V4_LEN;
pub const NODE_V6_LEN: usize = ID_LEN + ENDPOINT_V6_LEN;

/// Appends the packed form of `addr` to `out`.
pub fn pack_endpoint(addr: &SocketAddr, out: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Decodes a packed endpoint; accepts the 6-byte and the 18-byte form.
pub fn unpack_endpoint(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        ENDPOINT_V4_LEN => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ENDPOINT_V6_LEN => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// The bare address octets, used for the self-address hint in replies.
pub fn pack_ip(ip: &IpAddr) -> Bytes {
    match ip {
        IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
    }
}

/// Splits a node set into the v4 `nodes` blob and the v6 `nodes2` records.
pub fn encode_nodes(nodes: &[(NodeId, SocketAddr)]) -> (Bytes, Vec<Bytes>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for (id, addr) in nodes {
        match addr.ip() {
            IpAddr::V4(_) => {
                v4.extend_from_slice(id.as_bytes());
                pack_endpoint(addr, &mut v4);
            }
            IpAddr::V6(_) => {
                let mut rec = Vec::with_capacity(NODE_V6_LEN);
                rec.extend_from_slice(id.as_bytes());
                pack_endpoint(addr, &mut rec);
                v6.push(Bytes::from(rec));
            }
        }
    }
    (Bytes::from(v4), v6)
}

/// Decodes a `nodes` blob of 26-byte records. Trailing bytes that do not
/// form a whole record are ignored.
pub fn decode_nodes(blob: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    blob.chunks_exact(NODE_V4_LEN)
        .filter_map(decode_node)
        .collect()
}

/// Decodes one 26-byte or 38-byte node record.
pub fn decode_node(record: &[u8]) -> Option<(NodeId, SocketAddr)> {
    if record.len() != NODE_V4_LEN && record.len() != NODE_V6_LEN {
        return None;
    }
    let id = NodeId::from_bytes(&record[..ID_LEN]).ok()?;
    let addr = unpack_endpoint(&record[ID_LEN..])?;
    Some((id, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    #[test]
    fn endpoint_roundtrip_v4() {
        let addr = v4(192, 168, 1, 1, 6881);
        let mut buf = Vec::new();
        pack_endpoint(&addr, &mut buf);
        assert_eq!(buf.len(), ENDPOINT_V4_LEN);
        assert_eq!(unpack_endpoint(&buf), Some(addr));
    }

    #[test]
    fn endpoint_roundtrip_v6() {
        let addr = SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            6881,
        );
        let mut buf = Vec::new();
        pack_endpoint(&addr, &mut buf);
        assert_eq!(buf.len(), ENDPOINT_V6_LEN);
        assert_eq!(unpack_endpoint(&buf), Some(addr));
    }

    #[test]
    fn unpack_rejects_odd_lengths() {
        assert_eq!(unpack_endpoint(&[0u8; 5]), None);
        assert_eq!(unpack_endpoint(&[0u8; 7]), None);
        assert_eq!(unpack_endpoint(&[]), None);
    }

    #[test]
    fn nodes_blob_roundtrip() {
        let nodes = vec![
            (NodeId([1u8; 20]), v4(10, 0, 0, 1, 1000)),
            (NodeId([2u8; 20]), v4(10, 0, 0, 2, 2000)),
        ];
        let (blob, v6) = encode_nodes(&nodes);
        assert_eq!(blob.len(), 2 * NODE_V4_LEN);
        assert!(v6.is_empty());

        let decoded = decode_nodes(&blob);
        assert_eq!(decoded, nodes);

        let (again, _) = encode_nodes(&decoded);
        assert_eq!(again, blob);
    }

    #[test]
    fn mixed_nodes_split_into_v6_records() {
        let six = SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 9)),
            4242,
        );
        let nodes = vec![
            (NodeId([1u8; 20]), v4(10, 0, 0, 1, 1000)),
            (NodeId([3u8; 20]), six),
        ];
        let (blob, v6) = encode_nodes(&nodes);
        assert_eq!(blob.len(), NODE_V4_LEN);
        assert_eq!(v6.len(), 1);
        assert_eq!(v6[0].len(), NODE_V6_LEN);
        assert_eq!(decode_node(&v6[0]), Some((NodeId([3u8; 20]), six)));
    }
}
