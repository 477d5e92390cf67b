//! 160-bit node identifiers and the XOR metric.
//!
//! IDs are IP-bound: a node's ID must match a CRC32C hash of its masked
//! external address, so a remote cannot claim an arbitrary position in
//! the keyspace without controlling a matching address. Local network
//! addresses are exempt.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::Rng as _;

use crate::error::Error;

pub const ID_LEN: usize = 20;

/// Mask applied to an IPv4 address before hashing it into an ID.
pub const IPV4_MASK: u32 = 0x030f_3fff;

/// Mask applied to the high 64 bits of an IPv6 address.
pub const IPV6_MASK: u64 = 0x0103_070f_1f3f_7fff;

/// A 160-bit identifier: a node ID, an info-hash, or a lookup target.
///
/// Ordering is big-endian numeric, which makes `Ord` agree with the XOR
/// metric on distances.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0u8; ID_LEN]);

    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != ID_LEN {
            return Err(Error::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance to `other`, big-endian.
    pub fn distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Position of the highest set bit of the XOR distance, i.e.
    /// `floor(log2(self xor other))`. `None` when the IDs are equal.
    ///
    /// This doubles as the routing table bucket index: 159 is the most
    /// distant half of the keyspace, 0 a single-bit difference.
    pub fn distance_exp(&self, other: &NodeId) -> Option<usize> {
        for (i, byte) in self.distance(other).iter().enumerate() {
            if *byte != 0 {
                let high_bit = 7 - byte.leading_zeros() as usize;
                return Some((ID_LEN - 1 - i) * 8 + high_bit);
            }
        }
        None
    }

    /// A random ID whose distance exponent from `self` is exactly `exp`.
    ///
    /// Used to aim refresh lookups into a specific bucket.
    pub fn random_with_exponent(&self, exp: usize) -> NodeId {
        debug_assert!(exp < ID_LEN * 8);
        let mut id = self.0;
        let mut rng = rand::rng();
        let byte = ID_LEN - 1 - exp / 8;
        let bit = (exp % 8) as u8;

        id[byte] ^= 1 << bit;
        if bit > 0 {
            let low_mask = (1u8 << bit) - 1;
            let r: u8 = rng.random();
            id[byte] = (id[byte] & !low_mask) | (r & low_mask);
        }
        for b in &mut id[byte + 1..] {
            *b = rng.random();
        }
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Generates an ID bound to `ip`.
///
/// The first 21 bits come from the CRC32C hash of the masked address
/// combined with a 3-bit random value; that value is stored in the last
/// byte so a verifier can recompute the hash. Local addresses get a
/// fully random ID.
pub fn generate_id(ip: IpAddr) -> NodeId {
    if is_local_network(&ip) {
        return NodeId::random();
    }

    let mut rng = rand::rng();
    let r: u8 = rng.random::<u8>() & 0x07;
    let crc = ip_crc(ip, r);

    let mut id = [0u8; ID_LEN];
    rng.fill(&mut id);

    id[0] = (crc >> 24) as u8;
    id[1] = (crc >> 16) as u8;
    id[2] = (id[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
    id[19] = r;

    NodeId(id)
}

/// Whether `id` is correctly bound to `ip`.
pub fn verify_id(id: &NodeId, ip: IpAddr) -> bool {
    if is_local_network(&ip) {
        return true;
    }

    let r = id.0[19] & 0x07;
    let expected = ip_crc(ip, r);

    let actual =
        ((id.0[0] as u32) << 24) | ((id.0[1] as u32) << 16) | ((id.0[2] as u32) << 8);

    actual & 0xffff_f800 == expected & 0xffff_f800
}

fn ip_crc(ip: IpAddr, r: u8) -> u32 {
    match ip {
        IpAddr::V4(v4) => {
            let masked = (u32::from(v4) & IPV4_MASK) | ((r as u32) << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut high = [0u8; 8];
            high.copy_from_slice(&octets[..8]);
            let masked = (u64::from_be_bytes(high) & IPV6_MASK) | ((r as u64) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// Private, link-local and loopback ranges are exempt from ID binding.
pub fn is_local_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => is_local_v6(v6),
    }
}

fn is_local_v4(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
        || o[0] == 127
}

fn is_local_v6(ip: &Ipv6Addr) -> bool {
    let seg = ip.segments();
    ip.is_loopback() || seg[0] & 0xffc0 == 0xfe80 || seg[0] & 0xfe00 == 0xfc00
}
