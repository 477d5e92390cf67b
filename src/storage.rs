//! Bounded in-memory indices: peer announcements per info-hash and
//! signed feed items per target.
//!
//! Both maps evict under pressure instead of refusing writes: torrents
//! drop the entry with the fewest peers, feeds the item with the fewest
//! distinct announcers. Peer entries carry a TTL and are swept by the
//! periodic tick.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::bencode::Value;
use crate::config::MAX_NAME_LEN;
use crate::id::NodeId;

/// Tracks distinct announcer addresses without storing them.
///
/// Three probes into a 1024-bit filter, derived from the SHA1 of the
/// address octets. False positives only ever under-count announcers.
#[derive(Debug, Clone)]
pub struct IpSet {
    bits: [u8; 128],
}

impl IpSet {
    fn new() -> Self {
        Self { bits: [0u8; 128] }
    }

    fn probes(hash: &[u8; 20]) -> [usize; 3] {
        let p = |i: usize| (u16::from_be_bytes([hash[i], hash[i + 1]]) as usize) % (128 * 8);
        [p(0), p(2), p(4)]
    }

    fn contains(&self, hash: &[u8; 20]) -> bool {
        Self::probes(hash)
            .iter()
            .all(|&bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    fn insert(&mut self, hash: &[u8; 20]) {
        for bit in Self::probes(hash) {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }
}

/// SHA1 of the bare address octets, the announcer identity used by the
/// feed index.
pub fn hash_ip(ip: &IpAddr) -> [u8; 20] {
    let mut h = Sha1::new();
    match ip {
        IpAddr::V4(v4) => h.update(v4.octets()),
        IpAddr::V6(v6) => h.update(v6.octets()),
    }
    h.finalize().into()
}

#[derive(Debug)]
pub struct TorrentEntry {
    pub name: Option<Bytes>,
    /// Keyed by peer endpoint; reinsertion refreshes the timestamp.
    peers: HashMap<SocketAddr, Instant>,
}

impl TorrentEntry {
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Uniform sample of up to `max` peers, without materializing the
    /// full set (selection sampling over the iterator).
    pub fn sample_peers(&self, max: usize) -> Vec<SocketAddr> {
        let total = self.peers.len();
        let want = total.min(max);
        let mut picked = Vec::with_capacity(want);
        let mut remaining = total;
        let mut rng = rand::rng();
        for addr in self.peers.keys() {
            if picked.len() == want {
                break;
            }
            let need = want - picked.len();
            if rng.random_range(0..remaining) < need {
                picked.push(*addr);
            }
            remaining -= 1;
        }
        picked
    }

    fn newest(&self) -> Option<Instant> {
        self.peers.values().max().copied()
    }
}

pub struct TorrentStore {
    map: BTreeMap<NodeId, TorrentEntry>,
    max_torrents: usize,
    peer_ttl: Duration,
}

impl TorrentStore {
    pub fn new(max_torrents: usize, peer_ttl: Duration) -> Self {
        Self {
            map: BTreeMap::new(),
            max_torrents,
            peer_ttl,
        }
    }

    /// Inserts or refreshes `peer` under `info_hash`.
    ///
    /// A full index first evicts the entry with the fewest peers (least
    /// recently refreshed on a tie); the info-hash being announced is
    /// never the victim. An announced name is adopted only when the
    /// entry has none, truncated to the name limit.
    pub fn announce(
        &mut self,
        info_hash: NodeId,
        peer: SocketAddr,
        name: Option<&[u8]>,
        now: Instant,
    ) {
        if !self.map.contains_key(&info_hash) && self.map.len() >= self.max_torrents {
            let victim = self
                .map
                .iter()
                .filter(|(hash, _)| **hash != info_hash)
                .min_by_key(|(_, entry)| (entry.peers.len(), entry.newest()))
                .map(|(hash, _)| *hash);
            if let Some(hash) = victim {
                debug!(%hash, "evicting torrent entry with fewest peers");
                self.map.remove(&hash);
            }
        }

        let entry = self.map.entry(info_hash).or_insert_with(|| TorrentEntry {
            name: None,
            peers: HashMap::new(),
        });

        if entry.name.is_none() {
            if let Some(name) = name {
                let name = &name[..name.len().min(MAX_NAME_LEN)];
                entry.name = Some(Bytes::copy_from_slice(name));
            }
        }

        entry.peers.insert(peer, now);
    }

    /// Looks up an entry, optionally by byte prefix.
    ///
    /// `prefix` is a byte count in `[4, 20]`; anything shorter than the
    /// full hash matches the first entry at or above `info_hash` whose
    /// leading bytes agree.
    pub fn lookup(&self, info_hash: &NodeId, prefix: usize) -> Option<&TorrentEntry> {
        let (hash, entry) = self.map.range(*info_hash..).next()?;
        if prefix >= 20 {
            return (hash == info_hash).then_some(entry);
        }
        (hash.0[..prefix] == info_hash.0[..prefix]).then_some(entry)
    }

    /// Purges peers past their TTL; entries left empty are removed.
    pub fn expire(&mut self, now: Instant) {
        let ttl = self.peer_ttl;
        self.map.retain(|hash, entry| {
            entry
                .peers
                .retain(|_, added| now.duration_since(*added) < ttl);
            if entry.peers.is_empty() {
                debug!(%hash, "torrent entry expired");
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// A named list head: `target = H(name ‖ key)`.
    Head,
    /// A list node: `target = H(payload)`.
    Item,
}

#[derive(Debug, Clone)]
pub struct FeedItem {
    pub kind: FeedKind,
    pub name: Option<Bytes>,
    pub key: [u8; 64],
    pub seq: i64,
    pub signature: [u8; 64],
    /// The stored subtree, returned verbatim from `get_item`.
    pub payload: Value,
    pub last_seen: Instant,
    ips: IpSet,
    pub num_announcers: usize,
}

pub struct FeedStore {
    map: HashMap<NodeId, FeedItem>,
    max_items: usize,
}

impl FeedStore {
    pub fn new(max_items: usize) -> Self {
        Self {
            map: HashMap::new(),
            max_items,
        }
    }

    /// Applies a validated feed publication.
    ///
    /// The stored sequence number only moves forward; a lower or equal
    /// sequence refreshes liveness but changes nothing else. A kind
    /// mismatch against the stored item is ignored entirely.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &mut self,
        target: NodeId,
        kind: FeedKind,
        name: Option<Bytes>,
        key: [u8; 64],
        seq: i64,
        signature: [u8; 64],
        payload: Value,
        announcer: &IpAddr,
        now: Instant,
    ) {
        if !self.map.contains_key(&target) {
            if self.map.len() >= self.max_items {
                let victim = self
                    .map
                    .iter()
                    .min_by_key(|(_, item)| item.num_announcers)
                    .map(|(t, _)| *t);
                if let Some(t) = victim {
                    debug!(item = %t, "evicting feed item with fewest announcers");
                    self.map.remove(&t);
                }
            }
            self.map.insert(
                target,
                FeedItem {
                    kind,
                    name: name.clone(),
                    key,
                    seq,
                    signature,
                    payload: payload.clone(),
                    last_seen: now,
                    ips: IpSet::new(),
                    num_announcers: 0,
                },
            );
        }

        let Some(item) = self.map.get_mut(&target) else {
            return;
        };
        if item.kind != kind {
            return;
        }

        item.last_seen = now;
        if seq > item.seq {
            item.payload = payload;
            item.name = name;
            item.seq = seq;
            item.signature = signature;
        }

        let ip_hash = hash_ip(announcer);
        if !item.ips.contains(&ip_hash) {
            item.ips.insert(&ip_hash);
            item.num_announcers += 1;
        }
    }

    pub fn get(&self, target: &NodeId) -> Option<&FeedItem> {
        self.map.get(target)
    }

    /// Drops items unseen for `ttl`.
    pub fn expire(&mut self, ttl: Duration, now: Instant) {
        self.map
            .retain(|_, item| now.duration_since(item.last_seen) < ttl);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
