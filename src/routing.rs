//! The routing table: 160 K-buckets keyed by XOR distance exponent.
//!
//! Each bucket holds up to K live entries plus a replacement cache.
//! Insertion distinguishes a weak signal (`heard_about`: the address is
//! merely claimed) from a strong one (`node_seen`: the remote proved it
//! receives traffic at that address, e.g. by spending a write token).
//! A full bucket never drops the newcomer outright: it is cached and the
//! stalest live entry is handed back to the caller for a liveness ping.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::id::{self, NodeId};

pub const NUM_BUCKETS: usize = 160;

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub rtt: Option<Duration>,
    pub fails: u8,
    /// Proved ownership of its address at least once.
    pub confirmed: bool,
}

impl NodeEntry {
    fn new(id: NodeId, addr: SocketAddr, confirmed: bool, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            rtt: None,
            fails: 0,
            confirmed,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.fails = 0;
        self.confirmed = true;
    }
}

#[derive(Debug)]
struct Bucket {
    live: VecDeque<NodeEntry>,
    replacements: VecDeque<NodeEntry>,
    last_active: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            live: VecDeque::new(),
            replacements: VecDeque::new(),
            last_active: now,
        }
    }

    fn is_unused(&self) -> bool {
        self.live.is_empty() && self.replacements.is_empty()
    }

    fn promote(&mut self) {
        if let Some(r) = self.replacements.pop_front() {
            self.live.push_back(r);
        }
    }
}

/// Outcome of offering a node to the table.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Inserted as a live entry.
    Added,
    /// Already present; refreshed.
    Updated,
    /// Bucket full; parked in the replacement cache.
    Cached,
    /// Bucket full; parked, and the caller should ping this stale live
    /// entry. If the ping times out, `replace_stale` swaps them.
    PingStale(NodeEntry),
    /// Not admitted.
    Dropped,
}

pub struct RoutingTable {
    local: NodeId,
    k: usize,
    fail_limit: u8,
    refresh_interval: Duration,
    buckets: Vec<Bucket>,
    routers: Vec<SocketAddr>,
}

impl RoutingTable {
    pub fn new(
        local: NodeId,
        k: usize,
        fail_limit: u8,
        refresh_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            local,
            k,
            fail_limit,
            refresh_interval,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new(now)).collect(),
            routers: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Registers a bootstrap seed. Router nodes are contacted during
    /// bootstrap but never stored in a bucket or returned from lookups.
    pub fn add_router_node(&mut self, addr: SocketAddr) {
        if !self.routers.contains(&addr) {
            self.routers.push(addr);
        }
    }

    pub fn routers(&self) -> &[SocketAddr] {
        &self.routers
    }

    pub fn is_router(&self, addr: &SocketAddr) -> bool {
        self.routers.contains(addr)
    }

    /// Weak signal: some message mentioned this node.
    pub fn heard_about(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> Admission {
        self.insert(id, addr, false, None, now)
    }

    /// Strong signal: the node proved it owns its source address.
    pub fn node_seen(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        rtt: Option<Duration>,
        now: Instant,
    ) -> Admission {
        self.insert(id, addr, true, rtt, now)
    }

    fn insert(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        confirmed: bool,
        rtt: Option<Duration>,
        now: Instant,
    ) -> Admission {
        if id == self.local || self.is_router(&addr) {
            return Admission::Dropped;
        }
        let Some(idx) = self.local.distance_exp(&id) else {
            return Admission::Dropped;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        // an ID that does not bind to its address may only occupy an
        // otherwise unused bucket
        if !id::verify_id(&id, addr.ip()) && !bucket.is_unused() {
            debug!(%id, %addr, "dropping node with unverifiable id");
            return Admission::Dropped;
        }

        if let Some(entry) = bucket.live.iter_mut().find(|e| e.id == id) {
            if confirmed {
                entry.touch(now);
                entry.addr = addr;
                if rtt.is_some() {
                    entry.rtt = rtt;
                }
                bucket.last_active = now;
            }
            return Admission::Updated;
        }

        if let Some(pos) = bucket.replacements.iter().position(|e| e.id == id) {
            if let Some(entry) = bucket.replacements.get_mut(pos) {
                if confirmed {
                    entry.touch(now);
                }
            }
            if bucket.live.len() < k {
                if let Some(entry) = bucket.replacements.remove(pos) {
                    bucket.live.push_back(entry);
                    bucket.last_active = now;
                    return Admission::Added;
                }
            }
            return Admission::Cached;
        }

        let mut entry = NodeEntry::new(id, addr, confirmed, now);
        entry.rtt = rtt;

        if bucket.live.len() < k {
            bucket.live.push_back(entry);
            bucket.last_active = now;
            return Admission::Added;
        }

        // a proven node may displace the stalest entry that has been
        // failing
        if confirmed {
            let failing = bucket
                .live
                .iter()
                .enumerate()
                .filter(|(_, e)| e.fails > 0)
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(i, _)| i);
            if let Some(pos) = failing {
                bucket.live.remove(pos);
                bucket.live.push_back(entry);
                bucket.last_active = now;
                return Admission::Added;
            }
        }

        let stale = bucket.live.iter().min_by_key(|e| e.last_seen).cloned();
        if bucket.replacements.len() >= k {
            bucket.replacements.pop_front();
        }
        bucket.replacements.push_back(entry);
        match stale {
            Some(s) => Admission::PingStale(s),
            None => Admission::Cached,
        }
    }

    /// Advances the failure counter; at the limit the entry is evicted
    /// and a replacement promoted.
    pub fn node_failed(&mut self, id: &NodeId) {
        let Some(idx) = self.buckets_index(id) else {
            return;
        };
        let fail_limit = self.fail_limit;
        let k = self.k;
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.live.iter().position(|e| e.id == *id) else {
            return;
        };
        let evict = {
            let entry = &mut bucket.live[pos];
            entry.fails = entry.fails.saturating_add(1);
            entry.fails >= fail_limit
        };
        if evict {
            debug!(%id, "evicting node after repeated failures");
            bucket.live.remove(pos);
            if bucket.live.len() < k {
                bucket.promote();
            }
        }
    }

    /// A stale entry failed its liveness ping: swap it for the cached
    /// newcomer (or, if that is gone, the oldest replacement).
    pub fn replace_stale(&mut self, stale: &NodeId, newcomer: &NodeId) {
        let Some(idx) = self.buckets_index(stale) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        let Some(live_pos) = bucket.live.iter().position(|e| e.id == *stale) else {
            return;
        };
        let replacement = match bucket.replacements.iter().position(|e| e.id == *newcomer) {
            Some(pos) => bucket.replacements.remove(pos),
            None => bucket.replacements.pop_front(),
        };
        bucket.live.remove(live_pos);
        if let Some(r) = replacement {
            debug!(stale = %stale, new = %r.id, "replaced stale bucket entry");
            bucket.live.push_back(r);
        }
    }

    /// The `count` live entries closest to `target`: the target's bucket
    /// first, expanding outward on shortfall. Router nodes never appear.
    pub fn find_node(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let start = self.local.distance_exp(target).unwrap_or(0);
        let mut found: Vec<NodeEntry> = Vec::with_capacity(count * 2);
        found.extend(self.buckets[start].live.iter().cloned());

        let mut d = 1;
        while found.len() < count && (d <= start || start + d < NUM_BUCKETS) {
            if d <= start {
                found.extend(self.buckets[start - d].live.iter().cloned());
            }
            if start + d < NUM_BUCKETS {
                found.extend(self.buckets[start + d].live.iter().cloned());
            }
            d += 1;
        }

        found.sort_by_key(|e| e.id.distance(target));
        found.truncate(count);
        found
    }

    /// A randomized target inside the first bucket that has gone
    /// untouched past the refresh interval, or `None`.
    pub fn need_refresh(&mut self, now: Instant) -> Option<NodeId> {
        let local = self.local;
        let interval = self.refresh_interval;
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            if bucket.live.is_empty() {
                continue;
            }
            if now.duration_since(bucket.last_active) < interval {
                continue;
            }
            bucket.last_active = now;
            return Some(local.random_with_exponent(i));
        }
        None
    }

    pub fn bucket_size(&self, idx: usize) -> usize {
        self.buckets.get(idx).map(|b| b.live.len()).unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    pub fn replacement_count(&self) -> usize {
        self.buckets.iter().map(|b| b.replacements.len()).sum()
    }

    fn buckets_index(&self, id: &NodeId) -> Option<usize> {
        self.local.distance_exp(id)
    }

    #[cfg(test)]
    fn bucket_of(&self, id: &NodeId) -> &Bucket {
        &self.buckets[self.local.distance_exp(id).expect("own id")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const K: usize = 8;

    fn now() -> Instant {
        Instant::now()
    }

    fn table(local: NodeId) -> RoutingTable {
        RoutingTable::new(local, K, 3, Duration::from_secs(15 * 60), now())
    }

    fn addr(last: u8) -> SocketAddr {
        // 10.0.0.0/8 is exempt from ID binding
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 6881)
    }

    /// An ID at a fixed distance exponent from `local`.
    fn id_in_bucket(local: &NodeId, exp: usize, salt: u8) -> NodeId {
        let mut id = local.0;
        let byte = 19 - exp / 8;
        id[byte] ^= 1 << (exp % 8);
        id[19] ^= salt;
        // keep the salt below the flipped bit for low exponents
        if exp < 8 {
            id[19] = local.0[19] ^ (1 << (exp % 8));
            id[18] ^= salt;
        }
        NodeId(id)
    }

    #[test]
    fn live_entries_match_their_bucket_exponent() {
        let local = NodeId::MIN;
        let mut t = table(local);
        for i in 0..60u8 {
            let id = NodeId::random();
            t.heard_about(id, addr(i), now());
        }
        for (i, bucket) in t.buckets.iter().enumerate() {
            for e in &bucket.live {
                assert_eq!(local.distance_exp(&e.id), Some(i));
            }
        }
    }

    #[test]
    fn bucket_capacity_is_bounded() {
        let local = NodeId::MIN;
        let mut t = table(local);
        for salt in 0..40u8 {
            let id = id_in_bucket(&local, 100, salt);
            t.heard_about(id, addr(salt), now());
        }
        for bucket in &t.buckets {
            assert!(bucket.live.len() <= K);
            assert!(bucket.replacements.len() <= K);
        }
    }

    #[test]
    fn full_bucket_asks_for_a_stale_ping() {
        let local = NodeId::MIN;
        let mut t = table(local);
        for salt in 0..K as u8 {
            assert!(matches!(
                t.heard_about(id_in_bucket(&local, 100, salt), addr(salt), now()),
                Admission::Added
            ));
        }
        let newcomer = id_in_bucket(&local, 100, 99);
        match t.heard_about(newcomer, addr(99), now()) {
            Admission::PingStale(stale) => {
                assert_eq!(local.distance_exp(&stale.id), Some(100));
            }
            other => panic!("expected PingStale, got {:?}", other),
        }
        assert_eq!(t.bucket_of(&newcomer).replacements.len(), 1);
    }

    #[test]
    fn replace_stale_promotes_the_newcomer() {
        let local = NodeId::MIN;
        let mut t = table(local);
        for salt in 0..K as u8 {
            t.heard_about(id_in_bucket(&local, 100, salt), addr(salt), now());
        }
        let newcomer = id_in_bucket(&local, 100, 99);
        let Admission::PingStale(stale) = t.heard_about(newcomer, addr(99), now()) else {
            panic!("expected PingStale");
        };

        t.replace_stale(&stale.id, &newcomer);

        let bucket = t.bucket_of(&newcomer);
        assert_eq!(bucket.live.len(), K);
        assert!(bucket.live.iter().any(|e| e.id == newcomer));
        assert!(!bucket.live.iter().any(|e| e.id == stale.id));
    }

    #[test]
    fn repeated_failures_evict_and_promote() {
        let local = NodeId::MIN;
        let mut t = table(local);
        for salt in 0..K as u8 {
            t.heard_about(id_in_bucket(&local, 100, salt), addr(salt), now());
        }
        let cached = id_in_bucket(&local, 100, 77);
        t.heard_about(cached, addr(77), now());

        let victim = id_in_bucket(&local, 100, 0);
        for _ in 0..3 {
            t.node_failed(&victim);
        }
        let bucket = t.bucket_of(&victim);
        assert!(!bucket.live.iter().any(|e| e.id == victim));
        assert!(bucket.live.iter().any(|e| e.id == cached));
    }

    #[test]
    fn find_node_returns_closest() {
        let local = NodeId::MIN;
        let mut t = table(local);
        for exp in [50usize, 80, 100, 140] {
            for salt in 0..4u8 {
                t.heard_about(id_in_bucket(&local, exp, salt), addr(salt + exp as u8), now());
            }
        }
        let target = id_in_bucket(&local, 80, 0);
        let found = t.find_node(&target, K);
        assert_eq!(found.len(), K);
        assert_eq!(found[0].id, target);
        // results are sorted by distance to the target
        for w in found.windows(2) {
            assert!(w[0].id.distance(&target) <= w[1].id.distance(&target));
        }
    }

    #[test]
    fn router_nodes_are_never_stored_or_returned() {
        let local = NodeId::MIN;
        let mut t = table(local);
        let router = addr(200);
        t.add_router_node(router);

        assert!(matches!(
            t.heard_about(id_in_bucket(&local, 100, 1), router, now()),
            Admission::Dropped
        ));
        assert_eq!(t.node_count(), 0);
    }

    #[test]
    fn unverifiable_id_only_in_unused_bucket() {
        let local = NodeId::MIN;
        let mut t = table(local);
        let public = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 6881);

        // an ID generated for a different address will not bind (up to a
        // vanishing crc collision chance)
        let bad = {
            let mut id = id::generate_id(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
            id.0[10] ^= 1; // keep it away from local's bucket 159 neighbours
            id
        };
        assert!(!id::verify_id(&bad, public.ip()));

        assert!(matches!(
            t.heard_about(bad, public, now()),
            Admission::Added
        ));

        // second unverifiable ID for the same bucket is refused
        let mut bad2 = bad;
        bad2.0[19] ^= 0x04;
        if t.local.distance_exp(&bad2) == t.local.distance_exp(&bad) {
            assert!(matches!(
                t.heard_about(bad2, public, now()),
                Admission::Dropped
            ));
        }
    }

    #[test]
    fn need_refresh_fires_once_per_interval() {
        let local = NodeId::MIN;
        let start = now();
        let mut t = RoutingTable::new(local, K, 3, Duration::from_secs(60), start);
        t.heard_about(id_in_bucket(&local, 100, 1), addr(1), start);

        assert!(t.need_refresh(start).is_none());

        let later = start + Duration::from_secs(61);
        let target = t.need_refresh(later).expect("stale bucket");
        assert_eq!(local.distance_exp(&target), Some(100));
        assert!(t.need_refresh(later).is_none());
    }
}
