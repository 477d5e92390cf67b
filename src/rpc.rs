//! The RPC transaction multiplexer.
//!
//! Outstanding requests live in a fixed arena of observer slots. A slot
//! handle is `(slot, generation)` serialized as the 4-byte transaction
//! tag stamped into every outbound query, so a reply resolves only while
//! its slot is armed with the same generation. Recycling a slot bumps
//! the generation, which makes late and forged replies fall on the
//! floor instead of resurrecting a finished request.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::bencode::Value;
use crate::id::NodeId;
use crate::node::Transport;
use crate::traversal::TraversalId;

pub const TAG_LEN: usize = 4;

/// What a pending RPC reports back into when it resolves.
#[derive(Debug, Clone)]
pub enum ObserverTarget {
    /// A query issued by an iterative lookup.
    Traversal(TraversalId),
    /// A standalone ping (bootstrap seeding, `add_node`).
    Ping,
    /// Liveness check of a stale bucket entry; on timeout the newcomer
    /// takes its slot.
    ReplacementPing { stale: NodeId, newcomer: NodeId },
    /// The write phase of an announce.
    AnnounceWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle {
    slot: u16,
    generation: u16,
}

impl ObserverHandle {
    pub fn tag(&self) -> Bytes {
        let mut tag = [0u8; TAG_LEN];
        tag[..2].copy_from_slice(&self.slot.to_be_bytes());
        tag[2..].copy_from_slice(&self.generation.to_be_bytes());
        Bytes::copy_from_slice(&tag)
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        if tag.len() != TAG_LEN {
            return None;
        }
        Some(Self {
            slot: u16::from_be_bytes([tag[0], tag[1]]),
            generation: u16::from_be_bytes([tag[2], tag[3]]),
        })
    }
}

#[derive(Debug)]
struct Pending {
    target: ObserverTarget,
    to: SocketAddr,
    /// Routing table entry this request is attributed to, when known.
    node: Option<NodeId>,
    sent_at: Instant,
}

struct Slot {
    generation: u16,
    pending: Option<Pending>,
}

/// A resolved (answered) request.
pub struct RpcReply {
    pub target: ObserverTarget,
    pub to: SocketAddr,
    pub rtt: Duration,
}

/// A request that timed out or was failed eagerly.
pub struct RpcFailure {
    pub target: ObserverTarget,
    pub to: SocketAddr,
    pub node: Option<NodeId>,
}

pub struct RpcManager {
    slots: Vec<Slot>,
    free: Vec<u16>,
    timeout: Duration,
}

impl RpcManager {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                pending: None,
            })
            .collect();
        Self {
            slots,
            free: (0..capacity as u16).rev().collect(),
            timeout,
        }
    }

    /// Reserves an observer slot. `None` means the pool is exhausted and
    /// the caller must abandon the RPC.
    pub fn allocate(&mut self) -> Option<ObserverHandle> {
        let slot = self.free.pop()?;
        Some(ObserverHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        })
    }

    /// Stamps the transaction tag into `query`, arms the slot, and hands
    /// the message to the transport sink.
    pub fn invoke(
        &mut self,
        handle: ObserverHandle,
        target: ObserverTarget,
        node: Option<NodeId>,
        mut query: Value,
        to: SocketAddr,
        now: Instant,
        sink: &mut dyn Transport,
    ) {
        let Some(slot) = self.slots.get_mut(handle.slot as usize) else {
            return;
        };
        if slot.generation != handle.generation || slot.pending.is_some() {
            return;
        }
        slot.pending = Some(Pending {
            target,
            to,
            node,
            sent_at: now,
        });
        if let Value::Dict(dict) = &mut query {
            dict.insert(Bytes::from_static(b"t"), Value::Bytes(handle.tag()));
        }
        sink.send(query, to);
    }

    /// Matches a reply's transaction tag against the arena.
    ///
    /// The source endpoint must be the one the request went to; anything
    /// else leaves the slot armed and returns `None`.
    pub fn incoming(&mut self, tag: &[u8], from: SocketAddr, now: Instant) -> Option<RpcReply> {
        let handle = ObserverHandle::from_tag(tag)?;
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            debug!(%from, "reply for a recycled observer slot");
            return None;
        }
        if slot.pending.as_ref()?.to != from {
            debug!(%from, "reply from unexpected endpoint");
            return None;
        }
        let pending = slot.pending.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);
        Some(RpcReply {
            target: pending.target,
            to: pending.to,
            rtt: now.duration_since(pending.sent_at),
        })
    }

    /// Times out stale requests. Returns the failures plus the deadline
    /// of the next outstanding request, if any.
    pub fn tick(&mut self, now: Instant) -> (Vec<RpcFailure>, Option<Instant>) {
        let mut failures = Vec::new();
        let mut next: Option<Instant> = None;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let Some(pending) = &slot.pending else {
                continue;
            };
            let deadline = pending.sent_at + self.timeout;
            if deadline <= now {
                let Some(pending) = slot.pending.take() else {
                    continue;
                };
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(i as u16);
                failures.push(RpcFailure {
                    target: pending.target,
                    to: pending.to,
                    node: pending.node,
                });
            } else {
                next = Some(match next {
                    Some(n) => n.min(deadline),
                    None => deadline,
                });
            }
        }
        if !failures.is_empty() {
            debug!(count = failures.len(), "timed out rpcs");
        }
        (failures, next)
    }

    /// Fails every outstanding request bound for `addr` eagerly.
    pub fn unreachable(&mut self, addr: SocketAddr) -> Vec<RpcFailure> {
        let mut failures = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let hit = slot
                .pending
                .as_ref()
                .map(|p| p.to == addr)
                .unwrap_or(false);
            if !hit {
                continue;
            }
            let Some(pending) = slot.pending.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(i as u16);
            failures.push(RpcFailure {
                target: pending.target,
                to: pending.to,
                node: pending.node,
            });
        }
        failures
    }

    pub fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<(Value, SocketAddr)>>>);

    impl Transport for RecordingSink {
        fn send(&mut self, message: Value, to: SocketAddr) {
            self.0.lock().push((message, to));
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new([10, 0, 0, 1].into(), port)
    }

    fn empty_query() -> Value {
        Value::Dict(Default::default())
    }

    #[test]
    fn pool_is_bounded() {
        let mut rpc = RpcManager::new(4, Duration::from_secs(15));
        let handles: Vec<_> = (0..4).map(|_| rpc.allocate().unwrap()).collect();
        assert!(rpc.allocate().is_none());
        assert_eq!(handles.len(), 4);
    }

    #[test]
    fn reply_resolves_and_frees_the_slot() {
        let mut sink = RecordingSink::default();
        let mut rpc = RpcManager::new(4, Duration::from_secs(15));
        let now = Instant::now();

        let h = rpc.allocate().unwrap();
        rpc.invoke(
            h,
            ObserverTarget::Ping,
            None,
            empty_query(),
            addr(1000),
            now,
            &mut sink,
        );
        assert_eq!(rpc.outstanding(), 1);

        let sent = sink.0.lock();
        let tag = sent[0].0.get_bytes(b"t").unwrap().clone();
        drop(sent);

        let reply = rpc
            .incoming(&tag, addr(1000), now + Duration::from_millis(20))
            .unwrap();
        assert!(matches!(reply.target, ObserverTarget::Ping));
        assert_eq!(reply.rtt, Duration::from_millis(20));
        assert_eq!(rpc.outstanding(), 0);

        // the tag is dead now
        assert!(rpc.incoming(&tag, addr(1000), now).is_none());
    }

    #[test]
    fn reply_from_wrong_endpoint_is_ignored() {
        let mut sink = RecordingSink::default();
        let mut rpc = RpcManager::new(4, Duration::from_secs(15));
        let now = Instant::now();

        let h = rpc.allocate().unwrap();
        rpc.invoke(
            h,
            ObserverTarget::Ping,
            None,
            empty_query(),
            addr(1000),
            now,
            &mut sink,
        );
        let tag = h.tag();

        assert!(rpc.incoming(&tag, addr(2000), now).is_none());
        assert_eq!(rpc.outstanding(), 1);
        assert!(rpc.incoming(&tag, addr(1000), now).is_some());
    }

    #[test]
    fn recycled_generation_rejects_late_replies() {
        let mut sink = RecordingSink::default();
        let mut rpc = RpcManager::new(1, Duration::from_secs(15));
        let now = Instant::now();

        let h = rpc.allocate().unwrap();
        rpc.invoke(
            h,
            ObserverTarget::Ping,
            None,
            empty_query(),
            addr(1000),
            now,
            &mut sink,
        );
        let old_tag = h.tag();
        assert!(rpc.incoming(&old_tag, addr(1000), now).is_some());

        // same slot, next generation
        let h2 = rpc.allocate().unwrap();
        rpc.invoke(
            h2,
            ObserverTarget::Ping,
            None,
            empty_query(),
            addr(1000),
            now,
            &mut sink,
        );
        assert!(rpc.incoming(&old_tag, addr(1000), now).is_none());
        assert_eq!(rpc.outstanding(), 1);
    }

    #[test]
    fn timeouts_fire_exactly_once() {
        let mut sink = RecordingSink::default();
        let mut rpc = RpcManager::new(4, Duration::from_secs(15));
        let now = Instant::now();

        let h = rpc.allocate().unwrap();
        rpc.invoke(
            h,
            ObserverTarget::Ping,
            None,
            empty_query(),
            addr(1000),
            now,
            &mut sink,
        );

        let (failures, next) = rpc.tick(now + Duration::from_secs(1));
        assert!(failures.is_empty());
        assert_eq!(next, Some(now + Duration::from_secs(15)));

        let (failures, next) = rpc.tick(now + Duration::from_secs(16));
        assert_eq!(failures.len(), 1);
        assert!(next.is_none());
        assert_eq!(rpc.outstanding(), 0);

        let (failures, _) = rpc.tick(now + Duration::from_secs(17));
        assert!(failures.is_empty());
    }

    #[test]
    fn unreachable_fails_all_requests_to_that_endpoint() {
        let mut sink = RecordingSink::default();
        let mut rpc = RpcManager::new(8, Duration::from_secs(15));
        let now = Instant::now();

        for _ in 0..3 {
            let h = rpc.allocate().unwrap();
            rpc.invoke(
                h,
                ObserverTarget::Ping,
                None,
                empty_query(),
                addr(1000),
                now,
                &mut sink,
            );
        }
        let h = rpc.allocate().unwrap();
        rpc.invoke(
            h,
            ObserverTarget::Ping,
            None,
            empty_query(),
            addr(2000),
            now,
            &mut sink,
        );

        let failures = rpc.unreachable(addr(1000));
        assert_eq!(failures.len(), 3);
        assert_eq!(rpc.outstanding(), 1);
    }
}
