//! Iterative lookup state machines.
//!
//! A traversal walks the overlay toward a target: it keeps a
//! distance-sorted candidate set, queries the closest unqueried
//! candidates α at a time, merges the node sets replies return, and
//! completes once the K closest candidates have all replied or failed
//! and nothing is outstanding. Event handlers return the queries to
//! send next; the engine owns the sending.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::debug;

use crate::id::NodeId;

pub type TraversalId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    GetPeers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Initial,
    Queried,
    Replied,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    /// Unknown for bootstrap seeds until they reply.
    id: Option<NodeId>,
    addr: SocketAddr,
    state: CandidateState,
    /// Write token this node handed out (`get_peers` lookups).
    token: Option<Bytes>,
}

/// A query the engine should send on behalf of the traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryAction {
    pub to: SocketAddr,
    pub node: Option<NodeId>,
}

/// The interesting parts of a lookup reply.
#[derive(Debug, Default)]
pub struct ReplyData {
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Bytes>,
}

/// A terminal-set entry: a node that replied, with the token it issued.
#[derive(Debug, Clone)]
pub struct ClosestNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub token: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct TraversalStatus {
    pub target: NodeId,
    pub kind: LookupKind,
    pub outstanding: usize,
    pub replied: usize,
    pub failed: usize,
    pub candidates: usize,
}

pub struct Traversal {
    pub id: TraversalId,
    pub kind: LookupKind,
    pub target: NodeId,
    candidates: Vec<Candidate>,
    outstanding: usize,
    alpha: usize,
    k: usize,
    max_candidates: usize,
    replied: usize,
    failed: usize,
    finished: bool,
}

impl Traversal {
    pub fn new(
        id: TraversalId,
        kind: LookupKind,
        target: NodeId,
        alpha: usize,
        k: usize,
        max_candidates: usize,
    ) -> Self {
        Self {
            id,
            kind,
            target,
            candidates: Vec::new(),
            outstanding: 0,
            alpha,
            k,
            max_candidates,
            replied: 0,
            failed: 0,
            finished: false,
        }
    }

    /// Adds a candidate before or during the run. Seeds with an unknown
    /// ID (bootstrap routers) sort ahead of everything and are queried
    /// first.
    pub fn add_candidate(&mut self, id: Option<NodeId>, addr: SocketAddr) {
        if self.candidates.iter().any(|c| c.addr == addr) {
            return;
        }
        if let Some(id) = id {
            if self.candidates.iter().any(|c| c.id == Some(id)) {
                return;
            }
        }
        self.candidates.push(Candidate {
            id,
            addr,
            state: CandidateState::Initial,
            token: None,
        });
    }

    /// Kicks the traversal off. May immediately finish when there are no
    /// candidates at all.
    pub fn start(&mut self) -> Vec<QueryAction> {
        self.sort_and_trim();
        self.advance()
    }

    pub fn on_reply(
        &mut self,
        from: SocketAddr,
        sender: NodeId,
        data: &ReplyData,
    ) -> Vec<QueryAction> {
        if self.finished {
            return Vec::new();
        }
        if let Some(c) = self.candidates.iter_mut().find(|c| c.addr == from) {
            if c.state == CandidateState::Queried {
                self.outstanding -= 1;
            }
            c.state = CandidateState::Replied;
            c.id.get_or_insert(sender);
            if data.token.is_some() {
                c.token = data.token.clone();
            }
            self.replied += 1;
        }
        for (id, addr) in &data.nodes {
            self.add_candidate(Some(*id), *addr);
        }
        self.sort_and_trim();
        self.advance()
    }

    pub fn on_failure(&mut self, from: SocketAddr) -> Vec<QueryAction> {
        if self.finished {
            return Vec::new();
        }
        if let Some(c) = self.candidates.iter_mut().find(|c| c.addr == from) {
            if c.state == CandidateState::Queried {
                self.outstanding -= 1;
            }
            c.state = CandidateState::Failed;
            self.failed += 1;
        }
        self.advance()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The replied nodes among the K closest, with their tokens.
    pub fn closest_replied(&self) -> Vec<ClosestNode> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Replied)
            .take(self.k)
            .filter_map(|c| {
                c.id.map(|id| ClosestNode {
                    id,
                    addr: c.addr,
                    token: c.token.clone(),
                })
            })
            .collect()
    }

    pub fn status(&self) -> TraversalStatus {
        TraversalStatus {
            target: self.target,
            kind: self.kind,
            outstanding: self.outstanding,
            replied: self.replied,
            failed: self.failed,
            candidates: self.candidates.len(),
        }
    }

    fn advance(&mut self) -> Vec<QueryAction> {
        if self.finished {
            return Vec::new();
        }
        if self.is_done() {
            self.finished = true;
            debug!(lookup = %self.target, replied = self.replied, failed = self.failed,
                "traversal complete");
            return Vec::new();
        }
        let actions = self.pump();
        if actions.is_empty() && self.is_done() {
            self.finished = true;
            debug!(lookup = %self.target, replied = self.replied, failed = self.failed,
                "traversal complete");
        }
        actions
    }

    fn pump(&mut self) -> Vec<QueryAction> {
        let mut actions = Vec::new();
        let alpha = self.alpha;
        for c in self.candidates.iter_mut() {
            if self.outstanding >= alpha {
                break;
            }
            if c.state == CandidateState::Initial {
                c.state = CandidateState::Queried;
                self.outstanding += 1;
                actions.push(QueryAction {
                    to: c.addr,
                    node: c.id,
                });
            }
        }
        actions
    }

    fn is_done(&self) -> bool {
        if self.outstanding > 0 {
            return false;
        }
        self.candidates
            .iter()
            .take(self.k)
            .all(|c| matches!(c.state, CandidateState::Replied | CandidateState::Failed))
    }

    fn sort_and_trim(&mut self) {
        let target = self.target;
        self.candidates.sort_by(|a, b| match (&a.id, &b.id) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.distance(&target).cmp(&y.distance(&target)),
        });
        while self.candidates.len() > self.max_candidates {
            match self.candidates.last().map(|c| c.state) {
                Some(CandidateState::Initial) => {
                    self.candidates.pop();
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const ALPHA: usize = 3;
    const K: usize = 8;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 6881)
    }

    fn id(first: u8, last: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        bytes[19] = last;
        NodeId(bytes)
    }

    fn lookup(target: NodeId) -> Traversal {
        Traversal::new(1, LookupKind::FindNode, target, ALPHA, K, K * K)
    }

    #[test]
    fn queries_alpha_closest_first() {
        let target = NodeId::MIN;
        let mut t = lookup(target);
        for i in 1..=6u8 {
            t.add_candidate(Some(id(i, i)), addr(i));
        }
        let actions = t.start();
        assert_eq!(actions.len(), ALPHA);
        // closest three: 0x01.., 0x02.., 0x03..
        assert_eq!(actions[0].to, addr(1));
        assert_eq!(actions[1].to, addr(2));
        assert_eq!(actions[2].to, addr(3));
    }

    #[test]
    fn replies_merge_and_requery() {
        let target = NodeId::MIN;
        let mut t = lookup(target);
        for i in 1..=3u8 {
            t.add_candidate(Some(id(0x40 + i, i)), addr(i));
        }
        t.start();

        let data = ReplyData {
            nodes: vec![(id(0x01, 9), addr(9))],
            ..Default::default()
        };
        let actions = t.on_reply(addr(1), id(0x41, 1), &data);
        // the merged, closer node gets queried
        assert_eq!(actions, vec![QueryAction { to: addr(9), node: Some(id(0x01, 9)) }]);
        assert!(!t.is_finished());
    }

    #[test]
    fn completes_once_k_closest_settle() {
        let target = NodeId::MIN;
        let mut t = lookup(target);
        for i in 1..=4u8 {
            t.add_candidate(Some(id(i, i)), addr(i));
        }
        t.start();

        let empty = ReplyData::default();
        assert!(!t.is_finished());
        t.on_reply(addr(1), id(1, 1), &empty);
        t.on_reply(addr(2), id(2, 2), &empty);
        t.on_reply(addr(3), id(3, 3), &empty);
        assert!(!t.is_finished());
        t.on_reply(addr(4), id(4, 4), &empty);
        assert!(t.is_finished());

        let closest = t.closest_replied();
        assert_eq!(closest.len(), 4);
        assert_eq!(closest[0].id, id(1, 1));
    }

    #[test]
    fn failures_count_toward_completion() {
        let target = NodeId::MIN;
        let mut t = lookup(target);
        t.add_candidate(Some(id(1, 1)), addr(1));
        t.add_candidate(Some(id(2, 2)), addr(2));
        t.start();

        t.on_failure(addr(1));
        assert!(!t.is_finished());
        t.on_failure(addr(2));
        assert!(t.is_finished());
        assert!(t.closest_replied().is_empty());
    }

    #[test]
    fn unknown_id_seeds_go_first_and_learn_their_id() {
        let target = NodeId::MIN;
        let mut t = lookup(target);
        t.add_candidate(Some(id(1, 1)), addr(1));
        t.add_candidate(None, addr(50)); // router seed
        let actions = t.start();
        assert_eq!(actions[0].to, addr(50));

        let empty = ReplyData::default();
        t.on_reply(addr(50), id(9, 9), &empty);
        t.on_reply(addr(1), id(1, 1), &empty);
        assert!(t.is_finished());
        assert!(t.closest_replied().iter().any(|n| n.id == id(9, 9)));
    }

    #[test]
    fn tokens_are_kept_per_node() {
        let target = NodeId::MIN;
        let mut t = Traversal::new(2, LookupKind::GetPeers, target, ALPHA, K, K * K);
        t.add_candidate(Some(id(1, 1)), addr(1));
        t.start();

        let data = ReplyData {
            token: Some(Bytes::from_static(b"tok1")),
            ..Default::default()
        };
        t.on_reply(addr(1), id(1, 1), &data);
        assert!(t.is_finished());
        let closest = t.closest_replied();
        assert_eq!(closest[0].token.as_deref(), Some(b"tok1".as_ref()));
    }

    #[test]
    fn outstanding_never_exceeds_alpha() {
        let target = NodeId::MIN;
        let mut t = lookup(target);
        for i in 1..=20u8 {
            t.add_candidate(Some(id(i, i)), addr(i));
        }
        let actions = t.start();
        assert_eq!(actions.len(), ALPHA);

        // each resolution frees exactly one query slot
        let empty = ReplyData::default();
        let next = t.on_reply(addr(1), id(1, 1), &empty);
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn late_events_after_completion_are_dropped() {
        let target = NodeId::MIN;
        let mut t = lookup(target);
        t.add_candidate(Some(id(1, 1)), addr(1));
        t.start();
        t.on_failure(addr(1));
        assert!(t.is_finished());

        let empty = ReplyData::default();
        assert!(t.on_reply(addr(1), id(1, 1), &empty).is_empty());
        assert!(t.on_failure(addr(1)).is_empty());
    }

    #[test]
    fn candidate_set_is_bounded() {
        let target = NodeId::MIN;
        let mut t = Traversal::new(3, LookupKind::FindNode, target, ALPHA, K, 16);
        for i in 0..40u8 {
            t.add_candidate(Some(id(0x80, i)), SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, i)),
                6881,
            ));
        }
        t.start();
        assert!(t.status().candidates <= 16 + ALPHA);
    }
}
