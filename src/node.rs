//! The DHT engine.
//!
//! A [`Node`] owns every piece of per-process DHT state: routing table,
//! RPC arena, running traversals, peer and feed indices, and the token
//! secrets. It is synchronous and event-driven: datagrams, timeouts and
//! the periodic tick all enter as plain method calls carrying `now`,
//! and everything it sends leaves through the injected [`Transport`]
//! sink. Malformed or unauthorized input never panics; it either gets a
//! code-203 error reply or is dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::bencode::{encode, Value};
use crate::config::{DhtConfig, MAX_FEED_PAYLOAD};
use crate::id::{self, NodeId};
use crate::routing::{Admission, NodeEntry, RoutingTable};
use crate::rpc::{ObserverTarget, RpcFailure, RpcManager};
use crate::storage::{FeedKind, FeedStore, TorrentStore};
use crate::token::TokenAuthority;
use crate::traversal::{
    ClosestNode, LookupKind, QueryAction, ReplyData, Traversal, TraversalId, TraversalStatus,
};
use crate::validate::{
    verify_message, KeyDesc, KeyKind, LAST_CHILD, OPTIONAL, PARSE_CHILDREN, SIZE_DIVISIBLE,
};
use crate::wire;

/// Where encoded messages leave the core.
///
/// The sink must not block; a lossy transport is expected and losses
/// surface as RPC timeouts.
pub trait Transport: Send {
    fn send(&mut self, message: Value, to: SocketAddr);
}

/// Verifies feed item signatures before a publication is accepted.
///
/// The payload is the encoded `head`/`item` subtree exactly as it will
/// be stored and returned.
pub trait SignatureVerifier: Send {
    fn verify(&self, key: &[u8; 64], payload: &[u8], signature: &[u8; 64]) -> bool;
}

/// Receives each batch of peers a `get_peers` lookup turns up.
pub type PeersSink = Box<dyn FnMut(&[SocketAddr]) + Send>;

/// Receives the terminal set of a lookup: the closest replied nodes and
/// the write tokens they issued.
pub type NodesSink = Box<dyn FnOnce(Vec<ClosestNode>) + Send>;

enum TraversalGoal {
    Refresh,
    Bootstrap,
    FindPeers {
        peers: PeersSink,
        done: Option<NodesSink>,
    },
    Announce {
        info_hash: NodeId,
        port: u16,
        peers: Option<PeersSink>,
    },
}

#[derive(Debug, Default, Clone)]
pub struct Counters {
    /// Queries answered with a code-203 error.
    pub rejected_queries: u64,
    /// Announces refused for a bad port or token.
    pub failed_announces: u64,
    /// Accepted announces carrying port 0 (stored but not contactable).
    pub port_zero_announces: u64,
    /// RPCs abandoned because the observer pool was exhausted.
    pub abandoned_rpcs: u64,
}

/// Copy-out view of the engine, safe to hand to any thread.
#[derive(Debug, Clone)]
pub struct Status {
    pub local_id: NodeId,
    pub nodes: usize,
    pub replacements: usize,
    pub torrents: usize,
    pub feed_items: usize,
    pub outstanding_rpcs: usize,
    pub observer_capacity: usize,
    pub traversals: Vec<TraversalStatus>,
    pub counters: Counters,
}

const TOP_DESC: &[KeyDesc] = &[
    KeyDesc::new("q", KeyKind::Str, 0, 0),
    KeyDesc::new("a", KeyKind::Dict, 0, 0),
];

const FIND_NODE_DESC: &[KeyDesc] = &[KeyDesc::new("target", KeyKind::Str, 20, 0)];

const GET_PEERS_DESC: &[KeyDesc] = &[
    KeyDesc::new("info_hash", KeyKind::Str, 20, 0),
    KeyDesc::new("ifhpfxl", KeyKind::Int, 0, OPTIONAL),
];

const ANNOUNCE_PEER_DESC: &[KeyDesc] = &[
    KeyDesc::new("info_hash", KeyKind::Str, 20, 0),
    KeyDesc::new("port", KeyKind::Int, 0, 0),
    KeyDesc::new("token", KeyKind::Str, 0, 0),
    KeyDesc::new("n", KeyKind::Str, 0, OPTIONAL),
];

const ANNOUNCE_ITEM_DESC: &[KeyDesc] = &[
    KeyDesc::new("target", KeyKind::Str, 20, 0),
    KeyDesc::new("token", KeyKind::Str, 0, 0),
    KeyDesc::new("sig", KeyKind::Str, 64, 0),
    KeyDesc::new("head", KeyKind::Dict, 0, OPTIONAL | PARSE_CHILDREN),
    KeyDesc::new("n", KeyKind::Str, 0, 0),
    KeyDesc::new("key", KeyKind::Str, 64, 0),
    KeyDesc::new("seq", KeyKind::Int, 0, 0),
    KeyDesc::new("next", KeyKind::Str, 20, LAST_CHILD | SIZE_DIVISIBLE),
    KeyDesc::new("item", KeyKind::Dict, 0, OPTIONAL | PARSE_CHILDREN),
    KeyDesc::new("key", KeyKind::Str, 64, 0),
    KeyDesc::new("next", KeyKind::Str, 20, LAST_CHILD | SIZE_DIVISIBLE),
];

const GET_ITEM_DESC: &[KeyDesc] = &[
    KeyDesc::new("target", KeyKind::Str, 20, 0),
    KeyDesc::new("key", KeyKind::Str, 64, 0),
    KeyDesc::new("n", KeyKind::Str, 0, OPTIONAL),
];

pub struct Node {
    config: DhtConfig,
    id: NodeId,
    table: RoutingTable,
    rpc: RpcManager,
    traversals: HashMap<TraversalId, Traversal>,
    goals: HashMap<TraversalId, TraversalGoal>,
    next_traversal: TraversalId,
    torrents: TorrentStore,
    feeds: FeedStore,
    tokens: TokenAuthority,
    sink: Box<dyn Transport>,
    verifier: Box<dyn SignatureVerifier>,
    last_storage_tick: Instant,
    counters: Counters,
}

impl Node {
    /// Builds an engine bound to `external_ip`.
    ///
    /// A requested ID is kept only when it verifies against the external
    /// address; otherwise a fresh bound ID is generated. The ID never
    /// changes afterwards.
    pub fn new(
        config: DhtConfig,
        requested_id: Option<NodeId>,
        external_ip: IpAddr,
        sink: Box<dyn Transport>,
        verifier: Box<dyn SignatureVerifier>,
        now: Instant,
    ) -> Self {
        let id = match requested_id {
            Some(id) if id::verify_id(&id, external_ip) => id,
            Some(id) => {
                info!(%id, %external_ip, "configured id does not bind to external address, regenerating");
                id::generate_id(external_ip)
            }
            None => id::generate_id(external_ip),
        };
        Self {
            table: RoutingTable::new(id, config.k, config.fail_limit, config.refresh_interval, now),
            rpc: RpcManager::new(config.observer_pool, config.rpc_timeout),
            traversals: HashMap::new(),
            goals: HashMap::new(),
            next_traversal: 0,
            torrents: TorrentStore::new(config.max_torrents, config.peer_ttl()),
            feeds: FeedStore::new(config.max_feed_items),
            tokens: TokenAuthority::new(),
            sink,
            verifier,
            last_storage_tick: now,
            counters: Counters::default(),
            id,
            config,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.id
    }

    /// Feeds one decoded datagram into the engine.
    pub fn incoming(&mut self, message: &Value, from: SocketAddr, now: Instant) {
        let tag = message.get_bytes(b"t").cloned().unwrap_or_default();
        let Some(y) = message.get_bytes(b"y").filter(|y| !y.is_empty()).cloned() else {
            self.counters.rejected_queries += 1;
            let reply = error_reply(tag, "missing 'y' entry");
            self.sink.send(reply, from);
            return;
        };
        match y[0] {
            b'r' => self.incoming_reply(message, from, now),
            b'q' => {
                let reply = self.incoming_query(message, from, now);
                self.sink.send(reply, from);
            }
            b'e' => {
                let err = message.get(b"e").and_then(|v| v.as_list());
                let code = err.and_then(|l| l.first()).and_then(|v| v.as_integer());
                let text = err.and_then(|l| l.get(1)).and_then(|v| v.as_str());
                debug!(%from, code, text, "remote reported an error");
            }
            _ => {
                self.counters.rejected_queries += 1;
                let reply = error_reply(tag, "invalid 'y' entry");
                self.sink.send(reply, from);
            }
        }
    }

    /// Host hint that `addr` is unreachable (e.g. an ICMP error): fails
    /// every outstanding request bound for it.
    pub fn unreachable(&mut self, addr: SocketAddr, now: Instant) {
        for failure in self.rpc.unreachable(addr) {
            self.handle_rpc_failure(failure, now);
        }
    }

    /// Advances timeouts; every `tick_interval` also sweeps the stores,
    /// rotates the token secret, and refreshes a stale bucket. Returns
    /// the next RPC deadline.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        let (failures, deadline) = self.rpc.tick(now);
        for failure in failures {
            self.handle_rpc_failure(failure, now);
        }

        if now.duration_since(self.last_storage_tick) >= self.config.tick_interval {
            self.last_storage_tick = now;
            self.feeds.expire(self.config.feed_ttl, now);
            self.torrents.expire(now);
            self.tokens.rotate();
            debug!(
                torrents = self.torrents.len(),
                feeds = self.feeds.len(),
                "storage sweep and token rotation"
            );
            if let Some(target) = self.table.need_refresh(now) {
                self.start_refresh(target, now);
            }
        }
        deadline
    }

    /// Seeds the routing table by walking toward the local ID from the
    /// given router endpoints.
    pub fn bootstrap(&mut self, seeds: &[SocketAddr], now: Instant) {
        info!(seeds = seeds.len(), "starting bootstrap");
        for seed in seeds {
            self.table.add_router_node(*seed);
        }
        let target = self.id;
        self.start_traversal(LookupKind::FindNode, target, TraversalGoal::Bootstrap, seeds, now);
    }

    pub fn add_router_node(&mut self, addr: SocketAddr) {
        self.table.add_router_node(addr);
    }

    /// Pings a raw endpoint; a reply admits it into the routing table.
    pub fn add_node(&mut self, addr: SocketAddr, now: Instant) {
        let Some(handle) = self.rpc.allocate() else {
            self.counters.abandoned_rpcs += 1;
            return;
        };
        let msg = self.build_query("ping", BTreeMap::new());
        self.rpc
            .invoke(handle, ObserverTarget::Ping, None, msg, addr, now, &mut *self.sink);
    }

    /// Looks up swarm peers for `info_hash`. `peers` receives every
    /// values batch; `done` the terminal closest-node set with tokens.
    pub fn find_peers(
        &mut self,
        info_hash: NodeId,
        peers: PeersSink,
        done: Option<NodesSink>,
        now: Instant,
    ) {
        self.start_traversal(
            LookupKind::GetPeers,
            info_hash,
            TraversalGoal::FindPeers { peers, done },
            &[],
            now,
        );
    }

    /// Announces that this host serves `info_hash` on `port`: runs a
    /// peer lookup, then writes `announce_peer` to the closest nodes
    /// using the tokens they handed out.
    pub fn announce(
        &mut self,
        info_hash: NodeId,
        port: u16,
        peers: Option<PeersSink>,
        now: Instant,
    ) {
        self.start_traversal(
            LookupKind::GetPeers,
            info_hash,
            TraversalGoal::Announce {
                info_hash,
                port,
                peers,
            },
            &[],
            now,
        );
    }

    /// Starts a lookup toward `target` to repopulate its bucket.
    pub fn refresh(&mut self, target: NodeId, now: Instant) {
        self.start_refresh(target, now);
    }

    pub fn status(&self) -> Status {
        Status {
            local_id: self.id,
            nodes: self.table.node_count(),
            replacements: self.table.replacement_count(),
            torrents: self.torrents.len(),
            feed_items: self.feeds.len(),
            outstanding_rpcs: self.rpc.outstanding(),
            observer_capacity: self.rpc.capacity(),
            traversals: self.traversals.values().map(|t| t.status()).collect(),
            counters: self.counters.clone(),
        }
    }

    pub fn bucket_size(&self, idx: usize) -> usize {
        self.table.bucket_size(idx)
    }

    // ---- replies ----------------------------------------------------

    fn incoming_reply(&mut self, message: &Value, from: SocketAddr, now: Instant) {
        let Some(tag) = message.get_bytes(b"t") else {
            return;
        };
        let Some(reply) = self.rpc.incoming(tag, from, now) else {
            debug!(%from, "reply does not match an outstanding request");
            return;
        };
        let body = message.get(b"r");
        let sender = body
            .and_then(|r| r.get_bytes(b"id"))
            .and_then(|b| NodeId::from_bytes(b).ok());

        match reply.target {
            ObserverTarget::Traversal(tid) => {
                let data = parse_reply_data(body);
                self.drive_reply(tid, from, sender, data, reply.rtt, now);
            }
            ObserverTarget::Ping
            | ObserverTarget::AnnounceWrite
            | ObserverTarget::ReplacementPing { .. } => {
                // for a replacement ping this keeps the stale entry: it
                // answered, so the newcomer stays in the cache
                if let Some(id) = sender {
                    self.node_confirmed(id, from, Some(reply.rtt), now);
                }
            }
        }
    }

    fn drive_reply(
        &mut self,
        tid: TraversalId,
        from: SocketAddr,
        sender: Option<NodeId>,
        data: ReplyData,
        rtt: Duration,
        now: Instant,
    ) {
        let Some(mut t) = self.traversals.remove(&tid) else {
            return;
        };
        // the observer sees the reply first; routing table updates follow
        let actions = match sender {
            Some(id) => t.on_reply(from, id, &data),
            None => t.on_failure(from),
        };

        if !data.peers.is_empty() {
            match self.goals.get_mut(&tid) {
                Some(TraversalGoal::FindPeers { peers, .. }) => peers(&data.peers),
                Some(TraversalGoal::Announce {
                    peers: Some(peers), ..
                }) => peers(&data.peers),
                _ => {}
            }
        }

        if let Some(id) = sender {
            self.node_confirmed(id, from, Some(rtt), now);
        }
        for (nid, naddr) in &data.nodes {
            self.admit_heard(*nid, *naddr, now);
        }

        self.run_queries(&mut t, actions, now);
        if t.is_finished() {
            self.finish_traversal(t, now);
        } else {
            self.traversals.insert(tid, t);
        }
    }

    fn drive_failure(&mut self, tid: TraversalId, from: SocketAddr, now: Instant) {
        let Some(mut t) = self.traversals.remove(&tid) else {
            return;
        };
        let actions = t.on_failure(from);
        self.run_queries(&mut t, actions, now);
        if t.is_finished() {
            self.finish_traversal(t, now);
        } else {
            self.traversals.insert(tid, t);
        }
    }

    fn handle_rpc_failure(&mut self, failure: RpcFailure, now: Instant) {
        if let Some(id) = failure.node {
            self.table.node_failed(&id);
        }
        match failure.target {
            ObserverTarget::Traversal(tid) => self.drive_failure(tid, failure.to, now),
            ObserverTarget::ReplacementPing { stale, newcomer } => {
                self.table.replace_stale(&stale, &newcomer);
            }
            ObserverTarget::Ping | ObserverTarget::AnnounceWrite => {}
        }
    }

    fn node_confirmed(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        rtt: Option<Duration>,
        now: Instant,
    ) {
        match self.table.node_seen(id, addr, rtt, now) {
            Admission::Added => {
                // a bucket gained a live node it did not know: walk its
                // neighbourhood to fill in the surroundings
                self.start_refresh(id, now);
            }
            Admission::PingStale(stale) => self.send_replacement_ping(stale, id, now),
            _ => {}
        }
    }

    fn admit_heard(&mut self, id: NodeId, addr: SocketAddr, now: Instant) {
        if let Admission::PingStale(stale) = self.table.heard_about(id, addr, now) {
            self.send_replacement_ping(stale, id, now);
        }
    }

    fn send_replacement_ping(&mut self, stale: NodeEntry, newcomer: NodeId, now: Instant) {
        let Some(handle) = self.rpc.allocate() else {
            self.counters.abandoned_rpcs += 1;
            return;
        };
        let msg = self.build_query("ping", BTreeMap::new());
        self.rpc.invoke(
            handle,
            ObserverTarget::ReplacementPing {
                stale: stale.id,
                newcomer,
            },
            None,
            msg,
            stale.addr,
            now,
            &mut *self.sink,
        );
    }

    // ---- traversals -------------------------------------------------

    fn start_refresh(&mut self, target: NodeId, now: Instant) {
        self.start_traversal(LookupKind::FindNode, target, TraversalGoal::Refresh, &[], now);
    }

    fn start_traversal(
        &mut self,
        kind: LookupKind,
        target: NodeId,
        goal: TraversalGoal,
        seeds: &[SocketAddr],
        now: Instant,
    ) -> TraversalId {
        let tid = self.next_traversal;
        self.next_traversal = self.next_traversal.wrapping_add(1);

        let mut t = Traversal::new(
            tid,
            kind,
            target,
            self.config.alpha,
            self.config.k,
            self.config.max_candidates(),
        );
        for entry in self.table.find_node(&target, self.config.k) {
            t.add_candidate(Some(entry.id), entry.addr);
        }
        for seed in seeds {
            t.add_candidate(None, *seed);
        }

        self.goals.insert(tid, goal);
        let actions = t.start();
        self.run_queries(&mut t, actions, now);
        if t.is_finished() {
            self.finish_traversal(t, now);
        } else {
            self.traversals.insert(tid, t);
        }
        tid
    }

    fn run_queries(&mut self, t: &mut Traversal, actions: Vec<QueryAction>, now: Instant) {
        let mut queue: VecDeque<QueryAction> = actions.into();
        while let Some(q) = queue.pop_front() {
            let Some(handle) = self.rpc.allocate() else {
                // pool exhausted: abandon this query, let the traversal
                // absorb it as a failure
                self.counters.abandoned_rpcs += 1;
                queue.extend(t.on_failure(q.to));
                continue;
            };
            let msg = match t.kind {
                LookupKind::FindNode => {
                    let mut args = BTreeMap::new();
                    args.insert(
                        Bytes::from_static(b"target"),
                        Value::bytes(t.target.as_bytes()),
                    );
                    self.build_query("find_node", args)
                }
                LookupKind::GetPeers => {
                    let mut args = BTreeMap::new();
                    args.insert(
                        Bytes::from_static(b"info_hash"),
                        Value::bytes(t.target.as_bytes()),
                    );
                    self.build_query("get_peers", args)
                }
            };
            self.rpc.invoke(
                handle,
                ObserverTarget::Traversal(t.id),
                q.node,
                msg,
                q.to,
                now,
                &mut *self.sink,
            );
        }
    }

    fn finish_traversal(&mut self, t: Traversal, now: Instant) {
        let results = t.closest_replied();
        match self.goals.remove(&t.id) {
            None | Some(TraversalGoal::Refresh) => {}
            Some(TraversalGoal::Bootstrap) => {
                info!(nodes = self.table.node_count(), "bootstrap complete");
            }
            Some(TraversalGoal::FindPeers { done, .. }) => {
                if let Some(done) = done {
                    done(results);
                }
            }
            Some(TraversalGoal::Announce {
                info_hash, port, ..
            }) => {
                self.send_announces(info_hash, port, &results, now);
            }
        }
    }

    fn send_announces(
        &mut self,
        info_hash: NodeId,
        port: u16,
        closest: &[ClosestNode],
        now: Instant,
    ) {
        debug!(%info_hash, port, nodes = closest.len(), "writing announce to closest nodes");
        for node in closest {
            let Some(token) = &node.token else {
                continue;
            };
            let Some(handle) = self.rpc.allocate() else {
                self.counters.abandoned_rpcs += 1;
                return;
            };
            let mut args = BTreeMap::new();
            args.insert(
                Bytes::from_static(b"info_hash"),
                Value::bytes(info_hash.as_bytes()),
            );
            args.insert(Bytes::from_static(b"port"), Value::Integer(port as i64));
            args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
            let msg = self.build_query("announce_peer", args);
            self.rpc.invoke(
                handle,
                ObserverTarget::AnnounceWrite,
                Some(node.id),
                msg,
                node.addr,
                now,
                &mut *self.sink,
            );
        }
    }

    fn build_query(&self, name: &str, mut args: BTreeMap<Bytes, Value>) -> Value {
        args.insert(Bytes::from_static(b"id"), Value::bytes(self.id.as_bytes()));
        let mut msg = BTreeMap::new();
        msg.insert(Bytes::from_static(b"y"), Value::string("q"));
        msg.insert(Bytes::from_static(b"q"), Value::string(name));
        msg.insert(Bytes::from_static(b"a"), Value::Dict(args));
        Value::Dict(msg)
    }

    // ---- queries ----------------------------------------------------

    fn incoming_query(&mut self, message: &Value, from: SocketAddr, now: Instant) -> Value {
        let tag = message.get_bytes(b"t").cloned().unwrap_or_default();

        let mut top = [None; 2];
        if let Err(err) = verify_message(message, TOP_DESC, &mut top) {
            self.counters.rejected_queries += 1;
            return error_reply(tag, &err);
        }
        let query = top[0].and_then(|v| v.as_bytes()).cloned().unwrap_or_default();
        let Some(args) = top[1] else {
            self.counters.rejected_queries += 1;
            return error_reply(tag, "missing 'a' key");
        };

        let Some(sender) = args
            .get_bytes(b"id")
            .filter(|b| b.len() == 20)
            .and_then(|b| NodeId::from_bytes(b).ok())
        else {
            self.counters.rejected_queries += 1;
            return error_reply(tag, "missing 'id' key");
        };

        self.admit_heard(sender, from, now);

        let mut r: BTreeMap<Bytes, Value> = BTreeMap::new();
        r.insert(Bytes::from_static(b"id"), Value::bytes(self.id.as_bytes()));

        // a sender whose ID does not bind to its source address gets told
        // what we see, so it can correct itself
        if !id::verify_id(&sender, from.ip()) {
            r.insert(Bytes::from_static(b"ip"), Value::Bytes(wire::pack_ip(&from.ip())));
        }

        let outcome = match query.as_ref() {
            b"ping" => Ok(()),
            b"find_node" => self.handle_find_node(args, &mut r),
            b"get_peers" => self.handle_get_peers(args, from, &mut r),
            b"announce_peer" => self.handle_announce_peer(args, sender, from, now),
            b"announce_item" => self.handle_announce_item(args, sender, from, now),
            b"get_item" => self.handle_get_item(args, from, &mut r),
            _ => self.handle_unknown(args, &mut r),
        };

        match outcome {
            Ok(()) => reply_message(tag, r),
            Err(text) => {
                self.counters.rejected_queries += 1;
                error_reply(tag, &text)
            }
        }
    }

    fn handle_find_node(
        &mut self,
        args: &Value,
        r: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), String> {
        let mut keys = [None; 1];
        verify_message(args, FIND_NODE_DESC, &mut keys)?;
        let target = expect_id(keys[0])?;
        self.write_nodes(&target, r);
        Ok(())
    }

    fn handle_get_peers(
        &mut self,
        args: &Value,
        from: SocketAddr,
        r: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), String> {
        let mut keys = [None; 2];
        verify_message(args, GET_PEERS_DESC, &mut keys)?;
        let info_hash = expect_id(keys[0])?;

        r.insert(
            Bytes::from_static(b"token"),
            Value::Bytes(self.tokens.generate(&from, info_hash.as_bytes())),
        );
        self.write_nodes(&info_hash, r);

        let prefix = keys[1]
            .and_then(|v| v.as_integer())
            .unwrap_or(20)
            .clamp(4, 20) as usize;

        if let Some(entry) = self.torrents.lookup(&info_hash, prefix) {
            if entry.num_peers() > 0 {
                if let Some(name) = &entry.name {
                    r.insert(Bytes::from_static(b"n"), Value::Bytes(name.clone()));
                }
                let values = entry
                    .sample_peers(self.config.max_peers_reply)
                    .iter()
                    .map(|addr| {
                        let mut buf = Vec::new();
                        wire::pack_endpoint(addr, &mut buf);
                        Value::Bytes(Bytes::from(buf))
                    })
                    .collect();
                r.insert(Bytes::from_static(b"values"), Value::List(values));
            }
        }
        Ok(())
    }

    fn handle_announce_peer(
        &mut self,
        args: &Value,
        sender: NodeId,
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), String> {
        let mut keys = [None; 4];
        verify_message(args, ANNOUNCE_PEER_DESC, &mut keys)?;
        let info_hash = expect_id(keys[0])?;

        let port = keys[1].and_then(|v| v.as_integer()).unwrap_or(-1);
        if !(0..=65535).contains(&port) {
            self.counters.failed_announces += 1;
            return Err("invalid port".to_string());
        }

        let token = keys[2].and_then(|v| v.as_bytes());
        if !self
            .tokens
            .verify(token.map(|b| b.as_ref()).unwrap_or(&[]), info_hash.as_bytes(), &from)
        {
            self.counters.failed_announces += 1;
            debug!(%from, "rejecting announce with invalid token");
            return Err("invalid token".to_string());
        }

        // spending a token proves the source address
        self.node_confirmed(sender, from, None, now);

        if port == 0 {
            self.counters.port_zero_announces += 1;
            warn!(%from, "accepted announce for port 0; peer is not contactable");
        }

        let name = keys[3].and_then(|v| v.as_bytes()).map(|b| b.as_ref());
        self.torrents.announce(
            info_hash,
            SocketAddr::new(from.ip(), port as u16),
            name,
            now,
        );
        Ok(())
    }

    fn handle_announce_item(
        &mut self,
        args: &Value,
        sender: NodeId,
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), String> {
        let mut keys = [None; 11];
        verify_message(args, ANNOUNCE_ITEM_DESC, &mut keys)?;
        let target = expect_id(keys[0])?;

        let token = keys[1].and_then(|v| v.as_bytes());
        if !self
            .tokens
            .verify(token.map(|b| b.as_ref()).unwrap_or(&[]), target.as_bytes(), &from)
        {
            return Err("invalid token".to_string());
        }

        let (kind, subtree, name, key_value, seq) = if let Some(head) = keys[3] {
            let name = keys[4].and_then(|v| v.as_bytes()).cloned();
            let seq = keys[6].and_then(|v| v.as_integer()).unwrap_or(0);
            (FeedKind::Head, head, name, keys[5], seq)
        } else if let Some(item) = keys[8] {
            (FeedKind::Item, item, None, keys[9], 0)
        } else {
            return Err("missing head or item".to_string());
        };

        let payload = encode(subtree);
        if payload.len() > MAX_FEED_PAYLOAD {
            return Err("message too big".to_string());
        }

        let key = expect_fixed64(key_value, "key")?;

        let expected = match kind {
            FeedKind::Head => {
                let mut h = Sha1::new();
                h.update(name.as_deref().unwrap_or(&[]));
                h.update(key);
                NodeId(h.finalize().into())
            }
            FeedKind::Item => {
                let mut h = Sha1::new();
                h.update(&payload);
                NodeId(h.finalize().into())
            }
        };
        if expected != target {
            return Err("invalid target".to_string());
        }

        let signature = expect_fixed64(keys[2], "sig")?;
        if !self.verifier.verify(&key, &payload, &signature) {
            return Err("invalid signature".to_string());
        }

        self.node_confirmed(sender, from, None, now);
        self.feeds.upsert(
            target,
            kind,
            name,
            key,
            seq,
            signature,
            subtree.clone(),
            &from.ip(),
            now,
        );
        Ok(())
    }

    fn handle_get_item(
        &mut self,
        args: &Value,
        from: SocketAddr,
        r: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), String> {
        let mut keys = [None; 3];
        verify_message(args, GET_ITEM_DESC, &mut keys)?;
        let target = expect_id(keys[0])?;

        // with the list name we can check the key against the target
        if let Some(n) = keys[2].and_then(|v| v.as_bytes()) {
            let key = keys[1].and_then(|v| v.as_bytes()).map(|b| b.as_ref()).unwrap_or(&[]);
            let mut h = Sha1::new();
            h.update(n);
            h.update(key);
            if NodeId(h.finalize().into()) != target {
                return Err("invalid target".to_string());
            }
        }

        r.insert(
            Bytes::from_static(b"token"),
            Value::Bytes(self.tokens.generate(&from, target.as_bytes())),
        );
        self.write_nodes(&target, r);

        if let Some(item) = self.feeds.get(&target) {
            let slot: &'static [u8] = match item.kind {
                FeedKind::Head => b"head",
                FeedKind::Item => b"item",
            };
            r.insert(Bytes::from_static(slot), item.payload.clone());
            r.insert(Bytes::from_static(b"sig"), Value::bytes(&item.signature));
        }
        Ok(())
    }

    /// Unrecognized queries that still carry a target are answered like
    /// `find_node`, for forward compatibility.
    fn handle_unknown(
        &mut self,
        args: &Value,
        r: &mut BTreeMap<Bytes, Value>,
    ) -> Result<(), String> {
        let target = args
            .get_bytes(b"target")
            .filter(|b| b.len() == 20)
            .or_else(|| args.get_bytes(b"info_hash").filter(|b| b.len() == 20))
            .and_then(|b| NodeId::from_bytes(b).ok());
        let Some(target) = target else {
            return Err("unknown message".to_string());
        };
        self.write_nodes(&target, r);
        Ok(())
    }

    fn write_nodes(&self, target: &NodeId, r: &mut BTreeMap<Bytes, Value>) {
        let found = self.table.find_node(target, self.config.k);
        let pairs: Vec<(NodeId, SocketAddr)> =
            found.iter().map(|e| (e.id, e.addr)).collect();
        let (v4, v6) = wire::encode_nodes(&pairs);
        r.insert(Bytes::from_static(b"nodes"), Value::Bytes(v4));
        if !v6.is_empty() {
            r.insert(
                Bytes::from_static(b"nodes2"),
                Value::List(v6.into_iter().map(Value::Bytes).collect()),
            );
        }
    }
}

fn parse_reply_data(body: Option<&Value>) -> ReplyData {
    let mut data = ReplyData::default();
    let Some(body) = body else {
        return data;
    };
    if let Some(blob) = body.get_bytes(b"nodes") {
        data.nodes = wire::decode_nodes(blob);
    }
    if let Some(records) = body.get(b"nodes2").and_then(|v| v.as_list()) {
        for record in records {
            if let Some(node) = record.as_bytes().and_then(|b| wire::decode_node(b)) {
                data.nodes.push(node);
            }
        }
    }
    if let Some(values) = body.get(b"values").and_then(|v| v.as_list()) {
        data.peers = values
            .iter()
            .filter_map(|v| v.as_bytes())
            .filter_map(|b| wire::unpack_endpoint(b))
            .collect();
    }
    data.token = body.get_bytes(b"token").cloned();
    data
}

fn reply_message(tag: Bytes, r: BTreeMap<Bytes, Value>) -> Value {
    let mut msg = BTreeMap::new();
    msg.insert(Bytes::from_static(b"t"), Value::Bytes(tag));
    msg.insert(Bytes::from_static(b"y"), Value::string("r"));
    msg.insert(Bytes::from_static(b"r"), Value::Dict(r));
    Value::Dict(msg)
}

fn error_reply(tag: Bytes, text: &str) -> Value {
    let mut msg = BTreeMap::new();
    msg.insert(Bytes::from_static(b"t"), Value::Bytes(tag));
    msg.insert(Bytes::from_static(b"y"), Value::string("e"));
    msg.insert(
        Bytes::from_static(b"e"),
        Value::List(vec![Value::Integer(203), Value::string(text)]),
    );
    Value::Dict(msg)
}

fn expect_id(value: Option<&Value>) -> Result<NodeId, String> {
    value
        .and_then(|v| v.as_bytes())
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| "invalid target".to_string())
}

fn expect_fixed64(value: Option<&Value>, name: &str) -> Result<[u8; 64], String> {
    let bytes = value
        .and_then(|v| v.as_bytes())
        .filter(|b| b.len() == 64)
        .ok_or_else(|| format!("invalid value for '{}'", name))?;
    let mut out = [0u8; 64];
    out.copy_from_slice(bytes);
    Ok(out)
}
