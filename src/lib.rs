//! kadnode - a Kademlia DHT node
//!
//! An in-process engine for the mainline-style DHT overlay: it answers
//! queries from untrusted remotes, maintains an XOR-metric routing
//! table, runs iterative lookups, stores swarm peers per info-hash and
//! small signed feed records per target, and defends writes with
//! source-address-bound tokens.
//!
//! The core ([`Node`]) is synchronous and event-driven; it does no I/O
//! of its own and emits every message through an injected [`Transport`]
//! sink. [`DhtService`] wires it to a UDP socket under tokio.
//!
//! # Modules
//!
//! - [`bencode`] - the wire tree codec
//! - [`id`] - 160-bit IDs, XOR metric, IP-bound ID generation
//! - [`wire`] - packed endpoints and node record blobs
//! - [`validate`] - descriptor-driven message validation
//! - [`routing`] - the K-bucket routing table
//! - [`token`] - rolling write tokens
//! - [`rpc`] - the transaction multiplexer and observer arena
//! - [`traversal`] - iterative lookup state machines
//! - [`storage`] - bounded peer and feed indices
//! - [`node`] - the engine and request dispatcher
//! - [`service`] - the tokio UDP driver

pub mod bencode;
pub mod config;
pub mod error;
pub mod id;
pub mod node;
pub mod routing;
pub mod rpc;
pub mod service;
pub mod storage;
pub mod token;
pub mod traversal;
pub mod validate;
pub mod wire;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::DhtConfig;
pub use error::Error;
pub use id::NodeId;
pub use node::{Node, NodesSink, PeersSink, SignatureVerifier, Status, Transport};
pub use routing::{NodeEntry, RoutingTable};
pub use service::DhtService;
pub use traversal::ClosestNode;
