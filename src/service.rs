//! UDP driver for the engine.
//!
//! Binds a socket and runs the event loop: inbound datagrams are
//! decoded and fed to the [`Node`], outbound messages are drained from
//! the engine's sink queue, and a coarse interval drives timeouts and
//! the storage sweep. The engine sits behind a single mutex; every
//! event takes it briefly and never across an await point.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::bencode::{self, Value};
use crate::config::DhtConfig;
use crate::error::Error;
use crate::id::NodeId;
use crate::node::{Node, SignatureVerifier, Transport};

const RECV_BUFFER: usize = 65536;
const TICK_GRANULARITY: Duration = Duration::from_secs(1);

struct UdpSink {
    tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl Transport for UdpSink {
    fn send(&mut self, message: Value, to: SocketAddr) {
        let _ = self.tx.send((bencode::encode(&message), to));
    }
}

pub struct DhtService {
    socket: Arc<UdpSocket>,
    node: Arc<Mutex<Node>>,
    outbound: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    local_addr: SocketAddr,
}

impl DhtService {
    /// Binds `bind_addr` and builds the engine around it.
    ///
    /// `external_ip` is the address remotes see, used for ID binding;
    /// discovering it is the host's concern.
    pub async fn bind(
        bind_addr: SocketAddr,
        external_ip: IpAddr,
        requested_id: Option<NodeId>,
        config: DhtConfig,
        verifier: Box<dyn SignatureVerifier>,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (tx, outbound) = mpsc::unbounded_channel();
        let node = Node::new(
            config,
            requested_id,
            external_ip,
            Box::new(UdpSink { tx }),
            verifier,
            Instant::now(),
        );
        info!(%local_addr, id = %node.local_id(), "dht node bound");
        Ok(Self {
            socket: Arc::new(socket),
            node: Arc::new(Mutex::new(node)),
            outbound,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the engine, for bootstrap/announce/status calls
    /// from the host while the loop runs.
    pub fn node(&self) -> Arc<Mutex<Node>> {
        self.node.clone()
    }

    /// Runs the event loop until the task is dropped or the socket
    /// fails.
    pub async fn run(mut self) -> Result<(), Error> {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut tick = tokio::time::interval(TICK_GRANULARITY);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, from) = result?;
                    match bencode::decode(&buf[..len]) {
                        Ok(message) => {
                            self.node.lock().incoming(&message, from, Instant::now());
                        }
                        Err(e) => {
                            debug!(%from, error = %e, "dropping undecodable datagram");
                        }
                    }
                }
                Some((data, to)) = self.outbound.recv() => {
                    if let Err(e) = socket.send_to(&data, to).await {
                        debug!(%to, error = %e, "send failed");
                    }
                }
                _ = tick.tick() => {
                    self.node.lock().tick(Instant::now());
                }
            }
        }
    }
}
