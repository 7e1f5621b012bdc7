//! Server-side demultiplexer: binds one UDP socket, routes inbound datagrams
//! to per-peer `Connection`s, and drives the periodic housekeeping tick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, trace, warn};
use tokio::net::UdpSocket;

use crate::connection::{Connection, OutboundTransport};
use crate::error::{Result, TransportError};
use crate::handler::ConnectionHandler;
use crate::header::MAX_PACKET_SIZE;

/// How often the housekeeping tick runs `tmr()` on every connection and
/// reaps the ones it tore down.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Builds a handler for a newly observed remote endpoint. One call per
/// unique (ip, port) the server hasn't seen since that endpoint's last
/// teardown.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, remote: SocketAddr) -> Box<dyn ConnectionHandler>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(SocketAddr) -> Box<dyn ConnectionHandler> + Send + Sync,
{
    fn create(&self, remote: SocketAddr) -> Box<dyn ConnectionHandler> {
        (self)(remote)
    }
}

struct SocketTransport {
    socket: Arc<UdpSocket>,
}

impl OutboundTransport for SocketTransport {
    fn send_to(&self, addr: SocketAddr, bytes: &[u8]) {
        let socket = self.socket.clone();
        let bytes = bytes.to_vec();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!("failed to send datagram to {addr}: {e}");
            }
        });
    }
}

pub struct Server {
    socket: Arc<UdpSocket>,
    transport: Arc<SocketTransport>,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    factory: Arc<dyn ConnectionFactory>,
}

impl Server {
    pub async fn bind(addr: &str, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(TransportError::Io)?);
        debug!("bound UDP socket to {addr}");
        Ok(Server {
            transport: Arc::new(SocketTransport {
                socket: socket.clone(),
            }),
            socket,
            connections: DashMap::new(),
            factory,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Runs the receive loop and the periodic tick concurrently until the
    /// socket fails. Both live on one task, matching the single-I/O-task
    /// scheduling model the Connection state machine assumes.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, remote) = result.map_err(TransportError::Io)?;
                    self.on_datagram(&buf[..len], remote).await;
                }
                _ = tick.tick() => {
                    self.housekeeping().await;
                }
            }
        }
    }

    async fn on_datagram(&self, bytes: &[u8], remote: SocketAddr) {
        if bytes.len() > MAX_PACKET_SIZE {
            trace!("dropping oversized datagram from {remote} ({} bytes)", bytes.len());
            return;
        }

        let connection = match self.connections.get(&remote) {
            Some(entry) if !entry.is_dead() => entry.value().clone(),
            _ => {
                let handler = self.factory.create(remote);
                let connection = Arc::new(Connection::new(remote, self.transport.clone(), handler));
                connection.attach().await;
                self.connections.insert(remote, connection.clone());
                connection
            }
        };

        connection.process_packet(bytes).await;
    }

    async fn housekeeping(&self) {
        for entry in self.connections.iter() {
            entry.value().tmr().await;
        }

        self.connections.retain(|_, connection| !connection.is_dead());
    }

    /// Looks up the established connection for `remote`, if any. Application
    /// code uses this to call `send` from outside the I/O task.
    pub fn connection(&self, remote: SocketAddr) -> Option<Arc<Connection>> {
        self.connections
            .get(&remote)
            .map(|entry| entry.value().clone())
            .filter(|connection| !connection.is_dead())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
