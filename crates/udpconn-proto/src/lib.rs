//! Reliable, session-oriented datagram transport on top of UDP: handshake,
//! a sliding-window-of-one send/ack loop, liveness pings, and a server-side
//! demultiplexer that binds remote endpoints to connections.

pub mod connection;
pub mod error;
pub mod handler;
pub mod header;
pub mod seq;
pub mod server;

pub use connection::{Connection, OutboundTransport, SendStatus};
pub use error::TransportError;
pub use handler::ConnectionHandler;
pub use header::Header;
pub use server::{ConnectionFactory, Server};
