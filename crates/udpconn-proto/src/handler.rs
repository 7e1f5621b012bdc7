//! Application-side upcall contract.
//!
//! A `Connection` drives exactly one implementation of this trait through its
//! whole lifetime: `attach` once (with a back-reference to the owning
//! `Connection`), `on_connected` once, then zero or more `on_new_packet`
//! calls in sequence order, then `on_disconnected` once.

use std::sync::Weak;

use crate::connection::Connection;

/// Upcalls fired by a `Connection` as its handshake, data, and teardown
/// state machine progresses.
pub trait ConnectionHandler: Send {
    /// Fired once, immediately after the `Connection` is constructed and
    /// before any packet reaches it. Gives a handler that wants to send data
    /// on its own initiative (e.g. an echo) a handle back to the connection
    /// without the connection having to own a reference to itself.
    fn attach(&mut self, _connection: Weak<Connection>) {}

    /// Fired exactly once, synchronously while handling the SYN that
    /// establishes the session.
    fn on_connected(&mut self) {}

    /// Fired exactly once, on whichever teardown path runs first.
    fn on_disconnected(&mut self) {}

    /// Fired at most once per unique DATA packet-id, only for non-empty
    /// payloads, strictly in sequence order.
    fn on_new_packet(&mut self, payload: &[u8]);
}
