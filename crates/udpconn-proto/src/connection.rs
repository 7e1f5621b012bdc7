//! Per-peer protocol state machine: handshake, the sliding-window-of-one
//! send/ack loop, liveness tracking, and teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Instant};

use udpconn_binary::BinaryReader;

use crate::handler::ConnectionHandler;
use crate::header::{Header, FLAG_ACK, FLAG_DATA, FLAG_PING, FLAG_RST, FLAG_SYNACK};
use crate::seq::{is_covered_by, is_next, AckClass};

/// Overall deadline for a single `send` call.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a send iteration waits for ack progress before retransmitting.
pub const TIME_WAIT_FOR_ACK: Duration = Duration::from_millis(200);
/// Pacing delay between frames of the same outbound batch.
pub const TIME_MIDDLE_PACKET: Duration = Duration::from_millis(20);
/// No inbound packet within this window on an established session is a dead peer.
pub const QUIET_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of a `Connection::send` call. Discriminants match the distilled
/// protocol's wire-level return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok = 0,
    Timeout = -1,
    /// Reserved for a future bounded-queue policy; this engine never produces it.
    NoSpace = -2,
    ConnectionLost = -3,
}

/// Sink a `Connection` uses to emit outbound datagrams. The server implements
/// this over its bound socket; tests implement it over an in-memory queue.
pub trait OutboundTransport: Send + Sync {
    fn send_to(&self, addr: SocketAddr, bytes: &[u8]);
}

/// Fields a sender and the I/O task both touch: guarded by one async mutex
/// so a sender's wait and the I/O task's ack bookkeeping never race.
struct SendState {
    sess_id: u16,
    last_send_id: u16,
    last_send_acked: Option<u16>,
    disconnected: bool,
}

struct OutboundFrame {
    packet_id: u16,
    bytes: Vec<u8>,
}

pub struct Connection {
    remote: SocketAddr,
    transport: Arc<dyn OutboundTransport>,
    handler: Mutex<Box<dyn ConnectionHandler>>,

    state: Mutex<SendState>,
    ack_notify: Notify,

    // Touched only by the single I/O task (the datagram-dispatch/tick loop).
    // `Connection` is still shared via `Arc` across sender tasks, so these
    // need thread-safe interior mutability even though only one task writes.
    last_received_id: AtomicU16,
    last_received_at: StdMutex<Instant>,
    to_delete: AtomicBool,
    established: AtomicBool,
}

impl Connection {
    pub fn new(
        remote: SocketAddr,
        transport: Arc<dyn OutboundTransport>,
        handler: Box<dyn ConnectionHandler>,
    ) -> Self {
        Connection {
            remote,
            transport,
            handler: Mutex::new(handler),
            state: Mutex::new(SendState {
                sess_id: 0,
                last_send_id: 0,
                last_send_acked: None,
                disconnected: false,
            }),
            ack_notify: Notify::new(),
            last_received_id: AtomicU16::new(0),
            last_received_at: StdMutex::new(Instant::now()),
            to_delete: AtomicBool::new(false),
            established: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Hands the handler a weak back-reference to this connection. Called
    /// once by the Server right after construction, before the first
    /// datagram is processed.
    pub async fn attach(self: &Arc<Self>) {
        self.handler.lock().await.attach(Arc::downgrade(self));
    }

    pub fn is_dead(&self) -> bool {
        self.to_delete.load(Ordering::Acquire)
    }

    fn touch_received(&self) {
        *self.last_received_at.lock().unwrap() = Instant::now();
    }

    fn quiet_for(&self) -> Duration {
        self.last_received_at.lock().unwrap().elapsed()
    }

    fn send_raw(&self, header: Header, payload: &[u8]) {
        match header.encode_with_payload(payload) {
            Ok(bytes) => self.transport.send_to(self.remote, &bytes),
            Err(e) => warn!("{}: failed to encode outbound header: {e}", self.remote),
        }
    }

    /// Invoked by the Server on the I/O task with every datagram matched to
    /// this connection. Never suspends indefinitely.
    pub async fn process_packet(&self, bytes: &[u8]) {
        if self.to_delete.load(Ordering::Acquire) {
            return;
        }

        let mut reader = BinaryReader::new(Bytes::copy_from_slice(bytes));
        let header = match Header::decode(&mut reader) {
            Ok(h) => h,
            Err(e) => {
                trace!("{}: dropping malformed datagram: {e}", self.remote);
                return;
            }
        };

        let established = self.established.load(Ordering::Acquire);

        if header.is_syn() {
            if established {
                info!("{}: SYN while established, tearing down", self.remote);
                self.mark_disconnection(false).await;
            } else {
                self.accept_syn(header.packet_id).await;
            }
            return;
        }

        if !established {
            // A non-SYN before any handshake is rejected outright: RST unless
            // the inbound packet was itself a RST, then torn down. No session
            // ever existed, so no `on_disconnected` fires.
            trace!("{}: non-SYN before handshake, rejecting", self.remote);
            self.mark_disconnection(!header.is_rst()).await;
            return;
        }

        let sess_id = { self.state.lock().await.sess_id };
        if header.session_id != sess_id {
            warn!(
                "{}: session id mismatch ({} != {sess_id}), tearing down",
                self.remote, header.session_id
            );
            self.mark_disconnection(true).await;
            return;
        }

        if header.is_rst() {
            info!("{}: received RST", self.remote);
            self.mark_disconnection(false).await;
            return;
        }

        self.touch_received();

        let payload = reader.read_remaining();

        if header.is_ping() {
            self.handle_ping(sess_id);
        } else if header.is_data() {
            self.handle_data(header.packet_id, &payload).await;
        } else if header.is_ack() {
            self.handle_ack(header.packet_id).await;
        }
    }

    async fn accept_syn(&self, syn_id: u16) {
        let sess_id: u16 = rand::random_range(1..=u16::MAX);
        let send_id: u16 = rand::random();

        {
            let mut state = self.state.lock().await;
            state.sess_id = sess_id;
            state.last_send_id = send_id;
            state.last_send_acked = None;
            state.disconnected = false;
        }

        self.last_received_id.store(syn_id, Ordering::Release);
        self.touch_received();
        self.established.store(true, Ordering::Release);

        debug!("{}: SYN accepted, sess_id={sess_id}", self.remote);

        self.send_raw(Header::new(sess_id, send_id, FLAG_SYNACK), &[]);

        self.handler.lock().await.on_connected();
    }

    /// Echoes a PING with packet-id 0, regardless of the inbound id. PINGs
    /// never touch sequence numbers or fire upcalls.
    fn handle_ping(&self, sess_id: u16) {
        trace!("{}: PING", self.remote);
        self.send_raw(Header::new(sess_id, 0, FLAG_PING), &[]);
    }

    async fn handle_ack(&self, ack_id: u16) {
        let mut should_notify = false;
        let mut tear_down = false;

        {
            let mut state = self.state.lock().await;
            match state.last_send_acked {
                None => {
                    state.last_send_acked = Some(ack_id);
                    should_notify = true;
                }
                Some(last) => match crate::seq::classify_ack(ack_id, last) {
                    AckClass::NextExpected => {
                        state.last_send_acked = Some(ack_id);
                        should_notify = true;
                    }
                    AckClass::LargeForwardJump => {
                        tear_down = true;
                    }
                    AckClass::Duplicate => {}
                },
            }
        }

        if tear_down {
            warn!("{}: ACK jumped out of range, tearing down", self.remote);
            self.mark_disconnection(true).await;
            return;
        }

        if should_notify {
            self.ack_notify.notify_waiters();
        }
    }

    async fn handle_data(&self, packet_id: u16, payload: &Bytes) {
        let last_received = self.last_received_id.load(Ordering::Acquire);

        if is_next(packet_id, last_received) {
            self.last_received_id.store(packet_id, Ordering::Release);
            if !payload.is_empty() {
                self.handler.lock().await.on_new_packet(payload);
            }
        } else {
            trace!(
                "{}: out-of-order DATA id={packet_id} (last={last_received}), not advancing",
                self.remote
            );
        }

        let ack_id = self.last_received_id.load(Ordering::Acquire);
        let sess_id = { self.state.lock().await.sess_id };
        self.send_raw(Header::new(sess_id, ack_id, FLAG_ACK), &[]);
    }

    /// Delivers `payloads` reliably and in order. Suspends the caller up to
    /// `SEND_TIMEOUT`.
    pub async fn send(&self, payloads: &[Vec<u8>]) -> SendStatus {
        if !self.established.load(Ordering::Acquire) || self.to_delete.load(Ordering::Acquire) {
            return SendStatus::ConnectionLost;
        }

        let (sess_id, mut frames) = {
            let mut state = self.state.lock().await;
            if state.disconnected {
                state.disconnected = false;
                return SendStatus::ConnectionLost;
            }

            let sess_id = state.sess_id;
            let mut frames = Vec::with_capacity(payloads.len());
            for payload in payloads {
                state.last_send_id = state.last_send_id.wrapping_add(1);
                let header = Header::new(sess_id, state.last_send_id, FLAG_DATA);
                let bytes = match header.encode_with_payload(payload) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("{}: failed to encode DATA frame: {e}", self.remote);
                        continue;
                    }
                };
                frames.push(OutboundFrame {
                    packet_id: state.last_send_id,
                    bytes,
                });
            }
            (sess_id, frames)
        };

        let deadline = Instant::now() + SEND_TIMEOUT;

        loop {
            let (acked, disconnected_now) = {
                let mut state = self.state.lock().await;
                let disconnected_now = state.disconnected;
                if disconnected_now {
                    state.disconnected = false;
                }
                (state.last_send_acked, disconnected_now)
            };

            if disconnected_now {
                return SendStatus::ConnectionLost;
            }

            frames.retain(|frame| match acked {
                Some(acked_id) => !is_covered_by(frame.packet_id, acked_id),
                None => true,
            });

            if frames.is_empty() {
                return SendStatus::Ok;
            }

            if Instant::now() >= deadline {
                self.send_raw(Header::new(sess_id, 0, FLAG_RST), &[]);
                self.mark_disconnection(false).await;
                return SendStatus::Timeout;
            }

            for frame in &frames {
                self.transport.send_to(self.remote, &frame.bytes);
                tokio::time::sleep(TIME_MIDDLE_PACKET).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(TIME_WAIT_FOR_ACK);

            // Spurious wake-ups are fine: the top of the loop re-checks both
            // the acked set and the disconnection edge under the mutex.
            let _ = timeout(wait, self.ack_notify.notified()).await;
        }
    }

    /// Invoked by the Server's periodic tick. Tears down established
    /// connections that have gone quiet for longer than `QUIET_TIMEOUT`.
    pub async fn tmr(&self) {
        if !self.established.load(Ordering::Acquire) || self.to_delete.load(Ordering::Acquire) {
            return;
        }

        if self.quiet_for() > QUIET_TIMEOUT {
            info!("{}: quiet timeout, tearing down", self.remote);
            self.mark_disconnection(true).await;
        }
    }

    /// Idempotent teardown. Optionally sends an RST, fires `on_disconnected`
    /// exactly once, and wakes any blocked sender.
    async fn mark_disconnection(&self, send_rst: bool) {
        if self.to_delete.swap(true, Ordering::AcqRel) {
            return;
        }

        let sess_id = {
            let mut state = self.state.lock().await;
            let sess_id = state.sess_id;
            state.sess_id = 0;
            state.disconnected = true;
            sess_id
        };

        if send_rst {
            self.send_raw(Header::new(sess_id, 0, FLAG_RST), &[]);
        }

        if self.established.swap(false, Ordering::AcqRel) {
            self.handler.lock().await.on_disconnected();
        }

        self.ack_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdSyncMutex;
    use udpconn_binary::BinaryWriter;

    struct RecordingTransport {
        sent: StdSyncMutex<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdSyncMutex::new(Vec::new()),
            })
        }

        fn last(&self) -> Option<Vec<u8>> {
            self.sent.lock().unwrap().last().cloned()
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl OutboundTransport for RecordingTransport {
        fn send_to(&self, _addr: SocketAddr, bytes: &[u8]) {
            self.sent.lock().unwrap().push(bytes.to_vec());
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        connected: u32,
        disconnected: u32,
        packets: Vec<Vec<u8>>,
    }

    impl ConnectionHandler for RecordingHandler {
        fn on_connected(&mut self) {
            self.connected += 1;
        }

        fn on_disconnected(&mut self) {
            self.disconnected += 1;
        }

        fn on_new_packet(&mut self, payload: &[u8]) {
            self.packets.push(payload.to_vec());
        }
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn encode(header: Header, payload: &[u8]) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        header.encode(&mut writer).unwrap();
        writer.write_bytes(payload).unwrap();
        writer.freeze().to_vec()
    }

    fn decode_header(bytes: &[u8]) -> Header {
        let mut reader = BinaryReader::new(Bytes::copy_from_slice(bytes));
        Header::decode(&mut reader).unwrap()
    }

    fn new_connection() -> (Connection, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let conn = Connection::new(
            remote(),
            transport.clone(),
            Box::new(RecordingHandler::default()),
        );
        (conn, transport)
    }

    async fn handshake(conn: &Connection, transport: &RecordingTransport) -> u16 {
        let syn = encode(Header::new(0, 1000, crate::header::FLAG_SYN), &[]);
        conn.process_packet(&syn).await;
        let synack = decode_header(&transport.last().unwrap());
        assert!(synack.is_synack());
        synack.session_id
    }

    #[tokio::test]
    async fn s1_happy_handshake_and_one_data() {
        let (conn, transport) = new_connection();
        let sess_id = handshake(&conn, &transport).await;

        let data = encode(Header::new(sess_id, 1001, FLAG_DATA), b"hello");
        conn.process_packet(&data).await;

        let ack = decode_header(&transport.last().unwrap());
        assert!(ack.is_ack());
        assert_eq!(ack.packet_id, 1001);
    }

    #[tokio::test]
    async fn s2_duplicate_data_does_not_advance_or_refire() {
        let (conn, transport) = new_connection();
        let sess_id = handshake(&conn, &transport).await;

        let data = encode(Header::new(sess_id, 1001, FLAG_DATA), b"one");
        conn.process_packet(&data).await;
        let first_count = transport.count();

        conn.process_packet(&data).await;
        let ack = decode_header(&transport.last().unwrap());
        assert_eq!(ack.packet_id, 1001);
        assert_eq!(transport.count(), first_count + 1);
    }

    #[tokio::test]
    async fn s3_gapped_data_is_acked_at_last_in_order_id() {
        let (conn, transport) = new_connection();
        let sess_id = handshake(&conn, &transport).await;

        let gapped = encode(Header::new(sess_id, 1003, FLAG_DATA), b"skip");
        conn.process_packet(&gapped).await;

        let ack = decode_header(&transport.last().unwrap());
        assert!(ack.is_ack());
        assert_eq!(ack.packet_id, 1000);
    }

    #[tokio::test]
    async fn s4_wraparound_data_advances_across_the_boundary() {
        let (conn, transport) = new_connection();
        let syn = encode(Header::new(0, 0xFFFF, crate::header::FLAG_SYN), &[]);
        conn.process_packet(&syn).await;
        let sess_id = decode_header(&transport.last().unwrap()).session_id;

        let data = encode(Header::new(sess_id, 0x0000, FLAG_DATA), b"wrap");
        conn.process_packet(&data).await;

        let ack = decode_header(&transport.last().unwrap());
        assert_eq!(ack.packet_id, 0x0000);
    }

    #[tokio::test(start_paused = true)]
    async fn s5_quiet_timeout_tears_down_established_session() {
        let (conn, transport) = new_connection();
        handshake(&conn, &transport).await;

        tokio::time::advance(QUIET_TIMEOUT + Duration::from_millis(1)).await;
        conn.tmr().await;

        assert!(conn.is_dead());
        let rst = decode_header(&transport.last().unwrap());
        assert!(rst.is_rst());
    }

    #[tokio::test(start_paused = true)]
    async fn s6_send_timeout_without_any_ack_returns_timeout() {
        let (conn, transport) = new_connection();
        handshake(&conn, &transport).await;

        // No ACK ever arrives; the paused clock auto-advances through every
        // internal pacing/ack-wait sleep until the 5 s deadline is hit.
        let status = conn.send(&[b"payload".to_vec()]).await;

        assert_eq!(status, SendStatus::Timeout);
        assert!(conn.is_dead());
    }

    #[tokio::test]
    async fn s7_session_id_mismatch_tears_down_without_upcall_suppression() {
        let (conn, transport) = new_connection();
        let sess_id = handshake(&conn, &transport).await;

        let wrong = encode(Header::new(sess_id.wrapping_add(1), 1001, FLAG_DATA), b"x");
        conn.process_packet(&wrong).await;

        assert!(conn.is_dead());
        let rst = decode_header(&transport.last().unwrap());
        assert!(rst.is_rst());
    }

    #[tokio::test]
    async fn send_returns_ok_once_all_frames_are_covered_by_an_ack() {
        use std::future::Future;
        use std::task::Poll;

        let (conn, transport) = new_connection();
        let sess_id = handshake(&conn, &transport).await;

        let send = conn.send(&[b"ping".to_vec()]);
        tokio::pin!(send);

        // Poll once so the DATA frame is assigned and transmitted.
        std::future::poll_fn(|cx| match send.as_mut().poll(cx) {
            Poll::Pending => Poll::Ready(()),
            Poll::Ready(_) => panic!("send resolved before any ack"),
        })
        .await;

        let sent_data = decode_header(&transport.last().unwrap());
        assert!(sent_data.is_data());

        let ack = encode(Header::new(sess_id, sent_data.packet_id, FLAG_ACK), &[]);
        conn.process_packet(&ack).await;

        let status = send.await;
        assert_eq!(status, SendStatus::Ok);
    }
}
