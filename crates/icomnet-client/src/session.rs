//! Per-session protocol state machine.
//!
//! Each of the three UDP sessions (control, CI-V, audio) carries its own
//! identifiers, tracked sequence numbering, retransmission history, and
//! keep-alive timers. [`Session`] owns all of that plus the
//! [`UdpEndpoint`] the session speaks through.
//!
//! The radio binds session liveness to the tuple (local id, tokens), so
//! [`reset`](Session::reset) reinitializes every mutable field before a
//! reconnect; reusing stale identifiers makes the radio reject the peer.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use icomnet_core::{Error, Result, SessionKind};
use icomnet_proto::packets::{self, ControlType, SEQ_OFFSET};
use icomnet_proto::wire::write_u16_le;

use crate::transport::UdpEndpoint;

/// ARE_YOU_THERE probe period.
const AYT_INTERVAL: Duration = Duration::from_millis(500);
/// Ping request period.
const PING_INTERVAL: Duration = Duration::from_millis(500);
/// Idle-timer tick.
const IDLE_TICK: Duration = Duration::from_millis(100);
/// Send a keep-alive when the session has been quiet this long.
const IDLE_AFTER: Duration = Duration::from_millis(200);
/// Retransmission history depth. A request for an evicted sequence falls
/// back to a NULL control carrying that sequence, which satisfies the radio.
const TX_HISTORY_LIMIT: usize = 512;

/// Lower 32 bits of the process monotonic clock, in milliseconds. Used as
/// the ping request timestamp.
pub(crate) fn monotonic_millis() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u32
}

/// A fresh session id: the low 32 bits of the wall clock at nanosecond
/// resolution.
fn new_local_id() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u32
}

#[derive(Debug)]
struct SessionState {
    local_id: u32,
    remote_id: u32,
    local_token: u16,
    rig_token: u32,
    /// Next tracked sequence. Starts at 1; sequence 0 is reserved for the
    /// initial ARE_YOU_THERE.
    tracked_seq: u16,
    ping_seq: u16,
    inner_seq: u16,
    tx_history: HashMap<u16, Vec<u8>>,
    history_order: VecDeque<u16>,
    last_sent_at: Instant,
    last_received_at: Instant,
}

impl SessionState {
    fn fresh() -> Self {
        let now = Instant::now();
        SessionState {
            local_id: new_local_id(),
            remote_id: 0,
            local_token: 0,
            rig_token: 0,
            tracked_seq: 1,
            ping_seq: 0,
            inner_seq: 0x30,
            tx_history: HashMap::new(),
            history_order: VecDeque::new(),
            last_sent_at: now,
            last_received_at: now,
        }
    }
}

#[derive(Debug, Default)]
struct Timers {
    are_you_there: Option<JoinHandle<()>>,
    ping: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
}

/// One UDP session: identifiers, sequence counters, retransmission history,
/// and keep-alive timers, plus the socket they run over.
#[derive(Debug)]
pub struct Session {
    kind: SessionKind,
    endpoint: UdpEndpoint,
    state: Mutex<SessionState>,
    timers: StdMutex<Timers>,
    send_enabled: AtomicBool,
}

impl Session {
    /// Create a session in its reset state. Sending is disabled until the
    /// first [`reset`](Self::reset).
    pub fn new(kind: SessionKind) -> Self {
        Session {
            kind,
            endpoint: UdpEndpoint::new(kind),
            state: Mutex::new(SessionState::fresh()),
            timers: StdMutex::new(Timers::default()),
            send_enabled: AtomicBool::new(false),
        }
    }

    /// Which session this is.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// The session's socket.
    pub fn endpoint(&self) -> &UdpEndpoint {
        &self.endpoint
    }

    // -- state accessors ----------------------------------------------------

    /// The locally chosen 32-bit session id.
    pub async fn local_id(&self) -> u32 {
        self.state.lock().await.local_id
    }

    /// The radio's 32-bit session id, or 0 until I_AM_HERE arrives.
    pub async fn remote_id(&self) -> u32 {
        self.state.lock().await.remote_id
    }

    /// `(local_id, remote_id)` for packet building.
    pub async fn ids(&self) -> (u32, u32) {
        let state = self.state.lock().await;
        (state.local_id, state.remote_id)
    }

    /// Record the radio's session id learned from I_AM_HERE.
    pub async fn set_remote_id(&self, remote_id: u32) {
        self.state.lock().await.remote_id = remote_id;
    }

    /// `(local_token, rig_token)` as learned during login.
    pub async fn tokens(&self) -> (u16, u32) {
        let state = self.state.lock().await;
        (state.local_token, state.rig_token)
    }

    /// Record the token pair.
    pub async fn set_tokens(&self, local_token: u16, rig_token: u32) {
        let mut state = self.state.lock().await;
        state.local_token = local_token;
        state.rig_token = rig_token;
    }

    /// Return the current inner sequence and advance it. The counter starts
    /// at 0x30 and increments per token/login/conninfo payload.
    pub async fn next_inner_seq(&self) -> u16 {
        let mut state = self.state.lock().await;
        let seq = state.inner_seq;
        state.inner_seq = state.inner_seq.wrapping_add(1);
        seq
    }

    /// The ping sequence the next request will carry.
    pub async fn ping_seq(&self) -> u16 {
        self.state.lock().await.ping_seq
    }

    /// Advance the ping sequence; called when a ping reply arrives.
    pub async fn ping_reply_received(&self) {
        let mut state = self.state.lock().await;
        state.ping_seq = state.ping_seq.wrapping_add(1);
    }

    /// Note an inbound datagram on this session.
    pub async fn note_received(&self, at: Instant) {
        self.state.lock().await.last_received_at = at;
    }

    /// How long the session has gone without receiving anything.
    pub async fn receive_age(&self) -> Duration {
        self.state.lock().await.last_received_at.elapsed()
    }

    /// How long the session has gone without sending anything.
    pub async fn sent_age(&self) -> Duration {
        self.state.lock().await.last_sent_at.elapsed()
    }

    // -- sending ------------------------------------------------------------

    /// Stamp the next tracked sequence into `packet`, record the bytes for
    /// retransmission, and send. Returns the sequence used.
    ///
    /// The sequence is written after the caller's template is copied and
    /// before the bytes enter the history, so a retransmit resends exactly
    /// what the radio saw.
    pub async fn send_tracked(&self, mut packet: Vec<u8>) -> Result<u16> {
        if !self.send_enabled.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let seq = {
            let mut state = self.state.lock().await;
            let seq = state.tracked_seq;
            state.tracked_seq = state.tracked_seq.wrapping_add(1);
            write_u16_le(&mut packet, SEQ_OFFSET, seq);
            state.tx_history.insert(seq, packet.clone());
            state.history_order.push_back(seq);
            if state.history_order.len() > TX_HISTORY_LIMIT {
                if let Some(evicted) = state.history_order.pop_front() {
                    state.tx_history.remove(&evicted);
                }
            }
            seq
        };
        self.endpoint.send(&packet).await?;
        self.note_sent().await;
        Ok(seq)
    }

    /// Send a packet as-is, without sequence stamping or history.
    pub async fn send_untracked(&self, packet: &[u8]) -> Result<()> {
        if !self.send_enabled.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.endpoint.send(packet).await?;
        self.note_sent().await;
        Ok(())
    }

    /// Answer a retransmission request for `seq`.
    ///
    /// If the history still holds the packet it is resent byte-identical;
    /// otherwise a NULL control carrying the requested sequence is sent,
    /// which satisfies the radio even without history.
    pub async fn retransmit(&self, seq: u16) -> Result<()> {
        let stored = {
            let state = self.state.lock().await;
            state.tx_history.get(&seq).cloned()
        };
        match stored {
            Some(bytes) => {
                tracing::debug!(session = %self.kind, seq, "retransmitting from history");
                self.send_untracked(&bytes).await
            }
            None => {
                tracing::debug!(session = %self.kind, seq, "retransmit miss, sending NULL");
                let (local, remote) = self.ids().await;
                let packet = packets::control_packet(ControlType::Null, seq, local, remote);
                self.send_untracked(&packet).await
            }
        }
    }

    async fn note_sent(&self) {
        self.state.lock().await.last_sent_at = Instant::now();
    }

    // -- timers -------------------------------------------------------------

    /// Probe the radio with ARE_YOU_THERE every 500 ms (seq 0, receiver id
    /// unknown). Stopped when I_AM_HERE is processed.
    pub fn start_are_you_there(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(AYT_INTERVAL);
            loop {
                interval.tick().await;
                let local_id = session.local_id().await;
                let packet = packets::are_you_there_packet(local_id);
                if let Err(e) = session.send_untracked(&packet).await {
                    tracing::debug!(session = %session.kind, error = %e, "are-you-there stopped");
                    break;
                }
            }
        });
        self.store_timer(|timers| &mut timers.are_you_there, handle);
    }

    /// Stop the ARE_YOU_THERE probe.
    pub fn stop_are_you_there(&self) {
        if let Some(handle) = self.timers.lock().expect("timers lock").are_you_there.take() {
            handle.abort();
        }
    }

    /// Send a ping request every 500 ms carrying the current ping sequence
    /// and the low 32 bits of the monotonic clock.
    pub fn start_ping(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                let (local, remote) = session.ids().await;
                let seq = session.ping_seq().await;
                let packet = packets::ping_request(seq, local, remote, monotonic_millis());
                if let Err(e) = session.send_untracked(&packet).await {
                    tracing::debug!(session = %session.kind, error = %e, "ping stopped");
                    break;
                }
            }
        });
        self.store_timer(|timers| &mut timers.ping, handle);
    }

    /// Every 100 ms, if nothing has been sent for 200 ms, send a tracked
    /// NULL control to keep the session alive.
    pub fn start_idle(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_TICK);
            // Skip the immediate first tick; the caller just sent something.
            interval.tick().await;
            loop {
                interval.tick().await;
                if session.sent_age().await <= IDLE_AFTER {
                    continue;
                }
                let (local, remote) = session.ids().await;
                let packet = packets::control_packet(ControlType::Null, 0, local, remote);
                if let Err(e) = session.send_tracked(packet).await {
                    tracing::debug!(session = %session.kind, error = %e, "idle timer stopped");
                    break;
                }
            }
        });
        self.store_timer(|timers| &mut timers.idle, handle);
    }

    /// Stop every timer on this session.
    pub fn stop_timers(&self) {
        let mut timers = self.timers.lock().expect("timers lock");
        for handle in [
            timers.are_you_there.take(),
            timers.ping.take(),
            timers.idle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    fn store_timer(
        &self,
        slot: impl FnOnce(&mut Timers) -> &mut Option<JoinHandle<()>>,
        handle: JoinHandle<()>,
    ) {
        let mut timers = self.timers.lock().expect("timers lock");
        if let Some(old) = slot(&mut timers).replace(handle) {
            old.abort();
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Stop timers and reinitialize every mutable field: fresh local id,
    /// cleared remote id and tokens, sequence counters back to their start
    /// values, empty history. Mandatory before any reconnect attempt.
    pub async fn reset(&self) {
        self.stop_timers();
        *self.state.lock().await = SessionState::fresh();
        self.send_enabled.store(true, Ordering::SeqCst);
        tracing::debug!(session = %self.kind, "session state reset");
    }

    /// Disable transmission. A closed session must not transmit; every send
    /// after this returns [`Error::NotConnected`] until the next reset.
    pub fn disable_send(&self) {
        self.send_enabled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icomnet_proto::wire::{read_u16_le, read_u32_le};
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    async fn session_with_peer() -> (Arc<Session>, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = Arc::new(Session::new(SessionKind::Control));
        let (tx, _rx) = mpsc::channel(32);
        session.endpoint().open(tx).await.unwrap();
        session
            .endpoint()
            .set_remote(peer.local_addr().unwrap())
            .await;
        session.reset().await;
        (session, peer)
    }

    async fn recv_packet(peer: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("timed out waiting for packet")
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn tracked_seq_starts_at_one_and_increments() {
        let (session, peer) = session_with_peer().await;
        let (local, remote) = session.ids().await;

        for expected in 1u16..=3 {
            let packet = packets::control_packet(ControlType::Null, 0, local, remote);
            let seq = session.send_tracked(packet).await.unwrap();
            assert_eq!(seq, expected);
            let sent = recv_packet(&peer).await;
            assert_eq!(read_u16_le(&sent, SEQ_OFFSET), expected);
        }
    }

    #[tokio::test]
    async fn retransmit_is_byte_identical() {
        let (session, peer) = session_with_peer().await;
        let (local, remote) = session.ids().await;

        let packet = packets::control_packet(ControlType::Null, 0, local, remote);
        let seq = session.send_tracked(packet).await.unwrap();
        let original = recv_packet(&peer).await;

        session.retransmit(seq).await.unwrap();
        let resent = recv_packet(&peer).await;
        assert_eq!(original, resent);
    }

    #[tokio::test]
    async fn retransmit_miss_sends_null_with_requested_seq() {
        let (session, peer) = session_with_peer().await;

        session.retransmit(0x0123).await.unwrap();
        let sent = recv_packet(&peer).await;
        assert_eq!(sent.len(), packets::CONTROL_SIZE);
        assert_eq!(read_u16_le(&sent, 0x04), ControlType::Null.as_u16());
        assert_eq!(read_u16_le(&sent, SEQ_OFFSET), 0x0123);
    }

    #[tokio::test]
    async fn history_eviction_falls_back_to_null() {
        let (session, peer) = session_with_peer().await;
        let (local, remote) = session.ids().await;

        // Push sequence 1 out of the history window.
        for _ in 0..(TX_HISTORY_LIMIT + 1) {
            let packet = packets::control_packet(ControlType::Null, 0, local, remote);
            session.send_tracked(packet).await.unwrap();
            recv_packet(&peer).await;
        }

        session.retransmit(1).await.unwrap();
        let sent = recv_packet(&peer).await;
        // The evicted packet comes back as a NULL control with that seq.
        assert_eq!(sent.len(), packets::CONTROL_SIZE);
        assert_eq!(read_u16_le(&sent, SEQ_OFFSET), 1);
    }

    #[tokio::test]
    async fn are_you_there_probes_until_stopped() {
        let (session, peer) = session_with_peer().await;
        let local = session.local_id().await;

        session.start_are_you_there();
        let first = recv_packet(&peer).await;
        assert_eq!(read_u16_le(&first, 0x04), ControlType::AreYouThere.as_u16());
        assert_eq!(read_u16_le(&first, SEQ_OFFSET), 0);
        assert_eq!(read_u32_le(&first, 0x08), local);
        assert_eq!(read_u32_le(&first, 0x0C), 0);

        // A second probe follows while unanswered.
        let second = recv_packet(&peer).await;
        assert_eq!(read_u16_le(&second, 0x04), ControlType::AreYouThere.as_u16());

        session.stop_are_you_there();
    }

    #[tokio::test]
    async fn idle_timer_fills_transmit_gaps() {
        let (session, peer) = session_with_peer().await;
        session.start_idle();

        // With nothing else sending, a tracked NULL shows up within a few
        // hundred milliseconds.
        let sent = recv_packet(&peer).await;
        assert_eq!(sent.len(), packets::CONTROL_SIZE);
        assert_eq!(read_u16_le(&sent, 0x04), ControlType::Null.as_u16());
        assert_eq!(read_u16_le(&sent, SEQ_OFFSET), 1);

        session.stop_timers();
    }

    #[tokio::test]
    async fn reset_reinitializes_state() {
        let (session, peer) = session_with_peer().await;
        let first_id = session.local_id().await;
        session.set_remote_id(0xAABB).await;
        session.set_tokens(0x1234, 0x5678_9ABC).await;
        let (local, remote) = session.ids().await;
        session
            .send_tracked(packets::control_packet(ControlType::Null, 0, local, remote))
            .await
            .unwrap();
        recv_packet(&peer).await;
        session.next_inner_seq().await;
        session.ping_reply_received().await;

        session.reset().await;

        assert_ne!(session.local_id().await, first_id);
        assert_eq!(session.remote_id().await, 0);
        assert_eq!(session.tokens().await, (0, 0));
        assert_eq!(session.ping_seq().await, 0);
        assert_eq!(session.next_inner_seq().await, 0x30);
        // Tracked sequence is back to 1.
        let (local, remote) = session.ids().await;
        let seq = session
            .send_tracked(packets::control_packet(ControlType::Null, 0, local, remote))
            .await
            .unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn closed_session_does_not_transmit() {
        let (session, _peer) = session_with_peer().await;
        session.disable_send();

        let (local, remote) = session.ids().await;
        let packet = packets::control_packet(ControlType::Null, 0, local, remote);
        assert!(matches!(
            session.send_tracked(packet).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.send_untracked(&[0u8; 16]).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn ping_requests_carry_current_seq() {
        let (session, peer) = session_with_peer().await;
        session.set_remote_id(0x42).await;
        session.start_ping();

        let first = recv_packet(&peer).await;
        assert_eq!(first.len(), packets::PING_SIZE);
        assert_eq!(read_u16_le(&first, 0x04), ControlType::Ping.as_u16());
        assert_eq!(first[0x10], 0x00);
        assert_eq!(read_u16_le(&first, SEQ_OFFSET), 0);

        // The sequence does not advance until a reply is processed.
        let second = recv_packet(&peer).await;
        assert_eq!(read_u16_le(&second, SEQ_OFFSET), 0);

        session.ping_reply_received().await;
        // Drain until the new sequence appears (a request built before the
        // reply may still be in flight).
        let mut seen = read_u16_le(&recv_packet(&peer).await, SEQ_OFFSET);
        if seen == 0 {
            seen = read_u16_le(&recv_packet(&peer).await, SEQ_OFFSET);
        }
        assert_eq!(seen, 1);

        session.stop_timers();
    }
}
