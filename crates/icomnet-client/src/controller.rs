//! The connection controller.
//!
//! [`WlanClient`] owns the three sessions, drives the connection state
//! machine, demultiplexes inbound packets by length and header, coordinates
//! the CI-V/Audio bring-up, runs the health monitor and the reconnect loop,
//! and emits lifecycle events on a broadcast channel.
//!
//! All inbound datagrams from the three sockets funnel through one demux
//! task, so state mutation is serialized: handlers run to completion, one
//! datagram at a time. Sessions mutate only their own fields; the controller
//! is the sole mutator of the connection phase.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use icomnet_core::{
    ClientConfig, ClientEvent, ConnectionMetrics, ConnectionPhase, Error, MonitorConfig,
    RadioCapabilities, Result, SessionKind,
};
use icomnet_proto::auth;
use icomnet_proto::civ::CivReassembler;
use icomnet_proto::packets::{
    self, AudioView, CapabilitiesView, CivView, ConnInfoParams, ConnInfoView, ControlType, Header,
    LoginResponseView, PingView, StatusView, TokenRequestKind, TokenView,
};

use crate::audio::AudioSubsession;
use crate::civ::CivSubsession;
use crate::session::Session;
use crate::transport::Datagram;

/// CI-V and audio bring-up share this clock, started once login succeeds. A
/// radio that accepts login but never answers sub-session discovery fails
/// fast instead of burning the whole connect timeout.
const SUBSESSION_TIMEOUT: Duration = Duration::from_secs(10);
/// Token renewal period while connected.
const TOKEN_RENEWAL_INTERVAL: Duration = Duration::from_secs(60);
/// Best-effort outbound drain before sockets close on disconnect.
const DISCONNECT_DRAIN: Duration = Duration::from_millis(200);
/// Broadcast capacity for event subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Demux channel capacity; inbound datagrams queue here briefly.
const DEMUX_CHANNEL_CAPACITY: usize = 256;
/// Stream sample rates advertised in the connection-info reply.
const STREAM_SAMPLE_RATE: u32 = 12_000;
/// TX jitter buffer size advertised in the connection-info reply.
const TX_BUFFER_SIZE: u32 = 0x96;

// ---------------------------------------------------------------------------
// Per-attempt readiness signals
// ---------------------------------------------------------------------------

/// The login outcome handed from the demux to the connect driver.
#[derive(Debug)]
struct LoginOutcome {
    error: u32,
    token: u32,
}

/// A single-use readiness signal, fired at most once by the demux.
#[derive(Debug)]
struct SignalSlot<T>(StdMutex<Option<oneshot::Sender<T>>>);

impl<T> SignalSlot<T> {
    fn pair() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (SignalSlot(StdMutex::new(Some(tx))), rx)
    }

    fn fire(&self, value: T) {
        if let Some(tx) = self.0.lock().expect("signal lock").take() {
            let _ = tx.send(value);
        }
    }
}

/// The demux-facing side of one connect attempt's readiness signals.
///
/// These are internal one-shot signals, deliberately separate from the
/// user-visible event channel.
#[derive(Debug)]
struct AttemptSignals {
    session_id: u64,
    control_here: SignalSlot<()>,
    control_ready: SignalSlot<()>,
    login: SignalSlot<LoginOutcome>,
    conn_info: SignalSlot<()>,
    status_ports: SignalSlot<(u16, u16)>,
    civ_ready: SignalSlot<()>,
    audio_ready: SignalSlot<()>,
}

/// The driver-facing side of the signals.
struct AttemptReceivers {
    control_here: oneshot::Receiver<()>,
    control_ready: oneshot::Receiver<()>,
    login: oneshot::Receiver<LoginOutcome>,
    conn_info: oneshot::Receiver<()>,
    status_ports: oneshot::Receiver<(u16, u16)>,
    civ_ready: oneshot::Receiver<()>,
    audio_ready: oneshot::Receiver<()>,
}

fn attempt_signals(session_id: u64) -> (AttemptSignals, AttemptReceivers) {
    let (control_here, control_here_rx) = SignalSlot::pair();
    let (control_ready, control_ready_rx) = SignalSlot::pair();
    let (login, login_rx) = SignalSlot::pair();
    let (conn_info, conn_info_rx) = SignalSlot::pair();
    let (status_ports, status_ports_rx) = SignalSlot::pair();
    let (civ_ready, civ_ready_rx) = SignalSlot::pair();
    let (audio_ready, audio_ready_rx) = SignalSlot::pair();
    (
        AttemptSignals {
            session_id,
            control_here,
            control_ready,
            login,
            conn_info,
            status_ports,
            civ_ready,
            audio_ready,
        },
        AttemptReceivers {
            control_here: control_here_rx,
            control_ready: control_ready_rx,
            login: login_rx,
            conn_info: conn_info_rx,
            status_ports: status_ports_rx,
            civ_ready: civ_ready_rx,
            audio_ready: audio_ready_rx,
        },
    )
}

/// Fields of the radio's connection-info packet echoed back in ours.
#[derive(Debug, Clone, Copy, Default)]
struct ConnContext {
    mac: [u8; 6],
    rig_name: [u8; 32],
}

// ---------------------------------------------------------------------------
// Inner shared state
// ---------------------------------------------------------------------------

struct Inner {
    config: ClientConfig,
    control: Arc<Session>,
    civ: Arc<CivSubsession>,
    audio: Arc<AudioSubsession>,
    demux_tx: mpsc::Sender<Datagram>,
    phase_tx: watch::Sender<ConnectionPhase>,
    /// Monotonically incremented per connect attempt; a late completion
    /// from an aborted attempt cannot affect the current one.
    session_counter: AtomicU64,
    abort_handlers: StdMutex<HashMap<u64, oneshot::Sender<String>>>,
    attempt: StdMutex<Option<Arc<AttemptSignals>>>,
    event_tx: broadcast::Sender<ClientEvent>,
    capabilities: Mutex<Option<RadioCapabilities>>,
    reassembler: Mutex<CivReassembler>,
    monitor: Mutex<MonitorConfig>,
    conn_context: Mutex<Option<ConnContext>>,
    connected_at: Mutex<Option<Instant>>,
    last_disconnect_at: Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,
    demux_task: StdMutex<Option<JoinHandle<()>>>,
    monitor_task: StdMutex<Option<JoinHandle<()>>>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
    renewal_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn phase(&self) -> ConnectionPhase {
        *self.phase_tx.borrow()
    }

    /// Apply a validated phase transition.
    fn set_phase(&self, to: ConnectionPhase) -> Result<()> {
        let mut outcome = Ok(());
        self.phase_tx.send_if_modified(|phase| {
            match phase.validate_transition(to) {
                Ok(()) => {
                    tracing::debug!(from = %*phase, to = %to, "phase transition");
                    *phase = to;
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Apply `from -> to` only if the phase is currently `from`. Returns
    /// whether the transition happened.
    fn transition_if(&self, from: ConnectionPhase, to: ConnectionPhase) -> bool {
        let mut moved = false;
        self.phase_tx.send_if_modified(|phase| {
            if *phase == from && phase.can_transition_to(to) {
                tracing::debug!(from = %*phase, to = %to, "phase transition");
                *phase = to;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn session_for(&self, kind: SessionKind) -> Arc<Session> {
        match kind {
            SessionKind::Control => Arc::clone(&self.control),
            SessionKind::Civ => Arc::clone(self.civ.session()),
            SessionKind::Audio => Arc::clone(self.audio.session()),
        }
    }

    fn current_attempt(&self) -> Option<Arc<AttemptSignals>> {
        self.attempt.lock().expect("attempt lock").clone()
    }
}

fn store_task(slot: &StdMutex<Option<JoinHandle<()>>>, handle: JoinHandle<()>) {
    if let Some(old) = slot.lock().expect("task lock").replace(handle) {
        old.abort();
    }
}

fn stop_task(slot: &StdMutex<Option<JoinHandle<()>>>) {
    if let Some(handle) = slot.lock().expect("task lock").take() {
        handle.abort();
    }
}

// ---------------------------------------------------------------------------
// WlanClient
// ---------------------------------------------------------------------------

/// Client for the Icom WLAN (UDP) protocol.
///
/// Construction binds the CI-V and audio sockets (their OS-assigned ports
/// are advertised to the radio during connect) and starts the demux and
/// health-monitor tasks. [`connect`](Self::connect) then brings the three
/// sessions up in lockstep.
pub struct WlanClient {
    inner: Arc<Inner>,
}

impl WlanClient {
    /// Create a client for the given radio. No traffic is sent until
    /// [`connect`](Self::connect).
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let (demux_tx, demux_rx) = mpsc::channel(DEMUX_CHANNEL_CAPACITY);
        let control = Arc::new(Session::new(SessionKind::Control));
        let civ = Arc::new(CivSubsession::new(Arc::new(Session::new(SessionKind::Civ))));
        let audio = Arc::new(AudioSubsession::new(Arc::new(Session::new(
            SessionKind::Audio,
        ))));

        // The sub-session sockets are bound up front so their local ports
        // are available for the connection-info reply.
        civ.session().endpoint().open(demux_tx.clone()).await?;
        audio.session().endpoint().open(demux_tx.clone()).await?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (phase_tx, _) = watch::channel(ConnectionPhase::Idle);

        let inner = Arc::new(Inner {
            config,
            control,
            civ,
            audio,
            demux_tx,
            phase_tx,
            session_counter: AtomicU64::new(0),
            abort_handlers: StdMutex::new(HashMap::new()),
            attempt: StdMutex::new(None),
            event_tx,
            capabilities: Mutex::new(None),
            reassembler: Mutex::new(CivReassembler::new()),
            monitor: Mutex::new(MonitorConfig::default()),
            conn_context: Mutex::new(None),
            connected_at: Mutex::new(None),
            last_disconnect_at: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            demux_task: StdMutex::new(None),
            monitor_task: StdMutex::new(None),
            reconnect_task: StdMutex::new(None),
            renewal_task: StdMutex::new(None),
        });

        let demux_inner = Arc::clone(&inner);
        store_task(
            &inner.demux_task,
            tokio::spawn(async move { demux_loop(demux_inner, demux_rx).await }),
        );
        start_monitor(&inner);

        Ok(WlanClient { inner })
    }

    /// Subscribe to client events. Each subscriber gets an independent copy
    /// of every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.event_tx.subscribe()
    }

    /// The current connection phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.inner.phase()
    }

    /// Capabilities learned from the radio, if the capability packet has
    /// arrived on this connection.
    pub async fn capabilities(&self) -> Option<RadioCapabilities> {
        self.inner.capabilities.lock().await.clone()
    }

    /// Establish the connection. Idempotent: while already connected this
    /// returns immediately; while an attempt is in flight it waits for that
    /// attempt to settle; during disconnect it fails.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        loop {
            match inner.phase() {
                ConnectionPhase::Connected => return Ok(()),
                ConnectionPhase::Connecting | ConnectionPhase::Reconnecting => {
                    return wait_for_settle(inner).await;
                }
                ConnectionPhase::Disconnecting => {
                    return Err(Error::InvalidTransition {
                        from: ConnectionPhase::Disconnecting,
                        to: ConnectionPhase::Connecting,
                    });
                }
                ConnectionPhase::Idle => {
                    if inner.transition_if(ConnectionPhase::Idle, ConnectionPhase::Connecting) {
                        break;
                    }
                    // Lost the race to another caller; re-evaluate.
                }
            }
        }

        match run_attempt(inner).await {
            Ok(()) => finish_connect(inner).await,
            Err(e) => {
                inner.transition_if(ConnectionPhase::Connecting, ConnectionPhase::Idle);
                Err(e)
            }
        }
    }

    /// Tear the connection down. Idempotent: repeated calls during an
    /// in-flight disconnect wait for IDLE and never send duplicate
    /// disconnect packets. When invoked during an in-flight connect or
    /// reconnect, the attempt is aborted via its abort handler so its
    /// readiness waits settle with a single [`Error::Aborted`].
    ///
    /// `silent` suppresses the `Disconnected` event; internal waits still
    /// settle.
    pub async fn disconnect(&self, reason: Option<&str>, silent: bool) -> Result<()> {
        let inner = &self.inner;
        let reason = reason.unwrap_or("user disconnect");
        loop {
            match inner.phase() {
                ConnectionPhase::Idle => return Ok(()),
                ConnectionPhase::Disconnecting => {
                    let mut rx = inner.phase_tx.subscribe();
                    loop {
                        if *rx.borrow_and_update() == ConnectionPhase::Idle {
                            return Ok(());
                        }
                        if rx.changed().await.is_err() {
                            return Ok(());
                        }
                    }
                }
                ConnectionPhase::Connecting | ConnectionPhase::Reconnecting => {
                    abort_in_flight(inner, reason);
                    stop_task(&inner.reconnect_task);
                    quiet_teardown(inner).await;
                    inner.transition_if(ConnectionPhase::Connecting, ConnectionPhase::Idle);
                    inner.transition_if(ConnectionPhase::Reconnecting, ConnectionPhase::Idle);
                    if !silent {
                        inner.emit(ClientEvent::Disconnected);
                    }
                    return Ok(());
                }
                ConnectionPhase::Connected => {
                    if !inner.transition_if(
                        ConnectionPhase::Connected,
                        ConnectionPhase::Disconnecting,
                    ) {
                        continue; // raced with the monitor; re-evaluate
                    }
                    tracing::debug!(reason, "disconnecting");
                    *inner.last_disconnect_at.lock().await = Some(Instant::now());
                    graceful_teardown(inner).await;
                    inner.set_phase(ConnectionPhase::Idle)?;
                    if !silent {
                        inner.emit(ClientEvent::Disconnected);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Transport a raw CI-V frame over the CI-V sub-session.
    pub async fn send_civ(&self, frame: &[u8]) -> Result<()> {
        if self.inner.phase() != ConnectionPhase::Connected {
            return Err(Error::NotConnected);
        }
        self.inner.civ.send_frame(frame).await
    }

    /// Queue 16-bit PCM for transmission (used as-is, no scaling).
    pub async fn enqueue_audio_pcm16(&self, samples: &[i16]) {
        self.inner.audio.enqueue_pcm16(samples).await;
    }

    /// Queue float samples for transmission, clipped and scaled by the TX
    /// volume. `leading_silence` prepends the PTT-on silence frames.
    pub async fn enqueue_audio_float32(&self, samples: &[f32], leading_silence: bool) {
        self.inner.audio.enqueue_float32(samples, leading_silence).await;
    }

    /// Push the trailing silence that flushes transmit audio out of the
    /// radio before it unkeys; call on PTT-off.
    pub async fn end_audio_transmission(&self) {
        self.inner.audio.end_transmission().await;
    }

    /// Set the transmit volume applied to float audio input.
    pub async fn set_tx_volume(&self, volume: f32) {
        self.inner.audio.set_volume(volume).await;
    }

    /// Replace the health-monitor and reconnect tuning.
    pub async fn configure_monitor(&self, config: MonitorConfig) {
        *self.inner.monitor.lock().await = config;
    }

    /// A snapshot of connection health.
    pub async fn metrics(&self) -> ConnectionMetrics {
        let inner = &self.inner;
        ConnectionMetrics {
            phase: Some(inner.phase()),
            session_id: inner.session_counter.load(Ordering::SeqCst),
            connected_for: inner.connected_at.lock().await.map(|t| t.elapsed()),
            since_last_disconnect: inner.last_disconnect_at.lock().await.map(|t| t.elapsed()),
            control_receive_age: Some(inner.control.receive_age().await),
            civ_receive_age: Some(inner.civ.session().receive_age().await),
            audio_receive_age: Some(inner.audio.session().receive_age().await),
            reconnect_attempts: inner.reconnect_attempts.load(Ordering::SeqCst),
        }
    }
}

impl Drop for WlanClient {
    fn drop(&mut self) {
        // Break the Arc cycle held by the long-lived tasks.
        for slot in [
            &self.inner.demux_task,
            &self.inner.monitor_task,
            &self.inner.reconnect_task,
            &self.inner.renewal_task,
        ] {
            stop_task(slot);
        }
    }
}

// ---------------------------------------------------------------------------
// Connect driver
// ---------------------------------------------------------------------------

async fn finish_connect(inner: &Arc<Inner>) -> Result<()> {
    inner.set_phase(ConnectionPhase::Connected)?;
    *inner.connected_at.lock().await = Some(Instant::now());
    inner.reconnect_attempts.store(0, Ordering::SeqCst);
    inner.emit(ClientEvent::Connected);
    Ok(())
}

/// Wait for an in-flight attempt (ours or another caller's) to settle.
async fn wait_for_settle(inner: &Arc<Inner>) -> Result<()> {
    let mut rx = inner.phase_tx.subscribe();
    loop {
        match *rx.borrow_and_update() {
            ConnectionPhase::Connected => return Ok(()),
            ConnectionPhase::Idle => return Err(Error::ConnectionLost),
            _ => {}
        }
        if rx.changed().await.is_err() {
            return Err(Error::ConnectionLost);
        }
    }
}

/// Run one connect attempt under the overall timeout and the attempt's
/// abort handler. The abort settles the whole attempt with a single
/// [`Error::Aborted`] instead of failing login, CI-V, and audio separately.
async fn run_attempt(inner: &Arc<Inner>) -> Result<()> {
    let session_id = inner.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::debug!(session_id, "connect attempt starting");

    let (signals, receivers) = attempt_signals(session_id);
    *inner.attempt.lock().expect("attempt lock") = Some(Arc::new(signals));
    let (abort_tx, abort_rx) = oneshot::channel::<String>();
    inner
        .abort_handlers
        .lock()
        .expect("abort lock")
        .insert(session_id, abort_tx);

    let timeout = inner.config.connect_timeout;
    let result = tokio::select! {
        res = drive_attempt(inner, receivers) => res,
        reason = abort_rx => Err(Error::Aborted {
            reason: reason.unwrap_or_else(|_| "attempt superseded".to_string()),
            session_id,
            phase: inner.phase(),
        }),
        _ = tokio::time::sleep(timeout) => Err(Error::Timeout),
    };

    inner
        .abort_handlers
        .lock()
        .expect("abort lock")
        .remove(&session_id);
    *inner.attempt.lock().expect("attempt lock") = None;

    match &result {
        Ok(()) => tracing::debug!(session_id, "connect attempt succeeded"),
        Err(e) => {
            tracing::debug!(session_id, error = %e, "connect attempt failed");
            quiet_teardown(inner).await;
        }
    }
    result
}

/// The connect sequence proper: handshake, login, connection info, status,
/// sub-session bring-up.
async fn drive_attempt(inner: &Arc<Inner>, rx: AttemptReceivers) -> Result<()> {
    let AttemptReceivers {
        control_here,
        control_ready,
        login,
        conn_info,
        status_ports,
        civ_ready,
        audio_ready,
    } = rx;

    // Reset every per-session field; the radio rejects stale ids/tokens.
    inner.control.reset().await;
    inner.civ.session().reset().await;
    inner.civ.reset().await;
    inner.audio.session().reset().await;
    inner.audio.reset().await;
    inner.reassembler.lock().await.clear();
    *inner.capabilities.lock().await = None;
    *inner.conn_context.lock().await = None;

    let radio = resolve_radio(&inner.config).await?;
    inner.control.endpoint().open(inner.demux_tx.clone()).await?;
    inner.control.endpoint().set_remote(radio).await;
    inner.civ.session().endpoint().open(inner.demux_tx.clone()).await?;
    inner.audio.session().endpoint().open(inner.demux_tx.clone()).await?;

    inner.control.start_are_you_there();

    // Control handshake: I_AM_HERE stops the probe and triggers
    // ARE_YOU_READY in the demux; I_AM_READY lets login proceed.
    control_here.await.map_err(|_| Error::ConnectionLost)?;
    control_ready.await.map_err(|_| Error::ConnectionLost)?;

    // Login with obfuscated credentials.
    let token_request = rand::random::<u16>();
    inner.control.set_tokens(token_request, 0).await;
    let (local, remote) = inner.control.ids().await;
    let inner_seq = inner.control.next_inner_seq().await;
    let username = auth::obfuscate(&inner.config.username);
    let password = auth::obfuscate(&inner.config.password);
    let packet = packets::login_packet(
        local,
        remote,
        inner_seq,
        token_request,
        &username,
        &password,
        &inner.config.client_name,
    );
    inner.control.send_tracked(packet).await?;
    inner.control.start_idle();

    let outcome = login.await.map_err(|_| Error::ConnectionLost)?;
    if outcome.error != 0 {
        return Err(Error::Auth {
            code: outcome.error,
        });
    }
    inner.control.set_tokens(token_request, outcome.token).await;
    let inner_seq = inner.control.next_inner_seq().await;
    let confirm = packets::token_packet(
        TokenRequestKind::Confirm,
        local,
        remote,
        inner_seq,
        token_request,
        outcome.token,
    );
    inner.control.send_tracked(confirm).await?;
    start_token_renewal(inner);

    // Sub-session bring-up on its own clock.
    tokio::time::timeout(SUBSESSION_TIMEOUT, async {
        conn_info.await.map_err(|_| Error::ConnectionLost)?;
        let (civ_port, audio_port) = status_ports.await.map_err(|_| Error::ConnectionLost)?;
        tracing::debug!(civ_port, audio_port, "sub-session ports assigned");
        civ_ready.await.map_err(|_| Error::ConnectionLost)?;
        audio_ready.await.map_err(|_| Error::ConnectionLost)?;
        Ok(())
    })
    .await
    .map_err(|_| Error::Timeout)?
}

async fn resolve_radio(config: &ClientConfig) -> Result<SocketAddr> {
    let target = format!("{}:{}", config.host, config.control_port);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| Error::Transport(format!("cannot resolve {target}: {e}")))?
        .collect();
    // The protocol is IPv4; prefer an A record when both families resolve.
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Transport(format!("no addresses for {target}")))
}

/// Fire the abort handler of the in-flight attempt, if any.
fn abort_in_flight(inner: &Arc<Inner>, reason: &str) {
    let session_id = inner.session_counter.load(Ordering::SeqCst);
    let handler = inner
        .abort_handlers
        .lock()
        .expect("abort lock")
        .remove(&session_id);
    if let Some(tx) = handler {
        tracing::debug!(session_id, reason, "aborting in-flight connect attempt");
        let _ = tx.send(reason.to_string());
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Stop timers, schedulers, and the control socket without sending
/// anything. Used after failed attempts and inside the reconnect loop.
async fn quiet_teardown(inner: &Arc<Inner>) {
    stop_task(&inner.renewal_task);
    inner.audio.stop().await;
    inner.civ.stop_watchdog();
    for session in [&inner.control, inner.civ.session(), inner.audio.session()] {
        session.stop_timers();
        session.disable_send();
    }
    inner.control.endpoint().close().await;
    *inner.connected_at.lock().await = None;
}

/// Announce the disconnect to the radio, drain briefly, then tear down.
/// Timers stop before sockets close. Individual send failures are logged
/// and do not interrupt the teardown.
async fn graceful_teardown(inner: &Arc<Inner>) {
    stop_task(&inner.renewal_task);
    inner.audio.stop().await;

    if inner.civ.session().remote_id().await != 0 {
        if let Err(e) = inner.civ.send_close().await {
            tracing::debug!(error = %e, "CI-V close failed");
        }
    }
    inner.civ.stop_watchdog();

    let (token_request, token) = inner.control.tokens().await;
    if token != 0 {
        let (local, remote) = inner.control.ids().await;
        let inner_seq = inner.control.next_inner_seq().await;
        let packet = packets::token_packet(
            TokenRequestKind::Disconnect,
            local,
            remote,
            inner_seq,
            token_request,
            token,
        );
        if let Err(e) = inner.control.send_tracked(packet).await {
            tracing::debug!(error = %e, "token disconnect failed");
        }
    }
    for session in [inner.civ.session(), inner.audio.session(), &inner.control] {
        if session.remote_id().await == 0 {
            continue;
        }
        let (local, remote) = session.ids().await;
        let packet = packets::control_packet(ControlType::Disconnect, 0, local, remote);
        if let Err(e) = session.send_untracked(&packet).await {
            tracing::debug!(session = %session.kind(), error = %e, "disconnect packet failed");
        }
    }

    tokio::time::sleep(DISCONNECT_DRAIN).await;

    for session in [&inner.control, inner.civ.session(), inner.audio.session()] {
        session.stop_timers();
        session.disable_send();
    }
    inner.control.endpoint().close().await;
    *inner.connected_at.lock().await = None;
}

// ---------------------------------------------------------------------------
// Token renewal
// ---------------------------------------------------------------------------

fn start_token_renewal(inner: &Arc<Inner>) {
    let inner_clone = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOKEN_RENEWAL_INTERVAL);
        interval.tick().await; // the confirm just went out
        loop {
            interval.tick().await;
            let (token_request, token) = inner_clone.control.tokens().await;
            let (local, remote) = inner_clone.control.ids().await;
            let inner_seq = inner_clone.control.next_inner_seq().await;
            let packet = packets::token_packet(
                TokenRequestKind::Renewal,
                local,
                remote,
                inner_seq,
                token_request,
                token,
            );
            match inner_clone.control.send_tracked(packet).await {
                Ok(_) => tracing::debug!("token renewal sent"),
                Err(e) => {
                    tracing::debug!(error = %e, "token renewal stopped");
                    break;
                }
            }
        }
    });
    store_task(&inner.renewal_task, handle);
}

// ---------------------------------------------------------------------------
// Health monitor and reconnect
// ---------------------------------------------------------------------------

fn start_monitor(inner: &Arc<Inner>) {
    let inner_clone = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        loop {
            let interval = inner_clone.monitor.lock().await.check_interval;
            tokio::time::sleep(interval).await;
            // The monitor acts only on an established connection; attempts
            // in flight have their own timeouts.
            if inner_clone.phase() != ConnectionPhase::Connected {
                continue;
            }
            let timeout = inner_clone.monitor.lock().await.timeout;
            let sessions = [
                (SessionKind::Control, Arc::clone(&inner_clone.control)),
                (SessionKind::Civ, Arc::clone(inner_clone.civ.session())),
                (SessionKind::Audio, Arc::clone(inner_clone.audio.session())),
            ];
            for (kind, session) in sessions {
                let age = session.receive_age().await;
                if age > timeout {
                    tracing::warn!(
                        session = %kind,
                        silent_ms = age.as_millis() as u64,
                        "connection lost"
                    );
                    inner_clone.emit(ClientEvent::ConnectionLost {
                        session: kind,
                        elapsed: age,
                    });
                    begin_reconnect(&inner_clone).await;
                    break;
                }
            }
        }
    });
    store_task(&inner.monitor_task, handle);
}

/// Leave CONNECTED after a loss: into the reconnect loop, or straight to
/// IDLE when auto-reconnect is off.
async fn begin_reconnect(inner: &Arc<Inner>) {
    *inner.last_disconnect_at.lock().await = Some(Instant::now());
    let auto_reconnect = inner.monitor.lock().await.auto_reconnect;
    if !auto_reconnect {
        if inner.transition_if(ConnectionPhase::Connected, ConnectionPhase::Disconnecting) {
            quiet_teardown(inner).await;
            let _ = inner.set_phase(ConnectionPhase::Idle);
            inner.emit(ClientEvent::Disconnected);
        }
        return;
    }
    if !inner.transition_if(ConnectionPhase::Connected, ConnectionPhase::Reconnecting) {
        return; // another path is already handling the loss
    }
    let loop_inner = Arc::clone(inner);
    store_task(
        &inner.reconnect_task,
        tokio::spawn(async move { reconnect_loop(loop_inner).await }),
    );
}

/// The single reconnect loop: exponential backoff, full teardown, release
/// pause, fresh attempt. Teardown errors are logged, never fatal.
async fn reconnect_loop(inner: Arc<Inner>) {
    let lost_at = inner
        .last_disconnect_at
        .lock()
        .await
        .unwrap_or_else(Instant::now);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
        let config = inner.monitor.lock().await.clone();
        let delay = config.delay_for_attempt(attempt);
        inner.emit(ClientEvent::ReconnectAttempting { attempt, delay });
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::time::sleep(delay).await;
        if inner.phase() != ConnectionPhase::Reconnecting {
            return; // disconnected while backing off
        }

        quiet_teardown(&inner).await;
        // Give the radio time to release the prior session before dialing.
        tokio::time::sleep(config.release_delay).await;

        match run_attempt(&inner).await {
            Ok(()) => {
                if finish_connect(&inner).await.is_ok() {
                    let downtime = lost_at.elapsed();
                    tracing::debug!(downtime_ms = downtime.as_millis() as u64, "reconnected");
                    inner.emit(ClientEvent::ConnectionRestored { downtime });
                }
                return;
            }
            Err(e) => {
                let will_retry = config.max_attempts.map_or(true, |max| attempt < max)
                    && inner.phase() == ConnectionPhase::Reconnecting;
                let next_delay = will_retry.then(|| config.delay_for_attempt(attempt + 1));
                tracing::warn!(attempt, error = %e, will_retry, "reconnect attempt failed");
                inner.emit(ClientEvent::ReconnectFailed {
                    attempt,
                    error: e.to_string(),
                    will_retry,
                    next_delay,
                });
                if !will_retry {
                    if inner.transition_if(ConnectionPhase::Reconnecting, ConnectionPhase::Idle) {
                        inner.emit(ClientEvent::Disconnected);
                    }
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Demux
// ---------------------------------------------------------------------------

/// Serialize every inbound datagram through one task. Handlers run to
/// completion; there is no concurrent state mutation.
async fn demux_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Datagram>) {
    while let Some(datagram) = rx.recv().await {
        inner
            .session_for(datagram.kind)
            .note_received(datagram.received_at)
            .await;
        if let Err(e) = handle_datagram(&inner, &datagram).await {
            match &e {
                // Socket failures are surfaced to subscribers; they do not
                // change the connection phase by themselves.
                Error::Transport(_) | Error::Io(_) => {
                    tracing::debug!(session = %datagram.kind, error = %e, "transport error");
                    inner.emit(ClientEvent::Error(e.to_string()));
                }
                // Malformed packets never reach the state machine.
                _ => tracing::trace!(
                    session = %datagram.kind,
                    bytes = datagram.data.len(),
                    error = %e,
                    "packet dropped"
                ),
            }
        }
    }
    tracing::debug!("demux loop ended");
}

/// Route one datagram by length and header byte.
async fn handle_datagram(inner: &Arc<Inner>, datagram: &Datagram) -> Result<()> {
    let data = &datagram.data[..];
    let kind = datagram.kind;
    if data.len() < packets::CONTROL_SIZE {
        return Err(Error::Protocol(format!("runt datagram: {} bytes", data.len())));
    }
    match data.len() {
        packets::CONTROL_SIZE => handle_control(inner, kind, data).await,
        packets::PING_SIZE => handle_ping(inner, kind, data).await,
        packets::TOKEN_SIZE if kind == SessionKind::Control => handle_token(inner, data).await,
        packets::STATUS_SIZE if kind == SessionKind::Control => handle_status(inner, data).await,
        packets::LOGIN_RESPONSE_SIZE if kind == SessionKind::Control => {
            handle_login_response(inner, data).await
        }
        packets::LOGIN_SIZE if kind == SessionKind::Control => {
            // Login packets flow client -> radio only.
            tracing::trace!("ignoring inbound login packet");
            Ok(())
        }
        packets::CONN_INFO_SIZE if kind == SessionKind::Control => {
            handle_conn_info(inner, data).await
        }
        packets::CAPABILITIES_SIZE if kind == SessionKind::Control => {
            handle_capabilities(inner, data).await
        }
        _ => handle_stream_packet(inner, kind, data).await,
    }
}

async fn handle_control(inner: &Arc<Inner>, kind: SessionKind, data: &[u8]) -> Result<()> {
    let header = Header::parse(data)?;
    match header.control_type() {
        Some(ControlType::IAmHere) => handle_i_am_here(inner, kind, header.sent_id).await,
        Some(ControlType::Ready) => handle_i_am_ready(inner, kind).await,
        Some(ControlType::Retransmit) => inner.session_for(kind).retransmit(header.seq).await,
        Some(ControlType::Disconnect) => {
            handle_remote_disconnect(inner).await;
            Ok(())
        }
        Some(ControlType::Null) | Some(ControlType::AreYouThere) => Ok(()),
        Some(ControlType::Ping) => Err(Error::Protocol("ping with control length".to_string())),
        None => Err(Error::Protocol(format!(
            "unknown control type {:#06x}",
            header.packet_type
        ))),
    }
}

/// The peer answered ARE_YOU_THERE: record its id, stop the probe, start
/// pinging, and ask whether it is ready.
async fn handle_i_am_here(inner: &Arc<Inner>, kind: SessionKind, sent_id: u32) -> Result<()> {
    let session = inner.session_for(kind);
    if session.remote_id().await != 0 {
        return Ok(()); // duplicate announcement
    }
    session.set_remote_id(sent_id).await;
    session.stop_are_you_there();
    session.start_ping();
    tracing::debug!(
        session = %kind,
        remote_id = format!("{sent_id:#010x}"),
        "peer discovered"
    );
    let (local, remote) = session.ids().await;
    let ready = packets::control_packet(ControlType::Ready, 0, local, remote);
    session.send_tracked(ready).await?;
    if kind == SessionKind::Control {
        if let Some(attempt) = inner.current_attempt() {
            attempt.control_here.fire(());
        }
    }
    Ok(())
}

/// The peer answered ARE_YOU_READY. Control proceeds to login; CI-V opens
/// its stream and starts its keep-alives; audio starts the 50 Hz scheduler.
async fn handle_i_am_ready(inner: &Arc<Inner>, kind: SessionKind) -> Result<()> {
    match kind {
        SessionKind::Control => {
            if let Some(attempt) = inner.current_attempt() {
                attempt.control_ready.fire(());
            }
        }
        SessionKind::Civ => {
            if !inner.civ.watchdog_running() {
                inner.civ.send_open().await?;
                inner.civ.session().start_idle();
                inner.civ.start_watchdog();
            }
            if let Some(attempt) = inner.current_attempt() {
                attempt.civ_ready.fire(());
            }
        }
        SessionKind::Audio => {
            if !inner.audio.is_running() {
                inner.audio.start();
                inner.audio.session().start_idle();
            }
            if let Some(attempt) = inner.current_attempt() {
                attempt.audio_ready.fire(());
            }
        }
    }
    Ok(())
}

async fn handle_ping(inner: &Arc<Inner>, kind: SessionKind, data: &[u8]) -> Result<()> {
    let view = PingView::parse(data)?;
    let session = inner.session_for(kind);
    if view.is_reply {
        session.ping_reply_received().await;
        Ok(())
    } else {
        let (local, remote) = session.ids().await;
        let reply = packets::ping_reply(&view, local, remote);
        session.send_untracked(&reply).await
    }
}

/// Token responses. A rejected renewal means the radio wants a fresh
/// connection-info exchange: capture its new id and tokens and re-send.
async fn handle_token(inner: &Arc<Inner>, data: &[u8]) -> Result<()> {
    let view = TokenView::parse(data)?;
    if view.is_renewal_rejected() {
        tracing::debug!("token renewal rejected, re-establishing connection info");
        inner.control.set_remote_id(view.sent_id).await;
        inner.control.set_tokens(view.token_request, view.token).await;
        send_conn_info_reply(inner).await?;
    } else {
        tracing::trace!(
            request_type = view.request_type,
            response = view.response,
            "token response"
        );
    }
    Ok(())
}

async fn handle_status(inner: &Arc<Inner>, data: &[u8]) -> Result<()> {
    let view = StatusView::parse(data)?;
    inner.emit(ClientEvent::Status {
        civ_port: view.civ_port,
        audio_port: view.audio_port,
        auth_ok: view.error == 0,
        connected: view.connected,
    });

    if !view.has_ports() {
        // Placeholder status during the radio's busy/retry phase; carries
        // no port information and expects nothing from us.
        tracing::debug!("status without port assignments ignored");
        return Ok(());
    }
    if !view.connected {
        match inner.phase() {
            ConnectionPhase::Connecting | ConnectionPhase::Reconnecting => {
                abort_in_flight(inner, "radio refused the connection");
            }
            ConnectionPhase::Connected => {
                inner.emit(ClientEvent::ConnectionLost {
                    session: SessionKind::Control,
                    elapsed: inner.control.receive_age().await,
                });
                begin_reconnect(inner).await;
            }
            _ => {}
        }
        return Ok(());
    }

    // Program the sub-session remotes from the advertised dynamic ports.
    let radio_ip = inner
        .control
        .endpoint()
        .remote()
        .await
        .map(|addr| addr.ip())
        .ok_or(Error::NotConnected)?;
    inner
        .civ
        .session()
        .endpoint()
        .set_remote(SocketAddr::new(radio_ip, view.civ_port))
        .await;
    inner
        .audio
        .session()
        .endpoint()
        .set_remote(SocketAddr::new(radio_ip, view.audio_port))
        .await;
    if inner.civ.session().remote_id().await == 0 {
        inner.civ.session().start_are_you_there();
    }
    if inner.audio.session().remote_id().await == 0 {
        inner.audio.session().start_are_you_there();
    }
    if let Some(attempt) = inner.current_attempt() {
        attempt.status_ports.fire((view.civ_port, view.audio_port));
    }
    Ok(())
}

async fn handle_login_response(inner: &Arc<Inner>, data: &[u8]) -> Result<()> {
    let view = LoginResponseView::parse(data)?;
    if view.ok() {
        tracing::debug!(connection = %view.connection, "login accepted");
    } else {
        tracing::warn!(error_code = view.error, "login rejected");
    }
    inner.emit(ClientEvent::Login {
        ok: view.ok(),
        error_code: view.error,
        connection: view.connection.clone(),
    });
    if let Some(attempt) = inner.current_attempt() {
        attempt.login.fire(LoginOutcome {
            error: view.error,
            token: view.token,
        });
    }
    Ok(())
}

async fn handle_conn_info(inner: &Arc<Inner>, data: &[u8]) -> Result<()> {
    let view = ConnInfoView::parse(data)?;
    tracing::debug!(busy = view.busy, rig = %view.rig_name(), "connection info from radio");
    *inner.conn_context.lock().await = Some(ConnContext {
        mac: view.mac,
        rig_name: view.rig_name_raw,
    });
    // Answer every inbound packet, busy or not: an unanswered busy packet
    // stalls the flow on a fast reconnect.
    send_conn_info_reply(inner).await?;
    if let Some(attempt) = inner.current_attempt() {
        attempt.conn_info.fire(());
    }
    Ok(())
}

/// Build and send our connection-info reply: stream configuration plus the
/// local ports of the already-bound CI-V and audio sockets.
async fn send_conn_info_reply(inner: &Arc<Inner>) -> Result<()> {
    let context = inner.conn_context.lock().await.unwrap_or_default();
    let (local, remote) = inner.control.ids().await;
    let (token_request, token) = inner.control.tokens().await;
    let inner_seq = inner.control.next_inner_seq().await;
    let params = ConnInfoParams {
        sent_id: local,
        rcvd_id: remote,
        inner_seq,
        token_request,
        token,
        mac: context.mac,
        rig_name: context.rig_name,
        username_obfuscated: auth::obfuscate(&inner.config.username),
        rx_sample_rate: STREAM_SAMPLE_RATE,
        tx_sample_rate: STREAM_SAMPLE_RATE,
        civ_port: inner.civ.session().endpoint().local_port(),
        audio_port: inner.audio.session().endpoint().local_port(),
        tx_buffer_size: TX_BUFFER_SIZE,
    };
    inner
        .control
        .send_tracked(packets::conn_info_packet(&params))
        .await?;
    Ok(())
}

async fn handle_capabilities(inner: &Arc<Inner>, data: &[u8]) -> Result<()> {
    let view = CapabilitiesView::parse(data)?;
    if let Some(radio) = view.radios.into_iter().next() {
        tracing::debug!(
            rig = %radio.rig_name,
            civ_address = format!("{:#04x}", radio.civ_address),
            supports_tx = radio.supports_tx,
            "capabilities received"
        );
        *inner.capabilities.lock().await = Some(radio.clone());
        inner.emit(ClientEvent::Capabilities(radio));
    }
    Ok(())
}

/// Variable-length traffic: multi-sequence retransmit requests, CI-V, and
/// audio, distinguished by type and header byte.
async fn handle_stream_packet(inner: &Arc<Inner>, kind: SessionKind, data: &[u8]) -> Result<()> {
    let header = Header::parse(data)?;
    if header.control_type() == Some(ControlType::Retransmit) {
        let session = inner.session_for(kind);
        for seq in packets::retransmit_seqs(data)? {
            session.retransmit(seq).await?;
        }
        return Ok(());
    }
    if data.len() > packets::CIV_HEADER_SIZE && data[0x10] == 0xC1 {
        return handle_civ_packet(inner, data).await;
    }
    if data.len() > packets::AUDIO_HEADER_SIZE
        && matches!(data[0x10], 0x97 | 0x00)
        && matches!(data[0x11], 0x80 | 0x81)
    {
        return handle_audio_packet(inner, data).await;
    }
    Err(Error::Protocol(format!(
        "unroutable {} byte packet on {} session",
        data.len(),
        kind
    )))
}

async fn handle_civ_packet(inner: &Arc<Inner>, data: &[u8]) -> Result<()> {
    let view = CivView::parse(data)?;
    inner.emit(ClientEvent::Civ(Bytes::copy_from_slice(view.payload)));
    let frames = inner.reassembler.lock().await.push(view.payload);
    for frame in frames {
        inner.emit(ClientEvent::CivFrame(frame));
    }
    Ok(())
}

async fn handle_audio_packet(inner: &Arc<Inner>, data: &[u8]) -> Result<()> {
    let view = AudioView::parse(data)?;
    inner.emit(ClientEvent::Audio(Bytes::copy_from_slice(view.payload)));
    Ok(())
}

/// The radio announced a disconnect on the control session.
async fn handle_remote_disconnect(inner: &Arc<Inner>) {
    match inner.phase() {
        ConnectionPhase::Connected => {
            tracing::warn!("radio sent disconnect");
            inner.emit(ClientEvent::ConnectionLost {
                session: SessionKind::Control,
                elapsed: Duration::ZERO,
            });
            begin_reconnect(inner).await;
        }
        ConnectionPhase::Connecting | ConnectionPhase::Reconnecting => {
            abort_in_flight(inner, "radio sent disconnect");
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
