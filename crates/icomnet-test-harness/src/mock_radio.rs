//! A mock radio for protocol-level testing.
//!
//! [`MockRadio`] binds three UDP sockets (control, CI-V, audio) and speaks
//! the radio side of the Icom WLAN protocol: it answers ARE_YOU_THERE and
//! ARE_YOU_READY, validates nothing about credentials but answers login
//! with a configurable error code, confirms tokens, sends connection info
//! and the port-announcing status, completes the sub-session handshakes,
//! and echoes pings. Test-side hooks inject CI-V and audio traffic and
//! inspect what the client sent.
//!
//! Stopping the mock silences all three sockets, which is how connection
//! loss and reconnect behavior are exercised.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use icomnet_core::{Error, Result};
use icomnet_proto::packets::{
    self, CivView, ControlType, Header, PingView, TokenRequestKind, TokenView,
};
use icomnet_proto::wire::{write_u16_be, write_u16_le, write_u32_be, write_u32_le};

/// The mock's session id on the control socket.
const RADIO_CONTROL_ID: u32 = 0x5249_4701;
/// The mock's session id on the CI-V socket.
const RADIO_CIV_ID: u32 = 0x5249_4702;
/// The mock's session id on the audio socket.
const RADIO_AUDIO_ID: u32 = 0x5249_4703;
/// The token the mock assigns at login.
const RADIO_TOKEN: u32 = 0x0102_0304;

/// Behavior switches for the mock radio.
#[derive(Debug, Clone)]
pub struct MockRadioOptions {
    /// Login response error code; 0 accepts the credentials.
    pub login_error: u32,
    /// Send a placeholder status with zero ports before the real one, as a
    /// radio does during a fast reconnect.
    pub zero_port_status_first: bool,
    /// Set the busy indicator in the connection-info packet.
    pub busy_conn_info: bool,
    /// Send a capabilities packet once the status has gone out.
    pub send_capabilities: bool,
    /// Rig name reported in connection info and capabilities.
    pub rig_name: String,
    /// CI-V address reported in capabilities.
    pub civ_address: u8,
}

impl Default for MockRadioOptions {
    fn default() -> Self {
        MockRadioOptions {
            login_error: 0,
            zero_port_status_first: false,
            busy_conn_info: false,
            send_capabilities: true,
            rig_name: "IC-705".to_string(),
            civ_address: 0xA4,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    client_control: Option<SocketAddr>,
    client_civ: Option<SocketAddr>,
    client_audio: Option<SocketAddr>,
    /// Header fields of the client's first ARE_YOU_READY: (seq, sent, rcvd).
    first_are_you_ready: Option<(u16, u32, u32)>,
    conn_info_count: usize,
    control_disconnects: usize,
    civ_payloads: Vec<Vec<u8>>,
    open_packets: usize,
    audio_packets: usize,
    zero_port_sent: bool,
    capabilities_sent: bool,
    inject_civ_seq: u16,
    inject_audio_seq: u16,
}

struct Shared {
    options: MockRadioOptions,
    state: Mutex<MockState>,
}

/// An in-process radio speaking the Icom WLAN protocol over loopback UDP.
pub struct MockRadio {
    shared: Arc<Shared>,
    control: Arc<UdpSocket>,
    civ: Arc<UdpSocket>,
    audio: Arc<UdpSocket>,
    control_port: u16,
    civ_port: u16,
    audio_port: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl MockRadio {
    /// Bind the three sockets and start answering.
    pub async fn start(options: MockRadioOptions) -> Result<Self> {
        let control = Arc::new(UdpSocket::bind("127.0.0.1:0").await.map_err(Error::Io)?);
        let civ = Arc::new(UdpSocket::bind("127.0.0.1:0").await.map_err(Error::Io)?);
        let audio = Arc::new(UdpSocket::bind("127.0.0.1:0").await.map_err(Error::Io)?);
        let control_port = control.local_addr().map_err(Error::Io)?.port();
        let civ_port = civ.local_addr().map_err(Error::Io)?.port();
        let audio_port = audio.local_addr().map_err(Error::Io)?.port();

        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(MockState::default()),
        });

        let tasks = vec![
            tokio::spawn(control_task(
                Arc::clone(&shared),
                Arc::clone(&control),
                civ_port,
                audio_port,
            )),
            tokio::spawn(sub_task(
                Arc::clone(&shared),
                Arc::clone(&civ),
                RADIO_CIV_ID,
                SubKind::Civ,
            )),
            tokio::spawn(sub_task(
                Arc::clone(&shared),
                Arc::clone(&audio),
                RADIO_AUDIO_ID,
                SubKind::Audio,
            )),
        ];

        Ok(MockRadio {
            shared,
            control,
            civ,
            audio,
            control_port,
            civ_port,
            audio_port,
            tasks,
        })
    }

    /// The control port to point the client at.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// The dynamic CI-V port the status packet advertises.
    pub fn civ_port(&self) -> u16 {
        self.civ_port
    }

    /// The dynamic audio port the status packet advertises.
    pub fn audio_port(&self) -> u16 {
        self.audio_port
    }

    /// Stop answering on all three sockets. The sockets stay bound so the
    /// client's traffic goes nowhere instead of producing ICMP errors.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Header fields of the client's first ARE_YOU_READY on the control
    /// session: `(seq, sent_id, rcvd_id)`.
    pub async fn first_are_you_ready(&self) -> Option<(u16, u32, u32)> {
        self.shared.state.lock().await.first_are_you_ready
    }

    /// How many connection-info replies the client has sent.
    pub async fn conn_info_count(&self) -> usize {
        self.shared.state.lock().await.conn_info_count
    }

    /// How many DISCONNECT controls arrived on the control socket.
    pub async fn control_disconnects(&self) -> usize {
        self.shared.state.lock().await.control_disconnects
    }

    /// CI-V payloads the client transported, in arrival order.
    pub async fn received_civ_payloads(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().await.civ_payloads.clone()
    }

    /// How many Open keep-alives arrived on the CI-V socket.
    pub async fn open_packets(&self) -> usize {
        self.shared.state.lock().await.open_packets
    }

    /// How many audio packets the client's scheduler has sent.
    pub async fn audio_packets(&self) -> usize {
        self.shared.state.lock().await.audio_packets
    }

    /// Inject a CI-V packet carrying `payload` toward the client.
    pub async fn send_civ_payload(&self, payload: &[u8]) -> Result<()> {
        let (dst, seq) = {
            let mut state = self.shared.state.lock().await;
            let dst = state.client_civ.ok_or(Error::NotConnected)?;
            let seq = state.inject_civ_seq;
            state.inject_civ_seq = state.inject_civ_seq.wrapping_add(1);
            (dst, seq)
        };
        let packet = packets::civ_packet(payload, seq, RADIO_CIV_ID, 0);
        self.civ.send_to(&packet, dst).await.map_err(Error::Io)?;
        Ok(())
    }

    /// Inject an audio packet carrying raw PCM toward the client.
    pub async fn send_audio_frame(&self, pcm: &[u8]) -> Result<()> {
        let (dst, seq) = {
            let mut state = self.shared.state.lock().await;
            let dst = state.client_audio.ok_or(Error::NotConnected)?;
            let seq = state.inject_audio_seq;
            state.inject_audio_seq = state.inject_audio_seq.wrapping_add(1);
            (dst, seq)
        };
        let packet = packets::audio_packet(pcm, seq, RADIO_AUDIO_ID, 0);
        self.audio.send_to(&packet, dst).await.map_err(Error::Io)?;
        Ok(())
    }

    /// Reject the client's token renewal, asking it to re-establish the
    /// connection-info exchange with a fresh radio id and token.
    pub async fn send_token_renewal_rejection(&self) -> Result<()> {
        let dst = self
            .shared
            .state
            .lock()
            .await
            .client_control
            .ok_or(Error::NotConnected)?;
        let mut packet = packets::token_packet(
            TokenRequestKind::Renewal,
            RADIO_CONTROL_ID.wrapping_add(0x100),
            0,
            0x31,
            0x4242,
            RADIO_TOKEN.wrapping_add(1),
        );
        packet[0x14] = 0x02; // reply
        write_u32_be(&mut packet, 0x30, packets::TOKEN_RESPONSE_REJECTED);
        self.control.send_to(&packet, dst).await.map_err(Error::Io)?;
        Ok(())
    }

    /// Keep injecting audio until the task is aborted; a convenience for
    /// tests that need a continuously healthy audio session.
    pub fn spawn_audio_feed(&self, interval: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let socket = Arc::clone(&self.audio);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (dst, seq) = {
                    let mut state = shared.state.lock().await;
                    let Some(dst) = state.client_audio else { continue };
                    let seq = state.inject_audio_seq;
                    state.inject_audio_seq = state.inject_audio_seq.wrapping_add(1);
                    (dst, seq)
                };
                let packet = packets::audio_packet(&[0u8; 160], seq, RADIO_AUDIO_ID, 0);
                let _ = socket.send_to(&packet, dst).await;
            }
        })
    }
}

impl Drop for MockRadio {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Radio-side packet builders
// ---------------------------------------------------------------------------

fn header_into(buf: &mut [u8], packet_type: u16, sent_id: u32, rcvd_id: u32) {
    let len = buf.len() as u32;
    write_u32_le(buf, 0x00, len);
    write_u16_le(buf, 0x04, packet_type);
    write_u32_le(buf, 0x08, sent_id);
    write_u32_le(buf, 0x0C, rcvd_id);
}

fn login_response_packet(rcvd_id: u32, error: u32, token: u32, connection: &str) -> Vec<u8> {
    let mut buf = vec![0u8; packets::LOGIN_RESPONSE_SIZE];
    header_into(&mut buf, 0x00, RADIO_CONTROL_ID, rcvd_id);
    write_u32_be(&mut buf, 0x1C, token);
    write_u32_be(&mut buf, 0x30, error);
    let name = connection.as_bytes();
    let n = name.len().min(0x10);
    buf[0x40..0x40 + n].copy_from_slice(&name[..n]);
    buf
}

fn token_reply_packet(rcvd_id: u32, kind: TokenRequestKind, token_request: u16, token: u32) -> Vec<u8> {
    let mut buf = packets::token_packet(kind, RADIO_CONTROL_ID, rcvd_id, 0x31, token_request, token);
    buf[0x14] = 0x02; // reply
    buf
}

fn conn_info_packet(rcvd_id: u32, busy: bool, rig_name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; packets::CONN_INFO_SIZE];
    header_into(&mut buf, 0x00, RADIO_CONTROL_ID, rcvd_id);
    buf[0x26] = 0x10;
    buf[0x27] = 0x80;
    buf[0x28..0x2E].copy_from_slice(&[0x00, 0x90, 0xC7, 0x00, 0x11, 0x22]);
    let name = rig_name.as_bytes();
    let n = name.len().min(0x20);
    buf[0x40..0x40 + n].copy_from_slice(&name[..n]);
    buf[0x60] = busy as u8;
    buf
}

fn status_packet(rcvd_id: u32, connected: bool, civ_port: u16, audio_port: u16) -> Vec<u8> {
    let mut buf = vec![0u8; packets::STATUS_SIZE];
    header_into(&mut buf, 0x00, RADIO_CONTROL_ID, rcvd_id);
    buf[0x40] = if connected { 0x00 } else { 0x01 };
    write_u32_be(&mut buf, 0x42, civ_port as u32);
    write_u32_be(&mut buf, 0x46, audio_port as u32);
    buf
}

fn capabilities_packet(rcvd_id: u32, rig_name: &str, civ_address: u8) -> Vec<u8> {
    let mut buf = vec![0u8; packets::CAPABILITIES_SIZE];
    header_into(&mut buf, 0x00, RADIO_CONTROL_ID, rcvd_id);
    let base = 0x42;
    let name = rig_name.as_bytes();
    let n = name.len().min(0x20);
    buf[base + 0x10..base + 0x10 + n].copy_from_slice(&name[..n]);
    let audio_name = b"ICOM_VAUD";
    buf[base + 0x30..base + 0x30 + audio_name.len()].copy_from_slice(audio_name);
    buf[base + 0x52] = civ_address;
    write_u16_be(&mut buf, base + 0x53, 12_000);
    write_u16_be(&mut buf, base + 0x55, 12_000);
    buf[base + 0x57] = 0x01;
    buf
}

// ---------------------------------------------------------------------------
// Socket tasks
// ---------------------------------------------------------------------------

async fn control_task(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    civ_port: u16,
    audio_port: u16,
) {
    let mut buf = [0u8; 4096];
    loop {
        let Ok((n, src)) = socket.recv_from(&mut buf).await else {
            break;
        };
        let data = &buf[..n];
        let Ok(header) = Header::parse(data) else {
            continue;
        };

        match data.len() {
            packets::CONTROL_SIZE => match header.control_type() {
                Some(ControlType::AreYouThere) => {
                    shared.state.lock().await.client_control = Some(src);
                    let reply = packets::control_packet(
                        ControlType::IAmHere,
                        0,
                        RADIO_CONTROL_ID,
                        header.sent_id,
                    );
                    let _ = socket.send_to(&reply, src).await;
                }
                Some(ControlType::Ready) => {
                    {
                        let mut state = shared.state.lock().await;
                        if state.first_are_you_ready.is_none() {
                            state.first_are_you_ready =
                                Some((header.seq, header.sent_id, header.rcvd_id));
                        }
                    }
                    let reply = packets::control_packet(
                        ControlType::Ready,
                        0,
                        RADIO_CONTROL_ID,
                        header.sent_id,
                    );
                    let _ = socket.send_to(&reply, src).await;
                }
                Some(ControlType::Disconnect) => {
                    shared.state.lock().await.control_disconnects += 1;
                }
                _ => {}
            },
            packets::PING_SIZE => {
                if let Ok(view) = PingView::parse(data) {
                    if !view.is_reply {
                        let reply = packets::ping_reply(&view, RADIO_CONTROL_ID, view.sent_id);
                        let _ = socket.send_to(&reply, src).await;
                    }
                }
            }
            packets::LOGIN_SIZE => {
                let reply = login_response_packet(
                    header.sent_id,
                    shared.options.login_error,
                    RADIO_TOKEN,
                    "FTTH",
                );
                let _ = socket.send_to(&reply, src).await;
            }
            packets::TOKEN_SIZE => {
                if let Ok(view) = TokenView::parse(data) {
                    match view.kind() {
                        Some(TokenRequestKind::Confirm) => {
                            let reply = token_reply_packet(
                                header.sent_id,
                                TokenRequestKind::Confirm,
                                view.token_request,
                                view.token,
                            );
                            let _ = socket.send_to(&reply, src).await;
                            // The confirm unlocks the stream negotiation.
                            let info = conn_info_packet(
                                header.sent_id,
                                shared.options.busy_conn_info,
                                &shared.options.rig_name,
                            );
                            let _ = socket.send_to(&info, src).await;
                        }
                        Some(TokenRequestKind::Renewal) => {
                            let reply = token_reply_packet(
                                header.sent_id,
                                TokenRequestKind::Renewal,
                                view.token_request,
                                view.token,
                            );
                            let _ = socket.send_to(&reply, src).await;
                        }
                        _ => {}
                    }
                }
            }
            packets::CONN_INFO_SIZE => {
                let send_zero_first = {
                    let mut state = shared.state.lock().await;
                    state.conn_info_count += 1;
                    if shared.options.zero_port_status_first && !state.zero_port_sent {
                        state.zero_port_sent = true;
                        true
                    } else {
                        false
                    }
                };
                if send_zero_first {
                    let placeholder = status_packet(header.sent_id, false, 0, 0);
                    let _ = socket.send_to(&placeholder, src).await;
                }
                let status = status_packet(header.sent_id, true, civ_port, audio_port);
                let _ = socket.send_to(&status, src).await;

                let send_caps = {
                    let mut state = shared.state.lock().await;
                    if shared.options.send_capabilities && !state.capabilities_sent {
                        state.capabilities_sent = true;
                        true
                    } else {
                        false
                    }
                };
                if send_caps {
                    let caps = capabilities_packet(
                        header.sent_id,
                        &shared.options.rig_name,
                        shared.options.civ_address,
                    );
                    let _ = socket.send_to(&caps, src).await;
                }
            }
            _ => {
                tracing::trace!(bytes = n, "mock radio ignoring control datagram");
            }
        }
    }
}

#[derive(Clone, Copy)]
enum SubKind {
    Civ,
    Audio,
}

async fn sub_task(shared: Arc<Shared>, socket: Arc<UdpSocket>, radio_id: u32, which: SubKind) {
    let mut buf = [0u8; 4096];
    loop {
        let Ok((n, src)) = socket.recv_from(&mut buf).await else {
            break;
        };
        let data = &buf[..n];
        let Ok(header) = Header::parse(data) else {
            continue;
        };

        match data.len() {
            packets::CONTROL_SIZE => match header.control_type() {
                Some(ControlType::AreYouThere) => {
                    {
                        let mut state = shared.state.lock().await;
                        match which {
                            SubKind::Civ => state.client_civ = Some(src),
                            SubKind::Audio => state.client_audio = Some(src),
                        }
                    }
                    let reply =
                        packets::control_packet(ControlType::IAmHere, 0, radio_id, header.sent_id);
                    let _ = socket.send_to(&reply, src).await;
                }
                Some(ControlType::Ready) => {
                    let reply =
                        packets::control_packet(ControlType::Ready, 0, radio_id, header.sent_id);
                    let _ = socket.send_to(&reply, src).await;
                }
                _ => {}
            },
            packets::PING_SIZE => {
                if let Ok(view) = PingView::parse(data) {
                    if !view.is_reply {
                        let reply = packets::ping_reply(&view, radio_id, view.sent_id);
                        let _ = socket.send_to(&reply, src).await;
                    }
                }
            }
            packets::OPEN_CLOSE_SIZE if data[0x10] == 0xC0 => {
                if data[0x15] == 0x04 {
                    shared.state.lock().await.open_packets += 1;
                }
            }
            _ => {
                if data.len() > packets::CIV_HEADER_SIZE && data[0x10] == 0xC1 {
                    if let Ok(view) = CivView::parse(data) {
                        shared.state.lock().await.civ_payloads.push(view.payload.to_vec());
                    }
                } else if data.len() > packets::AUDIO_HEADER_SIZE {
                    shared.state.lock().await.audio_packets += 1;
                }
            }
        }
    }
}
