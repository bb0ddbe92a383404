//! Builders and parsers for the Icom WLAN (UDP) packet families.
//!
//! Every packet begins with the same 16-byte little-endian session header:
//!
//! ```text
//! offset  size  field     byte order
//! 0x00    4     length    LE   (total packet length in bytes)
//! 0x04    2     type      LE   (control type, see [`ControlType`])
//! 0x06    2     seq       LE   (tracked sequence, stamped by the session)
//! 0x08    4     sent_id   LE   (sender's session id)
//! 0x0C    4     rcvd_id   LE   (receiver's session id, 0 until learned)
//! ```
//!
//! Past the header the byte order flips: payload size, inner sequence,
//! token request, token, CI-V sequence, and audio identity/length fields
//! are all big-endian. The token-family packets (Token, Login,
//! LoginResponse, ConnInfo) share one inner header:
//!
//! ```text
//! 0x11    2     payload size        BE  (total length - 0x10)
//! 0x14    1     request reply       (0x01 request, 0x02 reply)
//! 0x15    1     request type        (see [`TokenRequestKind`])
//! 0x16    2     inner sequence      BE
//! 0x18    2     token request       BE  (client-chosen 16-bit token)
//! 0x1C    4     token               BE  (radio-assigned 32-bit token)
//! ```
//!
//! Builders produce fully-formed byte vectors with the `seq` field left at
//! zero; the owning session stamps it at [`SEQ_OFFSET`] for tracked sends.
//! Inbound parsers are validating views in the style of a strict binary
//! parser: length and magic checks come first, and a packet that fails them
//! never reaches the state machine.

use icomnet_core::{Error, RadioCapabilities, Result};

use crate::wire::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, write_u16_be, write_u16_le, write_u32_be,
    write_u32_le,
};

// ---------------------------------------------------------------------------
// Sizes and offsets
// ---------------------------------------------------------------------------

/// Size of the bare control packet (and of the common session header).
pub const CONTROL_SIZE: usize = 0x10;
/// Size of a ping request/reply packet.
pub const PING_SIZE: usize = 0x15;
/// Size of a CI-V open/close keep-alive packet.
pub const OPEN_CLOSE_SIZE: usize = 0x16;
/// Size of a token request/response packet.
pub const TOKEN_SIZE: usize = 0x40;
/// Size of a status packet.
pub const STATUS_SIZE: usize = 0x50;
/// Size of a login response packet.
pub const LOGIN_RESPONSE_SIZE: usize = 0x60;
/// Size of a login packet.
pub const LOGIN_SIZE: usize = 0x80;
/// Size of a connection-info packet.
pub const CONN_INFO_SIZE: usize = 0x90;
/// Size of a capabilities packet carrying one radio record.
pub const CAPABILITIES_SIZE: usize = 0xA8;
/// Offset of the payload in a CI-V packet (and its minimum size less one).
pub const CIV_HEADER_SIZE: usize = 0x15;
/// Offset of the payload in an audio packet.
pub const AUDIO_HEADER_SIZE: usize = 0x18;

/// Offset of the tracked-sequence field within the session header.
///
/// The session stamps this field after a builder's template is copied and
/// before the bytes enter the retransmission history, so a later retransmit
/// resends exactly what the radio saw.
pub const SEQ_OFFSET: usize = 0x06;

/// Largest audio payload the protocol permits per packet.
pub const MAX_AUDIO_PAYLOAD: usize = 2048;

/// Offset of the first capability record in a capabilities packet.
const CAP_FIRST_RECORD: usize = 0x42;
/// Size of one capability record.
const CAP_RECORD_SIZE: usize = 0x66;

// ---------------------------------------------------------------------------
// Control types
// ---------------------------------------------------------------------------

/// The control-type field of the session header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Keep-alive / no-op; also the stand-in for an unavailable retransmit.
    Null,
    /// Retransmission request for one or more tracked sequences.
    Retransmit,
    /// Session discovery probe, sent until the peer answers.
    AreYouThere,
    /// Answer to [`AreYouThere`](Self::AreYouThere), carrying the peer's id.
    IAmHere,
    /// Session teardown.
    Disconnect,
    /// Readiness exchange: the same type value is used for the client's
    /// ARE_YOU_READY probe and the radio's I_AM_READY answer.
    Ready,
    /// Latency probe; byte 0x10 distinguishes request from reply.
    Ping,
}

impl ControlType {
    /// The on-wire type value.
    pub fn as_u16(self) -> u16 {
        match self {
            ControlType::Null => 0x00,
            ControlType::Retransmit => 0x01,
            ControlType::AreYouThere => 0x03,
            ControlType::IAmHere => 0x04,
            ControlType::Disconnect => 0x05,
            ControlType::Ready => 0x06,
            ControlType::Ping => 0x07,
        }
    }

    /// Decode an on-wire type value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x00 => Some(ControlType::Null),
            0x01 => Some(ControlType::Retransmit),
            0x03 => Some(ControlType::AreYouThere),
            0x04 => Some(ControlType::IAmHere),
            0x05 => Some(ControlType::Disconnect),
            0x06 => Some(ControlType::Ready),
            0x07 => Some(ControlType::Ping),
            _ => None,
        }
    }
}

/// The request-type field of a token packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRequestKind {
    /// Release the token.
    Delete,
    /// Confirm the token received in the login response.
    Confirm,
    /// Announce disconnect.
    Disconnect,
    /// Periodic renewal (every 60 s while connected).
    Renewal,
}

impl TokenRequestKind {
    /// The on-wire request-type value.
    pub fn as_u8(self) -> u8 {
        match self {
            TokenRequestKind::Delete => 0x01,
            TokenRequestKind::Confirm => 0x02,
            TokenRequestKind::Disconnect => 0x04,
            TokenRequestKind::Renewal => 0x05,
        }
    }

    /// Decode an on-wire request-type value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(TokenRequestKind::Delete),
            0x02 => Some(TokenRequestKind::Confirm),
            0x04 => Some(TokenRequestKind::Disconnect),
            0x05 => Some(TokenRequestKind::Renewal),
            _ => None,
        }
    }
}

/// The renewal-rejected marker in a token response's `response` field.
pub const TOKEN_RESPONSE_REJECTED: u32 = 0xFFFF_FFFF;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn write_header(buf: &mut [u8], packet_type: u16, seq: u16, sent_id: u32, rcvd_id: u32) {
    let len = buf.len() as u32;
    write_u32_le(buf, 0x00, len);
    write_u16_le(buf, 0x04, packet_type);
    write_u16_le(buf, SEQ_OFFSET, seq);
    write_u32_le(buf, 0x08, sent_id);
    write_u32_le(buf, 0x0C, rcvd_id);
}

fn write_inner_header(
    buf: &mut [u8],
    request_reply: u8,
    request_type: u8,
    inner_seq: u16,
    token_request: u16,
    token: u32,
) {
    let payload_size = (buf.len() - CONTROL_SIZE) as u16;
    write_u16_be(buf, 0x11, payload_size);
    buf[0x14] = request_reply;
    buf[0x15] = request_type;
    write_u16_be(buf, 0x16, inner_seq);
    write_u16_be(buf, 0x18, token_request);
    write_u32_be(buf, 0x1C, token);
}

/// Copy `src` into a fixed-width field, truncating or zero-padding.
fn write_padded(buf: &mut [u8], offset: usize, width: usize, src: &[u8]) {
    let n = src.len().min(width);
    buf[offset..offset + n].copy_from_slice(&src[..n]);
}

/// Build a bare 16-byte control packet.
pub fn control_packet(packet_type: ControlType, seq: u16, sent_id: u32, rcvd_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; CONTROL_SIZE];
    write_header(&mut buf, packet_type.as_u16(), seq, sent_id, rcvd_id);
    buf
}

/// Build an ARE_YOU_THERE probe: seq 0, receiver id unknown.
pub fn are_you_there_packet(sent_id: u32) -> Vec<u8> {
    control_packet(ControlType::AreYouThere, 0, sent_id, 0)
}

/// Build a ping request. `time` is the lower 32 bits of the sender's
/// monotonic clock; the reply echoes those four bytes verbatim.
pub fn ping_request(seq: u16, sent_id: u32, rcvd_id: u32, time: u32) -> Vec<u8> {
    let mut buf = vec![0u8; PING_SIZE];
    write_header(&mut buf, ControlType::Ping.as_u16(), seq, sent_id, rcvd_id);
    buf[0x10] = 0x00;
    write_u32_le(&mut buf, 0x11, time);
    buf
}

/// Build the reply to an inbound ping request, echoing its sequence and
/// timestamp bytes.
pub fn ping_reply(request: &PingView, sent_id: u32, rcvd_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; PING_SIZE];
    write_header(&mut buf, ControlType::Ping.as_u16(), request.seq, sent_id, rcvd_id);
    buf[0x10] = 0x01;
    buf[0x11..0x15].copy_from_slice(&request.time_bytes);
    buf
}

/// Build a CI-V open (magic 0x04) or close (magic 0x00) keep-alive packet.
pub fn open_close_packet(open: bool, civ_seq: u16, sent_id: u32, rcvd_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; OPEN_CLOSE_SIZE];
    write_header(&mut buf, ControlType::Null.as_u16(), 0, sent_id, rcvd_id);
    buf[0x10] = 0xC0;
    write_u16_le(&mut buf, 0x11, 0x01);
    write_u16_be(&mut buf, 0x13, civ_seq);
    buf[0x15] = if open { 0x04 } else { 0x00 };
    buf
}

/// Build a token request (confirm, renewal, delete, or disconnect).
pub fn token_packet(
    kind: TokenRequestKind,
    sent_id: u32,
    rcvd_id: u32,
    inner_seq: u16,
    token_request: u16,
    token: u32,
) -> Vec<u8> {
    let mut buf = vec![0u8; TOKEN_SIZE];
    write_header(&mut buf, ControlType::Null.as_u16(), 0, sent_id, rcvd_id);
    write_inner_header(&mut buf, 0x01, kind.as_u8(), inner_seq, token_request, token);
    buf
}

/// Build a login packet with obfuscated credentials.
///
/// `username` and `password` must already be the 16-byte obfuscated forms
/// from [`crate::auth::obfuscate`]; `client_name` is plain ASCII, truncated
/// or zero-padded to 16 bytes.
pub fn login_packet(
    sent_id: u32,
    rcvd_id: u32,
    inner_seq: u16,
    token_request: u16,
    username: &[u8; 16],
    password: &[u8; 16],
    client_name: &str,
) -> Vec<u8> {
    let mut buf = vec![0u8; LOGIN_SIZE];
    write_header(&mut buf, ControlType::Null.as_u16(), 0, sent_id, rcvd_id);
    write_inner_header(&mut buf, 0x01, 0x00, inner_seq, token_request, 0);
    buf[0x40..0x50].copy_from_slice(username);
    buf[0x50..0x60].copy_from_slice(password);
    write_padded(&mut buf, 0x60, 0x10, client_name.as_bytes());
    buf
}

/// Parameters for the client's connection-info reply.
#[derive(Debug, Clone)]
pub struct ConnInfoParams {
    /// Our session id.
    pub sent_id: u32,
    /// The radio's session id.
    pub rcvd_id: u32,
    /// Next inner sequence.
    pub inner_seq: u16,
    /// The token request chosen at login.
    pub token_request: u16,
    /// The token assigned by the radio.
    pub token: u32,
    /// Radio MAC, copied from the inbound connection-info packet.
    pub mac: [u8; 6],
    /// Rig name field, copied verbatim from the inbound packet.
    pub rig_name: [u8; 32],
    /// Obfuscated username, placed in the 0x60 field.
    pub username_obfuscated: [u8; 16],
    /// RX stream sample rate in hertz.
    pub rx_sample_rate: u32,
    /// TX stream sample rate in hertz.
    pub tx_sample_rate: u32,
    /// Our local CI-V socket port.
    pub civ_port: u16,
    /// Our local audio socket port.
    pub audio_port: u16,
    /// TX jitter buffer size the radio should use.
    pub tx_buffer_size: u32,
}

/// Build the connection-info reply that programs the stream configuration
/// and advertises our local CI-V and audio ports.
pub fn conn_info_packet(p: &ConnInfoParams) -> Vec<u8> {
    let mut buf = vec![0u8; CONN_INFO_SIZE];
    write_header(&mut buf, ControlType::Null.as_u16(), 0, p.sent_id, p.rcvd_id);
    write_inner_header(&mut buf, 0x01, 0x00, p.inner_seq, p.token_request, p.token);
    // Common capability marker.
    buf[0x26] = 0x10;
    buf[0x27] = 0x80;
    buf[0x28..0x2E].copy_from_slice(&p.mac);
    buf[0x40..0x60].copy_from_slice(&p.rig_name);
    buf[0x60..0x70].copy_from_slice(&p.username_obfuscated);
    // Stream configuration: rx enable, tx enable, LPCM, 16-bit.
    buf[0x70] = 0x01;
    buf[0x71] = 0x01;
    buf[0x72] = 0x04;
    buf[0x73] = 0x04;
    write_u32_be(&mut buf, 0x74, p.rx_sample_rate);
    write_u32_be(&mut buf, 0x78, p.tx_sample_rate);
    write_u32_be(&mut buf, 0x7C, p.civ_port as u32);
    write_u32_be(&mut buf, 0x80, p.audio_port as u32);
    write_u32_be(&mut buf, 0x84, p.tx_buffer_size);
    buf[0x88] = 0x01;
    buf
}

/// Build a CI-V transport packet carrying `payload` (a raw frame or a
/// fragment thereof).
pub fn civ_packet(payload: &[u8], civ_seq: u16, sent_id: u32, rcvd_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; CIV_HEADER_SIZE + payload.len()];
    write_header(&mut buf, ControlType::Null.as_u16(), 0, sent_id, rcvd_id);
    buf[0x10] = 0xC1;
    write_u16_le(&mut buf, 0x11, payload.len() as u16);
    write_u16_be(&mut buf, 0x13, civ_seq);
    buf[CIV_HEADER_SIZE..].copy_from_slice(payload);
    buf
}

/// Build an audio packet carrying raw 16-bit little-endian PCM.
///
/// The identity field is stored low byte first on the wire: `97 81`
/// (0x8197) for the 160-byte payload the radio produces, `00 80` (0x8000)
/// for everything else, including our 480-byte transmit frames.
pub fn audio_packet(pcm: &[u8], audio_seq: u16, sent_id: u32, rcvd_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; AUDIO_HEADER_SIZE + pcm.len()];
    write_header(&mut buf, ControlType::Null.as_u16(), 0, sent_id, rcvd_id);
    if pcm.len() == 160 {
        buf[0x10] = 0x97;
        buf[0x11] = 0x81;
    } else {
        buf[0x10] = 0x00;
        buf[0x11] = 0x80;
    }
    write_u16_be(&mut buf, 0x12, audio_seq);
    write_u16_be(&mut buf, 0x16, pcm.len() as u16);
    buf[AUDIO_HEADER_SIZE..].copy_from_slice(pcm);
    buf
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// The common 16-byte session header, parsed from any inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Declared total length (little-endian at 0x00).
    pub len: u32,
    /// Raw control type value.
    pub packet_type: u16,
    /// Tracked sequence.
    pub seq: u16,
    /// Sender's session id.
    pub sent_id: u32,
    /// Receiver's session id.
    pub rcvd_id: u32,
}

impl Header {
    /// Parse the session header. Requires at least 16 bytes and a declared
    /// length matching the datagram length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CONTROL_SIZE {
            return Err(Error::Protocol(format!(
                "packet too short for session header: {} bytes",
                data.len()
            )));
        }
        let len = read_u32_le(data, 0x00);
        if len as usize != data.len() {
            return Err(Error::Protocol(format!(
                "declared length {} does not match datagram length {}",
                len,
                data.len()
            )));
        }
        Ok(Header {
            len,
            packet_type: read_u16_le(data, 0x04),
            seq: read_u16_le(data, SEQ_OFFSET),
            sent_id: read_u32_le(data, 0x08),
            rcvd_id: read_u32_le(data, 0x0C),
        })
    }

    /// The decoded control type, if the raw value is known.
    pub fn control_type(&self) -> Option<ControlType> {
        ControlType::from_u16(self.packet_type)
    }
}

/// A parsed ping packet (21 bytes, type 0x07).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingView {
    /// `false` for a request (byte 0x10 == 0), `true` for a reply.
    pub is_reply: bool,
    /// The ping sequence from the session header.
    pub seq: u16,
    /// The four timestamp bytes; replies echo these verbatim.
    pub time_bytes: [u8; 4],
    /// Sender's session id.
    pub sent_id: u32,
}

impl PingView {
    /// Parse and validate a ping packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = Header::parse(data)?;
        if data.len() != PING_SIZE || header.packet_type != ControlType::Ping.as_u16() {
            return Err(Error::Protocol(format!(
                "not a ping packet: len={} type={:#06x}",
                data.len(),
                header.packet_type
            )));
        }
        let mut time_bytes = [0u8; 4];
        time_bytes.copy_from_slice(&data[0x11..0x15]);
        Ok(PingView {
            is_reply: data[0x10] != 0,
            seq: header.seq,
            time_bytes,
            sent_id: header.sent_id,
        })
    }
}

/// A parsed 64-byte token response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenView {
    /// Request/reply marker (0x01 request, 0x02 reply).
    pub request_reply: u8,
    /// Raw request-type value.
    pub request_type: u8,
    /// Inner sequence.
    pub inner_seq: u16,
    /// The 16-bit token request echoed by the radio.
    pub token_request: u16,
    /// The 32-bit token.
    pub token: u32,
    /// Response code; [`TOKEN_RESPONSE_REJECTED`] means the radio wants a
    /// fresh connection-info exchange.
    pub response: u32,
    /// Sender's session id (carries the radio's new id on renewal
    /// rejection).
    pub sent_id: u32,
}

impl TokenView {
    /// Parse and validate a token packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = Header::parse(data)?;
        if data.len() != TOKEN_SIZE {
            return Err(Error::Protocol(format!(
                "not a token packet: len={}",
                data.len()
            )));
        }
        Ok(TokenView {
            request_reply: data[0x14],
            request_type: data[0x15],
            inner_seq: read_u16_be(data, 0x16),
            token_request: read_u16_be(data, 0x18),
            token: read_u32_be(data, 0x1C),
            response: read_u32_be(data, 0x30),
            sent_id: header.sent_id,
        })
    }

    /// The decoded request kind, if known.
    pub fn kind(&self) -> Option<TokenRequestKind> {
        TokenRequestKind::from_u8(self.request_type)
    }

    /// Whether this is a rejected renewal: the radio is asking us to tear
    /// down and re-establish the connection-info exchange.
    pub fn is_renewal_rejected(&self) -> bool {
        self.kind() == Some(TokenRequestKind::Renewal) && self.response == TOKEN_RESPONSE_REJECTED
    }
}

/// A parsed 80-byte status packet announcing dynamic port assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusView {
    /// Error field (little-endian, unlike the token-family fields).
    pub error: u32,
    /// The radio's view of the link: byte 0x40 == 0 means connected.
    pub connected: bool,
    /// Dynamic CI-V port, or 0 during the radio's busy/retry phase.
    pub civ_port: u16,
    /// Dynamic audio port, or 0 during the radio's busy/retry phase.
    pub audio_port: u16,
}

impl StatusView {
    /// Parse and validate a status packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Header::parse(data)?;
        if data.len() != STATUS_SIZE {
            return Err(Error::Protocol(format!(
                "not a status packet: len={}",
                data.len()
            )));
        }
        Ok(StatusView {
            error: read_u32_le(data, 0x30),
            connected: data[0x40] == 0,
            civ_port: read_u32_be(data, 0x42) as u16,
            audio_port: read_u32_be(data, 0x46) as u16,
        })
    }

    /// Whether the packet actually carries port assignments. Zero-port
    /// status packets occur during a fast reconnect and must not reprogram
    /// the sub-sessions.
    pub fn has_ports(&self) -> bool {
        self.civ_port != 0 && self.audio_port != 0
    }
}

/// A parsed 96-byte login response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponseView {
    /// The 32-bit token assigned by the radio.
    pub token: u32,
    /// Error code (big-endian); 0 means the credentials were accepted.
    pub error: u32,
    /// The connection string the radio reports (NUL-trimmed).
    pub connection: String,
}

impl LoginResponseView {
    /// Parse and validate a login response.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Header::parse(data)?;
        if data.len() != LOGIN_RESPONSE_SIZE {
            return Err(Error::Protocol(format!(
                "not a login response: len={}",
                data.len()
            )));
        }
        Ok(LoginResponseView {
            token: read_u32_be(data, 0x1C),
            error: read_u32_be(data, 0x30),
            connection: trimmed_string(&data[0x40..0x50]),
        })
    }

    /// Whether the radio accepted the credentials.
    pub fn ok(&self) -> bool {
        self.error == 0
    }
}

/// A parsed 144-byte connection-info packet from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfoView {
    /// Busy indicator at 0x60. `true` may occur on a fast reconnect; the
    /// packet must still be answered or the flow stalls.
    pub busy: bool,
    /// Radio MAC address.
    pub mac: [u8; 6],
    /// Raw rig-name field, echoed verbatim in our reply.
    pub rig_name_raw: [u8; 32],
    /// Inner sequence.
    pub inner_seq: u16,
    /// Token request echoed by the radio.
    pub token_request: u16,
    /// Token echoed by the radio.
    pub token: u32,
}

impl ConnInfoView {
    /// Parse and validate a connection-info packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Header::parse(data)?;
        if data.len() != CONN_INFO_SIZE {
            return Err(Error::Protocol(format!(
                "not a connection-info packet: len={}",
                data.len()
            )));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[0x28..0x2E]);
        let mut rig_name_raw = [0u8; 32];
        rig_name_raw.copy_from_slice(&data[0x40..0x60]);
        Ok(ConnInfoView {
            busy: data[0x60] != 0,
            mac,
            rig_name_raw,
            inner_seq: read_u16_be(data, 0x16),
            token_request: read_u16_be(data, 0x18),
            token: read_u32_be(data, 0x1C),
        })
    }

    /// The rig name as a NUL-trimmed string.
    pub fn rig_name(&self) -> String {
        trimmed_string(&self.rig_name_raw)
    }
}

/// A parsed capabilities packet (0xA8 bytes per carried record).
#[derive(Debug, Clone)]
pub struct CapabilitiesView {
    /// The radio records carried by the packet, in order.
    pub radios: Vec<RadioCapabilities>,
}

impl CapabilitiesView {
    /// Parse and validate a capabilities packet, extracting every complete
    /// record at `0x42 + 0x66 * index`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Header::parse(data)?;
        if data.len() < CAP_FIRST_RECORD + CAP_RECORD_SIZE {
            return Err(Error::Protocol(format!(
                "capabilities packet too short: {} bytes",
                data.len()
            )));
        }
        let count = (data.len() - CAP_FIRST_RECORD) / CAP_RECORD_SIZE;
        let mut radios = Vec::with_capacity(count);
        for index in 0..count {
            let base = CAP_FIRST_RECORD + CAP_RECORD_SIZE * index;
            let record = &data[base..base + CAP_RECORD_SIZE];
            radios.push(RadioCapabilities {
                rig_name: trimmed_string(&record[0x10..0x30]),
                audio_name: trimmed_string(&record[0x30..0x50]),
                civ_address: record[0x52],
                rx_sample_rate: read_u16_be(record, 0x53),
                tx_sample_rate: read_u16_be(record, 0x55),
                supports_tx: record[0x57] != 0,
            });
        }
        Ok(CapabilitiesView { radios })
    }
}

/// A validated view of an inbound CI-V transport packet.
#[derive(Debug, PartialEq, Eq)]
pub struct CivView<'a> {
    /// The CI-V stream sequence.
    pub civ_seq: u16,
    /// The payload past the CI-V header (may hold partial frames).
    pub payload: &'a [u8],
}

impl<'a> CivView<'a> {
    /// Parse and validate a CI-V packet: marker 0xC1 at 0x10, a declared
    /// payload length matching the datagram, and a non-retransmit type.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = Header::parse(data)?;
        if data.len() <= CIV_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "CI-V packet too short: {} bytes",
                data.len()
            )));
        }
        if data[0x10] != 0xC1 {
            return Err(Error::Protocol(format!(
                "CI-V marker mismatch: {:#04x}",
                data[0x10]
            )));
        }
        let civ_len = read_u16_le(data, 0x11) as usize;
        if civ_len != data.len() - CIV_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "CI-V length mismatch: declared {} actual {}",
                civ_len,
                data.len() - CIV_HEADER_SIZE
            )));
        }
        if header.control_type() == Some(ControlType::Retransmit) {
            return Err(Error::Protocol(
                "retransmit request framed as CI-V".to_string(),
            ));
        }
        Ok(CivView {
            civ_seq: read_u16_be(data, 0x13),
            payload: &data[CIV_HEADER_SIZE..],
        })
    }
}

/// A validated view of an inbound audio packet.
#[derive(Debug, PartialEq, Eq)]
pub struct AudioView<'a> {
    /// The audio stream sequence.
    pub send_seq: u16,
    /// Raw 16-bit little-endian PCM payload.
    pub payload: &'a [u8],
}

impl<'a> AudioView<'a> {
    /// Parse and validate an audio packet: identity bytes in range, and a
    /// declared data length matching the datagram with `0 < len <= 2048`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        Header::parse(data)?;
        if data.len() <= AUDIO_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "audio packet too short: {} bytes",
                data.len()
            )));
        }
        if !matches!(data[0x10], 0x97 | 0x00) || !matches!(data[0x11], 0x80 | 0x81) {
            return Err(Error::Protocol(format!(
                "audio identity mismatch: {:#04x} {:#04x}",
                data[0x10], data[0x11]
            )));
        }
        let data_len = read_u16_be(data, 0x16) as usize;
        if data_len == 0 || data_len > MAX_AUDIO_PAYLOAD {
            return Err(Error::Protocol(format!(
                "audio data length out of range: {data_len}"
            )));
        }
        if data.len() != AUDIO_HEADER_SIZE + data_len {
            return Err(Error::Protocol(format!(
                "audio length mismatch: declared {} datagram {}",
                data_len,
                data.len()
            )));
        }
        Ok(AudioView {
            send_seq: read_u16_be(data, 0x12),
            payload: &data[AUDIO_HEADER_SIZE..],
        })
    }
}

/// Extract the requested sequence numbers from a retransmit packet.
///
/// A 16-byte retransmit names one sequence in its own `seq` field; longer
/// packets carry a list of little-endian 16-bit words from 0x10.
pub fn retransmit_seqs(data: &[u8]) -> Result<Vec<u16>> {
    let header = Header::parse(data)?;
    if header.control_type() != Some(ControlType::Retransmit) {
        return Err(Error::Protocol(format!(
            "not a retransmit packet: type={:#06x}",
            header.packet_type
        )));
    }
    if data.len() == CONTROL_SIZE {
        return Ok(vec![header.seq]);
    }
    let mut seqs = Vec::with_capacity((data.len() - CONTROL_SIZE) / 2);
    let mut offset = 0x10;
    while offset + 2 <= data.len() {
        seqs.push(read_u16_le(data, offset));
        offset += 2;
    }
    Ok(seqs)
}

/// NUL-trim a fixed-width string field, dropping any non-UTF-8 tail.
fn trimmed_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- session header -----------------------------------------------------

    #[test]
    fn control_packet_layout() {
        let packet = control_packet(ControlType::AreYouThere, 0, 0x1122_3344, 0);
        assert_eq!(packet.len(), 16);
        // Length and type are little-endian.
        assert_eq!(&packet[0x00..0x04], &[0x10, 0x00, 0x00, 0x00]);
        assert_eq!(&packet[0x04..0x06], &[0x03, 0x00]);
        // sent_id little-endian.
        assert_eq!(&packet[0x08..0x0C], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn header_round_trip() {
        let packet = control_packet(ControlType::Ready, 7, 0xAABB_CCDD, 0x0102_0304);
        let header = Header::parse(&packet).unwrap();
        assert_eq!(header.control_type(), Some(ControlType::Ready));
        assert_eq!(header.seq, 7);
        assert_eq!(header.sent_id, 0xAABB_CCDD);
        assert_eq!(header.rcvd_id, 0x0102_0304);
    }

    #[test]
    fn header_rejects_length_mismatch() {
        let mut packet = control_packet(ControlType::Null, 0, 1, 2);
        packet.push(0);
        assert!(Header::parse(&packet).is_err());
    }

    #[test]
    fn header_rejects_short_datagram() {
        assert!(Header::parse(&[0u8; 8]).is_err());
    }

    // -- ping ---------------------------------------------------------------

    #[test]
    fn ping_request_round_trip() {
        let packet = ping_request(42, 0xDEAD_BEEF, 0xCAFE_F00D, 0x0102_0304);
        let view = PingView::parse(&packet).unwrap();
        assert!(!view.is_reply);
        assert_eq!(view.seq, 42);
        assert_eq!(view.time_bytes, 0x0102_0304u32.to_le_bytes());
    }

    #[test]
    fn ping_reply_echoes_time_bytes() {
        let request = ping_request(9, 1, 2, 0x5566_7788);
        let view = PingView::parse(&request).unwrap();
        let reply = ping_reply(&view, 2, 1);
        assert_eq!(reply[0x10], 0x01);
        assert_eq!(&reply[0x11..0x15], &request[0x11..0x15]);
        let reply_view = PingView::parse(&reply).unwrap();
        assert!(reply_view.is_reply);
        assert_eq!(reply_view.seq, 9);
    }

    // -- open/close ---------------------------------------------------------

    #[test]
    fn open_close_layout() {
        let open = open_close_packet(true, 0x0203, 1, 2);
        assert_eq!(open.len(), OPEN_CLOSE_SIZE);
        assert_eq!(open[0x10], 0xC0);
        // civ_len little-endian 1.
        assert_eq!(&open[0x11..0x13], &[0x01, 0x00]);
        // civSeq big-endian.
        assert_eq!(&open[0x13..0x15], &[0x02, 0x03]);
        assert_eq!(open[0x15], 0x04);

        let close = open_close_packet(false, 0, 1, 2);
        assert_eq!(close[0x15], 0x00);
    }

    // -- token --------------------------------------------------------------

    #[test]
    fn token_round_trip() {
        let packet = token_packet(
            TokenRequestKind::Renewal,
            0x0101_0101,
            0x0202_0202,
            0x31,
            0x4B5C,
            0x6D7E_8F90,
        );
        assert_eq!(packet.len(), TOKEN_SIZE);
        let view = TokenView::parse(&packet).unwrap();
        assert_eq!(view.kind(), Some(TokenRequestKind::Renewal));
        assert_eq!(view.request_reply, 0x01);
        assert_eq!(view.inner_seq, 0x31);
        assert_eq!(view.token_request, 0x4B5C);
        assert_eq!(view.token, 0x6D7E_8F90);
        assert!(!view.is_renewal_rejected());
    }

    #[test]
    fn token_fields_are_big_endian() {
        let packet = token_packet(TokenRequestKind::Confirm, 0, 0, 0x30, 0x1234, 0xAABB_CCDD);
        // token_request at 0x18 big-endian.
        assert_eq!(&packet[0x18..0x1A], &[0x12, 0x34]);
        // token at 0x1C big-endian.
        assert_eq!(&packet[0x1C..0x20], &[0xAA, 0xBB, 0xCC, 0xDD]);
        // Reading the same bytes little-endian must give a different value;
        // ports of this protocol have historically inverted these.
        assert_ne!(read_u16_le(&packet, 0x18), 0x1234);
    }

    #[test]
    fn renewal_rejection_detected() {
        let mut packet = token_packet(TokenRequestKind::Renewal, 5, 6, 0x31, 1, 2);
        write_u32_be(&mut packet, 0x30, TOKEN_RESPONSE_REJECTED);
        let view = TokenView::parse(&packet).unwrap();
        assert!(view.is_renewal_rejected());
    }

    // -- login --------------------------------------------------------------

    #[test]
    fn login_field_placement() {
        let user = [0x11u8; 16];
        let pass = [0x22u8; 16];
        let packet = login_packet(1, 2, 0x30, 0xBEEF, &user, &pass, "icomnet");
        assert_eq!(packet.len(), LOGIN_SIZE);
        assert_eq!(&packet[0x40..0x50], &user);
        assert_eq!(&packet[0x50..0x60], &pass);
        assert_eq!(&packet[0x60..0x67], b"icomnet");
        assert_eq!(packet[0x67], 0x00);
        // payload size big-endian at 0x11: 0x80 - 0x10 = 0x70.
        assert_eq!(read_u16_be(&packet, 0x11), 0x70);
        // request marker.
        assert_eq!(packet[0x14], 0x01);
    }

    #[test]
    fn login_client_name_truncated_to_field() {
        let packet = login_packet(
            1,
            2,
            0x30,
            0,
            &[0u8; 16],
            &[0u8; 16],
            "a-very-long-client-name-indeed",
        );
        assert_eq!(&packet[0x60..0x70], b"a-very-long-clie");
    }

    // -- login response -----------------------------------------------------

    fn login_response_bytes(error: u32, token: u32, connection: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; LOGIN_RESPONSE_SIZE];
        write_u32_le(&mut data, 0x00, LOGIN_RESPONSE_SIZE as u32);
        write_u32_be(&mut data, 0x1C, token);
        write_u32_be(&mut data, 0x30, error);
        data[0x40..0x40 + connection.len()].copy_from_slice(connection);
        data
    }

    #[test]
    fn login_response_success() {
        let data = login_response_bytes(0, 0x1234_5678, b"FTTH");
        let view = LoginResponseView::parse(&data).unwrap();
        assert!(view.ok());
        assert_eq!(view.token, 0x1234_5678);
        assert_eq!(view.connection, "FTTH");
    }

    #[test]
    fn login_response_error_is_big_endian() {
        // Error 1 big-endian at 0x30: 00 00 00 01.
        let data = login_response_bytes(1, 0, b"");
        let view = LoginResponseView::parse(&data).unwrap();
        assert!(!view.ok());
        assert_eq!(view.error, 1);
        assert_eq!(&data[0x30..0x34], &[0x00, 0x00, 0x00, 0x01]);
    }

    // -- status -------------------------------------------------------------

    fn status_bytes(connected: bool, civ_port: u32, audio_port: u32) -> Vec<u8> {
        let mut data = vec![0u8; STATUS_SIZE];
        write_u32_le(&mut data, 0x00, STATUS_SIZE as u32);
        data[0x40] = if connected { 0x00 } else { 0x01 };
        write_u32_be(&mut data, 0x42, civ_port);
        write_u32_be(&mut data, 0x46, audio_port);
        data
    }

    #[test]
    fn status_port_extraction() {
        let data = status_bytes(true, 0x9C45, 0x9C46);
        let view = StatusView::parse(&data).unwrap();
        assert!(view.connected);
        assert!(view.has_ports());
        assert_eq!(view.civ_port, 40005);
        assert_eq!(view.audio_port, 40006);
    }

    #[test]
    fn status_zero_ports_flagged() {
        let data = status_bytes(true, 0, 0);
        let view = StatusView::parse(&data).unwrap();
        assert!(!view.has_ports());
    }

    // -- conn info ----------------------------------------------------------

    fn sample_conn_info_params() -> ConnInfoParams {
        let mut rig_name = [0u8; 32];
        rig_name[..6].copy_from_slice(b"IC-705");
        ConnInfoParams {
            sent_id: 0x0A0B_0C0D,
            rcvd_id: 0x0E0F_1011,
            inner_seq: 0x32,
            token_request: 0x4242,
            token: 0x1357_9BDF,
            mac: [0x00, 0x90, 0xC7, 0x11, 0x22, 0x33],
            rig_name,
            username_obfuscated: [0x33u8; 16],
            rx_sample_rate: 12_000,
            tx_sample_rate: 12_000,
            civ_port: 50010,
            audio_port: 50011,
            tx_buffer_size: 0x96,
        }
    }

    #[test]
    fn conn_info_constants_and_ports() {
        let packet = conn_info_packet(&sample_conn_info_params());
        assert_eq!(packet.len(), CONN_INFO_SIZE);
        assert_eq!(&packet[0x26..0x28], &[0x10, 0x80]);
        assert_eq!(&packet[0x70..0x74], &[0x01, 0x01, 0x04, 0x04]);
        assert_eq!(read_u32_be(&packet, 0x74), 12_000);
        assert_eq!(read_u32_be(&packet, 0x78), 12_000);
        assert_eq!(read_u32_be(&packet, 0x7C), 50_010);
        assert_eq!(read_u32_be(&packet, 0x80), 50_011);
        assert_eq!(read_u32_be(&packet, 0x84), 0x96);
        assert_eq!(packet[0x88], 0x01);
    }

    #[test]
    fn conn_info_view_round_trip() {
        let params = sample_conn_info_params();
        let packet = conn_info_packet(&params);
        let view = ConnInfoView::parse(&packet).unwrap();
        assert_eq!(view.mac, params.mac);
        assert_eq!(view.rig_name(), "IC-705");
        assert_eq!(view.token, params.token);
        assert_eq!(view.token_request, params.token_request);
        // Byte 0x60 carries the obfuscated username in an outbound packet;
        // the busy flag only means something on inbound packets.
        assert!(view.busy);
    }

    #[test]
    fn conn_info_busy_indicator() {
        let mut data = vec![0u8; CONN_INFO_SIZE];
        write_u32_le(&mut data, 0x00, CONN_INFO_SIZE as u32);
        assert!(!ConnInfoView::parse(&data).unwrap().busy);
        data[0x60] = 0x01;
        assert!(ConnInfoView::parse(&data).unwrap().busy);
    }

    // -- capabilities -------------------------------------------------------

    #[test]
    fn capabilities_record_extraction() {
        let mut data = vec![0u8; CAPABILITIES_SIZE];
        write_u32_le(&mut data, 0x00, CAPABILITIES_SIZE as u32);
        let base = 0x42;
        data[base + 0x10..base + 0x16].copy_from_slice(b"IC-705");
        data[base + 0x30..base + 0x39].copy_from_slice(b"ICOM_VAUD");
        data[base + 0x52] = 0xA4;
        write_u16_be(&mut data, base + 0x53, 12_000);
        write_u16_be(&mut data, base + 0x55, 12_000);
        data[base + 0x57] = 0x01;

        let view = CapabilitiesView::parse(&data).unwrap();
        assert_eq!(view.radios.len(), 1);
        let radio = &view.radios[0];
        assert_eq!(radio.rig_name, "IC-705");
        assert_eq!(radio.audio_name, "ICOM_VAUD");
        assert_eq!(radio.civ_address, 0xA4);
        assert_eq!(radio.rx_sample_rate, 12_000);
        assert!(radio.supports_tx);
    }

    // -- CI-V ---------------------------------------------------------------

    #[test]
    fn civ_round_trip() {
        let payload = [0xFE, 0xFE, 0xA4, 0xE0, 0x03, 0xFD];
        let packet = civ_packet(&payload, 0x0105, 1, 2);
        assert_eq!(packet.len(), CIV_HEADER_SIZE + payload.len());
        assert_eq!(packet[0x10], 0xC1);
        // civ_len little-endian; civSeq big-endian.
        assert_eq!(read_u16_le(&packet, 0x11), payload.len() as u16);
        assert_eq!(&packet[0x13..0x15], &[0x01, 0x05]);
        let view = CivView::parse(&packet).unwrap();
        assert_eq!(view.civ_seq, 0x0105);
        assert_eq!(view.payload, &payload);
    }

    #[test]
    fn civ_rejects_bad_marker() {
        let mut packet = civ_packet(&[0xFD], 0, 1, 2);
        packet[0x10] = 0xC0;
        assert!(CivView::parse(&packet).is_err());
    }

    #[test]
    fn civ_rejects_length_mismatch() {
        let mut packet = civ_packet(&[0xFE, 0xFD], 0, 1, 2);
        write_u16_le(&mut packet, 0x11, 5);
        assert!(CivView::parse(&packet).is_err());
    }

    #[test]
    fn civ_rejects_retransmit_type() {
        let mut packet = civ_packet(&[0xFD], 0, 1, 2);
        write_u16_le(&mut packet, 0x04, ControlType::Retransmit.as_u16());
        assert!(CivView::parse(&packet).is_err());
    }

    // -- audio --------------------------------------------------------------

    #[test]
    fn audio_160_byte_identity() {
        // A radio-style 160-byte frame: identity bytes 97 81, dataLen A0 BE.
        let pcm = vec![0x55u8; 160];
        let packet = audio_packet(&pcm, 1, 1, 2);
        assert_eq!(&packet[0x10..0x18], &[0x97, 0x81, 0x00, 0x01, 0x00, 0x00, 0x00, 0xA0]);
        let view = AudioView::parse(&packet).unwrap();
        assert_eq!(view.send_seq, 1);
        assert_eq!(view.payload.len(), 160);
    }

    #[test]
    fn audio_decode_spec_pattern() {
        // Bytes 0x10..0x17 = 00 80 00 01 00 00 00 A0 followed by 160 bytes
        // of sample data must decode to a 160-byte audio payload.
        let mut data = vec![0u8; AUDIO_HEADER_SIZE + 160];
        let len = data.len() as u32;
        write_u32_le(&mut data, 0x00, len);
        data[0x10..0x18].copy_from_slice(&[0x00, 0x80, 0x00, 0x01, 0x00, 0x00, 0x00, 0xA0]);
        for (i, byte) in data[AUDIO_HEADER_SIZE..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        let view = AudioView::parse(&data).unwrap();
        assert_eq!(view.send_seq, 1);
        assert_eq!(view.payload.len(), 160);
        assert_eq!(view.payload[1], 1);
    }

    #[test]
    fn audio_tx_frame_identity() {
        // Our 480-byte transmit frames use the 00 80 identity.
        let pcm = vec![0u8; 480];
        let packet = audio_packet(&pcm, 3, 1, 2);
        assert_eq!(&packet[0x10..0x12], &[0x00, 0x80]);
        assert_eq!(read_u16_be(&packet, 0x16), 480);
        AudioView::parse(&packet).unwrap();
    }

    #[test]
    fn audio_rejects_bad_identity() {
        let mut packet = audio_packet(&[0u8; 16], 0, 1, 2);
        packet[0x11] = 0x7F;
        assert!(AudioView::parse(&packet).is_err());
    }

    #[test]
    fn audio_rejects_length_mismatch() {
        let mut packet = audio_packet(&[0u8; 16], 0, 1, 2);
        write_u16_be(&mut packet, 0x16, 17);
        assert!(AudioView::parse(&packet).is_err());
    }

    #[test]
    fn audio_rejects_oversize_declared_length() {
        let mut data = vec![0u8; AUDIO_HEADER_SIZE + MAX_AUDIO_PAYLOAD + 1];
        let len = data.len() as u32;
        write_u32_le(&mut data, 0x00, len);
        data[0x10] = 0x00;
        data[0x11] = 0x80;
        write_u16_be(&mut data, 0x16, (MAX_AUDIO_PAYLOAD + 1) as u16);
        assert!(AudioView::parse(&data).is_err());
    }

    // -- retransmit ---------------------------------------------------------

    #[test]
    fn retransmit_single_uses_header_seq() {
        let packet = control_packet(ControlType::Retransmit, 0x0042, 1, 2);
        assert_eq!(retransmit_seqs(&packet).unwrap(), vec![0x0042]);
    }

    #[test]
    fn retransmit_range_parses_le_words() {
        let mut data = vec![0u8; 0x18];
        write_u32_le(&mut data, 0x00, 0x18);
        write_u16_le(&mut data, 0x04, ControlType::Retransmit.as_u16());
        for (i, seq) in [0x0010u16, 0x0011, 0x0012, 0x0013].iter().enumerate() {
            write_u16_le(&mut data, 0x10 + i * 2, *seq);
        }
        assert_eq!(
            retransmit_seqs(&data).unwrap(),
            vec![0x0010, 0x0011, 0x0012, 0x0013]
        );
    }

    #[test]
    fn retransmit_rejects_other_types() {
        let packet = control_packet(ControlType::Null, 5, 1, 2);
        assert!(retransmit_seqs(&packet).is_err());
    }
}
