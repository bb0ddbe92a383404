//! UDP endpoint for one protocol session.
//!
//! [`UdpEndpoint`] wraps a [`tokio::net::UdpSocket`] with the small amount
//! of policy a session needs: bind to an OS-assigned port, expose that port
//! (the connection-info reply advertises it to the radio), send to a
//! reprogrammable remote, and deliver inbound datagrams -- tagged with their
//! session and receive time -- into the controller's demux channel.
//!
//! There is no retry policy here. Retransmission is a session-level concern;
//! the endpoint surfaces errors rather than swallowing them.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use icomnet_core::{Error, Result, SessionKind};

/// Largest datagram the protocol produces (audio header + maximum payload,
/// rounded up generously).
const RECV_BUFFER: usize = 4096;

/// One inbound datagram, as delivered to the controller's demux.
#[derive(Debug)]
pub struct Datagram {
    /// The session whose socket received the datagram.
    pub kind: SessionKind,
    /// The raw datagram bytes.
    pub data: Vec<u8>,
    /// Where the datagram came from.
    pub source: SocketAddr,
    /// When the datagram was received.
    pub received_at: Instant,
}

/// A UDP socket owned by exactly one session.
///
/// The endpoint may be opened and closed repeatedly. The CI-V and audio
/// endpoints are opened once at client construction -- their OS-assigned
/// ports must be stable so they can be advertised in the connection-info
/// reply -- while the control endpoint is opened per connect attempt.
#[derive(Debug)]
pub struct UdpEndpoint {
    kind: SessionKind,
    socket: Mutex<Option<std::sync::Arc<UdpSocket>>>,
    remote: Mutex<Option<SocketAddr>>,
    local_port: AtomicU16,
    recv_task: StdMutex<Option<JoinHandle<()>>>,
}

impl UdpEndpoint {
    /// Create a closed endpoint for the given session.
    pub fn new(kind: SessionKind) -> Self {
        UdpEndpoint {
            kind,
            socket: Mutex::new(None),
            remote: Mutex::new(None),
            local_port: AtomicU16::new(0),
            recv_task: StdMutex::new(None),
        }
    }

    /// Bind the socket (any IPv4 port) and start the receive loop, which
    /// forwards datagrams into `demux_tx`. Returns the OS-assigned local
    /// port. A second call on an already-open endpoint is a no-op that
    /// returns the existing port.
    pub async fn open(&self, demux_tx: mpsc::Sender<Datagram>) -> Result<u16> {
        let mut slot = self.socket.lock().await;
        if slot.is_some() {
            return Ok(self.local_port.load(Ordering::SeqCst));
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            tracing::error!(session = %self.kind, error = %e, "failed to bind UDP socket");
            Error::Io(e)
        })?;
        let local_port = socket.local_addr().map_err(Error::Io)?.port();
        let socket = std::sync::Arc::new(socket);

        tracing::debug!(session = %self.kind, port = local_port, "UDP socket bound");

        let kind = self.kind;
        let recv_socket = std::sync::Arc::clone(&socket);
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUFFER];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((n, source)) => {
                        let datagram = Datagram {
                            kind,
                            data: buf[..n].to_vec(),
                            source,
                            received_at: Instant::now(),
                        };
                        if demux_tx.send(datagram).await.is_err() {
                            // Demux gone; the client is shutting down.
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(session = %kind, error = %e, "UDP recv error");
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.recv_task.lock().expect("recv task lock").replace(handle) {
            old.abort();
        }
        *slot = Some(socket);
        self.local_port.store(local_port, Ordering::SeqCst);
        Ok(local_port)
    }

    /// Stop the receive loop and drop the socket. The local port is
    /// forgotten; a later [`open`](Self::open) binds a fresh one.
    pub async fn close(&self) {
        if let Some(task) = self.recv_task.lock().expect("recv task lock").take() {
            task.abort();
        }
        *self.socket.lock().await = None;
        *self.remote.lock().await = None;
        self.local_port.store(0, Ordering::SeqCst);
        tracing::debug!(session = %self.kind, "UDP socket closed");
    }

    /// Point the endpoint at a peer address.
    pub async fn set_remote(&self, addr: SocketAddr) {
        tracing::debug!(session = %self.kind, remote = %addr, "remote address set");
        *self.remote.lock().await = Some(addr);
    }

    /// The current peer address, if set.
    pub async fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock().await
    }

    /// The locally bound port, or 0 if the endpoint is closed.
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    /// Send one datagram to the configured remote.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let socket = {
            let slot = self.socket.lock().await;
            slot.as_ref().map(std::sync::Arc::clone)
        }
        .ok_or(Error::NotConnected)?;
        let remote = self.remote().await.ok_or(Error::NotConnected)?;

        tracing::trace!(
            session = %self.kind,
            remote = %remote,
            bytes = data.len(),
            "sending datagram"
        );
        socket
            .send_to(data, remote)
            .await
            .map_err(|e| Error::Transport(format!("send to {remote} failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn open_assigns_port_and_is_idempotent() {
        let endpoint = UdpEndpoint::new(SessionKind::Control);
        let (tx, _rx) = mpsc::channel(8);
        let port = endpoint.open(tx.clone()).await.unwrap();
        assert_ne!(port, 0, "OS should assign a nonzero port");
        assert_eq!(endpoint.open(tx).await.unwrap(), port);
        assert_eq!(endpoint.local_port(), port);
    }

    #[tokio::test]
    async fn send_requires_remote() {
        let endpoint = UdpEndpoint::new(SessionKind::Civ);
        let (tx, _rx) = mpsc::channel(8);
        endpoint.open(tx).await.unwrap();
        let result = endpoint.send(b"hello").await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn send_requires_open_socket() {
        let endpoint = UdpEndpoint::new(SessionKind::Civ);
        let result = endpoint.send(b"hello").await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn loopback_delivery_tags_session_and_source() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let endpoint = UdpEndpoint::new(SessionKind::Audio);
        let (tx, mut rx) = mpsc::channel(8);
        let port = endpoint.open(tx).await.unwrap();
        endpoint.set_remote(peer_addr).await;

        // Outbound reaches the peer.
        endpoint.send(b"CQ CQ").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"CQ CQ");
        assert_eq!(from.port(), port);

        // Inbound arrives on the demux channel with metadata.
        peer.send_to(b"73", from).await.unwrap();
        let datagram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.kind, SessionKind::Audio);
        assert_eq!(datagram.data, b"73");
        assert_eq!(datagram.source, peer_addr);
    }

    #[tokio::test]
    async fn close_then_reopen_gets_fresh_socket() {
        let endpoint = UdpEndpoint::new(SessionKind::Control);
        let (tx, _rx) = mpsc::channel(8);
        endpoint.open(tx.clone()).await.unwrap();
        endpoint.close().await;
        assert_eq!(endpoint.local_port(), 0);
        assert!(endpoint.remote().await.is_none());
        let port = endpoint.open(tx).await.unwrap();
        assert_ne!(port, 0);
    }
}
