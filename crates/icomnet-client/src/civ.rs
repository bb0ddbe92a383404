//! CI-V sub-session: outbound frame transport and keep-alive.
//!
//! A thin layer over the CI-V [`Session`] that numbers outbound CI-V and
//! open/close packets with its own sequence counter and runs the open/close
//! watchdog. The radio can stop speaking CI-V without closing the session;
//! the watchdog re-sends an Open packet when the session has been silent
//! too long, which revives the stream.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use icomnet_core::Result;
use icomnet_proto::packets;

use crate::session::Session;

/// Watchdog tick.
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);
/// Silence threshold after which an Open packet is re-sent.
const WATCHDOG_SILENCE: Duration = Duration::from_millis(2000);

/// The CI-V sub-session.
#[derive(Debug)]
pub struct CivSubsession {
    session: Arc<Session>,
    civ_seq: Mutex<u16>,
    watchdog: StdMutex<Option<JoinHandle<()>>>,
}

impl CivSubsession {
    /// Wrap the CI-V session.
    pub fn new(session: Arc<Session>) -> Self {
        CivSubsession {
            session,
            civ_seq: Mutex::new(0),
            watchdog: StdMutex::new(None),
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn next_civ_seq(&self) -> u16 {
        let mut seq = self.civ_seq.lock().await;
        let current = *seq;
        *seq = seq.wrapping_add(1);
        current
    }

    /// Send a raw CI-V frame (or fragment) over the sub-session.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let civ_seq = self.next_civ_seq().await;
        let (local, remote) = self.session.ids().await;
        let packet = packets::civ_packet(frame, civ_seq, local, remote);
        self.session.send_tracked(packet).await?;
        Ok(())
    }

    /// Send the Open keep-alive (magic 0x04).
    pub async fn send_open(&self) -> Result<()> {
        let civ_seq = self.next_civ_seq().await;
        let (local, remote) = self.session.ids().await;
        let packet = packets::open_close_packet(true, civ_seq, local, remote);
        self.session.send_tracked(packet).await?;
        Ok(())
    }

    /// Send the Close packet (magic 0x00), used during shutdown.
    pub async fn send_close(&self) -> Result<()> {
        let civ_seq = self.next_civ_seq().await;
        let (local, remote) = self.session.ids().await;
        let packet = packets::open_close_packet(false, civ_seq, local, remote);
        self.session.send_tracked(packet).await?;
        Ok(())
    }

    /// Whether the watchdog is currently running.
    pub fn watchdog_running(&self) -> bool {
        self.watchdog.lock().expect("watchdog lock").is_some()
    }

    /// Every 500 ms, if more than 2 s have passed since the session last
    /// received anything, send an Open packet.
    pub fn start_watchdog(self: &Arc<Self>) {
        let sub = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if sub.session.receive_age().await <= WATCHDOG_SILENCE {
                    continue;
                }
                tracing::debug!("CI-V session silent, re-sending open");
                if let Err(e) = sub.send_open().await {
                    tracing::debug!(error = %e, "CI-V watchdog stopped");
                    break;
                }
            }
        });
        let mut slot = self.watchdog.lock().expect("watchdog lock");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop the watchdog.
    pub fn stop_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().expect("watchdog lock").take() {
            handle.abort();
        }
    }

    /// Stop the watchdog and rewind the sequence counter; part of the
    /// pre-connect reset.
    pub async fn reset(&self) {
        self.stop_watchdog();
        *self.civ_seq.lock().await = 0;
    }
}
