//! Audio sub-session: drift-compensated 50 Hz transmit scheduler.
//!
//! The radio requires a continuous 50 Hz packet stream while the connection
//! is up: one 20 ms frame of 240 samples (16-bit little-endian PCM at
//! 12 kHz) per packet, silence when there is nothing to say. The scheduler
//! never blocks waiting for data.
//!
//! Drift control: each frame's ideal send instant is computed from the
//! scheduler start time (`t0 + (n + 1) * 20 ms`), never by accumulating
//! increments, so scheduler jitter on one frame cannot leak into the next.
//! The wait uses a coarse timer sleep until about a millisecond before the
//! deadline and cooperative yields inside that window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use icomnet_proto::packets;

use crate::session::Session;

/// Audio sample rate in hertz.
pub const SAMPLE_RATE: u32 = 12_000;
/// Samples per transmit frame (20 ms at 12 kHz).
pub const FRAME_SAMPLES: usize = 240;
/// Bytes per transmit frame (16-bit samples).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;
/// Frame period in milliseconds.
const FRAME_MS: u64 = 20;
/// Silence frames prepended after PTT-on so the radio's jitter buffer fills
/// before real audio arrives.
pub const LEADING_SILENCE_FRAMES: usize = 3;
/// Silence frames appended at PTT-off so the tail of the audio is delivered
/// before the radio unkeys.
pub const TRAILING_SILENCE_FRAMES: usize = 5;
/// Within this window of the deadline the scheduler switches from the
/// coarse timer to cooperative yielding.
const FINE_WINDOW: Duration = Duration::from_millis(1);

/// The audio sub-session: transmit queue, scheduler, and volume.
#[derive(Debug)]
pub struct AudioSubsession {
    session: Arc<Session>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    volume: Mutex<f32>,
    audio_seq: Mutex<u16>,
    scheduler: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AudioSubsession {
    /// Wrap the audio session.
    pub fn new(session: Arc<Session>) -> Self {
        AudioSubsession {
            session,
            queue: Mutex::new(VecDeque::new()),
            volume: Mutex::new(1.0),
            audio_seq: Mutex::new(0),
            scheduler: StdMutex::new(None),
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    // -- queueing -----------------------------------------------------------

    /// Queue caller-supplied 16-bit PCM for transmission, sliced into
    /// 240-sample frames. A final short frame is zero-padded.
    pub async fn enqueue_pcm16(&self, samples: &[i16]) {
        self.push_frames(samples).await;
    }

    /// Queue float samples in `[-1.0, 1.0]` for transmission. Samples are
    /// clipped, scaled by the configured volume, and converted to 16-bit.
    /// With `leading_silence`, three silence frames precede the audio
    /// (used right after PTT-on).
    pub async fn enqueue_float32(&self, samples: &[f32], leading_silence: bool) {
        if leading_silence {
            self.push_silence(LEADING_SILENCE_FRAMES).await;
        }
        let volume = *self.volume.lock().await;
        let pcm: Vec<i16> = samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * volume * 32767.0) as i16)
            .collect();
        self.push_frames(&pcm).await;
    }

    /// Append the trailing silence that flushes the end of the audio out of
    /// the radio's buffer; called when PTT is turned off. The scheduler
    /// keeps running.
    pub async fn end_transmission(&self) {
        self.push_silence(TRAILING_SILENCE_FRAMES).await;
    }

    /// Set the transmit volume applied to float input. Clamped to
    /// `[0.0, 1.0]`; PCM input is never scaled.
    pub async fn set_volume(&self, volume: f32) {
        *self.volume.lock().await = volume.clamp(0.0, 1.0);
    }

    /// Frames currently waiting to be sent.
    pub async fn queued_frames(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drop all queued frames.
    pub async fn clear_queue(&self) {
        self.queue.lock().await.clear();
    }

    async fn push_frames(&self, samples: &[i16]) {
        let mut queue = self.queue.lock().await;
        for chunk in samples.chunks(FRAME_SAMPLES) {
            let mut frame = vec![0u8; FRAME_BYTES];
            for (i, &sample) in chunk.iter().enumerate() {
                frame[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
            }
            queue.push_back(frame);
        }
    }

    async fn push_silence(&self, frames: usize) {
        let mut queue = self.queue.lock().await;
        for _ in 0..frames {
            queue.push_back(vec![0u8; FRAME_BYTES]);
        }
    }

    // -- scheduler ----------------------------------------------------------

    /// Whether the 50 Hz scheduler is running.
    pub fn is_running(&self) -> bool {
        self.scheduler.lock().expect("scheduler lock").is_some()
    }

    /// Start the 50 Hz send loop. Each tick sends the next queued frame,
    /// or a silence frame when the queue is empty.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock().expect("scheduler lock");
        if slot.is_some() {
            return;
        }
        let sub = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            sub.run_scheduler(token).await;
        });
        *slot = Some((cancel, handle));
    }

    /// Stop the scheduler and drop any queued frames. Only done on full
    /// disconnect; unkeying PTT goes through [`end_transmission`](Self::end_transmission)
    /// instead.
    pub async fn stop(&self) {
        let taken = self.scheduler.lock().expect("scheduler lock").take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            handle.abort();
        }
        self.clear_queue().await;
    }

    /// Stop the scheduler and rewind counters; part of the pre-connect
    /// reset.
    pub async fn reset(&self) {
        self.stop().await;
        *self.audio_seq.lock().await = 0;
    }

    async fn run_scheduler(self: Arc<Self>, cancel: CancellationToken) {
        let t0 = Instant::now();
        let mut frame_index: u64 = 0;
        tracing::debug!("audio scheduler started");

        loop {
            // Ideal time computed from t0 so drift never accumulates.
            let ideal = t0 + Duration::from_millis(FRAME_MS * (frame_index + 1));

            // Coarse sleep to just short of the deadline.
            let coarse = ideal.checked_sub(FINE_WINDOW).unwrap_or(t0);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(coarse)) => {}
            }
            // Cooperative yield inside the final window.
            while Instant::now() < ideal {
                if cancel.is_cancelled() {
                    tracing::debug!("audio scheduler stopped");
                    return;
                }
                tokio::task::yield_now().await;
            }

            let frame = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            }
            .unwrap_or_else(|| vec![0u8; FRAME_BYTES]);

            let seq = {
                let mut seq = self.audio_seq.lock().await;
                let current = *seq;
                *seq = seq.wrapping_add(1);
                current
            };
            let (local, remote) = self.session.ids().await;
            let packet = packets::audio_packet(&frame, seq, local, remote);
            if let Err(e) = self.session.send_tracked(packet).await {
                tracing::debug!(error = %e, "audio scheduler stopped on send error");
                break;
            }
            frame_index += 1;
        }
        tracing::debug!("audio scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icomnet_core::SessionKind;
    use icomnet_proto::packets::AudioView;
    use icomnet_proto::wire::read_u16_be;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    async fn subsession_with_peer() -> (Arc<AudioSubsession>, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = Arc::new(Session::new(SessionKind::Audio));
        let (tx, _rx) = mpsc::channel(32);
        session.endpoint().open(tx).await.unwrap();
        session
            .endpoint()
            .set_remote(peer.local_addr().unwrap())
            .await;
        session.reset().await;
        session.set_remote_id(0x77).await;
        (Arc::new(AudioSubsession::new(session)), peer)
    }

    async fn recv_packet(peer: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("timed out waiting for audio packet")
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn pcm16_is_sliced_and_padded() {
        let (sub, _peer) = subsession_with_peer().await;
        // 250 samples: one full frame plus a 10-sample tail.
        let samples = vec![0x0102i16; 250];
        sub.enqueue_pcm16(&samples).await;
        assert_eq!(sub.queued_frames().await, 2);

        let queue = sub.queue.lock().await;
        let tail = &queue[1];
        assert_eq!(tail.len(), FRAME_BYTES);
        // 10 real samples little-endian, the rest zero padding.
        assert_eq!(&tail[..2], &[0x02, 0x01]);
        assert_eq!(&tail[18..20], &[0x02, 0x01]);
        assert!(tail[20..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn float32_scales_and_clips() {
        let (sub, _peer) = subsession_with_peer().await;
        sub.enqueue_float32(&[1.0, -1.0, 2.0, -2.0, 0.5], false).await;

        let queue = sub.queue.lock().await;
        let frame = &queue[0];
        let sample = |i: usize| i16::from_le_bytes([frame[i * 2], frame[i * 2 + 1]]);
        assert_eq!(sample(0), 32767);
        assert_eq!(sample(1), -32767);
        // Out-of-range input clips to full scale.
        assert_eq!(sample(2), 32767);
        assert_eq!(sample(3), -32767);
        assert_eq!(sample(4), 16383);
    }

    #[tokio::test]
    async fn volume_attenuates_float_input() {
        let (sub, _peer) = subsession_with_peer().await;
        sub.set_volume(0.5).await;
        sub.enqueue_float32(&[1.0], false).await;

        let queue = sub.queue.lock().await;
        let sample = i16::from_le_bytes([queue[0][0], queue[0][1]]);
        assert_eq!(sample, 16383);
    }

    #[tokio::test]
    async fn leading_and_trailing_silence_counts() {
        let (sub, _peer) = subsession_with_peer().await;
        sub.enqueue_float32(&[0.25; 240], true).await;
        assert_eq!(sub.queued_frames().await, LEADING_SILENCE_FRAMES + 1);
        {
            let queue = sub.queue.lock().await;
            for i in 0..LEADING_SILENCE_FRAMES {
                assert!(queue[i].iter().all(|&b| b == 0), "frame {i} must be silent");
            }
        }

        sub.end_transmission().await;
        assert_eq!(
            sub.queued_frames().await,
            LEADING_SILENCE_FRAMES + 1 + TRAILING_SILENCE_FRAMES
        );
    }

    #[tokio::test]
    async fn scheduler_sends_silence_when_queue_is_empty() {
        let (sub, peer) = subsession_with_peer().await;
        sub.start();
        assert!(sub.is_running());

        let packet = recv_packet(&peer).await;
        let view = AudioView::parse(&packet).unwrap();
        assert_eq!(view.payload.len(), FRAME_BYTES);
        assert!(view.payload.iter().all(|&b| b == 0));

        sub.stop().await;
        assert!(!sub.is_running());
    }

    #[tokio::test]
    async fn scheduler_drains_queue_in_order_with_incrementing_seq() {
        let (sub, peer) = subsession_with_peer().await;
        let mut samples = vec![0x1111i16; FRAME_SAMPLES];
        samples.extend(vec![0x2222i16; FRAME_SAMPLES]);
        sub.enqueue_pcm16(&samples).await;
        sub.start();

        let first = recv_packet(&peer).await;
        let second = recv_packet(&peer).await;
        assert_eq!(read_u16_be(&first, 0x12), 0);
        assert_eq!(read_u16_be(&second, 0x12), 1);
        assert_eq!(&first[0x18..0x1A], &[0x11, 0x11]);
        assert_eq!(&second[0x18..0x1A], &[0x22, 0x22]);

        sub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frame_rate_is_close_to_50_hz() {
        let (sub, peer) = subsession_with_peer().await;
        sub.start();

        // Count frames over roughly 1.2 seconds of wall clock.
        let started = Instant::now();
        let mut count = 0u32;
        while started.elapsed() < Duration::from_millis(1200) {
            recv_packet(&peer).await;
            count += 1;
        }
        sub.stop().await;

        // 60 frames expected; allow scheduler warm-up and test jitter.
        assert!((50..=70).contains(&count), "got {count} frames");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "runs for a full minute to measure cumulative drift"]
    async fn drift_stays_under_50ms_over_one_minute() {
        let (sub, peer) = subsession_with_peer().await;
        sub.start();

        const FRAMES: u32 = 3000;
        let started = Instant::now();
        for _ in 0..FRAMES {
            recv_packet(&peer).await;
        }
        let elapsed = started.elapsed();
        sub.stop().await;

        let ideal = Duration::from_millis(FRAME_MS * FRAMES as u64);
        let drift = if elapsed > ideal {
            elapsed - ideal
        } else {
            ideal - elapsed
        };
        assert!(drift < Duration::from_millis(50), "drift was {drift:?}");
    }

    #[tokio::test]
    async fn stop_clears_queue() {
        let (sub, _peer) = subsession_with_peer().await;
        sub.enqueue_pcm16(&vec![1i16; FRAME_SAMPLES * 4]).await;
        sub.start();
        sub.stop().await;
        assert_eq!(sub.queued_frames().await, 0);
    }
}
