//! CI-V frame reassembly.
//!
//! CI-V frames are delimited by a two-byte preamble (`FE FE`) and a
//! terminator (`FD`):
//!
//! ```text
//! 0xFE 0xFE <dst> <src> <cmd> [<data>...] 0xFD
//! ```
//!
//! A UDP payload may contain zero, one, or several frames, and a frame may
//! split across packets. [`CivReassembler`] accumulates payload bytes and
//! emits each complete frame exactly once, in wire order. The core
//! transports frames; it does not interpret them.

use bytes::Bytes;

/// Preamble byte, repeated twice at the start of every CI-V frame.
pub const PREAMBLE: u8 = 0xFE;

/// Frame terminator byte.
pub const TERMINATOR: u8 = 0xFD;

/// Noise tolerated ahead of a preamble before old bytes are discarded.
const NOISE_LIMIT: usize = 1024;

/// Stateful reassembler for CI-V frame boundaries in a byte stream.
#[derive(Debug, Default)]
pub struct CivReassembler {
    buf: Vec<u8>,
}

impl CivReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        CivReassembler::default()
    }

    /// Discard any partial frame, e.g. when a session is reset.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Append inbound CI-V payload bytes and return every frame completed
    /// by them, preamble and terminator inclusive.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let start = match find_preamble(&self.buf) {
                Some(pos) => pos,
                None => {
                    if self.buf.len() > NOISE_LIMIT {
                        // Keep only the trailing byte: it may be the first
                        // half of a preamble split across packets.
                        tracing::trace!(dropped = self.buf.len() - 1, "CI-V noise discarded");
                        if let Some(&last) = self.buf.last() {
                            self.buf.clear();
                            self.buf.push(last);
                        }
                    }
                    return frames;
                }
            };

            // Drop inter-frame noise ahead of the preamble.
            if start > 0 {
                self.buf.drain(..start);
            }

            // Scan for the terminator past the preamble.
            let term = match self.buf[2..].iter().position(|&b| b == TERMINATOR) {
                Some(rel) => 2 + rel,
                None => return frames, // frame incomplete; wait for more bytes
            };

            frames.push(Bytes::copy_from_slice(&self.buf[..=term]));
            self.buf.drain(..=term);
        }
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Position of the first `FE FE` pair, if any.
fn find_preamble(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|pair| pair[0] == PREAMBLE && pair[1] == PREAMBLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_to_vecs(frames: Vec<Bytes>) -> Vec<Vec<u8>> {
        frames.into_iter().map(|f| f.to_vec()).collect()
    }

    #[test]
    fn single_complete_frame() {
        let mut reassembler = CivReassembler::new();
        let frame = [0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD];
        let out = reassembler.push(&frame);
        assert_eq!(frames_to_vecs(out), vec![frame.to_vec()]);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn two_frames_in_one_push() {
        let mut reassembler = CivReassembler::new();
        let data = [
            0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD, 0xFE, 0xFE, 0xE0, 0xA4, 0x04, 0xFD,
        ];
        let out = reassembler.push(&data);
        assert_eq!(
            frames_to_vecs(out),
            vec![
                vec![0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD],
                vec![0xFE, 0xFE, 0xE0, 0xA4, 0x04, 0xFD],
            ]
        );
    }

    #[test]
    fn frame_split_across_three_packets() {
        // Payloads FE FE E0 A4 03 FD FE FE E0 A4 | 04 FD arriving in three
        // pieces must produce exactly two frames, in order.
        let mut reassembler = CivReassembler::new();
        let mut frames = Vec::new();
        frames.extend(reassembler.push(&[0xFE, 0xFE, 0xE0, 0xA4]));
        frames.extend(reassembler.push(&[0x03, 0xFD, 0xFE, 0xFE, 0xE0, 0xA4]));
        frames.extend(reassembler.push(&[0x04, 0xFD]));
        assert_eq!(
            frames_to_vecs(frames),
            vec![
                vec![0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD],
                vec![0xFE, 0xFE, 0xE0, 0xA4, 0x04, 0xFD],
            ]
        );
    }

    #[test]
    fn every_partition_yields_the_same_frames() {
        // Feed the same two-frame stream byte by byte and in every possible
        // two-way split; the emitted frames must always match.
        let stream = [
            0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD, 0xFE, 0xFE, 0xE0, 0xA4, 0x04, 0xFD,
        ];
        let expected = vec![
            vec![0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD],
            vec![0xFE, 0xFE, 0xE0, 0xA4, 0x04, 0xFD],
        ];

        for split in 0..=stream.len() {
            let mut reassembler = CivReassembler::new();
            let mut frames = Vec::new();
            frames.extend(reassembler.push(&stream[..split]));
            frames.extend(reassembler.push(&stream[split..]));
            assert_eq!(frames_to_vecs(frames), expected, "split at {split}");
        }

        let mut reassembler = CivReassembler::new();
        let mut frames = Vec::new();
        for byte in stream {
            frames.extend(reassembler.push(&[byte]));
        }
        assert_eq!(frames_to_vecs(frames), expected);
    }

    #[test]
    fn noise_between_frames_is_discarded() {
        let mut reassembler = CivReassembler::new();
        let data = [
            0x00, 0x11, 0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD, 0xAA, 0xBB, 0xFE, 0xFE, 0xE0, 0xA4,
            0x04, 0xFD,
        ];
        let out = reassembler.push(&data);
        assert_eq!(
            frames_to_vecs(out),
            vec![
                vec![0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD],
                vec![0xFE, 0xFE, 0xE0, 0xA4, 0x04, 0xFD],
            ]
        );
    }

    #[test]
    fn incomplete_frame_is_retained() {
        let mut reassembler = CivReassembler::new();
        assert!(reassembler.push(&[0xFE, 0xFE, 0xE0, 0xA4]).is_empty());
        assert_eq!(reassembler.pending(), 4);
        let out = reassembler.push(&[0xFD]);
        assert_eq!(
            frames_to_vecs(out),
            vec![vec![0xFE, 0xFE, 0xE0, 0xA4, 0xFD]]
        );
    }

    #[test]
    fn preamble_split_survives_noise_purge() {
        let mut reassembler = CivReassembler::new();
        // Over a kilobyte of noise ending with the first preamble byte.
        let mut noise = vec![0x00u8; NOISE_LIMIT + 1];
        *noise.last_mut().unwrap() = 0xFE;
        assert!(reassembler.push(&noise).is_empty());
        // Only the trailing 0xFE survives the purge.
        assert_eq!(reassembler.pending(), 1);
        let out = reassembler.push(&[0xFE, 0xE0, 0xA4, 0x03, 0xFD]);
        assert_eq!(
            frames_to_vecs(out),
            vec![vec![0xFE, 0xFE, 0xE0, 0xA4, 0x03, 0xFD]]
        );
    }

    #[test]
    fn clear_discards_partial_frame() {
        let mut reassembler = CivReassembler::new();
        reassembler.push(&[0xFE, 0xFE, 0xE0]);
        reassembler.clear();
        assert_eq!(reassembler.pending(), 0);
        // A terminator alone after clear produces nothing.
        assert!(reassembler.push(&[0xA4, 0xFD]).is_empty());
    }
}
