//! Credential obfuscation for the login exchange.
//!
//! The radio does not accept plain-text credentials: username and password
//! are mapped through a fixed substitution table before they are placed in
//! the login packet, and the same transform produces the user field of the
//! connection-info reply. This is obfuscation, not encryption -- the table
//! is public and the transform is trivially reversible.

/// The fixed 128-byte substitution table.
///
/// Indices outside the printable range (below 0x20 and above 0x7E) map to
/// zero; the wrap step in [`obfuscate`] keeps shifted printable input
/// inside the table.
const SUBSTITUTION: [u8; 128] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x47, 0x5D, 0x4C, 0x42, 0x66, 0x20, 0x23, 0x46, 0x4E, 0x57, 0x45, 0x3D, 0x67,
    0x76, 0x60, 0x41, 0x62, 0x39, 0x59, 0x2D, 0x68, 0x7E, 0x7C, 0x65, 0x7D, 0x49, 0x29, 0x72,
    0x73, 0x78, 0x21, 0x6E, 0x5A, 0x5E, 0x4A, 0x3E, 0x71, 0x2C, 0x2A, 0x54, 0x3C, 0x3A, 0x63,
    0x4F, 0x43, 0x75, 0x27, 0x79, 0x5B, 0x35, 0x70, 0x48, 0x6B, 0x56, 0x6F, 0x34, 0x32, 0x6C,
    0x30, 0x61, 0x6D, 0x7B, 0x2F, 0x4B, 0x64, 0x38, 0x2B, 0x2E, 0x50, 0x40, 0x3F, 0x55, 0x33,
    0x37, 0x25, 0x77, 0x24, 0x26, 0x74, 0x6A, 0x28, 0x53, 0x4D, 0x69, 0x22, 0x5C, 0x44, 0x31,
    0x36, 0x58, 0x3B, 0x7A, 0x51, 0x5F, 0x52, 0x00,
];

/// Obfuscate a credential into the fixed 16-byte wire form.
///
/// For each input byte at position `i`: shift by `i` modulo 256, wrap
/// values above 126 back into the printable range (`32 + p % 127`), then
/// substitute through the table. Input longer than 16 bytes is truncated;
/// shorter input leaves the remaining bytes zero.
pub fn obfuscate(input: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, &byte) in input.as_bytes().iter().take(16).enumerate() {
        let mut p = (byte as usize + i) & 0xFF;
        if p > 126 {
            p = 32 + p % 127;
        }
        out[i] = SUBSTITUTION.get(p).copied().unwrap_or(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Golden vectors observed on-wire against real hardware.

    #[test]
    fn golden_icom() {
        let expected: [u8; 16] = [
            0x37, 0x50, 0x53, 0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        assert_eq!(obfuscate("icom"), expected);
    }

    #[test]
    fn golden_icomicom() {
        let expected: [u8; 16] = [
            0x37, 0x50, 0x53, 0x28, 0x26, 0x33, 0x5C, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        assert_eq!(obfuscate("icomicom"), expected);
    }

    #[test]
    fn empty_input_is_all_zero() {
        assert_eq!(obfuscate(""), [0u8; 16]);
    }

    #[test]
    fn long_input_truncates_at_16() {
        let long = "abcdefghijklmnopqrstuvwxyz";
        let truncated = &long[..16];
        assert_eq!(obfuscate(long), obfuscate(truncated));
    }

    #[test]
    fn shift_wraps_above_126() {
        // '~' (0x7E) shifted past 126 must wrap back into the table, not
        // index past its end.
        let out = obfuscate("~~~~~~~~~~~~~~~~");
        // position 0: 0x7E -> table[0x7E] = 0x52.
        assert_eq!(out[0], 0x52);
        // position 1: 0x7F wraps to 32 + 127 % 127 = 32 -> table[0x20].
        assert_eq!(out[1], 0x47);
    }

    #[test]
    fn position_affects_output() {
        // The same character obfuscates differently at different offsets.
        let out = obfuscate("aa");
        assert_ne!(out[0], out[1]);
    }
}
