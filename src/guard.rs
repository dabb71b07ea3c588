//! Binary Guard: decides up front whether input is worth structuring.
//!
//! Opaque inputs skip tokenization entirely and travel as raw coder
//! payloads; the container stays valid either way.

use crate::config::GuardTunables;

pub const GUARD_SAMPLE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Structurable,
    Opaque,
}

#[inline]
fn is_printable(b: u8) -> bool {
    matches!(b, 0x09 | 0x0A | 0x0D | 0x20..=0x7E | 0x80..=0xFF)
}

/// Classify `input` from its first `GUARD_SAMPLE_BYTES` bytes.
pub fn classify(input: &[u8], tunables: &GuardTunables) -> GuardDecision {
    let sample = &input[..input.len().min(GUARD_SAMPLE_BYTES)];
    if sample.is_empty() {
        return GuardDecision::Opaque;
    }

    let mut nonprintable = 0usize;
    let mut nuls = 0usize;
    let mut rows = 0usize;
    for &b in sample {
        if !is_printable(b) {
            nonprintable += 1;
        }
        if b == 0x00 {
            nuls += 1;
        }
        if b == b'\n' {
            rows += 1;
        }
    }

    let ratio = nonprintable as f64 / sample.len() as f64;
    if ratio > tunables.max_nonprintable_ratio {
        return GuardDecision::Opaque;
    }
    if nuls > tunables.max_nul_bytes {
        return GuardDecision::Opaque;
    }
    if rows < tunables.min_sample_rows {
        return GuardDecision::Opaque;
    }
    GuardDecision::Structurable
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_default(input: &[u8]) -> GuardDecision {
        classify(input, &GuardTunables::default())
    }

    #[test]
    fn csv_is_structurable() {
        let input = b"a,b,c\nd,e,f\ng,h,i\n";
        assert_eq!(classify_default(input), GuardDecision::Structurable);
    }

    #[test]
    fn high_bytes_are_printable() {
        let input = "caf\u{e9},b\ncaf\u{e8},d\n".as_bytes();
        assert_eq!(classify_default(input), GuardDecision::Structurable);
    }

    #[test]
    fn control_bytes_flip_opaque() {
        let mut input = Vec::new();
        for _ in 0..100 {
            input.extend_from_slice(b"ok\n");
            input.push(0x01);
        }
        // 1 control byte per 4 bytes clears the 15% bar.
        assert_eq!(classify_default(&input), GuardDecision::Opaque);
    }

    #[test]
    fn single_nul_is_tolerated() {
        let input = b"a,b\nc,\x00\nmore,rows\n";
        assert_eq!(classify_default(input), GuardDecision::Structurable);
    }

    #[test]
    fn two_nuls_flip_opaque() {
        let input = b"a,\x00\nc,\x00\nmore,rows\n";
        assert_eq!(classify_default(input), GuardDecision::Opaque);
    }

    #[test]
    fn rowless_input_is_opaque() {
        assert_eq!(classify_default(b"one line only\n"), GuardDecision::Opaque);
        assert_eq!(classify_default(b"no terminator at all"), GuardDecision::Opaque);
        assert_eq!(classify_default(b""), GuardDecision::Opaque);
    }

    #[test]
    fn sample_is_bounded() {
        // Binary tail past the 8 KiB window must not affect the decision.
        let mut input = b"x,y\n".repeat(4096);
        input.extend(std::iter::repeat(0u8).take(1024));
        assert_eq!(classify_default(&input), GuardDecision::Structurable);
    }
}
