//! Constant-time comparisons.
//!
//! Handshake proofs and pinned fingerprints are compared with these helpers
//! so that execution time depends only on input length, never content.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Returns `true` if slices are equal, `false` otherwise.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Timing-safe 32-byte array comparison (HMAC proofs, fingerprints).
#[must_use]
#[inline(never)]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq_equal() {
        assert!(ct_eq(b"same bytes", b"same bytes"));
    }

    #[test]
    fn test_ct_eq_different() {
        assert!(!ct_eq(b"same bytes", b"diff bytes"));
    }

    #[test]
    fn test_ct_eq_length_mismatch() {
        assert!(!ct_eq(b"short", b"longer input"));
    }

    #[test]
    fn test_verify_32() {
        let a = [7u8; 32];
        let mut b = [7u8; 32];
        assert!(verify_32(&a, &b));

        b[31] ^= 1;
        assert!(!verify_32(&a, &b));
    }
}
