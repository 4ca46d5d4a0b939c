//! Constant-time comparisons for MAC and tag verification.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Execution time depends only on slice length, not content. Slices of
/// different length compare unequal immediately; lengths are public.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Timing-safe 16-byte array comparison.
#[must_use]
#[inline(never)]
pub fn verify_16(a: &[u8; 16], b: &[u8; 16]) -> bool {
    ct_eq(a, b)
}

/// Timing-safe 32-byte array comparison.
#[must_use]
#[inline(never)]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}
