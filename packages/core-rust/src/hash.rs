//! Adler-32 checksum used to guard every frame payload on the wire.
//!
//! The value is identical to zlib's `adler32(data) & 0xffffffff`; workers
//! compute it with zlib, so the two must agree bit for bit.

/// Largest prime smaller than 2^16.
const MOD_ADLER: u32 = 65_521;

/// Largest number of bytes that can be summed before `b` may overflow a
/// `u32` (zlib's `NMAX`).
const NMAX: usize = 5_552;

/// Computes the Adler-32 checksum of `data`.
///
/// # Examples
///
/// ```
/// use jobrelay_core::hash::adler32;
///
/// assert_eq!(adler32(b""), 1);
/// assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
/// ```
#[must_use]
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

/// Returns `true` if `data` hashes to `expected`.
#[must_use]
pub fn verify(data: &[u8], expected: u32) -> bool {
    adler32(data) == expected
}
