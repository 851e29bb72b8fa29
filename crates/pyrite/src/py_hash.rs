//! Deterministic hashing for runtime values.
//!
//! Hashing is deterministic (equivalent to running CPython with
//! `PYTHONHASHSEED=0`) so that dict/set iteration order is reproducible
//! across runs and hosts. Text and bytes hash with SipHash-1-3 under a
//! zeroed key; numbers hash modulo the Mersenne prime `2^61 - 1`.
//!
//! ## Cross-type hash invariant
//!
//! Equal values must hash equal across numeric widenings: `False == 0 ==
//! 0.0 == 0+0j` all hash to the same value. [`hash_int`] and [`hash_float`]
//! share the modular algorithm to guarantee this; bool hashing routes
//! through [`hash_int`], and a complex with zero imaginary part routes
//! through [`hash_float`].

/// Mersenne prime used for numeric hashing: `2^61 - 1`.
///
/// All numeric shapes (bool, int, float, complex) hash modulo this prime so
/// that equal values across types produce identical hashes.
const MODULUS: i64 = (1 << 61) - 1;

/// Multiplier folding the imaginary hash lane into a complex hash.
const IMAG_MULTIPLIER: i64 = 1_000_003;

/// Hashes raw bytes with SipHash-1-3 under a zero key.
///
/// Two conventions apply:
/// - empty input hashes to `0`
/// - a computed hash of `-1` is remapped to `-2` (`-1` is reserved as an
///   error sentinel by the reference implementation)
#[must_use]
pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let raw = siphash13(bytes);
    let signed = i64::from_ne_bytes(raw.to_ne_bytes());
    let adjusted = if signed == -1 { -2 } else { signed };
    u64::from_ne_bytes(adjusted.to_ne_bytes())
}

/// Hashes UTF-8 string content; same algorithm as [`hash_bytes`].
#[must_use]
pub(crate) fn hash_str(value: &str) -> u64 {
    hash_bytes(value.as_bytes())
}

/// Hashes a signed 64-bit integer.
///
/// The algorithm is sign-preserving `n % MODULUS`, with `-1` remapped to
/// `-2`. The returned `u64` is the bit-reinterpretation of the signed
/// result, matching the convention of the other hash helpers.
#[must_use]
pub(crate) fn hash_int(value: i64) -> u64 {
    u64::from_ne_bytes(hash_int_signed(value).to_ne_bytes())
}

fn hash_int_signed(value: i64) -> i64 {
    if value == 0 {
        return 0;
    }
    let sign: i64 = if value < 0 { -1 } else { 1 };
    // i64::MIN has no i64 absolute value; widen through i128 first.
    let abs = i128::from(value).unsigned_abs() as u64;
    let result = sign * ((abs % MODULUS as u64) as i64);
    if result == -1 { -2 } else { result }
}

/// Hashes an `f64`.
///
/// Integral floats delegate to [`hash_int`] so that `hash(n) ==
/// hash(float(n))` holds. Non-integral floats use a frexp decomposition
/// accumulated modulo [`MODULUS`] in 28-bit chunks. `+inf` hashes to
/// `314159`, `-inf` to `-314159`, NaN to `0`.
#[must_use]
pub(crate) fn hash_float(value: f64) -> u64 {
    u64::from_ne_bytes(hash_float_signed(value).to_ne_bytes())
}

fn hash_float_signed(value: f64) -> i64 {
    if value.is_infinite() {
        return if value > 0.0 { 314_159 } else { -314_159 };
    }
    if value.is_nan() {
        return 0;
    }

    let truncated = value.trunc();
    if value == truncated && truncated >= i64::MIN as f64 && truncated <= i64::MAX as f64 {
        return hash_int_signed(truncated as i64);
    }

    // Non-integral (or out of i64 range): process the mantissa in 28-bit
    // chunks, then rotate in the exponent.
    let (frac, exp) = frexp(value);
    let mut m = frac;
    let mut e = exp;
    let sign: i64 = if m < 0.0 {
        m = -m;
        -1
    } else {
        1
    };

    let mut x: u64 = 0;
    while m > 0.0 {
        x = ((x << 28) & (MODULUS as u64)) | (x >> 33);
        m *= 268_435_456.0; // 2^28
        e -= 28;
        let w = m as u64;
        m -= w as f64;
        x = x.wrapping_add(w);
        if x >= MODULUS as u64 {
            x -= MODULUS as u64;
        }
    }

    e %= 61;
    if e < 0 {
        e += 61;
    }
    x = ((x << e as u32) & (MODULUS as u64)) | (x >> (61 - e) as u32);

    let result = (sign * x as i64) % MODULUS;
    if result == -1 { -2 } else { result }
}

/// Hashes a complex number.
///
/// When the imaginary part is zero this reduces to [`hash_float`] of the
/// real part, preserving the cross-type invariant `hash(2+0j) == hash(2.0)`.
#[must_use]
pub(crate) fn hash_complex(real: f64, imag: f64) -> u64 {
    let real_hash = i64::from_ne_bytes(hash_float(real).to_ne_bytes());
    let imag_hash = i64::from_ne_bytes(hash_float(imag).to_ne_bytes());
    let combined = real_hash.wrapping_add(IMAG_MULTIPLIER.wrapping_mul(imag_hash));
    let adjusted = if combined == -1 { -2 } else { combined };
    u64::from_ne_bytes(adjusted.to_ne_bytes())
}

/// Mixes element hashes into a tuple hash (xxPrime-style combiner).
///
/// Fed one element hash at a time via [`TupleHasher::write`], finished with
/// [`TupleHasher::finish`]. Equal tuples hash equal because element hashes
/// already respect the cross-type invariant.
pub(crate) struct TupleHasher {
    acc: u64,
    len: u64,
}

const XXPRIME_1: u64 = 11_400_714_785_074_694_791;
const XXPRIME_2: u64 = 14_029_467_366_897_019_727;
const XXPRIME_5: u64 = 2_870_177_450_012_600_261;

impl TupleHasher {
    pub fn new() -> Self {
        Self { acc: XXPRIME_5, len: 0 }
    }

    pub fn write(&mut self, item_hash: u64) {
        self.acc = self.acc.wrapping_add(item_hash.wrapping_mul(XXPRIME_2));
        self.acc = self.acc.rotate_left(31);
        self.acc = self.acc.wrapping_mul(XXPRIME_1);
        self.len += 1;
    }

    #[must_use]
    pub fn finish(self) -> u64 {
        let mut acc = self.acc;
        acc = acc.wrapping_add(self.len ^ (XXPRIME_5 ^ 3_527_539));
        if acc == u64::MAX { 1546_275_796 } else { acc }
    }
}

/// Combines element hashes order-independently for frozenset hashing.
#[must_use]
pub(crate) fn hash_frozenset(item_hashes: impl Iterator<Item = u64>) -> u64 {
    let mut hash: u64 = 0;
    let mut len: u64 = 0;
    for h in item_hashes {
        hash ^= shuffle_bits(h);
        len += 1;
    }
    hash ^= (len.wrapping_add(1)).wrapping_mul(1_927_868_237);
    hash = hash.wrapping_mul(69_069).wrapping_add(907_133_923);
    if hash == u64::MAX { 590_923_713 } else { hash }
}

fn shuffle_bits(h: u64) -> u64 {
    ((h ^ 89_869_747) ^ (h << 16)).wrapping_mul(3_644_798_167)
}

/// Returns `(frac, exp)` such that `value == frac * 2^exp` with
/// `0.5 <= |frac| < 1.0`, equivalent to C's `frexp()`.
fn frexp(value: f64) -> (f64, i32) {
    if value == 0.0 || value.is_nan() || value.is_infinite() {
        return (value, 0);
    }
    let bits = value.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i32;
    if exponent == 0 {
        // Subnormal: normalize by 2^64, then correct the exponent.
        let normalized = value * (1u64 << 63) as f64 * 2.0;
        let (frac, exp) = frexp(normalized);
        return (frac, exp - 64);
    }
    let frac_bits = (bits & 0x800F_FFFF_FFFF_FFFF) | 0x3FE0_0000_0000_0000;
    (f64::from_bits(frac_bits), exponent - 1022)
}

/// SipHash-1-3 with a zero key.
fn siphash13(bytes: &[u8]) -> u64 {
    let mut v0: u64 = 0x736f_6d65_7073_6575;
    let mut v1: u64 = 0x646f_7261_6e64_6f6d;
    let mut v2: u64 = 0x6c79_6765_6e65_7261;
    let mut v3: u64 = 0x7465_6462_7974_6573;

    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        let mut block = [0_u8; 8];
        block.copy_from_slice(chunk);
        let message = u64::from_le_bytes(block);
        v3 ^= message;
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= message;
    }

    let mut tail = (bytes.len() as u64) << 56;
    for (index, byte) in chunks.remainder().iter().copied().enumerate() {
        tail |= u64::from(byte) << (index * 8);
    }

    v3 ^= tail;
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= tail;
    v2 ^= 0xff;
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);

    v0 ^ v1 ^ v2 ^ v3
}

fn sip_round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
    *v0 = v0.wrapping_add(*v1);
    *v1 = v1.rotate_left(13);
    *v1 ^= *v0;
    *v0 = v0.rotate_left(32);

    *v2 = v2.wrapping_add(*v3);
    *v3 = v3.rotate_left(16);
    *v3 ^= *v2;

    *v0 = v0.wrapping_add(*v3);
    *v3 = v3.rotate_left(21);
    *v3 ^= *v0;

    *v2 = v2.wrapping_add(*v1);
    *v1 = v1.rotate_left(17);
    *v1 ^= *v2;
    *v2 = v2.rotate_left(32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_float_bool_agree() {
        assert_eq!(hash_int(0), hash_float(0.0));
        assert_eq!(hash_int(1), hash_float(1.0));
        assert_eq!(hash_int(-7), hash_float(-7.0));
        assert_eq!(hash_int(i64::from(true)), hash_int(1));
    }

    #[test]
    fn complex_real_agrees_with_float() {
        assert_eq!(hash_complex(2.5, 0.0), hash_float(2.5));
        assert_ne!(hash_complex(2.5, 1.0), hash_float(2.5));
    }

    #[test]
    fn minus_one_is_remapped() {
        // -1 % MODULUS == -1, which must be remapped to -2.
        assert_eq!(hash_int(-1), u64::from_ne_bytes((-2_i64).to_ne_bytes()));
    }

    #[test]
    fn empty_bytes_hash_to_zero() {
        assert_eq!(hash_bytes(b""), 0);
        assert_eq!(hash_str(""), 0);
    }

    #[test]
    fn infinities() {
        assert_eq!(hash_float(f64::INFINITY), 314_159);
        assert_eq!(
            hash_float(f64::NEG_INFINITY),
            u64::from_ne_bytes((-314_159_i64).to_ne_bytes())
        );
        assert_eq!(hash_float(f64::NAN), 0);
    }

    #[test]
    fn large_int_wraps_modulus() {
        let m = (1_i64 << 61) - 1;
        assert_eq!(hash_int(m), hash_int(0));
        assert_eq!(hash_int(m + 1), hash_int(1));
    }
}
