//! QuadKey codec: packed 64-bit tile identifiers and their string form.
//!
//! A quadkey is a string of base-4 digits whose length equals the zoom
//! level. The packed form stores digit `i` at bit position `64 - 2*(i+1)`
//! and the zoom level in the low 5 bits, so keys of zoom up to
//! [`MAX_ZOOM`] round-trip losslessly.
//!
//! Both directions are memoized in [`QuadKeyCache`]: the same keys recur
//! on every tick, so reads vastly outnumber writes. The caches are
//! capacity-bounded with random single-entry eviction to keep memory flat
//! when the traffic footprint shifts over long runs.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

/// Highest zoom level the packed form can hold without the digit bits
/// colliding with the 5-bit zoom field.
pub const MAX_ZOOM: usize = 29;

/// Codec errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuadKeyError {
    #[error("invalid quadkey digit '{0}'")]
    InvalidDigit(char),

    #[error("quadkey length {0} exceeds maximum zoom {MAX_ZOOM}")]
    TooLong(usize),
}

/// Decode a packed quadkey into its string form.
pub fn encode_str(quadint: u64) -> String {
    let zoom = (quadint & 0b11111) as usize;
    let mut key = String::with_capacity(zoom);

    for i in 0..zoom {
        let bit_loc = 64 - (i + 1) * 2;
        let digit = ((quadint >> bit_loc) & 0b11) as u8;
        key.push((b'0' + digit) as char);
    }

    key
}

/// Encode a string quadkey into its packed form.
pub fn decode_str(quadkey: &str) -> Result<u64, QuadKeyError> {
    let zoom = quadkey.len();
    if zoom > MAX_ZOOM {
        return Err(QuadKeyError::TooLong(zoom));
    }

    let mut quadint: u64 = 0;
    for (i, c) in quadkey.chars().enumerate() {
        let digit = match c {
            '0'..='3' => c as u64 - '0' as u64,
            other => return Err(QuadKeyError::InvalidDigit(other)),
        };
        quadint |= digit << (64 - (i + 1) * 2);
    }

    Ok(quadint | zoom as u64)
}

/// Parent tile of `key` at `level`: its first `level` digits.
#[inline]
pub fn parent(key: &str, level: usize) -> &str {
    &key[..level.min(key.len())]
}

/// Bounded two-direction memo cache for the quadkey codec.
///
/// Multi-reader, single-writer per direction. Concurrent inserts of the
/// same key are idempotent (both writers store the same value). When a
/// direction is full, one pseudo-randomly chosen entry is evicted.
pub struct QuadKeyCache {
    int_to_key: RwLock<HashMap<u64, String>>,
    key_to_int: RwLock<HashMap<String, u64>>,
    capacity: usize,
}

impl QuadKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            int_to_key: RwLock::new(HashMap::new()),
            key_to_int: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Packed form to string form, memoized.
    pub fn to_string(&self, quadint: u64) -> String {
        if let Some(key) = self.int_to_key.read().get(&quadint) {
            return key.clone();
        }

        let key = encode_str(quadint);

        let mut cache = self.int_to_key.write();
        if cache.len() >= self.capacity && !cache.contains_key(&quadint) {
            if let Some(victim) = pick_victim(cache.keys().copied(), quadint) {
                cache.remove(&victim);
            }
        }
        cache.entry(quadint).or_insert_with(|| key.clone());

        key
    }

    /// String form to packed form, memoized.
    pub fn to_int(&self, quadkey: &str) -> Result<u64, QuadKeyError> {
        if let Some(quadint) = self.key_to_int.read().get(quadkey) {
            return Ok(*quadint);
        }

        let quadint = decode_str(quadkey)?;

        let mut cache = self.key_to_int.write();
        if cache.len() >= self.capacity && !cache.contains_key(quadkey) {
            let victim = pick_victim(cache.keys().map(|k| k.as_str()), quadint)
                .map(|k| k.to_owned());
            if let Some(victim) = victim {
                cache.remove(&victim);
            }
        }
        cache.entry(quadkey.to_owned()).or_insert(quadint);

        Ok(quadint)
    }

    /// Entry counts per direction, for diagnostics.
    pub fn len(&self) -> (usize, usize) {
        (self.int_to_key.read().len(), self.key_to_int.read().len())
    }
}

/// Pick an arbitrary victim key, seeded by the incoming key so repeated
/// evictions do not always hit the same slot.
fn pick_victim<K, I>(keys: I, seed: u64) -> Option<K>
where
    I: ExactSizeIterator<Item = K>,
{
    let len = keys.len();
    if len == 0 {
        return None;
    }
    let mut x = seed | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    let mut keys = keys;
    keys.nth(x as usize % len)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Deterministic base-4 digit sequence for round-trip coverage.
    fn pseudo_key(len: usize, mut seed: u64) -> String {
        let mut key = String::with_capacity(len);
        for _ in 0..len {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            key.push((b'0' + ((seed >> 33) & 0b11) as u8) as char);
        }
        key
    }

    #[test]
    fn round_trip_string_to_int_to_string() {
        for zoom in 1..=25 {
            for seed in 0..8 {
                let key = pseudo_key(zoom, seed);
                let quadint = decode_str(&key).unwrap();
                assert_eq!(encode_str(quadint), key, "zoom {} key {}", zoom, key);
            }
        }
    }

    #[test]
    fn round_trip_int_to_string_to_int() {
        for zoom in 1..=25u64 {
            for seed in 0..8 {
                let key = pseudo_key(zoom as usize, seed ^ 0xDEAD);
                let quadint = decode_str(&key).unwrap();
                assert_eq!(quadint & 0b11111, zoom);
                assert_eq!(decode_str(&encode_str(quadint)).unwrap(), quadint);
            }
        }
    }

    #[test]
    fn single_digit_key_packs_into_top_bits() {
        // "0" has zoom 1 and its digit at bit 62.
        assert_eq!(decode_str("0").unwrap(), 1);
        assert_eq!(decode_str("1").unwrap(), (1 << 62) | 1);
        assert_eq!(decode_str("2").unwrap(), (2 << 62) | 1);
        assert_eq!(decode_str("3").unwrap(), (3 << 62) | 1);
    }

    #[test]
    fn known_vector_zoom_24() {
        // 0x9C40000000000018: digits 2,1,3,0,1,0 then zeros, zoom 24.
        let quadint = 0x9C40000000000018u64;
        assert_eq!(encode_str(quadint), "213010000000000000000000");
        assert_eq!(decode_str("213010000000000000000000").unwrap(), quadint);
    }

    #[test]
    fn invalid_digit_is_rejected() {
        assert_eq!(decode_str("0124"), Err(QuadKeyError::InvalidDigit('4')));
        assert_eq!(decode_str("01a2"), Err(QuadKeyError::InvalidDigit('a')));
    }

    #[test]
    fn overlong_key_is_rejected() {
        let key: String = std::iter::repeat('1').take(MAX_ZOOM + 1).collect();
        assert_eq!(decode_str(&key), Err(QuadKeyError::TooLong(MAX_ZOOM + 1)));
    }

    #[test]
    fn parent_is_prefix() {
        assert_eq!(parent("120203233230313100000100", 19), "1202032332303131000");
        assert_eq!(parent("120", 19), "120");
    }

    #[test]
    fn cache_is_idempotent_and_bounded() {
        let cache = QuadKeyCache::new(16);

        let key = "1202032332303131";
        let a = cache.to_int(key).unwrap();
        let b = cache.to_int(key).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.to_string(a), key);

        for seed in 0..200 {
            let key = pseudo_key(20, seed);
            let quadint = cache.to_int(&key).unwrap();
            cache.to_string(quadint);
        }
        let (ints, keys) = cache.len();
        assert!(ints <= 16, "int cache grew to {}", ints);
        assert!(keys <= 16, "key cache grew to {}", keys);

        // A bounded cache still answers correctly after eviction.
        let quadint = cache.to_int(key).unwrap();
        assert_eq!(cache.to_string(quadint), key);
    }
}
