use std::hash::{BuildHasherDefault, Hasher};

/// A hasher optimized for keys that are already well-distributed 64-bit
/// values, such as entity IDs.
#[derive(Default)]
pub struct U64Hasher(u64);

impl Hasher for U64Hasher {
    fn finish(&self) -> u64 { self.0 }

    fn write(&mut self, bytes: &[u8]) {
        use core::convert::TryInto;
        let seed = u64::from_ne_bytes(bytes.try_into().unwrap());
        let max_prime = 11_400_714_819_323_198_549u64;
        self.0 = max_prime.wrapping_mul(seed);
    }

    fn write_u64(&mut self, value: u64) {
        let max_prime = 11_400_714_819_323_198_549u64;
        self.0 = max_prime.wrapping_mul(value);
    }
}

/// A build-hasher for maps keyed by entity IDs.
pub type EntityHasher = BuildHasherDefault<U64Hasher>;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Folds one 64-bit word into a running lookup hash.
#[inline]
pub fn hash_combine(seed: u64, value: u64) -> u64 {
    let mut hash = seed;
    for byte in value.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Computes the canonical 64-bit lookup hash of an ordered sequence of
/// 64-bit identifiers. Used as the primary key of the archetype directory
/// and for query interning.
pub fn lookup_hash(values: impl IntoIterator<Item = u64>) -> u64 {
    let mut hash = FNV_OFFSET;
    for value in values {
        hash = hash_combine(hash, value);
    }
    hash
}
