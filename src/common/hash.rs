//! FNV-1a hashing and the small maps keyed by interned strings that the
//! symbol table and language descriptor use.
//!
//! Identifiers are already interned (see [`super::Id`]), so these maps
//! mostly hash a pointer-sized value; FNV keeps that cheap and avoids
//! pulling in `std`'s DoS-resistant (and therefore slower) default hasher
//! for data that never comes from an untrusted source at this granularity.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};

#[derive(Default)]
pub struct FnvHasher(u64);

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut hash = if self.0 == 0 { FNV_OFFSET } else { self.0 };
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        self.0 = hash;
    }
}

pub type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

/// A small map keyed by interned identifiers, using FNV hashing.
pub type IdMap<V> = HashMap<super::Id, V, FnvBuildHasher>;

pub fn id_map<V>() -> IdMap<V> {
    HashMap::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_hash_the_same() {
        let mut a = FnvHasher::default();
        let mut b = FnvHasher::default();
        a.write(b"hello");
        b.write(b"hello");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn different_bytes_usually_differ() {
        let mut a = FnvHasher::default();
        let mut b = FnvHasher::default();
        a.write(b"hello");
        b.write(b"world");
        assert_ne!(a.finish(), b.finish());
    }
}
