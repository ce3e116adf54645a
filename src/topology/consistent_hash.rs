//! Segment based consistent hash
//!
//! Keys hash into a fixed number of segments; each segment has an ordered
//! owner list whose first entry is the primary owner.

use std::collections::{BTreeSet, HashMap};

use crate::core::ServerAddress;

const MURMUR3_SEED: u64 = 9001;

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// MurmurHash3 x64 128-bit variant, returning (h1, h2)
pub fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    let mut h1 = seed;
    let mut h2 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let mut k1 = u64::from_le_bytes([
            block[0], block[1], block[2], block[3], block[4], block[5], block[6], block[7],
        ]);
        let mut k2 = u64::from_le_bytes([
            block[8], block[9], block[10], block[11], block[12], block[13], block[14], block[15],
        ]);

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27).wrapping_add(h2).wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31).wrapping_add(h1).wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;

    if tail.len() > 8 {
        for (i, byte) in tail[8..].iter().enumerate() {
            k2 ^= u64::from(*byte) << (i * 8);
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for (i, byte) in tail[..tail.len().min(8)].iter().enumerate() {
            k1 ^= u64::from(*byte) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    let len = data.len() as u64;
    h1 ^= len;
    h2 ^= len;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

/// 32-bit key hash used for segment lookup
pub fn murmur3_hash(key: &[u8]) -> i32 {
    let (h1, _) = murmur3_x64_128(key, MURMUR3_SEED);
    (h1 >> 32) as i32
}

/// Immutable segment to owners table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConsistentHash {
    segment_owners: Vec<Vec<ServerAddress>>,
    segment_size: u32,
    hash_function_version: i16,
}

impl SegmentConsistentHash {
    /// `None` when hashing is disabled (version <= 0) or there are no segments
    pub fn new(segment_owners: Vec<Vec<ServerAddress>>, hash_function_version: i16) -> Option<Self> {
        if hash_function_version <= 0 || segment_owners.is_empty() {
            return None;
        }
        let segments = segment_owners.len() as u64;
        let segment_size = ((i32::MAX as u64 + segments - 1) / segments) as u32;
        Some(Self {
            segment_owners,
            segment_size,
            hash_function_version,
        })
    }

    pub fn num_segments(&self) -> usize {
        self.segment_owners.len()
    }

    pub fn hash_function_version(&self) -> i16 {
        self.hash_function_version
    }

    pub fn segment(&self, key: &[u8]) -> usize {
        let normalized = (murmur3_hash(key) & i32::MAX) as u32;
        let segment = (normalized / self.segment_size) as usize;
        segment.min(self.segment_owners.len() - 1)
    }

    pub fn segment_owners(&self, segment: usize) -> &[ServerAddress] {
        self.segment_owners
            .get(segment)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Owners of the segment `key` maps to
    pub fn owners(&self, key: &[u8]) -> &[ServerAddress] {
        self.segment_owners(self.segment(key))
    }

    /// Primary owner of `key`
    pub fn server(&self, key: &[u8]) -> Option<&ServerAddress> {
        self.owners(key).first()
    }

    pub fn primary_segments_by_server(&self) -> HashMap<ServerAddress, BTreeSet<usize>> {
        let mut primaries: HashMap<ServerAddress, BTreeSet<usize>> = HashMap::new();
        for (segment, owners) in self.segment_owners.iter().enumerate() {
            if let Some(primary) = owners.first() {
                primaries.entry(primary.clone()).or_default().insert(segment);
            }
        }
        primaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(port: u16) -> ServerAddress {
        ServerAddress::new("127.0.0.1", port)
    }

    #[test]
    fn test_murmur3_known_vectors() {
        assert_eq!(murmur3_x64_128(b"", 0), (0, 0));
        assert_eq!(
            murmur3_x64_128(b"The quick brown fox jumps over the lazy dog", 0),
            (0xe34b_bc7b_bc07_1b6c, 0x7a43_3ca9_c49a_9347)
        );
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(murmur3_hash(b"key"), murmur3_hash(b"key"));
        assert_ne!(murmur3_hash(b"key-1"), murmur3_hash(b"key-2"));
    }

    #[test]
    fn test_disabled_hash() {
        assert!(SegmentConsistentHash::new(vec![vec![address(1)]], 0).is_none());
        assert!(SegmentConsistentHash::new(Vec::new(), 3).is_none());
    }

    #[test]
    fn test_segment_lookup() {
        let owners: Vec<Vec<ServerAddress>> = (0..4).map(|i| vec![address(i), address(i + 10)]).collect();
        let hash = SegmentConsistentHash::new(owners, 3).unwrap();
        assert_eq!(hash.num_segments(), 4);

        for i in 0..200 {
            let key = format!("key-{}", i);
            let segment = hash.segment(key.as_bytes());
            assert!(segment < 4);
            assert_eq!(hash.server(key.as_bytes()), Some(&address(segment as u16)));
            assert_eq!(hash.owners(key.as_bytes()).len(), 2);
        }
    }

    #[test]
    fn test_keys_spread_across_segments() {
        let owners: Vec<Vec<ServerAddress>> = (0..8).map(|i| vec![address(i)]).collect();
        let hash = SegmentConsistentHash::new(owners, 3).unwrap();
        let used: BTreeSet<usize> = (0..500)
            .map(|i| hash.segment(format!("key-{}", i).as_bytes()))
            .collect();
        assert_eq!(used.len(), 8);
    }

    #[test]
    fn test_primary_segments() {
        let owners = vec![vec![address(1)], vec![address(2)], vec![address(1), address(2)], vec![]];
        let hash = SegmentConsistentHash::new(owners, 3).unwrap();
        let primaries = hash.primary_segments_by_server();
        assert_eq!(primaries[&address(1)], BTreeSet::from([0, 2]));
        assert_eq!(primaries[&address(2)], BTreeSet::from([1]));
    }
}
