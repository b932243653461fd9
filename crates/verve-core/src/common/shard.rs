//! Deterministic mapping from request ids to worker shards.
//!
//! The shard of an id decides which bounded queue carries it and therefore its
//! ordering domain: ids are FIFO within a shard and unordered across shards.
//! Both strategies are pure functions of the id bytes, so a shard assignment
//! never changes for the lifetime of a pool.

use core::{fmt, str::FromStr};
use xxhash_rust::xxh3::xxh3_64;

/// Strategy used to pick a shard for a request id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShardHasher {
    /// `len(id) mod N`. Cheap, but ids of equal length always collide.
    Length,
    /// 64-bit XXH3 over the id bytes, `mod N`.
    #[default]
    Xxh3,
}

impl ShardHasher {
    /// Returns the shard index in `[0, shards)` for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is zero.
    pub fn shard(self, id: &str, shards: usize) -> usize {
        assert!(shards > 0, "shard count must be non-zero");
        match self {
            Self::Length => id.len() % shards,
            Self::Xxh3 => (xxh3_64(id.as_bytes()) % shards as u64) as usize,
        }
    }
}

impl fmt::Display for ShardHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length => write!(f, "length"),
            Self::Xxh3 => write!(f, "xxh3"),
        }
    }
}

impl FromStr for ShardHasher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "length" => Ok(Self::Length),
            "xxh3" => Ok(Self::Xxh3),
            other => Err(format!("unknown shard hasher `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_hasher_matches_id_length() {
        let hasher = ShardHasher::Length;
        assert_eq!(hasher.shard("a", 10), 1);
        assert_eq!(hasher.shard("bb", 10), 2);
        assert_eq!(hasher.shard("ccc", 10), 3);
        assert_eq!(hasher.shard("0123456789", 10), 0);
    }

    #[test]
    fn assignment_is_stable_across_calls() {
        for hasher in [ShardHasher::Length, ShardHasher::Xxh3] {
            for id in ["a", "req-17", "2f1c9e0a-3b4d", "ünïcødé"] {
                let first = hasher.shard(id, 7);
                assert!(first < 7);
                for _ in 0..100 {
                    assert_eq!(hasher.shard(id, 7), first);
                }
            }
        }
    }

    #[test]
    fn xxh3_matches_reference_vector() {
        assert_eq!(xxh3_64(b""), 0x2d06_8005_38d3_94c2);
        assert_eq!(
            ShardHasher::Xxh3.shard("", 1 << 20),
            (0x2d06_8005_38d3_94c2_u64 % (1 << 20)) as usize
        );
    }

    #[test]
    fn xxh3_spreads_equal_length_ids() {
        let shards = 16;
        let mut hit = vec![false; shards];
        for i in 0..1_000 {
            let id = format!("id-{i:04}");
            hit[ShardHasher::Xxh3.shard(&id, shards)] = true;
        }
        assert!(hit.iter().all(|&h| h), "every shard should receive ids");
    }

    #[test]
    fn parses_from_config_strings() {
        assert_eq!("length".parse::<ShardHasher>(), Ok(ShardHasher::Length));
        assert_eq!("XXH3".parse::<ShardHasher>(), Ok(ShardHasher::Xxh3));
        assert!("crc".parse::<ShardHasher>().is_err());
    }
}
