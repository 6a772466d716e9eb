use sha2::{Digest, Sha256};

/// Deterministic predicate deciding whether a user id belongs to this
/// instance. Shards partition the uid space by hashing; every uid is accepted
/// by exactly one of the `count` shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    index: u64,
    count: u64,
}

impl Shard {
    /// Shard `index` of `count` total shards.
    pub fn of(index: u32, count: u32) -> Self {
        assert!(count > 0, "shard count must be positive");
        assert!(index < count, "shard index {index} out of range 0..{count}");
        Self {
            index: u64::from(index),
            count: u64::from(count),
        }
    }

    /// Single-instance deployments: every uid is ours.
    pub fn all() -> Self {
        Self::of(0, 1)
    }

    pub fn accepts(&self, uid: &str) -> bool {
        hash_uid(uid) % self.count == self.index
    }
}

/// First 8 bytes of the uid's SHA-256, big-endian.
fn hash_uid(uid: &str) -> u64 {
    let digest = Sha256::digest(uid.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_accepts_everything() {
        let shard = Shard::all();
        for uid in ["u1", "u2", "", "0000fa39871de1ab"] {
            assert!(shard.accepts(uid));
        }
    }

    #[test]
    fn every_uid_lands_on_exactly_one_shard() {
        let shards: Vec<Shard> = (0..8).map(|i| Shard::of(i, 8)).collect();
        for n in 0..200 {
            let uid = format!("user-{n}");
            let owners = shards.iter().filter(|s| s.accepts(&uid)).count();
            assert_eq!(owners, 1, "uid {uid} owned by {owners} shards");
        }
    }

    #[test]
    fn predicate_is_deterministic() {
        let shard = Shard::of(3, 8);
        let first = shard.accepts("u-42");
        for _ in 0..10 {
            assert_eq!(shard.accepts("u-42"), first);
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn index_must_be_below_count() {
        Shard::of(4, 4);
    }
}
