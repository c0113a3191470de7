//! Consistent-hash ring for sharding object ownership across replicas.
//!
//! Each live replica contributes a fixed number of virtual points to the
//! ring; an object belongs to the replica owning the first point at or after
//! the object's hash, wrapping around. The hash is fixed to `xxh3_64` so
//! every replica computes identical ownership from the same membership view.

use xxhash_rust::xxh3::xxh3_64;

/// Virtual points per replica. High enough to keep the split even for small
/// clusters without making ring construction noticeable.
const VNODES_PER_REPLICA: usize = 64;

/// An immutable ownership ring built from the current replica membership.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// (ring position, replica index), sorted by position.
    points: Vec<(u64, usize)>,
    replicas: Vec<String>,
}

impl HashRing {
    /// Build a ring from the live replica ids. Order does not matter; the
    /// ring only depends on the membership set.
    pub fn new(mut replicas: Vec<String>) -> Self {
        replicas.sort();
        replicas.dedup();

        let mut points = Vec::with_capacity(replicas.len() * VNODES_PER_REPLICA);
        for (index, replica) in replicas.iter().enumerate() {
            for vnode in 0..VNODES_PER_REPLICA {
                let point = xxh3_64(format!("{replica}:{vnode}").as_bytes());
                points.push((point, index));
            }
        }
        points.sort_unstable();

        Self { points, replicas }
    }

    /// The replica that owns the given key, or `None` for an empty ring.
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = xxh3_64(key.as_bytes());
        let slot = self
            .points
            .partition_point(|(point, _)| *point < hash)
            .checked_rem(self.points.len())
            .unwrap_or(0);
        let (_, index) = self.points[slot];
        Some(&self.replicas[index])
    }

    /// Whether the given replica owns the key.
    pub fn is_owned_by(&self, key: &str, replica: &str) -> bool {
        self.owner(key) == Some(replica)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ring_owns_nothing() {
        let ring = HashRing::new(Vec::new());
        assert!(ring.owner("a").is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_single_replica_owns_everything() {
        let ring = HashRing::new(vec!["r1".to_string()]);
        for key in ["a", "b", "some/long/path.ndjson"] {
            assert_eq!(ring.owner(key), Some("r1"));
        }
    }

    #[test]
    fn test_ownership_is_deterministic_and_partitioning() {
        let ring = HashRing::new(vec!["r1".to_string(), "r2".to_string()]);
        let ring_reordered = HashRing::new(vec!["r2".to_string(), "r1".to_string()]);

        let keys: Vec<String> = (0..200).map(|i| format!("data/file-{i:04}.ndjson")).collect();
        let mut owned_r1 = 0;
        for key in &keys {
            let owner = ring.owner(key).unwrap();
            // Membership order must not change ownership.
            assert_eq!(Some(owner), ring_reordered.owner(key));
            // Exactly one replica owns each key.
            assert_eq!(
                ring.is_owned_by(key, "r1") as u32 + ring.is_owned_by(key, "r2") as u32,
                1
            );
            if owner == "r1" {
                owned_r1 += 1;
            }
        }

        // Both replicas take a meaningful share.
        assert!(owned_r1 > 30, "r1 owned only {owned_r1} of 200");
        assert!(owned_r1 < 170, "r1 owned {owned_r1} of 200");
    }

    #[test]
    fn test_membership_change_moves_only_some_keys() {
        let two = HashRing::new(vec!["r1".to_string(), "r2".to_string()]);
        let three = HashRing::new(vec!["r1".to_string(), "r2".to_string(), "r3".to_string()]);

        let keys: Vec<String> = (0..200).map(|i| format!("k{i}")).collect();
        let moved = keys
            .iter()
            .filter(|k| two.owner(k) != three.owner(k))
            .count();

        // Consistent hashing: adding a replica must not reshuffle everything.
        assert!(moved < 150, "too many keys moved: {moved}");
        assert!(moved > 0);
    }
}
