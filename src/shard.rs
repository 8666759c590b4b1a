//! Deterministic partitioning of the runnable test list across machines.
//!
//! Sharding is a pure function over the ordered runnable set: shard `i` of
//! `n` receives a contiguous slice, the first `len mod n` shards get one
//! extra test, and list order is never disturbed. Tests outside the selected
//! shard are not dropped; they carry a synthetic skip reason so the result
//! set stays exhaustive.

use serde::{Deserialize, Serialize};

use crate::registry::ResolvedEntity;

/// Skip reason attached to tests excluded by shard selection.
pub const NOT_IN_SHARD_REASON: &str = "test is not in the specified shard";

/// Selects one shard out of a total count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub total: usize,
    pub index: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("total shard count must be positive")]
    ZeroTotal,

    #[error("shard index {index} out of range for {total} shards")]
    IndexOutOfRange { index: usize, total: usize },
}

impl ShardDescriptor {
    pub fn new(total: usize, index: usize) -> Result<Self, ShardError> {
        if total == 0 {
            return Err(ShardError::ZeroTotal);
        }
        if index >= total {
            return Err(ShardError::IndexOutOfRange { index, total });
        }
        Ok(Self { total, index })
    }

    /// The single-shard descriptor, selecting everything.
    pub fn whole() -> Self {
        Self { total: 1, index: 0 }
    }

    /// Half-open range of list positions belonging to this shard.
    fn bounds(&self, len: usize) -> (usize, usize) {
        let per = len / self.total;
        let extra = len % self.total;
        if self.index < extra {
            let start = self.index * (per + 1);
            (start, start + per + 1)
        } else {
            let start = self.index * per + extra;
            (start, start + per)
        }
    }
}

/// Splits the runnable set into the selected shard and the remainder.
///
/// The remainder keeps its entities but each gains the
/// [`NOT_IN_SHARD_REASON`] skip. Order is preserved in both halves.
pub fn apply_shard(
    runnable: Vec<ResolvedEntity>,
    shard: ShardDescriptor,
) -> (Vec<ResolvedEntity>, Vec<ResolvedEntity>) {
    let (start, end) = shard.bounds(runnable.len());
    let mut to_run = Vec::with_capacity(end - start);
    let mut rest = Vec::with_capacity(runnable.len() - (end - start));
    for (i, mut entity) in runnable.into_iter().enumerate() {
        if i >= start && i < end {
            to_run.push(entity);
        } else {
            entity.skip_reason = Some(NOT_IN_SHARD_REASON.to_string());
            rest.push(entity);
        }
    }
    (to_run, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Entity, EntityKind};

    fn entities(n: usize) -> Vec<ResolvedEntity> {
        (0..n)
            .map(|i| ResolvedEntity {
                entity: Entity::new(format!("test{i:02}"), EntityKind::Test, "cros"),
                hops: 1,
                skip_reason: None,
                check_errors: Vec::new(),
                start_fixture_name: String::new(),
            })
            .collect()
    }

    #[test]
    fn descriptor_validation() {
        assert!(matches!(
            ShardDescriptor::new(0, 0),
            Err(ShardError::ZeroTotal)
        ));
        assert!(matches!(
            ShardDescriptor::new(3, 3),
            Err(ShardError::IndexOutOfRange { index: 3, total: 3 })
        ));
        assert!(ShardDescriptor::new(3, 2).is_ok());
    }

    #[test]
    fn eleven_tests_three_shards() {
        // Boundaries 0..4, 4..8, 8..11 with sizes 4, 4, 3.
        let sizes: Vec<usize> = (0..3)
            .map(|i| {
                let shard = ShardDescriptor::new(3, i).unwrap();
                apply_shard(entities(11), shard).0.len()
            })
            .collect();
        assert_eq!(sizes, [4, 4, 3]);

        let (shard0, _) = apply_shard(entities(11), ShardDescriptor::new(3, 0).unwrap());
        assert_eq!(shard0[0].entity.name, "test00");
        assert_eq!(shard0[3].entity.name, "test03");
        let (shard2, _) = apply_shard(entities(11), ShardDescriptor::new(3, 2).unwrap());
        assert_eq!(shard2[0].entity.name, "test08");
        assert_eq!(shard2[2].entity.name, "test10");
    }

    #[test]
    fn partition_is_disjoint_and_exhaustive() {
        for total in 1..=7 {
            let mut seen = Vec::new();
            for index in 0..total {
                let shard = ShardDescriptor::new(total, index).unwrap();
                let (to_run, rest) = apply_shard(entities(11), shard);
                assert_eq!(to_run.len() + rest.len(), 11);
                for entity in &rest {
                    assert_eq!(entity.skip_reason.as_deref(), Some(NOT_IN_SHARD_REASON));
                }
                seen.extend(to_run.into_iter().map(|e| e.entity.name));
            }
            let expected: Vec<String> = entities(11)
                .into_iter()
                .map(|e| e.entity.name)
                .collect();
            // Union over shards equals the input, in order, with no overlap.
            assert_eq!(seen, expected, "total={total}");
        }
    }

    #[test]
    fn more_shards_than_tests() {
        let (to_run, rest) = apply_shard(entities(2), ShardDescriptor::new(5, 4).unwrap());
        assert!(to_run.is_empty());
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn whole_shard_selects_everything() {
        let (to_run, rest) = apply_shard(entities(4), ShardDescriptor::whole());
        assert_eq!(to_run.len(), 4);
        assert!(rest.is_empty());
    }
}
