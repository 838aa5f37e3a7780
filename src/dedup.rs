//! Per-window beacon deduplication.
//!
//! A noisy radio channel reports the same advertisement several times within
//! one scan window. Only one observation per device per window is meaningful.

use crate::identity::BeaconId;
use crate::scanner::RawAdvertisement;
use std::collections::HashSet;

/// Keep the first advertisement seen for each identity.
///
/// Output order is the order of first appearance in `batch`.
pub fn distinct(batch: impl IntoIterator<Item = RawAdvertisement>) -> Vec<RawAdvertisement> {
    let mut seen: HashSet<BeaconId> = HashSet::new();
    batch
        .into_iter()
        .filter(|advertisement| seen.insert(advertisement.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::advertisement;

    #[test]
    fn test_distinct_keeps_first_occurrence_in_order() {
        let a = BeaconId([0xAA; 16]);
        let b = BeaconId([0xBB; 16]);
        let c = BeaconId([0xCC; 16]);

        let batch = vec![
            advertisement(a, 60, 1010),
            advertisement(b, 61, 1020),
            advertisement(a, 62, 1030),
            advertisement(c, 63, 1040),
            advertisement(b, 64, 1050),
        ];

        let unique = distinct(batch);
        let ids: Vec<_> = unique.iter().map(|adv| adv.id).collect();
        assert_eq!(ids, vec![a, b, c]);

        // first occurrence wins, not the latest
        assert_eq!(unique[0].major, 60);
        assert_eq!(unique[1].minor, 1020);
    }

    #[test]
    fn test_distinct_empty_batch() {
        assert!(distinct(Vec::new()).is_empty());
    }

    #[test]
    fn test_distinct_all_same_identity() {
        let a = BeaconId([0x01; 16]);
        let batch: Vec<_> = (0..10).map(|i| advertisement(a, 60 + i, 1000)).collect();

        let unique = distinct(batch);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].major, 60);
    }
}
