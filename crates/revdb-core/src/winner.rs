//! Winning revision selection among a document's leaves.
//!
//! Rank order, highest first:
//! 1. greater generation,
//! 2. non-deleted before deleted,
//! 3. lexicographically greater revision ID.
//!
//! The rule only looks at leaf metadata, so every replica holding the same
//! tree picks the same winner.

use std::cmp::Ordering;

use crate::types::RevId;

/// Compare two leaves by winning rank. `Greater` means `a` beats `b`.
pub fn compare_leaves(a: (&RevId, bool), b: (&RevId, bool)) -> Ordering {
    let (a_rev, a_deleted) = a;
    let (b_rev, b_deleted) = b;
    a_rev
        .generation()
        .cmp(&b_rev.generation())
        .then_with(|| b_deleted.cmp(&a_deleted))
        .then_with(|| a_rev.suffix().cmp(b_rev.suffix()))
}

/// Pick the winning leaf from `(rev_id, deleted)` pairs.
pub fn winning_revision<'a, I>(leaves: I) -> Option<(&'a RevId, bool)>
where
    I: IntoIterator<Item = (&'a RevId, bool)>,
{
    leaves.into_iter().max_by(|a, b| compare_leaves(*a, *b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rev(s: &str) -> RevId {
        RevId::parse(s).unwrap()
    }

    #[test]
    fn test_conflict_tie_goes_to_greater_id() {
        let bbb = rev("2-bbb");
        let ccc = rev("2-ccc");
        let winner = winning_revision([(&bbb, false), (&ccc, false)]).unwrap();
        assert_eq!(winner.0, &ccc);
    }

    #[test]
    fn test_higher_generation_beats_live_sibling() {
        let deep_deleted = rev("3-aaa");
        let shallow_live = rev("2-zzz");
        let winner = winning_revision([(&shallow_live, false), (&deep_deleted, true)]).unwrap();
        assert_eq!(winner, (&deep_deleted, true));
    }

    #[test]
    fn test_deleted_loses_generation_tie() {
        let deleted = rev("2-zzz");
        let live = rev("2-aaa");
        let winner = winning_revision([(&deleted, true), (&live, false)]).unwrap();
        assert_eq!(winner, (&live, false));
    }

    #[test]
    fn test_no_leaves_no_winner() {
        assert!(winning_revision(std::iter::empty()).is_none());
    }

    proptest! {
        #[test]
        fn winner_dominates_every_leaf(
            leaves in prop::collection::vec((1u64..20, "[a-f]{1,4}", any::<bool>()), 1..12)
        ) {
            let revs: Vec<(RevId, bool)> = leaves
                .into_iter()
                .map(|(gen, suffix, deleted)| (RevId::new(gen, suffix).unwrap(), deleted))
                .collect();
            let (winner, winner_deleted) = winning_revision(revs.iter().map(|(r, d)| (r, *d))).unwrap();

            for (rev, deleted) in &revs {
                prop_assert!(winner.generation() >= rev.generation());
                if rev.generation() == winner.generation() {
                    if !*deleted {
                        prop_assert!(!winner_deleted);
                    }
                    if *deleted == winner_deleted {
                        prop_assert!(winner >= rev);
                    }
                }
            }
        }

        #[test]
        fn winner_is_order_independent(
            leaves in prop::collection::vec((1u64..6, "[a-c]{1,2}", any::<bool>()), 1..8)
        ) {
            let mut revs: Vec<(RevId, bool)> = leaves
                .into_iter()
                .map(|(gen, suffix, deleted)| (RevId::new(gen, suffix).unwrap(), deleted))
                .collect();
            revs.sort();
            revs.dedup_by(|a, b| a.0 == b.0);
            let forward = winning_revision(revs.iter().map(|(r, d)| (r, *d))).map(|(r, d)| (r.clone(), d));
            let backward = winning_revision(revs.iter().rev().map(|(r, d)| (r, *d))).map(|(r, d)| (r.clone(), d));
            prop_assert_eq!(forward, backward);
        }
    }
}
