//! In-memory batch dedup ahead of multi-row UPSERTs.
//!
//! A batch may see the same natural key more than once (delta pages can
//! repeat an item); ON CONFLICT requires each key at most once per
//! statement, so batches are deduped keeping the last occurrence.

use std::collections::HashSet;
use std::hash::Hash;

/// Dedup `rows` by `key_fn`, keeping the last occurrence of each key and
/// preserving relative order otherwise. Returns the surviving rows and the
/// number dropped.
pub fn dedupe_keep_last<T, K, F>(rows: Vec<T>, key_fn: F) -> (Vec<T>, usize)
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    if rows.len() < 2 {
        return (rows, 0);
    }
    let total = rows.len();
    let mut seen: HashSet<K> = HashSet::new();
    let mut kept: Vec<T> = Vec::with_capacity(total);
    for row in rows.into_iter().rev() {
        if seen.insert(key_fn(&row)) {
            kept.push(row);
        }
    }
    let dropped = total - kept.len();
    kept.reverse();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_occurrence_per_key() {
        let rows = vec![("a", 1), ("b", 1), ("a", 2), ("c", 1), ("a", 3)];
        let (kept, dropped) = dedupe_keep_last(rows, |r| r.0);
        assert_eq!(kept, vec![("b", 1), ("c", 1), ("a", 3)]);
        assert_eq!(dropped, 2);
    }

    #[test]
    fn no_duplicates_is_a_no_op() {
        let rows = vec![("a", 1), ("b", 2)];
        let (kept, dropped) = dedupe_keep_last(rows.clone(), |r| r.0);
        assert_eq!(kept, rows);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn short_batches_pass_through() {
        let rows = vec![("a", 1)];
        let (kept, dropped) = dedupe_keep_last(rows, |r| r.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, 0);
    }
}
