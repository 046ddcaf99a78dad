//! Set algebra over keyed, sorted sequences (C2).
//!
//! Grounded on `src/convert-manifest/activationmapping.c`'s
//! `subtract_activation_mappings` / `intersect/union` helpers, re-expressed
//! as binary-search operations over a sorted slice instead of walking a
//! `GPtrArray` linearly. Every sequence handed to these functions is assumed
//! sorted by `Keyed::key()` -- `Manifest::load` (C1) establishes that
//! invariant once at parse time so the rest of the engine never has to
//! re-sort.

use crate::mapping::{MappingStatus, ServiceMapping};

/// Anything with a well-defined, orderable identity key.
pub trait Keyed {
    type Key: Ord + Clone;
    fn key(&self) -> Self::Key;
}

impl Keyed for ServiceMapping {
    type Key = crate::mapping::ServiceMappingKey;
    fn key(&self) -> Self::Key {
        ServiceMapping::key(self)
    }
}

impl Keyed for crate::mapping::SnapshotMapping {
    type Key = crate::mapping::SnapshotMappingKey;
    fn key(&self) -> Self::Key {
        crate::mapping::SnapshotMapping::key(self)
    }
}

/// Binary-search lookup by key. `O(log n)`. `sorted` must be sorted by key.
pub fn find<'a, T: Keyed>(sorted: &'a [T], k: &T::Key) -> Option<&'a T> {
    sorted
        .binary_search_by(|probe| probe.key().cmp(k))
        .ok()
        .map(|i| &sorted[i])
}

fn contains<T: Keyed>(sorted: &[T], k: &T::Key) -> bool {
    sorted.binary_search_by(|probe| probe.key().cmp(k)).is_ok()
}

/// Items of the smaller side whose key is also present in the larger side.
/// Preserves the sort order of whichever side was smaller (it is already
/// sorted, and filtering a sorted sequence preserves order).
pub fn intersect<T: Keyed + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter(|item| contains(large, &item.key()))
        .cloned()
        .collect()
}

/// Items of `a` whose key is not in `b`. Preserves the sort order of `a`.
pub fn subtract<T: Keyed + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    a.iter()
        .filter(|item| !contains(b, &item.key()))
        .cloned()
        .collect()
}

/// Builds the scheduler's working set: the sorted merge of `old` and `new`,
/// with every entry from `old` initialized to ACTIVATED and every entry from
/// `new` not already covered by `inter` initialized to DEACTIVATED. Entries
/// shared via `inter` appear once, taken from `old`.
pub fn unify(
    old: &[ServiceMapping],
    new: &[ServiceMapping],
    inter: &[ServiceMapping],
) -> Vec<ServiceMapping> {
    let mut out: Vec<ServiceMapping> = Vec::with_capacity(old.len() + new.len());

    for m in old {
        let mut m = m.clone();
        m.status = MappingStatus::Activated;
        out.push(m);
    }
    for m in new {
        if contains(inter, &m.key()) {
            continue;
        }
        let mut m = m.clone();
        m.status = MappingStatus::Deactivated;
        out.push(m);
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ServiceMapping;

    fn mapping(service: &str, target: &str) -> ServiceMapping {
        ServiceMapping::new(service, "main", target)
    }

    #[test]
    fn find_locates_existing_key() {
        let mut xs = vec![mapping("a", "T1"), mapping("b", "T1")];
        xs.sort();
        let found = find(&xs, &("T1".to_string(), "main".to_string(), "b".to_string()));
        assert!(found.is_some());
    }

    #[test]
    fn subtract_law_disjoint_from_b() {
        let mut a = vec![mapping("a", "T1"), mapping("b", "T1"), mapping("c", "T1")];
        a.sort();
        let mut b = vec![mapping("b", "T1")];
        b.sort();
        let diff = subtract(&a, &b);
        for item in &diff {
            assert!(find(&b, &item.key()).is_none());
        }
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn subtract_union_intersect_reconstructs_a() {
        let mut a = vec![mapping("a", "T1"), mapping("b", "T1"), mapping("c", "T1")];
        a.sort();
        let mut b = vec![mapping("b", "T1"), mapping("c", "T1"), mapping("d", "T1")];
        b.sort();

        let inter = intersect(&a, &b);
        let diff = subtract(&a, &b);

        let mut reconstructed: Vec<_> = diff.iter().chain(inter.iter()).map(|m| m.key()).collect();
        reconstructed.sort();
        let mut expected: Vec<_> = a.iter().map(|m| m.key()).collect();
        expected.sort();
        assert_eq!(reconstructed, expected);
    }

    #[test]
    fn unify_marks_old_activated_and_new_only_deactivated() {
        let mut old = vec![mapping("a", "T1"), mapping("b", "T1")];
        old.sort();
        let mut new = vec![mapping("a", "T1"), mapping("c", "T1")];
        new.sort();
        let inter = intersect(&old, &new);
        assert_eq!(inter.len(), 1);

        let union = unify(&old, &new, &inter);
        assert_eq!(union.len(), old.len() + new.len() - inter.len());

        let activated: Vec<_> = union
            .iter()
            .filter(|m| m.status == MappingStatus::Activated)
            .collect();
        let deactivated: Vec<_> = union
            .iter()
            .filter(|m| m.status == MappingStatus::Deactivated)
            .collect();
        assert_eq!(activated.len(), old.len());
        assert_eq!(deactivated.len(), new.len() - inter.len());
    }
}
