//! Comparator values and composition.
//!
//! Keys are user-chosen types; the engine only needs a total order on them,
//! supplied as shared closures so the same comparator can drive in-memory
//! sorts, spill merges, and cursor walks alike.

use std::cmp::Ordering;
use std::sync::Arc;

/// A shared total order over `T`.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Natural `Ord`-derived comparator.
pub fn natural<T: Ord + 'static>() -> Comparator<T> {
    Arc::new(|a, b| a.cmp(b))
}

/// Reverse a comparator.
pub fn reverse<T: 'static>(inner: Comparator<T>) -> Comparator<T> {
    Arc::new(move |a, b| (*inner)(b, a))
}

/// Compare through a projection.
pub fn by_key<T, K, F>(project: F, cmp: Comparator<K>) -> Comparator<T>
where
    T: 'static,
    K: 'static,
    F: Fn(&T) -> &K + Send + Sync + 'static,
{
    Arc::new(move |a, b| (*cmp)(project(a), project(b)))
}

/// Lexicographic composition: `second` breaks ties of `first`.
///
/// Synthetic tiebreaks (e.g. "instructions before existing rows at equal
/// keys") compose the same way: pass them as `second`.
pub fn lexicographic<T: 'static>(first: Comparator<T>, second: Comparator<T>) -> Comparator<T> {
    Arc::new(move |a, b| (*first)(a, b).then_with(|| (*second)(a, b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_flips() {
        let cmp = reverse(natural::<u32>());
        assert_eq!((*cmp)(&1, &2), Ordering::Greater);
    }

    #[test]
    fn lexicographic_breaks_ties() {
        let first: Comparator<(u32, u32)> = by_key(|p: &(u32, u32)| &p.0, natural());
        let second: Comparator<(u32, u32)> = by_key(|p: &(u32, u32)| &p.1, natural());
        let cmp = lexicographic(first, second);
        assert_eq!((*cmp)(&(1, 5), &(1, 7)), Ordering::Less);
        assert_eq!((*cmp)(&(2, 0), &(1, 7)), Ordering::Greater);
    }
}
