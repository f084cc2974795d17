//! Row types flowing through the engine.
//!
//! Three kinds of rows are persisted per stage and version:
//! - Content `(target_key, source_key, value)`, sorted by `(TK, SK)`
//! - KeyMappings `(source_key, target_key)`, sorted by `(SK, TK)`
//! - Updates `(kind, key, value?)`, sorted by key
//!
//! Instructions are ephemeral rows describing one add or delete to apply
//! against the previous version; they only ever live in scratch streams.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::order::Comparator;

/// Anything the row-group codec can persist.
pub trait Row: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Row for T {}

/// Key types additionally need cloning and debug formatting (for errors).
pub trait Key: Row + Clone + fmt::Debug {}
impl<T: Row + Clone + fmt::Debug> Key for T {}

/// Value types are opaque; the engine only ever clones them.
pub trait Value: Row + Clone {}
impl<T: Row + Clone> Value for T {}

/// Kind of an externally visible change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Add,
    Update,
    Delete,
}

/// One externally supplied change to a stage's source dataset.
///
/// Streams of these are sorted by `key`; for a given key a stream holds
/// either exactly one `Delete` or one-or-more non-deletes, never a mix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUpdate<K, V> {
    pub kind: UpdateKind,
    pub key: K,
    /// Absent exactly when `kind` is `Delete`
    pub value: Option<V>,
}

impl<K, V> SourceUpdate<K, V> {
    pub fn add(key: K, value: V) -> Self {
        Self {
            kind: UpdateKind::Add,
            key,
            value: Some(value),
        }
    }

    pub fn update(key: K, value: V) -> Self {
        Self {
            kind: UpdateKind::Update,
            key,
            value: Some(value),
        }
    }

    pub fn delete(key: K) -> Self {
        Self {
            kind: UpdateKind::Delete,
            key,
            value: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == UpdateKind::Delete
    }
}

/// A row of the persisted view, carrying the source key it was produced from.
///
/// Duplicates on `(TK, SK, value)` are allowed and survive productions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord<TK, SK, TV> {
    pub target_key: TK,
    pub source_key: SK,
    pub value: TV,
}

/// One `(SK, TK)` provenance row; multiplicity mirrors Content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMapping<SK, TK> {
    pub source_key: SK,
    pub target_key: TK,
}

/// Ephemeral add/delete against Content, sorted by `(TK, SK)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentInstruction<TK, SK, TV> {
    pub target_key: TK,
    pub source_key: SK,
    /// Absent exactly when `deletion` is set
    pub value: Option<TV>,
    pub deletion: bool,
}

impl<TK, SK, TV> ContentInstruction<TK, SK, TV> {
    pub fn addition(target_key: TK, source_key: SK, value: TV) -> Self {
        Self {
            target_key,
            source_key,
            value: Some(value),
            deletion: false,
        }
    }

    pub fn deletion(target_key: TK, source_key: SK) -> Self {
        Self {
            target_key,
            source_key,
            value: None,
            deletion: true,
        }
    }
}

/// Ephemeral add/delete against KeyMappings, sorted by `(SK, TK)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingInstruction<SK, TK> {
    pub source_key: SK,
    pub target_key: TK,
    pub deletion: bool,
}

impl<SK, TK> MappingInstruction<SK, TK> {
    pub fn addition(source_key: SK, target_key: TK) -> Self {
        Self {
            source_key,
            target_key,
            deletion: false,
        }
    }

    pub fn deletion(source_key: SK, target_key: TK) -> Self {
        Self {
            source_key,
            target_key,
            deletion: true,
        }
    }
}

// ============================================================================
// Sort orders
// ============================================================================

/// `(TK, SK)` order over Content rows.
pub fn content_order<TK: Key, SK: Key, TV: Value>(
    tk: &Comparator<TK>,
    sk: &Comparator<SK>,
) -> Comparator<ContentRecord<TK, SK, TV>> {
    let tk = Arc::clone(tk);
    let sk = Arc::clone(sk);
    Arc::new(move |a, b| {
        (*tk)(&a.target_key, &b.target_key)
            .then_with(|| (*sk)(&a.source_key, &b.source_key))
    })
}

/// `(SK, TK)` order over KeyMapping rows.
pub fn mapping_order<SK: Key, TK: Key>(
    sk: &Comparator<SK>,
    tk: &Comparator<TK>,
) -> Comparator<KeyMapping<SK, TK>> {
    let sk = Arc::clone(sk);
    let tk = Arc::clone(tk);
    Arc::new(move |a, b| {
        (*sk)(&a.source_key, &b.source_key)
            .then_with(|| (*tk)(&a.target_key, &b.target_key))
    })
}

/// `(TK, SK)` order over content instructions.
pub fn content_instruction_order<TK: Key, SK: Key, TV: Value>(
    tk: &Comparator<TK>,
    sk: &Comparator<SK>,
) -> Comparator<ContentInstruction<TK, SK, TV>> {
    let tk = Arc::clone(tk);
    let sk = Arc::clone(sk);
    Arc::new(move |a, b| {
        (*tk)(&a.target_key, &b.target_key)
            .then_with(|| (*sk)(&a.source_key, &b.source_key))
    })
}

/// `(SK, TK)` order over mapping instructions.
pub fn mapping_instruction_order<SK: Key, TK: Key>(
    sk: &Comparator<SK>,
    tk: &Comparator<TK>,
) -> Comparator<MappingInstruction<SK, TK>> {
    let sk = Arc::clone(sk);
    let tk = Arc::clone(tk);
    Arc::new(move |a, b| {
        (*sk)(&a.source_key, &b.source_key)
            .then_with(|| (*tk)(&a.target_key, &b.target_key))
    })
}

/// Key order over source updates.
pub fn update_order<K: Key, V: Value>(key: &Comparator<K>) -> Comparator<SourceUpdate<K, V>> {
    let key = Arc::clone(key);
    Arc::new(move |a, b| (*key)(&a.key, &b.key))
}

/// Relative position of a Content row against a content instruction
/// under `(TK, SK)`.
pub fn content_vs_instruction<TK: Key, SK: Key, TV: Value>(
    row: &ContentRecord<TK, SK, TV>,
    ins: &ContentInstruction<TK, SK, TV>,
    tk: &Comparator<TK>,
    sk: &Comparator<SK>,
) -> Ordering {
    (**tk)(&row.target_key, &ins.target_key)
        .then_with(|| (**sk)(&row.source_key, &ins.source_key))
}

/// Relative position of a KeyMapping row against a mapping instruction
/// under `(SK, TK)`.
pub fn mapping_vs_instruction<SK: Key, TK: Key>(
    row: &KeyMapping<SK, TK>,
    ins: &MappingInstruction<SK, TK>,
    sk: &Comparator<SK>,
    tk: &Comparator<TK>,
) -> Ordering {
    (**sk)(&row.source_key, &ins.source_key)
        .then_with(|| (**tk)(&row.target_key, &ins.target_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::natural;

    #[test]
    fn delete_has_no_value() {
        let u: SourceUpdate<u64, String> = SourceUpdate::delete(7);
        assert!(u.is_delete());
        assert!(u.value.is_none());
    }

    #[test]
    fn content_order_is_tk_then_sk() {
        let cmp = content_order::<u64, u64, String>(&natural(), &natural());
        let a = ContentRecord {
            target_key: 1,
            source_key: 9,
            value: "a".to_string(),
        };
        let b = ContentRecord {
            target_key: 2,
            source_key: 1,
            value: "b".to_string(),
        };
        assert_eq!((*cmp)(&a, &b), Ordering::Less);
        let c = ContentRecord {
            target_key: 1,
            source_key: 3,
            value: "c".to_string(),
        };
        assert_eq!((*cmp)(&c, &a), Ordering::Less);
    }
}
