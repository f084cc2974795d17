//! Delta derivation state.
//!
//! The content executor announces per-target-key events while it walks
//! `(TK, SK)` ascending: `send_delete` when a deletion instruction lands,
//! `send_upsert` when a row is (re)emitted. Many deletes are cancelled by a
//! later upsert for the same target key; a downstream Delete must only
//! survive when no upsert for that key does.
//!
//! `DeltaState` holds at most one undecided delete. `DeltaDedup` collapses
//! the resulting raw stream into the published invariant: per key, either
//! exactly one Delete or one-or-more non-deletes.

use std::cmp::Ordering;
use std::collections::VecDeque;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::model::{Key, SourceUpdate, Value};
use crate::order::Comparator;
use crate::Result;

enum Pending<TK> {
    Idle,
    /// A delete was announced and nothing has ruled it out yet.
    Requested(TK),
    /// An upsert for the same key landed; further deletes for it are moot.
    RuledOut(TK),
}

pub struct DeltaState<TK: Key, TV: Value> {
    pending: Pending<TK>,
    cmp: Comparator<TK>,
    out: VecDeque<SourceUpdate<TK, TV>>,
}

impl<TK: Key, TV: Value> DeltaState<TK, TV> {
    pub fn new(cmp: Comparator<TK>) -> Self {
        Self {
            pending: Pending::Idle,
            cmp,
            out: VecDeque::new(),
        }
    }

    fn same(&self, a: &TK, b: &TK) -> bool {
        (*self.cmp)(a, b) == Ordering::Equal
    }

    pub fn send_delete(&mut self, key: TK) {
        self.pending = match std::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => Pending::Requested(key),
            Pending::Requested(t) => {
                if self.same(&t, &key) {
                    Pending::Requested(t)
                } else {
                    self.out.push_back(SourceUpdate::delete(t));
                    Pending::Requested(key)
                }
            }
            Pending::RuledOut(t) => {
                if self.same(&t, &key) {
                    Pending::RuledOut(t)
                } else {
                    Pending::Requested(key)
                }
            }
        };
    }

    pub fn send_upsert(&mut self, key: TK, value: TV) {
        self.pending = match std::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => {
                self.out.push_back(SourceUpdate::update(key, value));
                Pending::Idle
            }
            Pending::Requested(t) => {
                if self.same(&t, &key) {
                    self.out.push_back(SourceUpdate::update(key, value));
                    Pending::RuledOut(t)
                } else {
                    self.out.push_back(SourceUpdate::delete(t));
                    self.out.push_back(SourceUpdate::update(key, value));
                    Pending::Idle
                }
            }
            Pending::RuledOut(t) => {
                if self.same(&t, &key) {
                    self.out.push_back(SourceUpdate::update(key, value));
                    Pending::RuledOut(t)
                } else {
                    self.out.push_back(SourceUpdate::update(key, value));
                    Pending::Idle
                }
            }
        };
    }

    /// Flush any still-pending delete.
    pub fn finish(&mut self) {
        if let Pending::Requested(t) = std::mem::replace(&mut self.pending, Pending::Idle) {
            self.out.push_back(SourceUpdate::delete(t));
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SourceUpdate<TK, TV>> + '_ {
        self.out.drain(..)
    }
}

/// Collapse a key-ordered update stream so that each key carries either one
/// Delete or its non-deletes, never both.
pub struct DeltaDedup<K: Key, V: Value> {
    cmp: Comparator<K>,
    current: Option<K>,
    saw_upsert: bool,
    saw_delete: bool,
    out: VecDeque<SourceUpdate<K, V>>,
}

impl<K: Key, V: Value> DeltaDedup<K, V> {
    pub fn new(cmp: Comparator<K>) -> Self {
        Self {
            cmp,
            current: None,
            saw_upsert: false,
            saw_delete: false,
            out: VecDeque::new(),
        }
    }

    fn close_group(&mut self) {
        if let Some(key) = self.current.take() {
            if self.saw_delete && !self.saw_upsert {
                self.out.push_back(SourceUpdate::delete(key));
            }
        }
        self.saw_upsert = false;
        self.saw_delete = false;
    }

    pub fn push(&mut self, update: SourceUpdate<K, V>) {
        let same_group = self
            .current
            .as_ref()
            .map(|k| (*self.cmp)(k, &update.key) == Ordering::Equal)
            .unwrap_or(false);
        if !same_group {
            self.close_group();
            self.current = Some(update.key.clone());
        }
        if update.is_delete() {
            self.saw_delete = true;
        } else {
            self.saw_upsert = true;
            self.out.push_back(update);
        }
    }

    pub fn finish(&mut self) {
        self.close_group();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SourceUpdate<K, V>> + '_ {
        self.out.drain(..)
    }
}

/// Stream adapter over [`DeltaDedup`].
pub fn dedupe_updates<K: Key, V: Value>(
    input: BoxStream<'static, Result<SourceUpdate<K, V>>>,
    cmp: Comparator<K>,
) -> BoxStream<'static, Result<SourceUpdate<K, V>>> {
    Box::pin(try_stream! {
        let mut input = input;
        let mut dedup = DeltaDedup::new(cmp);
        while let Some(update) = input.try_next().await? {
            dedup.push(update);
            for out in dedup.drain() {
                yield out;
            }
        }
        dedup.finish();
        for out in dedup.drain() {
            yield out;
        }
    })
}
