//! Instruction execution.
//!
//! Two reconcilers merge sorted instruction streams against the prior
//! version's streams. The mapping reconciler is a plain group-wise merge
//! under `(SK, TK)` where instructions replace existing rows at equal keys.
//! The content reconciler walks `(TK, SK)` and additionally derives the
//! downstream delta stream: deletes funnel through [`DeltaState`] so a later
//! upsert for the same target key can cancel them, and everything funnels
//! through [`DeltaDedup`] so each published key carries either one Delete or
//! its non-deletes.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::codec::RowWriter;
use crate::cursor::Cursor;
use crate::engine::delta::{DeltaDedup, DeltaState};
use crate::model::{
    content_vs_instruction, mapping_vs_instruction, ContentInstruction, ContentRecord, Key,
    KeyMapping, MappingInstruction, SourceUpdate, Value,
};
use crate::order::Comparator;
use crate::{ensure_active, Result, TerraceError};

/// Hook carrying identity fields from a previously persisted value with the
/// same target key (e.g. an assigned id) into a freshly produced one.
pub type PreserveHook<TV> = Arc<dyn Fn(&mut TV, Option<&TV>) + Send + Sync>;

/// Apply mapping instructions to the prior KeyMappings stream.
pub async fn execute_mapping_instructions<SK: Key, TK: Key>(
    existing: &mut Cursor<KeyMapping<SK, TK>>,
    instructions: &mut Cursor<MappingInstruction<SK, TK>>,
    source_cmp: &Comparator<SK>,
    target_cmp: &Comparator<TK>,
    out: &mut RowWriter<KeyMapping<SK, TK>>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut emitted = 0u64;
    loop {
        ensure_active(cancel)?;
        let take_instruction = match (existing.valid(), instructions.valid()) {
            (false, false) => break,
            (false, true) => true,
            (true, false) => false,
            // instructions precede existing rows at identical (SK, TK)
            (true, true) => {
                mapping_vs_instruction(
                    existing.value(),
                    instructions.value(),
                    source_cmp,
                    target_cmp,
                ) != Ordering::Less
            }
        };
        if take_instruction {
            let sk = instructions.value().source_key.clone();
            let tk = instructions.value().target_key.clone();
            while instructions.valid()
                && (**source_cmp)(&instructions.value().source_key, &sk) == Ordering::Equal
                && (**target_cmp)(&instructions.value().target_key, &tk) == Ordering::Equal
            {
                let ins = instructions.take().await?;
                if !ins.deletion {
                    out.push(
                        KeyMapping {
                            source_key: ins.source_key,
                            target_key: ins.target_key,
                        },
                        cancel,
                    )
                    .await?;
                    emitted += 1;
                }
            }
            while existing.valid()
                && (**source_cmp)(&existing.value().source_key, &sk) == Ordering::Equal
                && (**target_cmp)(&existing.value().target_key, &tk) == Ordering::Equal
            {
                existing.next().await?;
            }
        } else {
            let row = existing.take().await?;
            out.push(row, cancel).await?;
            emitted += 1;
        }
    }
    Ok(emitted)
}

/// Per-target-key delta events flowing out of the content reconciler.
pub struct DeltaSink<TK: Key, TV: Value> {
    state: DeltaState<TK, TV>,
    dedup: DeltaDedup<TK, TV>,
    writer: Option<RowWriter<SourceUpdate<TK, TV>>>,
    rows: u64,
}

impl<TK: Key, TV: Value> DeltaSink<TK, TV> {
    /// A `None` writer swallows the derived deltas.
    pub fn new(cmp: Comparator<TK>, writer: Option<RowWriter<SourceUpdate<TK, TV>>>) -> Self {
        Self {
            state: DeltaState::new(Arc::clone(&cmp)),
            dedup: DeltaDedup::new(cmp),
            writer,
            rows: 0,
        }
    }

    pub async fn send_delete(&mut self, key: TK, cancel: &CancellationToken) -> Result<()> {
        self.state.send_delete(key);
        self.pump(cancel).await
    }

    pub async fn send_upsert(&mut self, key: TK, value: TV, cancel: &CancellationToken) -> Result<()> {
        self.state.send_upsert(key, value);
        self.pump(cancel).await
    }

    async fn pump(&mut self, cancel: &CancellationToken) -> Result<()> {
        let staged: Vec<_> = self.state.drain().collect();
        for update in staged {
            self.dedup.push(update);
        }
        let ready: Vec<_> = self.dedup.drain().collect();
        for update in ready {
            self.rows += 1;
            if let Some(writer) = self.writer.as_mut() {
                writer.push(update, cancel).await?;
            }
        }
        Ok(())
    }

    /// Flush residual state and close the delta writer.
    ///
    /// Returns the number of delta rows published.
    pub async fn finish(mut self, cancel: &CancellationToken) -> Result<u64> {
        self.state.finish();
        self.pump(cancel).await?;
        self.dedup.finish();
        let ready: Vec<_> = self.dedup.drain().collect();
        for update in ready {
            self.rows += 1;
            if let Some(writer) = self.writer.as_mut() {
                writer.push(update, cancel).await?;
            }
        }
        if let Some(writer) = self.writer.take() {
            writer.finish(cancel).await?;
        }
        Ok(self.rows)
    }
}

/// Rolling window of the two most recent instruction target keys.
///
/// An existing row copied through unchanged still needs an upsert delta when
/// its target key was touched by the previous or the upcoming instruction;
/// two slots cover both adjacencies.
struct TargetWindow<TK: Key> {
    prev: Option<TK>,
    cur: Option<TK>,
    cmp: Comparator<TK>,
}

impl<TK: Key> TargetWindow<TK> {
    fn new(cmp: Comparator<TK>) -> Self {
        Self {
            prev: None,
            cur: None,
            cmp,
        }
    }

    fn observe(&mut self, key: &TK) {
        let same = self
            .cur
            .as_ref()
            .map(|c| (*self.cmp)(c, key) == Ordering::Equal)
            .unwrap_or(false);
        if !same {
            self.prev = self.cur.take();
            self.cur = Some(key.clone());
        }
    }

    fn contains(&self, key: &TK) -> bool {
        let hit = |slot: &Option<TK>| {
            slot.as_ref()
                .map(|s| (*self.cmp)(s, key) == Ordering::Equal)
                .unwrap_or(false)
        };
        hit(&self.cur) || hit(&self.prev)
    }
}

/// At most two recently seen `(TK, value)` exemplars from prior content.
struct ExemplarCache<TK: Key, TV: Value> {
    slots: Vec<(TK, TV)>,
    cmp: Comparator<TK>,
}

impl<TK: Key, TV: Value> ExemplarCache<TK, TV> {
    fn new(cmp: Comparator<TK>) -> Self {
        Self {
            slots: Vec::with_capacity(2),
            cmp,
        }
    }

    fn insert(&mut self, key: &TK, value: &TV) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|(k, _)| (*self.cmp)(k, key) == Ordering::Equal)
        {
            slot.1 = value.clone();
            return;
        }
        if self.slots.len() == 2 {
            self.slots.remove(0);
        }
        self.slots.push((key.clone(), value.clone()));
    }

    fn get(&self, key: &TK) -> Option<&TV> {
        self.slots
            .iter()
            .find(|(k, _)| (*self.cmp)(k, key) == Ordering::Equal)
            .map(|(_, v)| v)
    }
}

fn require_value<TV>(value: Option<TV>) -> Result<TV> {
    value.ok_or(TerraceError::InvalidStreamFormat)
}

/// Apply content instructions to the prior Content stream, writing the new
/// content and deriving the delta stream.
pub async fn execute_content_instructions<TK: Key, SK: Key, TV: Value>(
    existing: &mut Cursor<ContentRecord<TK, SK, TV>>,
    instructions: &mut Cursor<ContentInstruction<TK, SK, TV>>,
    target_cmp: &Comparator<TK>,
    source_cmp: &Comparator<SK>,
    out: &mut RowWriter<ContentRecord<TK, SK, TV>>,
    deltas: &mut DeltaSink<TK, TV>,
    preserve: Option<&PreserveHook<TV>>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut window = TargetWindow::new(Arc::clone(target_cmp));
    let mut exemplars = ExemplarCache::new(Arc::clone(target_cmp));
    let mut emitted = 0u64;

    loop {
        ensure_active(cancel)?;
        if instructions.valid() {
            window.observe(&instructions.value().target_key);
        }
        let relation = match (existing.valid(), instructions.valid()) {
            (false, false) => break,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (true, true) => content_vs_instruction(
                existing.value(),
                instructions.value(),
                target_cmp,
                source_cmp,
            ),
        };
        match relation {
            // instructions and existing rows share (TK, SK): the existing
            // rows are replaced by whatever the instructions say
            Ordering::Equal => {
                let tk = instructions.value().target_key.clone();
                let sk = instructions.value().source_key.clone();
                while existing.valid()
                    && (**target_cmp)(&existing.value().target_key, &tk) == Ordering::Equal
                    && (**source_cmp)(&existing.value().source_key, &sk) == Ordering::Equal
                {
                    let row = existing.take().await?;
                    exemplars.insert(&row.target_key, &row.value);
                }
                while instructions.valid()
                    && (**target_cmp)(&instructions.value().target_key, &tk) == Ordering::Equal
                    && (**source_cmp)(&instructions.value().source_key, &sk) == Ordering::Equal
                {
                    let ins = instructions.take().await?;
                    if ins.deletion {
                        deltas.send_delete(tk.clone(), cancel).await?;
                    } else {
                        let mut value = require_value(ins.value)?;
                        if let Some(hook) = preserve {
                            (**hook)(&mut value, exemplar(&exemplars, existing, &tk, target_cmp));
                        }
                        deltas.send_upsert(tk.clone(), value.clone(), cancel).await?;
                        out.push(
                            ContentRecord {
                                target_key: tk.clone(),
                                source_key: sk.clone(),
                                value,
                            },
                            cancel,
                        )
                        .await?;
                        emitted += 1;
                    }
                }
            }
            // instruction targets a (TK, SK) with no existing content
            Ordering::Greater => {
                let ins = instructions.take().await?;
                if ins.deletion {
                    return Err(TerraceError::UnexpectedDeletion(format!(
                        "({:?}, {:?})",
                        ins.target_key, ins.source_key
                    )));
                }
                let mut value = require_value(ins.value)?;
                if let Some(hook) = preserve {
                    (**hook)(
                        &mut value,
                        exemplar(&exemplars, existing, &ins.target_key, target_cmp),
                    );
                }
                deltas
                    .send_upsert(ins.target_key.clone(), value.clone(), cancel)
                    .await?;
                out.push(
                    ContentRecord {
                        target_key: ins.target_key,
                        source_key: ins.source_key,
                        value,
                    },
                    cancel,
                )
                .await?;
                emitted += 1;
            }
            // existing row passes through; re-publish it when its target key
            // sits in the instruction window, so downstream sees the whole
            // list of values for a touched key
            Ordering::Less => {
                let row = existing.take().await?;
                exemplars.insert(&row.target_key, &row.value);
                if window.contains(&row.target_key) {
                    deltas
                        .send_upsert(row.target_key.clone(), row.value.clone(), cancel)
                        .await?;
                }
                out.push(row, cancel).await?;
                emitted += 1;
            }
        }
    }
    Ok(emitted)
}

/// A previously persisted value for `key`: recently passed rows first, then
/// a peek at the not-yet-consumed head of the existing stream.
fn exemplar<'a, TK: Key, SK: Key, TV: Value>(
    cache: &'a ExemplarCache<TK, TV>,
    existing: &'a Cursor<ContentRecord<TK, SK, TV>>,
    key: &TK,
    target_cmp: &Comparator<TK>,
) -> Option<&'a TV> {
    if let Some(value) = cache.get(key) {
        return Some(value);
    }
    if existing.valid() && (**target_cmp)(&existing.value().target_key, key) == Ordering::Equal {
        return Some(&existing.value().value);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpdateKind;
    use crate::order::natural;
    use crate::store::{LocalTempStreams, TempStreams};
    use crate::stream_rows;
    use futures::TryStreamExt;

    async fn run_mappings(
        existing: Vec<KeyMapping<u64, u64>>,
        instructions: Vec<MappingInstruction<u64, u64>>,
    ) -> Vec<KeyMapping<u64, u64>> {
        let cancel = CancellationToken::new();
        let temps = LocalTempStreams::new();
        let scratch = temps.scratch("mappings").await.unwrap();
        let mut writer = RowWriter::new(scratch.stream().unwrap(), 100);
        let mut existing = Cursor::new(stream_rows(existing)).await.unwrap();
        let mut instructions = Cursor::new(stream_rows(instructions)).await.unwrap();
        execute_mapping_instructions(
            &mut existing,
            &mut instructions,
            &natural(),
            &natural(),
            &mut writer,
            &cancel,
        )
        .await
        .unwrap();
        writer.finish(&cancel).await.unwrap();
        crate::codec::read_rows(scratch.stream().unwrap())
            .try_collect()
            .await
            .unwrap()
    }

    fn km(sk: u64, tk: u64) -> KeyMapping<u64, u64> {
        KeyMapping {
            source_key: sk,
            target_key: tk,
        }
    }

    #[tokio::test]
    async fn no_instructions_copies_existing() {
        let out = run_mappings(vec![km(1, 1), km(2, 2)], vec![]).await;
        assert_eq!(out, vec![km(1, 1), km(2, 2)]);
    }

    #[tokio::test]
    async fn deletion_removes_all_duplicates() {
        let out = run_mappings(
            vec![km(1, 1), km(1, 1), km(2, 2)],
            vec![MappingInstruction::deletion(1, 1)],
        )
        .await;
        assert_eq!(out, vec![km(2, 2)]);
    }

    #[tokio::test]
    async fn additions_replace_existing_multiplicity() {
        let out = run_mappings(
            vec![km(1, 1)],
            vec![
                MappingInstruction::deletion(1, 1),
                MappingInstruction::addition(1, 1),
                MappingInstruction::addition(1, 1),
                MappingInstruction::addition(1, 1),
            ],
        )
        .await;
        assert_eq!(out, vec![km(1, 1), km(1, 1), km(1, 1)]);
    }

    #[derive(Debug)]
    struct ContentRun {
        content: Vec<ContentRecord<u64, u64, String>>,
        deltas: Vec<SourceUpdate<u64, String>>,
    }

    async fn run_content(
        existing: Vec<ContentRecord<u64, u64, String>>,
        instructions: Vec<ContentInstruction<u64, u64, String>>,
        preserve: Option<PreserveHook<String>>,
    ) -> Result<ContentRun> {
        let cancel = CancellationToken::new();
        let temps = LocalTempStreams::new();
        let content_scratch = temps.scratch("content").await?;
        let delta_scratch = temps.scratch("deltas").await?;
        let mut writer = RowWriter::new(content_scratch.stream()?, 100);
        let delta_writer = RowWriter::new(delta_scratch.stream()?, 100);
        let mut sink = DeltaSink::new(natural(), Some(delta_writer));
        let mut existing = Cursor::new(stream_rows(existing)).await?;
        let mut instructions = Cursor::new(stream_rows(instructions)).await?;
        execute_content_instructions(
            &mut existing,
            &mut instructions,
            &natural(),
            &natural(),
            &mut writer,
            &mut sink,
            preserve.as_ref(),
            &cancel,
        )
        .await?;
        writer.finish(&cancel).await?;
        sink.finish(&cancel).await?;
        Ok(ContentRun {
            content: crate::codec::read_rows(content_scratch.stream()?)
                .try_collect()
                .await?,
            deltas: crate::codec::read_rows(delta_scratch.stream()?)
                .try_collect()
                .await?,
        })
    }

    fn cr(tk: u64, sk: u64, v: &str) -> ContentRecord<u64, u64, String> {
        ContentRecord {
            target_key: tk,
            source_key: sk,
            value: v.to_string(),
        }
    }

    #[tokio::test]
    async fn no_instructions_copies_content_with_no_deltas() {
        let run = run_content(vec![cr(1, 1, "a"), cr(2, 2, "b")], vec![], None)
            .await
            .unwrap();
        assert_eq!(run.content, vec![cr(1, 1, "a"), cr(2, 2, "b")]);
        assert!(run.deltas.is_empty());
    }

    #[tokio::test]
    async fn addition_into_empty_content() {
        let run = run_content(
            vec![],
            vec![ContentInstruction::addition(3, 1, "x".to_string())],
            None,
        )
        .await
        .unwrap();
        assert_eq!(run.content, vec![cr(3, 1, "x")]);
        assert_eq!(run.deltas, vec![SourceUpdate::update(3, "x".to_string())]);
    }

    #[tokio::test]
    async fn deletion_without_content_is_structural_error() {
        let err = run_content(vec![], vec![ContentInstruction::deletion(3, 1)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::UnexpectedDeletion(_)));
    }

    #[tokio::test]
    async fn delete_then_readd_same_target_suppresses_delete() {
        // source key 1 stops producing target 5, source key 2 starts
        let run = run_content(
            vec![cr(5, 1, "old")],
            vec![
                ContentInstruction::deletion(5, 1),
                ContentInstruction::addition(5, 2, "new".to_string()),
            ],
            None,
        )
        .await
        .unwrap();
        assert_eq!(run.content, vec![cr(5, 2, "new")]);
        assert_eq!(run.deltas, vec![SourceUpdate::update(5, "new".to_string())]);
    }

    #[tokio::test]
    async fn lone_deletion_publishes_delete() {
        let run = run_content(
            vec![cr(5, 1, "old"), cr(6, 1, "keep")],
            vec![ContentInstruction::deletion(5, 1)],
            None,
        )
        .await
        .unwrap();
        assert_eq!(run.content, vec![cr(6, 1, "keep")]);
        assert_eq!(run.deltas.len(), 1);
        assert_eq!(run.deltas[0].kind, UpdateKind::Delete);
        assert_eq!(run.deltas[0].key, 5);
    }

    #[tokio::test]
    async fn untouched_row_sharing_touched_target_is_republished() {
        // target 5 keeps its row from source 9 while source 1 gets replaced;
        // downstream must see the full value list for target 5 again
        let run = run_content(
            vec![cr(5, 1, "old"), cr(5, 9, "other")],
            vec![
                ContentInstruction::deletion(5, 1),
                ContentInstruction::addition(5, 1, "new".to_string()),
            ],
            None,
        )
        .await
        .unwrap();
        assert_eq!(run.content, vec![cr(5, 1, "new"), cr(5, 9, "other")]);
        assert_eq!(
            run.deltas,
            vec![
                SourceUpdate::update(5, "new".to_string()),
                SourceUpdate::update(5, "other".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn preserve_hook_sees_replaced_value() {
        let hook: PreserveHook<String> = Arc::new(|value, exemplar| {
            if let Some(prev) = exemplar {
                value.push_str(":kept-");
                value.push_str(prev);
            }
        });
        let run = run_content(
            vec![cr(5, 1, "id7")],
            vec![
                ContentInstruction::deletion(5, 1),
                ContentInstruction::addition(5, 1, "fresh".to_string()),
            ],
            Some(hook),
        )
        .await
        .unwrap();
        assert_eq!(run.content[0].value, "fresh:kept-id7");
    }

    #[tokio::test]
    async fn preserve_hook_sees_later_sibling_value() {
        // the exemplar row sits at a higher source key than the instruction
        let hook: PreserveHook<String> = Arc::new(|value, exemplar| {
            if let Some(prev) = exemplar {
                *value = format!("{value}:{prev}");
            }
        });
        let run = run_content(
            vec![cr(5, 9, "sibling")],
            vec![ContentInstruction::addition(5, 2, "fresh".to_string())],
            Some(hook),
        )
        .await
        .unwrap();
        assert_eq!(run.content[0].value, "fresh:sibling");
        assert_eq!(run.content[1].value, "sibling");
    }
}
