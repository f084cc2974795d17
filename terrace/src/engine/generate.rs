//! Instruction generation.
//!
//! A single forward scan walks the prior key mappings and the incoming
//! source updates together, both ordered by source key. Every touched key
//! first retracts its old productions (one deletion instruction per prior
//! mapping), then — unless the update is a delete — re-runs the user
//! producer over the key's values and records one addition instruction per
//! produced pair. Instructions land in external sorters because producers
//! may emit target keys in any order.

use std::cmp::Ordering;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cursor::Cursor;
use crate::model::{
    ContentInstruction, Key, KeyMapping, MappingInstruction, SourceUpdate, Value,
};
use crate::order::Comparator;
use crate::sort::MergeSorter;
use crate::{ensure_active, Result, TerraceError};

/// The user function of a stage: turns one source key and its values into
/// target pairs.
///
/// `produce` must drain `values` before returning and may emit pairs in any
/// order, including none at all.
#[async_trait]
pub trait Producer<SK: Key, SV: Value, TK: Key, TV: Value>: Send + Sync {
    async fn produce(
        &self,
        key: &SK,
        values: &mut SourceValues<'_, SK, SV>,
        out: &mut ProducedRows<'_, SK, TK, TV>,
    ) -> Result<()>;
}

/// Single-use sequence of the values carried by one key's updates.
///
/// Reads from the shared update cursor and stops at the first strictly
/// greater key, so a producer can only ever see its own key's values.
pub struct SourceValues<'a, SK: Key, SV: Value> {
    cursor: &'a mut Cursor<SourceUpdate<SK, SV>>,
    key: &'a SK,
    cmp: &'a Comparator<SK>,
}

impl<SK: Key, SV: Value> SourceValues<'_, SK, SV> {
    pub async fn next(&mut self) -> Result<Option<SV>> {
        if !self.cursor.valid() {
            return Ok(None);
        }
        match (**self.cmp)(&self.cursor.value().key, self.key) {
            Ordering::Greater => Ok(None),
            Ordering::Less => Err(TerraceError::Ordering(format!(
                "source updates regressed to key {:?} while producing {:?}",
                self.cursor.value().key,
                self.key
            ))),
            Ordering::Equal => {
                let update = self.cursor.take().await?;
                if update.is_delete() {
                    return Err(TerraceError::Ordering(format!(
                        "delete mixed with other updates for key {:?}",
                        update.key
                    )));
                }
                update.value.ok_or_else(|| {
                    TerraceError::Ordering(format!(
                        "non-delete update without a value for key {:?}",
                        update.key
                    ))
                })
                .map(Some)
            }
        }
    }
}

/// Sink for the pairs a producer emits; each pair becomes one content
/// addition and one mapping addition.
pub struct ProducedRows<'a, SK: Key, TK: Key, TV: Value> {
    key: &'a SK,
    content: &'a mut MergeSorter<ContentInstruction<TK, SK, TV>>,
    mappings: &'a mut MergeSorter<MappingInstruction<SK, TK>>,
    cancel: &'a CancellationToken,
    emitted: u64,
}

impl<SK: Key, TK: Key, TV: Value> ProducedRows<'_, SK, TK, TV> {
    pub async fn emit(&mut self, target_key: TK, value: TV) -> Result<()> {
        self.content
            .push(
                ContentInstruction::addition(target_key.clone(), self.key.clone(), value),
                self.cancel,
            )
            .await?;
        self.mappings
            .push(
                MappingInstruction::addition(self.key.clone(), target_key),
                self.cancel,
            )
            .await?;
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// Scan prior mappings and source updates together, filling both
/// instruction sorters.
pub async fn generate_instructions<SK: Key, SV: Value, TK: Key, TV: Value>(
    producer: &dyn Producer<SK, SV, TK, TV>,
    mappings: &mut Cursor<KeyMapping<SK, TK>>,
    updates: &mut Cursor<SourceUpdate<SK, SV>>,
    source_cmp: &Comparator<SK>,
    content_sorter: &mut MergeSorter<ContentInstruction<TK, SK, TV>>,
    mapping_sorter: &mut MergeSorter<MappingInstruction<SK, TK>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut produced_keys = 0u64;
    while updates.valid() {
        ensure_active(cancel)?;
        let key = updates.value().key.clone();

        // retract every prior production of this key; mappings for
        // untouched keys pass by untouched
        while mappings.valid()
            && (**source_cmp)(&mappings.value().source_key, &key) == Ordering::Less
        {
            mappings.next().await?;
        }
        while mappings.valid()
            && (**source_cmp)(&mappings.value().source_key, &key) == Ordering::Equal
        {
            let mapping = mappings.take().await?;
            content_sorter
                .push(
                    ContentInstruction::deletion(
                        mapping.target_key.clone(),
                        mapping.source_key.clone(),
                    ),
                    cancel,
                )
                .await?;
            mapping_sorter
                .push(
                    MappingInstruction::deletion(mapping.source_key, mapping.target_key),
                    cancel,
                )
                .await?;
        }

        if updates.value().is_delete() {
            updates.take().await?;
            if updates.valid() {
                match (**source_cmp)(&updates.value().key, &key) {
                    Ordering::Greater => {}
                    Ordering::Equal => {
                        return Err(TerraceError::Ordering(format!(
                            "delete for key {:?} followed by more updates for the same key",
                            key
                        )))
                    }
                    Ordering::Less => {
                        return Err(TerraceError::Ordering(format!(
                            "source updates regressed after key {:?}",
                            key
                        )))
                    }
                }
            }
        } else {
            let mut values = SourceValues {
                cursor: &mut *updates,
                key: &key,
                cmp: source_cmp,
            };
            let mut out = ProducedRows {
                key: &key,
                content: &mut *content_sorter,
                mappings: &mut *mapping_sorter,
                cancel,
                emitted: 0,
            };
            producer.produce(&key, &mut values, &mut out).await?;
            produced_keys += 1;
            if updates.valid() {
                match (**source_cmp)(&updates.value().key, &key) {
                    Ordering::Greater => {}
                    Ordering::Equal => {
                        return Err(TerraceError::ProducerUnderconsumed(format!("{:?}", key)))
                    }
                    Ordering::Less => {
                        return Err(TerraceError::Ordering(format!(
                            "source updates regressed after key {:?}",
                            key
                        )))
                    }
                }
            }
        }
    }
    log::debug!("instruction generation covered {} produced keys", produced_keys);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProductionConfig;
    use crate::order::natural;
    use crate::store::{LocalTempStreams, TempStreams};
    use crate::stream_rows;
    use futures::TryStreamExt;
    use std::sync::Arc;

    /// Emits (value, key) for every value, i.e. swaps key and value.
    struct SwapProducer;

    #[async_trait]
    impl Producer<u64, u64, u64, u64> for SwapProducer {
        async fn produce(
            &self,
            key: &u64,
            values: &mut SourceValues<'_, u64, u64>,
            out: &mut ProducedRows<'_, u64, u64, u64>,
        ) -> Result<()> {
            while let Some(value) = values.next().await? {
                out.emit(value, *key).await?;
            }
            Ok(())
        }
    }

    /// Returns without reading any values.
    struct LazyProducer;

    #[async_trait]
    impl Producer<u64, u64, u64, u64> for LazyProducer {
        async fn produce(
            &self,
            _key: &u64,
            _values: &mut SourceValues<'_, u64, u64>,
            _out: &mut ProducedRows<'_, u64, u64, u64>,
        ) -> Result<()> {
            Ok(())
        }
    }

    async fn run(
        producer: &dyn Producer<u64, u64, u64, u64>,
        prior_mappings: Vec<KeyMapping<u64, u64>>,
        updates: Vec<SourceUpdate<u64, u64>>,
    ) -> Result<(
        Vec<ContentInstruction<u64, u64, u64>>,
        Vec<MappingInstruction<u64, u64>>,
    )> {
        let cancel = CancellationToken::new();
        let temps: Arc<dyn TempStreams> = Arc::new(LocalTempStreams::new());
        let config = ProductionConfig::default();
        let source_cmp = natural::<u64>();
        let mut content_sorter = MergeSorter::new(
            "content-instructions",
            crate::model::content_instruction_order(&natural(), &source_cmp),
            &config,
            Arc::clone(&temps),
        );
        let mut mapping_sorter = MergeSorter::new(
            "mapping-instructions",
            crate::model::mapping_instruction_order(&source_cmp, &natural()),
            &config,
            temps,
        );
        let mut mappings = Cursor::new(stream_rows(prior_mappings)).await?;
        let mut updates = Cursor::new(stream_rows(updates)).await?;
        generate_instructions(
            producer,
            &mut mappings,
            &mut updates,
            &source_cmp,
            &mut content_sorter,
            &mut mapping_sorter,
            &cancel,
        )
        .await?;
        let content: Vec<_> = content_sorter.finish(&cancel).await?.try_collect().await?;
        let mapping: Vec<_> = mapping_sorter.finish(&cancel).await?.try_collect().await?;
        Ok((content, mapping))
    }

    #[tokio::test]
    async fn add_produces_addition_instructions() {
        let (content, mapping) = run(
            &SwapProducer,
            vec![],
            vec![SourceUpdate::add(1, 10), SourceUpdate::add(2, 20)],
        )
        .await
        .unwrap();
        assert_eq!(content.len(), 2);
        assert!(!content[0].deletion);
        assert_eq!(content[0].target_key, 10);
        assert_eq!(content[0].source_key, 1);
        assert_eq!(mapping.len(), 2);
    }

    #[tokio::test]
    async fn update_retracts_prior_mappings_first() {
        let (content, _mapping) = run(
            &SwapProducer,
            vec![KeyMapping {
                source_key: 1,
                target_key: 99,
            }],
            vec![SourceUpdate::update(1, 10)],
        )
        .await
        .unwrap();
        // deletion of the old production plus the new addition
        assert_eq!(content.len(), 2);
        assert!(content.iter().any(|i| i.deletion && i.target_key == 99));
        assert!(content.iter().any(|i| !i.deletion && i.target_key == 10));
    }

    #[tokio::test]
    async fn untouched_mappings_are_ignored() {
        let (content, mapping) = run(
            &SwapProducer,
            vec![
                KeyMapping {
                    source_key: 1,
                    target_key: 11,
                },
                KeyMapping {
                    source_key: 3,
                    target_key: 33,
                },
            ],
            vec![SourceUpdate::delete(2)],
        )
        .await
        .unwrap();
        assert!(content.is_empty());
        assert!(mapping.is_empty());
    }

    #[tokio::test]
    async fn regressing_keys_are_rejected() {
        let err = run(
            &SwapProducer,
            vec![],
            vec![SourceUpdate::add(5, 50), SourceUpdate::add(3, 30)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TerraceError::Ordering(_)));
    }

    #[tokio::test]
    async fn delete_followed_by_same_key_is_rejected() {
        let err = run(
            &SwapProducer,
            vec![],
            vec![SourceUpdate::delete(5), SourceUpdate::add(5, 50)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TerraceError::Ordering(_)));
    }

    #[tokio::test]
    async fn underconsuming_producer_is_rejected() {
        let err = run(&LazyProducer, vec![], vec![SourceUpdate::add(5, 50)])
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::ProducerUnderconsumed(_)));
    }

    #[tokio::test]
    async fn multiple_values_reach_one_produce_call() {
        let (content, _) = run(
            &SwapProducer,
            vec![],
            vec![
                SourceUpdate::add(1, 10),
                SourceUpdate::add(1, 11),
                SourceUpdate::add(2, 20),
            ],
        )
        .await
        .unwrap();
        assert_eq!(content.len(), 3);
    }
}
