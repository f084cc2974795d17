//! Multi-source input assembly.
//!
//! A stage fed by several upstream stages needs one ordered update stream.
//! Three layers build it: the union of every feeder's touched keys, one
//! augmented stream per feeder (real updates for keys the feeder touched,
//! rows promoted from its content for the rest), and a global merge of the
//! augmented streams collapsed through the delta deduplicator.

use std::cmp::Ordering;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

use crate::codec::{read_rows, RowWriter};
use crate::config::ProductionConfig;
use crate::cursor::Cursor;
use crate::engine::delta::dedupe_updates;
use crate::merge::{dedup_adjacent, merge_streams};
use crate::model::{update_order, Key, SourceUpdate, Value};
use crate::order::Comparator;
use crate::stage::Version;
use crate::store::TempStreams;
use crate::Result;

/// Read side of an upstream stage, keyed by its target types.
#[async_trait]
pub trait UpdateSource<K: Key, V: Value>: Send + Sync {
    fn source_name(&self) -> &str;

    /// The feeder's published delta stream at `version`, ordered by key.
    async fn update_stream(
        &self,
        version: Version,
    ) -> Result<BoxStream<'static, Result<SourceUpdate<K, V>>>>;

    /// The feeder's content at `version` projected to `(key, value)` pairs,
    /// ordered by key with equal keys adjacent.
    async fn content_pairs(
        &self,
        version: Version,
    ) -> Result<BoxStream<'static, Result<(K, V)>>>;
}

/// Build the single ordered source-update stream of a stage from its
/// feeders' streams at `version`.
pub async fn merge_sources<K: Key, V: Value>(
    feeders: &[Arc<dyn UpdateSource<K, V>>],
    version: Version,
    key_cmp: &Comparator<K>,
    config: &ProductionConfig,
    temps: &Arc<dyn TempStreams>,
    cancel: &CancellationToken,
) -> Result<BoxStream<'static, Result<SourceUpdate<K, V>>>> {
    // union of affected keys, persisted so every feeder can walk it
    let mut key_streams: Vec<BoxStream<'static, Result<K>>> = Vec::new();
    for feeder in feeders {
        let updates = feeder.update_stream(version).await?;
        key_streams.push(Box::pin(updates.map_ok(|u| u.key)));
    }
    let mut affected = dedup_adjacent(
        merge_streams(key_streams, Arc::clone(key_cmp)),
        Arc::clone(key_cmp),
    );
    let scratch = temps.scratch("affected-keys").await?;
    let mut writer = RowWriter::<K>::new(scratch.stream()?, config.rows_per_group);
    let mut affected_count = 0u64;
    while let Some(key) = affected.try_next().await? {
        writer.push(key, cancel).await?;
        affected_count += 1;
    }
    writer.finish(cancel).await?;
    log::debug!(
        "merging {} feeders at version {}: {} affected keys",
        feeders.len(),
        version,
        affected_count
    );

    let mut augmented = Vec::with_capacity(feeders.len());
    for feeder in feeders {
        // the read handles keep the scratch data alive after it is dropped
        let keys = read_rows::<K>(scratch.stream()?);
        let updates = Cursor::new(feeder.update_stream(version).await?).await?;
        let content = Cursor::new(feeder.content_pairs(version).await?).await?;
        augmented.push(augment_feeder(keys, updates, content, Arc::clone(key_cmp)));
    }

    let merged = merge_streams(augmented, update_order(key_cmp));
    Ok(dedupe_updates(merged, Arc::clone(key_cmp)))
}

/// One feeder's view of the affected keys: its own updates where it touched
/// the key, its stored content otherwise.
fn augment_feeder<K: Key, V: Value>(
    affected: BoxStream<'static, Result<K>>,
    mut updates: Cursor<SourceUpdate<K, V>>,
    mut content: Cursor<(K, V)>,
    cmp: Comparator<K>,
) -> BoxStream<'static, Result<SourceUpdate<K, V>>> {
    Box::pin(try_stream! {
        let mut affected = affected;
        while let Some(key) = affected.try_next().await? {
            if updates.valid() && (*cmp)(&updates.value().key, &key) == Ordering::Equal {
                while updates.valid() && (*cmp)(&updates.value().key, &key) == Ordering::Equal {
                    let update = updates.take().await?;
                    yield update;
                }
            } else {
                while content.valid() && (*cmp)(&content.value().0, &key) == Ordering::Less {
                    content.next().await?;
                }
                while content.valid() && (*cmp)(&content.value().0, &key) == Ordering::Equal {
                    let (k, v) = content.take().await?;
                    yield SourceUpdate::update(k, v);
                }
            }
        }
    })
}
