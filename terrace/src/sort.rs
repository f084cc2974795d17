//! External merge sort.
//!
//! Records accumulate in memory up to the configured batch capacity; full
//! batches are sorted and spilled to scratch streams. Reading performs a
//! k-way merge across all spilled batches. The in-memory sort is stable, and
//! the merge resolves ties to the earliest batch, so records comparing equal
//! keep their insertion order end to end.

use std::sync::Arc;

use futures::stream::BoxStream;
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::codec::{read_rows, RowWriter};
use crate::config::ProductionConfig;
use crate::merge::merge_streams;
use crate::model::Row;
use crate::order::Comparator;
use crate::store::{Scratch, TempStreams};
use crate::{ensure_active, Result};

pub struct MergeSorter<T: Row> {
    label: String,
    cmp: Comparator<T>,
    buf: Vec<T>,
    capacity: usize,
    rows_per_group: usize,
    batches: Vec<Scratch>,
    temps: Arc<dyn TempStreams>,
}

impl<T: Row> MergeSorter<T> {
    pub fn new(
        label: impl Into<String>,
        cmp: Comparator<T>,
        config: &ProductionConfig,
        temps: Arc<dyn TempStreams>,
    ) -> Self {
        Self {
            label: label.into(),
            cmp,
            buf: Vec::new(),
            capacity: config.batch_capacity().max(1),
            rows_per_group: config.rows_per_group,
            batches: Vec::new(),
            temps,
        }
    }

    pub async fn push(&mut self, row: T, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)?;
        self.buf.push(row);
        if self.buf.len() >= self.capacity {
            self.spill(cancel).await?;
        }
        Ok(())
    }

    fn sort_buffer(&mut self) {
        let cmp = Arc::clone(&self.cmp);
        self.buf.par_sort_by(move |a, b| (*cmp)(a, b));
    }

    async fn spill(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.sort_buffer();
        let scratch = self.temps.scratch(&self.label).await?;
        let mut writer = RowWriter::new(scratch.stream()?, self.rows_per_group);
        let rows = std::mem::take(&mut self.buf);
        log::debug!(
            "sorter {}: spilling batch {} ({} rows)",
            self.label,
            self.batches.len(),
            rows.len()
        );
        writer.add_batch(rows, cancel).await?;
        writer.finish(cancel).await?;
        self.batches.push(scratch);
        Ok(())
    }

    /// Finish accepting rows and return the fully sorted stream.
    pub async fn finish(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<T>>> {
        ensure_active(cancel)?;
        if self.batches.is_empty() {
            self.sort_buffer();
            return Ok(crate::stream_rows(self.buf));
        }
        if !self.buf.is_empty() {
            self.spill(cancel).await?;
        }
        if self.batches.len() == 1 {
            return Ok(read_rows(self.batches[0].stream()?));
        }
        let mut readers = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            readers.push(read_rows::<T>(batch.stream()?));
        }
        Ok(merge_streams(readers, self.cmp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::natural;
    use crate::store::LocalTempStreams;
    use futures::TryStreamExt;

    fn small_config() -> ProductionConfig {
        ProductionConfig {
            rows_per_group: 4,
            groups_per_batch: 2,
        }
    }

    async fn sort_all(rows: Vec<u64>) -> Vec<u64> {
        let cancel = CancellationToken::new();
        let temps: Arc<dyn TempStreams> = Arc::new(LocalTempStreams::new());
        let mut sorter = MergeSorter::new("test", natural(), &small_config(), temps);
        for row in rows {
            sorter.push(row, &cancel).await.unwrap();
        }
        sorter
            .finish(&cancel)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sorts_in_memory() {
        assert_eq!(sort_all(vec![3, 1, 2]).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sorts_across_spilled_batches() {
        // capacity is 8, so 30 rows spill into multiple batches
        let rows: Vec<u64> = (0..30).rev().collect();
        assert_eq!(sort_all(rows).await, (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_sorter_yields_empty() {
        assert!(sort_all(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn equal_rows_keep_insertion_order() {
        let cancel = CancellationToken::new();
        let temps: Arc<dyn TempStreams> = Arc::new(LocalTempStreams::new());
        let key_cmp = crate::order::by_key(|p: &(u64, u32)| &p.0, natural());
        let mut sorter = MergeSorter::new("stable", key_cmp, &small_config(), temps);
        for (i, key) in [5u64, 5, 1, 5, 1].iter().enumerate() {
            sorter.push((*key, i as u32), &cancel).await.unwrap();
        }
        let out: Vec<(u64, u32)> = sorter
            .finish(&cancel)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out, vec![(1, 2), (1, 4), (5, 0), (5, 1), (5, 3)]);
    }
}
