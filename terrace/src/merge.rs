//! K-way sorted merge over async row streams.
//!
//! The merge tracks one cursor per input and repeatedly takes the smallest
//! head under the supplied comparator. Ties resolve to the earliest input,
//! which keeps the merge stable across spill batches pushed in order.

use std::cmp::Ordering;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::cursor::Cursor;
use crate::order::Comparator;
use crate::Result;

/// Merge pre-sorted streams into one sorted stream.
pub fn merge_streams<T: Send + 'static>(
    streams: Vec<BoxStream<'static, Result<T>>>,
    cmp: Comparator<T>,
) -> BoxStream<'static, Result<T>> {
    Box::pin(try_stream! {
        let mut cursors = Vec::with_capacity(streams.len());
        for stream in streams {
            cursors.push(Cursor::new(stream).await?);
        }
        loop {
            let mut best: Option<usize> = None;
            for (i, cursor) in cursors.iter().enumerate() {
                if !cursor.valid() {
                    continue;
                }
                best = Some(match best {
                    None => i,
                    Some(b) => {
                        if (*cmp)(cursor.value(), cursors[b].value()) == Ordering::Less {
                            i
                        } else {
                            b
                        }
                    }
                });
            }
            match best {
                None => break,
                Some(i) => {
                    let row = cursors[i].take().await?;
                    yield row;
                }
            }
        }
    })
}

/// Drop adjacent rows comparing equal, keeping the first of each run.
pub fn dedup_adjacent<T: Send + 'static>(
    input: BoxStream<'static, Result<T>>,
    cmp: Comparator<T>,
) -> BoxStream<'static, Result<T>>
where
    T: Clone,
{
    Box::pin(try_stream! {
        let mut input = input;
        let mut last: Option<T> = None;
        while let Some(row) = input.try_next().await? {
            let repeated = last
                .as_ref()
                .map(|l| (*cmp)(l, &row) == Ordering::Equal)
                .unwrap_or(false);
            if !repeated {
                last = Some(row.clone());
                yield row;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::natural;
    use crate::stream_rows;

    #[tokio::test]
    async fn merges_three_streams() {
        let merged: Vec<u32> = merge_streams(
            vec![
                stream_rows(vec![1, 4, 7]),
                stream_rows(vec![2, 5, 8]),
                stream_rows(vec![3, 6, 9]),
            ],
            natural(),
        )
        .try_collect()
        .await
        .unwrap();
        assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn ties_resolve_to_earliest_stream() {
        let merged: Vec<(u32, char)> = merge_streams(
            vec![
                stream_rows(vec![(1, 'a'), (2, 'a')]),
                stream_rows(vec![(1, 'b'), (3, 'b')]),
            ],
            crate::order::by_key(|p: &(u32, char)| &p.0, natural()),
        )
        .try_collect()
        .await
        .unwrap();
        assert_eq!(merged, vec![(1, 'a'), (1, 'b'), (2, 'a'), (3, 'b')]);
    }

    #[tokio::test]
    async fn dedup_keeps_first_of_run() {
        let out: Vec<u32> = dedup_adjacent(stream_rows(vec![1, 1, 2, 3, 3, 3, 4]), natural())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }
}
