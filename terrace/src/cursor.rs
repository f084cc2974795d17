//! Single-step forward cursor over an async row stream.
//!
//! The update algorithms are all peek-and-conditionally-advance walks over
//! sorted streams; the cursor keeps the head element loaded so callers can
//! inspect it any number of times before deciding to step.

use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::Result;

pub struct Cursor<T> {
    stream: BoxStream<'static, Result<T>>,
    current: Option<T>,
}

impl<T> Cursor<T> {
    /// Wrap a stream and load its first element.
    pub async fn new(mut stream: BoxStream<'static, Result<T>>) -> Result<Self> {
        let current = stream.try_next().await?;
        Ok(Self { stream, current })
    }

    /// False once the stream is exhausted.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The current element. Panics when the cursor is exhausted; callers
    /// check `valid()` first.
    pub fn value(&self) -> &T {
        match &self.current {
            Some(v) => v,
            None => panic!("value() on exhausted cursor"),
        }
    }

    /// Advance to the next element.
    pub async fn next(&mut self) -> Result<()> {
        self.current = self.stream.try_next().await?;
        Ok(())
    }

    /// Take the current element and advance. Panics when exhausted.
    pub async fn take(&mut self) -> Result<T> {
        let value = match self.current.take() {
            Some(v) => v,
            None => panic!("take() on exhausted cursor"),
        };
        self.current = self.stream.try_next().await?;
        Ok(value)
    }
}
