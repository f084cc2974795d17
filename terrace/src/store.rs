//! Stream persistence and scratch space.
//!
//! The persistence adapter is the engine's only I/O boundary: persisted
//! streams are named by `(stage, kind, version)` and are immutable once
//! uploaded. Scratch streams live for a single production and are reclaimed
//! on every exit path.

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::stage::Version;
use crate::{ensure_active, Result};

/// A seekable byte stream the codec can read and write.
pub trait DataStream: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin> DataStream for T {}

pub type BoxedStream = Box<dyn DataStream>;

/// The three persisted streams a stage owns per version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Content,
    KeyMappings,
    Updates,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Content => "content",
            StreamKind::KeyMappings => "mappings",
            StreamKind::Updates => "updates",
        }
    }
}

/// Versioned stream storage.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Open a persisted stream for reading. A missing object reads as an
    /// empty stream.
    async fn open_read(
        &self,
        stage: &str,
        kind: StreamKind,
        version: Version,
    ) -> Result<BoxedStream>;

    /// Persist the full contents of `stream` (positioned at 0) under the
    /// given version. A zero-length stream deletes any existing object.
    async fn upload(
        &self,
        stage: &str,
        kind: StreamKind,
        version: Version,
        stream: BoxedStream,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// A single-production scratch file supporting independent read handles.
pub struct Scratch {
    file: NamedTempFile,
    label: String,
}

impl Scratch {
    /// Fresh handle positioned at 0. Writers and readers each take their own.
    pub fn stream(&self) -> Result<BoxedStream> {
        let file = self.file.reopen().map_err(crate::TerraceError::Io)?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Factory for scratch streams; labels are diagnostic only.
#[async_trait]
pub trait TempStreams: Send + Sync {
    async fn scratch(&self, label: &str) -> Result<Scratch>;
}

/// Scratch files in the system temp dir (or a chosen one).
#[derive(Debug, Clone, Default)]
pub struct LocalTempStreams {
    dir: Option<PathBuf>,
}

impl LocalTempStreams {
    pub fn new() -> Self {
        Self { dir: None }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl TempStreams for LocalTempStreams {
    async fn scratch(&self, label: &str) -> Result<Scratch> {
        let file = match &self.dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        log::debug!("scratch stream {} at {:?}", label, file.path());
        Ok(Scratch {
            file,
            label: label.to_string(),
        })
    }
}

/// Directory-backed stream store: one file per `(stage, kind, version)`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, stage: &str, kind: StreamKind, version: Version) -> PathBuf {
        self.root
            .join(format!("{}.{}.v{}.trc", stage, kind.as_str(), version))
    }
}

#[async_trait]
impl StreamStore for LocalStore {
    async fn open_read(
        &self,
        stage: &str,
        kind: StreamKind,
        version: Version,
    ) -> Result<BoxedStream> {
        let path = self.object_path(stage, kind, version);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(MemStream::new())),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(
        &self,
        stage: &str,
        kind: StreamKind,
        version: Version,
        mut stream: BoxedStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_active(cancel)?;
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        let path = self.object_path(stage, kind, version);
        if bytes.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

/// Growable in-memory stream. Backs empty reads of missing objects and
/// small fixtures.
#[derive(Debug, Default)]
pub struct MemStream {
    data: Vec<u8>,
    pos: usize,
}

impl MemStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl AsyncRead for MemStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.data.len() {
            let n = buf.remaining().min(this.data.len() - this.pos);
            buf.put_slice(&this.data[this.pos..this.pos + n]);
            this.pos += n;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pos > this.data.len() {
            this.data.resize(this.pos, 0);
        }
        let overlap = (this.data.len() - this.pos).min(buf.len());
        this.data[this.pos..this.pos + overlap].copy_from_slice(&buf[..overlap]);
        this.data.extend_from_slice(&buf[overlap..]);
        this.pos += buf.len();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(d) => this.data.len() as i64 + d,
            SeekFrom::Current(d) => this.pos as i64 + d,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        this.pos = target as usize;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    #[tokio::test]
    async fn mem_stream_write_seek_read() {
        let mut s = MemStream::new();
        s.write_all(b"hello world").await.unwrap();
        s.seek(SeekFrom::Start(6)).await.unwrap();
        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"world");
    }

    #[tokio::test]
    async fn missing_object_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let mut stream = store
            .open_read("orders", StreamKind::Content, 3)
            .await
            .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn zero_length_upload_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let cancel = CancellationToken::new();

        store
            .upload(
                "orders",
                StreamKind::Updates,
                1,
                Box::new(MemStream::with_data(b"abc".to_vec())),
                &cancel,
            )
            .await
            .unwrap();
        assert!(dir.path().join("orders.updates.v1.trc").exists());

        store
            .upload(
                "orders",
                StreamKind::Updates,
                1,
                Box::new(MemStream::new()),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!dir.path().join("orders.updates.v1.trc").exists());
    }

    #[tokio::test]
    async fn scratch_handles_are_independent() {
        let temps = LocalTempStreams::new();
        let scratch = temps.scratch("probe").await.unwrap();
        let mut w = scratch.stream().unwrap();
        w.write_all(b"xyz").await.unwrap();
        w.flush().await.unwrap();

        let mut r = scratch.stream().unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xyz");
    }
}
