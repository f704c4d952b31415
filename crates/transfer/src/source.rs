//! Byte sources that serve exact ranges to concurrent chunk tasks.
//!
//! Every [`UploadSource::read_range`] call works on its own reader, so
//! concurrent chunks never share a cursor.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

/// Boxed future used across the source and client traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reader returned by a [`StreamSource`] opener.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens a fresh reader positioned at the start of the content.
pub type OpenReader = Arc<dyn Fn() -> BoxFuture<'static, io::Result<BoxReader>> + Send + Sync>;

/// A byte source of known size that can serve arbitrary ranges.
pub trait UploadSource: Send + Sync {
    /// Current size of the content in bytes.
    fn size(&self) -> BoxFuture<'_, io::Result<u64>>;

    /// Whether several `read_range` calls may run at once cheaply.
    ///
    /// Sources answering `false` are uploaded with a parallelism of 1.
    fn supports_concurrent_reads(&self) -> bool;

    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the content is shorter.
    fn read_range(&self, offset: u64, len: u64) -> BoxFuture<'_, io::Result<Vec<u8>>>;
}

fn buffer_for(len: u64) -> io::Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("range of {len} bytes"))
    })?;
    Ok(vec![0u8; len])
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A local file; each read opens its own handle and seeks.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadSource for FileSource {
    fn size(&self) -> BoxFuture<'_, io::Result<u64>> {
        Box::pin(async move { Ok(tokio::fs::metadata(&self.path).await?.len()) })
    }

    fn supports_concurrent_reads(&self) -> bool {
        true
    }

    fn read_range(&self, offset: u64, len: u64) -> BoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move {
            let mut buf = buffer_for(len)?;
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }
}

// ---------------------------------------------------------------------------
// StreamSource
// ---------------------------------------------------------------------------

/// Forward-only content (e.g. a provider stream) that can be reopened.
///
/// A read reopens the stream and skips `offset` bytes, so by default the
/// source opts out of concurrent reads.
pub struct StreamSource {
    open: OpenReader,
    size: u64,
    concurrent: bool,
}

impl StreamSource {
    /// Creates a source of `size` bytes backed by `open`.
    pub fn new(size: u64, open: OpenReader) -> Self {
        Self {
            open,
            size,
            concurrent: false,
        }
    }

    /// Declares that independent streams are cheap to open in parallel.
    pub fn with_concurrent_reads(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }
}

impl UploadSource for StreamSource {
    fn size(&self) -> BoxFuture<'_, io::Result<u64>> {
        Box::pin(async move { Ok(self.size) })
    }

    fn supports_concurrent_reads(&self) -> bool {
        self.concurrent
    }

    fn read_range(&self, offset: u64, len: u64) -> BoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move {
            let mut buf = buffer_for(len)?;
            let mut reader = (self.open)().await?;

            let skipped =
                tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink()).await?;
            if skipped != offset {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {skipped} of {offset} skipped bytes"),
                ));
            }

            reader.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Content already held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl UploadSource for MemorySource {
    fn size(&self) -> BoxFuture<'_, io::Result<u64>> {
        let size = self.data.len() as u64;
        Box::pin(async move { Ok(size) })
    }

    fn supports_concurrent_reads(&self) -> bool {
        true
    }

    fn read_range(&self, offset: u64, len: u64) -> BoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move {
            let start = usize::try_from(offset).unwrap_or(usize::MAX);
            let end = usize::try_from(len)
                .ok()
                .and_then(|len| start.checked_add(len));
            match end {
                Some(end) if end <= self.data.len() => Ok(self.data[start..end].to_vec()),
                _ => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "range {offset}+{len} past end of {} bytes",
                        self.data.len()
                    ),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DATA: &[u8] = b"0123456789abcdef";

    fn stream_source(opens: Arc<AtomicUsize>) -> StreamSource {
        let open: OpenReader = Arc::new(move || {
            opens.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Box::new(Cursor::new(DATA.to_vec())) as BoxReader) })
                as BoxFuture<'static, io::Result<BoxReader>>
        });
        StreamSource::new(DATA.len() as u64, open)
    }

    #[tokio::test]
    async fn file_source_reads_exact_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, DATA).unwrap();

        let source = FileSource::new(&path);
        assert_eq!(source.size().await.unwrap(), 16);
        assert!(source.supports_concurrent_reads());
        assert_eq!(source.read_range(0, 4).await.unwrap(), b"0123");
        assert_eq!(source.read_range(10, 6).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn file_source_concurrent_reads_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        std::fs::write(&path, &data).unwrap();

        let source = Arc::new(FileSource::new(&path));
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let s = Arc::clone(&source);
            handles.push(tokio::spawn(
                async move { (i, s.read_range(i * 4096, 4096).await) },
            ));
        }
        for h in handles {
            let (i, chunk) = h.await.unwrap();
            let start = (i * 4096) as usize;
            assert_eq!(chunk.unwrap(), &data[start..start + 4096]);
        }
    }

    #[tokio::test]
    async fn file_source_short_read_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, DATA).unwrap();

        let err = FileSource::new(&path).read_range(12, 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn file_source_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path().join("gone.bin"));
        let err = source.size().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn stream_source_reopens_and_skips() {
        let opens = Arc::new(AtomicUsize::new(0));
        let source = stream_source(Arc::clone(&opens));
        assert!(!source.supports_concurrent_reads());

        assert_eq!(source.read_range(4, 4).await.unwrap(), b"4567");
        assert_eq!(source.read_range(0, 2).await.unwrap(), b"01");
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stream_source_skip_past_end() {
        let source = stream_source(Arc::new(AtomicUsize::new(0)));
        let err = source.read_range(20, 1).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn stream_source_opt_in_concurrency() {
        let source = stream_source(Arc::new(AtomicUsize::new(0))).with_concurrent_reads(true);
        assert!(source.supports_concurrent_reads());
    }

    #[tokio::test]
    async fn memory_source_ranges() {
        let source = MemorySource::new(DATA.to_vec());
        assert_eq!(source.size().await.unwrap(), 16);
        assert_eq!(source.read_range(15, 1).await.unwrap(), b"f");
        assert!(source.read_range(15, 2).await.is_err());
        assert!(source.read_range(u64::MAX, 1).await.is_err());
    }
}
