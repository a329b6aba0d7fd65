//! Streaming tar+gzip codec.
//!
//! The writer appends entries straight into a gzip encoder feeding a bounded
//! in-memory pipe, so a slow consumer pauses the producer. The reader is a
//! pull iterator: at most one entry is in flight, and moving to the next entry
//! discards whatever the caller left unread. Memory use is bounded by the pipe
//! and read buffers regardless of archive size or entry count.
//!
//! Written headers are ustar. Reading goes through `tar::Archive`, so GNU long
//! names, pax `path` records and header checksums are handled there; the
//! compressed input is read to its end so the gzip trailer is verified.

use async_compression::Level;
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use thiserror::Error;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

const BLOCK_SIZE: u64 = 512;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Either side of an entry copy failed.
    #[error("stream error during tar operation: {0}")]
    Stream(#[source] std::io::Error),

    /// The compressed input or the tar framing inside it is unreadable.
    #[error("unreadable archive: {0}")]
    Archive(#[source] std::io::Error),

    #[error("invalid entry name {name:?}: {reason}")]
    InvalidEntryName { name: String, reason: String },

    #[error("entry {name} declared {expected} bytes but its source produced {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

// =============================================================================
// Packing
// =============================================================================

/// Writes tar entries through gzip into `W`.
pub struct ArchiveWriter<W: AsyncWrite + Unpin> {
    encoder: GzipEncoder<W>,
}

/// Create a connected writer/output pair.
///
/// Bytes written through the writer come out of the returned `DuplexStream`
/// gzip-compressed at the fastest level. `chunk_size` bounds how much
/// compressed data can be pending before the writer waits for the reader.
pub fn create_pack_streams(chunk_size: usize) -> (ArchiveWriter<DuplexStream>, DuplexStream) {
    let (input, output) = tokio::io::duplex(chunk_size);
    (ArchiveWriter::new(input), output)
}

impl<W: AsyncWrite + Unpin> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            encoder: GzipEncoder::with_quality(inner, Level::Fastest),
        }
    }

    /// Append a regular-file entry of exactly `size` bytes read from `source`.
    ///
    /// Fails with [`CodecError::SizeMismatch`] if the source ends early or has
    /// bytes left over.
    pub async fn append_entry<R>(
        &mut self,
        name: &str,
        size: u64,
        source: &mut R,
    ) -> CodecResult<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let header = file_header(name, size)?;
        self.encoder
            .write_all(header.as_bytes())
            .await
            .map_err(CodecError::Stream)?;

        let copied = tokio::io::copy(&mut (&mut *source).take(size), &mut self.encoder)
            .await
            .map_err(CodecError::Stream)?;
        if copied != size {
            return Err(CodecError::SizeMismatch {
                name: name.to_string(),
                expected: size,
                actual: copied,
            });
        }
        let mut probe = [0u8; 1];
        if source.read(&mut probe).await.map_err(CodecError::Stream)? != 0 {
            return Err(CodecError::SizeMismatch {
                name: name.to_string(),
                expected: size,
                actual: size + 1,
            });
        }

        let padding = padding_for(size) as usize;
        if padding > 0 {
            self.encoder
                .write_all(&[0u8; BLOCK_SIZE as usize][..padding])
                .await
                .map_err(CodecError::Stream)?;
        }
        debug!(entry = %name, size, "Appended archive entry");
        Ok(())
    }

    /// Append an in-memory entry.
    pub async fn append_bytes(&mut self, name: &str, data: &[u8]) -> CodecResult<()> {
        self.append_entry(name, data.len() as u64, &mut &data[..])
            .await
    }

    /// Write the end-of-archive marker, flush the gzip trailer and shut the
    /// output down. Returns the inner writer.
    pub async fn finish(mut self) -> CodecResult<W> {
        self.encoder
            .write_all(&[0u8; 2 * BLOCK_SIZE as usize])
            .await
            .map_err(CodecError::Stream)?;
        self.encoder.shutdown().await.map_err(CodecError::Stream)?;
        Ok(self.encoder.into_inner())
    }
}

/// Pipe one source into one archive entry, logging failures with `context`.
///
/// Every failure comes back as [`CodecError::Stream`].
pub async fn pipe_entry<W, R>(
    writer: &mut ArchiveWriter<W>,
    name: &str,
    size: u64,
    source: &mut R,
    context: &str,
) -> CodecResult<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
{
    writer
        .append_entry(name, size, source)
        .await
        .map_err(|e| match e {
            CodecError::Stream(e) => CodecError::Stream(e),
            other => CodecError::Stream(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other,
            )),
        })
        .inspect_err(|e| {
            warn!(entry = %name, context = %context, error = %e, "Archive entry failed")
        })
}

fn file_header(name: &str, size: u64) -> CodecResult<tar::Header> {
    let mut header = tar::Header::new_ustar();
    header
        .set_path(name)
        .map_err(|e| CodecError::InvalidEntryName {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    Ok(header)
}

fn padding_for(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

// =============================================================================
// Extraction
// =============================================================================

/// Bytes the extraction worker reads from an entry at a time.
const ENTRY_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the extraction worker and the entry consumer.
const ENTRY_CHANNEL_DEPTH: usize = 4;

/// Kind of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Symlinks, hard links, devices and anything else we do not import.
    Other,
}

/// Header of the entry currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

type EntryData = mpsc::Receiver<std::io::Result<Bytes>>;
type EntryMessage = CodecResult<(EntryHeader, EntryData)>;

/// Pull-based reader over a gzip-compressed tar stream.
///
/// Parsing is done by `tar::Archive` on a blocking worker reading the
/// decompressed input through [`SyncIoBridge`]. The worker hands over one
/// entry at a time and does not look at the next header until the reader
/// asks for it.
pub struct ArchiveReader {
    entries: mpsc::Receiver<EntryMessage>,
    advance: mpsc::Sender<()>,
    worker: Option<JoinHandle<()>>,
    current: Option<EntryBody>,
    /// An entry was handed out and the worker is waiting to be advanced.
    handed_out: bool,
    done: bool,
}

struct EntryBody {
    data: EntryData,
    chunk: Bytes,
}

/// Create a connected input-sink/reader pair. Bytes written into the returned
/// `DuplexStream` are parsed by the reader.
pub fn create_extract_streams(buffer_size: usize) -> (ArchiveReader, DuplexStream) {
    let (sink, source) = tokio::io::duplex(buffer_size);
    (ArchiveReader::new(source), sink)
}

impl ArchiveReader {
    /// Start reading `input`. Must be called from within a Tokio runtime.
    pub fn new<R>(input: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let input = SyncIoBridge::new(GzipDecoder::new(BufReader::new(input)));
        let (entries_tx, entries) = mpsc::channel(1);
        let (advance, advance_rx) = mpsc::channel(1);
        let worker =
            tokio::task::spawn_blocking(move || extraction_worker(input, entries_tx, advance_rx));
        Self {
            entries,
            advance,
            worker: Some(worker),
            current: None,
            handed_out: false,
            done: false,
        }
    }

    /// Advance to the next entry, discarding any unread data of the previous one.
    /// Returns `None` after the end of the archive.
    pub async fn next_entry(&mut self) -> CodecResult<Option<ArchiveEntry<'_>>> {
        if self.done {
            return Ok(None);
        }
        // Closing the body tells the worker to stop sending it; tar skips
        // whatever is left when it moves on.
        self.current = None;
        if self.handed_out {
            self.handed_out = false;
            // A closed channel means the worker has ended; its outcome
            // arrives below.
            let _ = self.advance.send(()).await;
        }

        match self.entries.recv().await {
            Some(Ok((header, data))) => {
                self.handed_out = true;
                self.current = Some(EntryBody {
                    data,
                    chunk: Bytes::new(),
                });
                Ok(Some(ArchiveEntry {
                    header,
                    archive: self,
                }))
            }
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                self.join_worker().await?;
                Ok(None)
            }
        }
    }

    async fn join_worker(&mut self) -> CodecResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.await.map_err(|e| {
            CodecError::Archive(std::io::Error::other(format!(
                "extraction worker failed: {e}"
            )))
        })
    }
}

/// The entry currently in flight. Reading yields exactly `header.size` bytes.
pub struct ArchiveEntry<'a> {
    header: EntryHeader,
    archive: &'a mut ArchiveReader,
}

impl ArchiveEntry<'_> {
    pub fn header(&self) -> &EntryHeader {
        &self.header
    }
}

impl AsyncRead for ArchiveEntry<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let Some(body) = this.archive.current.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        while body.chunk.is_empty() {
            match ready!(body.data.poll_recv(cx)) {
                Some(Ok(chunk)) => body.chunk = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = body.chunk.len().min(buf.remaining());
        buf.put_slice(&body.chunk.split_to(n));
        Poll::Ready(Ok(()))
    }
}

fn extraction_worker<R: std::io::Read>(
    input: R,
    entries: mpsc::Sender<EntryMessage>,
    mut advance: mpsc::Receiver<()>,
) {
    let mut archive = tar::Archive::new(input);
    match walk_entries(&mut archive, &entries, &mut advance) {
        Ok(true) => {}
        Ok(false) => {
            debug!("Archive reader dropped before the end of the archive");
            return;
        }
        Err(e) => {
            let _ = entries.blocking_send(Err(e));
            return;
        }
    }
    // Read past the end-of-archive marker so the gzip trailer is checked.
    if let Err(e) = std::io::copy(&mut archive.into_inner(), &mut std::io::sink()) {
        let _ = entries.blocking_send(Err(CodecError::Archive(e)));
    }
}

/// Hand every entry over in order. `Ok(false)` if the reader went away first.
fn walk_entries<R: std::io::Read>(
    archive: &mut tar::Archive<R>,
    entries: &mpsc::Sender<EntryMessage>,
    advance: &mut mpsc::Receiver<()>,
) -> CodecResult<bool> {
    for entry in archive.entries().map_err(CodecError::Archive)? {
        let mut entry = entry.map_err(CodecError::Archive)?;
        let header = entry_header(&entry);
        let size = header.size;

        let (tx, rx) = mpsc::channel(ENTRY_CHANNEL_DEPTH);
        if entries.blocking_send(Ok((header, rx))).is_err() {
            return Ok(false);
        }
        send_entry_data(&mut entry, size, &tx);
        drop(tx);

        if advance.blocking_recv().is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn entry_header<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> EntryHeader {
    let entry_type = entry.header().entry_type();
    let kind = if entry_type.is_file() || entry_type == tar::EntryType::Continuous {
        EntryKind::File
    } else if entry_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::Other
    };
    EntryHeader {
        name: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
        kind,
        size: entry.size(),
    }
}

/// Forward entry data until it ends or the consumer closes its side.
fn send_entry_data<R: std::io::Read>(
    entry: &mut R,
    size: u64,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
) {
    let mut sent = 0u64;
    loop {
        let mut buf = vec![0u8; ENTRY_CHUNK_SIZE];
        let n = match std::io::Read::read(entry, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        buf.truncate(n);
        sent += n as u64;
        if tx.blocking_send(Ok(Bytes::from(buf))).is_err() {
            return;
        }
    }
    if sent < size {
        let _ = tx.blocking_send(Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "archive truncated inside entry",
        )));
    }
}

// =============================================================================
// Extraction driver
// =============================================================================

/// Callbacks for [`extract_archive`].
#[async_trait]
pub trait ExtractHandler: Send {
    type Output: Send;
    type Error: Send;

    /// Handle one entry. Returning is the only way to advance; whatever the
    /// handler did not read from `entry` is discarded before the next entry.
    async fn on_entry(
        &mut self,
        header: &EntryHeader,
        entry: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Self::Error>;

    /// Adapt a codec failure into the handler's error type.
    fn on_error(&mut self, err: CodecError) -> Self::Error;

    /// Called once after the end of the archive; produces the result.
    async fn on_finish(&mut self) -> Result<Self::Output, Self::Error>;
}

/// Decompress `input` and feed every entry to `handler`, one at a time.
pub async fn extract_archive<R, H>(input: R, handler: &mut H) -> Result<H::Output, H::Error>
where
    R: AsyncRead + Unpin + Send + 'static,
    H: ExtractHandler,
{
    let mut reader = ArchiveReader::new(input);
    loop {
        let mut entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(handler.on_error(e)),
        };
        let header = entry.header().clone();
        handler.on_entry(&header, &mut entry).await?;
    }
    handler.on_finish().await
}
