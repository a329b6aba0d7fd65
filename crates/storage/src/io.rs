//! Bridges between object streams and `tokio::io`.
//!
//! The mirror pipeline moves archives as `AsyncRead`s; these helpers connect
//! them to [`ObjectStore`] reads and streaming uploads without buffering whole
//! objects.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMetadata, ObjectStore, StreamingUpload};
use bytes::BytesMut;
use futures::TryStreamExt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::warn;

/// Read size used when pumping a reader into an upload (1 MiB).
pub const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// A boxed object body.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Convert a storage error for use inside `AsyncRead` plumbing.
pub fn into_io_error(err: StorageError) -> std::io::Error {
    match err {
        StorageError::Io(e) => e,
        other => std::io::Error::other(other),
    }
}

/// Adapt a byte stream into an `AsyncRead`.
pub fn stream_reader(stream: ByteStream) -> ObjectReader {
    Box::pin(StreamReader::new(stream.map_err(into_io_error)))
}

/// Open an object for streaming reads.
pub async fn get_reader(store: &dyn ObjectStore, key: &str) -> StorageResult<ObjectReader> {
    Ok(stream_reader(store.get_stream(key).await?))
}

/// Copy everything from `reader` into `upload` without finishing it.
///
/// Returns the number of bytes written.
pub async fn pump_into<R>(reader: &mut R, upload: &mut dyn StreamingUpload) -> StorageResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let mut buf = BytesMut::with_capacity(UPLOAD_CHUNK_SIZE);
        // Fill up to one chunk so backends see reasonably sized writes.
        while buf.len() < UPLOAD_CHUNK_SIZE {
            if reader.read_buf(&mut buf).await? == 0 {
                break;
            }
        }
        if buf.is_empty() {
            return Ok(total);
        }
        total += buf.len() as u64;
        upload.write(buf.freeze()).await?;
    }
}

/// Stream `reader` into a new object. On any error the upload is aborted and
/// nothing becomes visible under `key`.
pub async fn put_reader<R>(
    store: &dyn ObjectStore,
    key: &str,
    metadata: &ObjectMetadata,
    reader: &mut R,
) -> StorageResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut upload = store.put_stream(key, metadata).await?;
    match pump_into(reader, upload.as_mut()).await {
        Ok(_) => upload.finish().await,
        Err(e) => {
            if let Err(abort_err) = upload.abort().await {
                warn!(key = %key, error = %abort_err, "failed to abort upload");
            }
            Err(e)
        }
    }
}
