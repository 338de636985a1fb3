//! Bounded byte collector
//!
//! Streams a response body into a preallocated [`FetchedChunk`]. Once the
//! buffer is full the stream is dropped, which cancels the underlying
//! transfer instead of letting it drain.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use tracing::debug;

use crate::pipeline::core::FetchedChunk;

/// What happened while filling the buffer
#[derive(Debug, Default)]
pub struct CollectOutcome {
    /// Bytes offered by the stream, including any discarded overflow
    pub bytes_seen: u64,
    /// The buffer hit its capacity and the stream was cancelled
    pub truncated: bool,
    /// The stream failed before reaching its end or the capacity
    pub stream_error: Option<io::Error>,
}

/// Fill `chunk` from `first` and then `stream` until full, ended or failed
pub async fn collect<S>(chunk: &mut FetchedChunk, first: Option<Bytes>, mut stream: S) -> CollectOutcome
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut outcome = CollectOutcome::default();

    if let Some(first) = first {
        outcome.bytes_seen += first.len() as u64;
        chunk.fill_from(&first);
    }

    while !chunk.is_full() {
        match stream.next().await {
            Some(Ok(bytes)) => {
                outcome.bytes_seen += bytes.len() as u64;
                let taken = chunk.fill_from(&bytes);
                if taken < bytes.len() {
                    debug!("Collector full, discarding {} overflow bytes", bytes.len() - taken);
                }
            }
            Some(Err(e)) => {
                debug!("Stream error after {} bytes: {}", chunk.len(), e);
                outcome.stream_error = Some(e);
                break;
            }
            None => break,
        }
    }

    if chunk.is_full() {
        outcome.truncated = true;
        debug!("Collected {} bytes, cancelling upstream stream", chunk.len());
    }

    drop(stream);
    outcome
}
