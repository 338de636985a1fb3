//! Single-entry ZIP peek and on-the-fly DEFLATE decompression
//!
//! Only the local file header at offset 0 is inspected; central directories
//! are never read because the tail of the archive is never fetched.

use bytes::{Bytes, BytesMut};
use flate2::{Decompress, FlushDecompress, Status};
use futures::stream::{self, Stream, StreamExt};
use std::io;

use crate::pipeline::core::ArchiveEnvelope;

/// Local file header signature, little-endian `PK\x03\x04`
const LOCAL_FILE_HEADER_MAGIC: u32 = 0x0403_4b50;
const LOCAL_FILE_HEADER_LEN: usize = 30;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const INFLATE_OUT_CHUNK: usize = 64 * 1024;

const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "7z", "rar", "tar", "gz", "tgz", "bz2", "xz"];

/// Outcome of inspecting the first chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZipPeek {
    /// No usable ZIP local file header
    NotArchive,
    /// A ZIP entry stored without compression; bytes pass through untouched
    Stored,
    /// A DEFLATE entry whose payload starts inside the first chunk
    Deflate(ArchiveEnvelope),
}

/// Whether the filename carries an archive extension
pub fn is_archive_name(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

/// Whether the first chunk should be inspected for a ZIP envelope
pub fn should_peek(filename: Option<&str>, is_share_link: bool) -> bool {
    is_share_link || filename.is_none_or(is_archive_name)
}

/// Inspect a first chunk for a single-entry ZIP local file header
pub fn peek_zip(first: &[u8]) -> ZipPeek {
    if first.len() <= LOCAL_FILE_HEADER_LEN || le_u32(&first[0..4]) != LOCAL_FILE_HEADER_MAGIC {
        return ZipPeek::NotArchive;
    }

    match le_u16(&first[8..10]) {
        METHOD_STORED => ZipPeek::Stored,
        METHOD_DEFLATE => {
            let name_len = le_u16(&first[26..28]) as usize;
            let extra_len = le_u16(&first[28..30]) as usize;
            let payload_offset = LOCAL_FILE_HEADER_LEN + name_len + extra_len;

            if first.len() < payload_offset {
                return ZipPeek::NotArchive;
            }

            let raw_name = &first[LOCAL_FILE_HEADER_LEN..LOCAL_FILE_HEADER_LEN + name_len];
            let name = String::from_utf8_lossy(raw_name).into_owned();
            let inner_name = (!name.is_empty() && !name.ends_with('/')).then_some(name);

            ZipPeek::Deflate(ArchiveEnvelope {
                inner_name,
                payload_offset,
            })
        }
        _ => ZipPeek::NotArchive,
    }
}

struct InflateState<S> {
    raw: S,
    decompress: Decompress,
    pending: Bytes,
    raw_done: bool,
    needs_input: bool,
    finished: bool,
}

/// Splice a raw-DEFLATE decoder in front of `raw`
///
/// `already_read` is the payload portion of the first chunk and is decoded
/// before anything is pulled from `raw`. When `raw` ends before the DEFLATE
/// stream does, the last item is an `UnexpectedEof` error; callers decide
/// whether the output produced so far is acceptable.
pub fn inflate_stream<S>(already_read: Bytes, raw: S) -> impl Stream<Item = io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let state = InflateState {
        raw,
        decompress: Decompress::new(false),
        pending: already_read,
        raw_done: false,
        needs_input: false,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if (state.pending.is_empty() || state.needs_input) && !state.raw_done {
                match state.raw.next().await {
                    Some(Ok(chunk)) => {
                        if state.pending.is_empty() {
                            state.pending = chunk;
                        } else {
                            let mut joined = BytesMut::with_capacity(state.pending.len() + chunk.len());
                            joined.extend_from_slice(&state.pending);
                            joined.extend_from_slice(&chunk);
                            state.pending = joined.freeze();
                        }
                        state.needs_input = false;
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                    None => state.raw_done = true,
                }
            }

            let mut out = vec![0u8; INFLATE_OUT_CHUNK];
            let before_in = state.decompress.total_in();
            let before_out = state.decompress.total_out();

            let status = match state.decompress.decompress(&state.pending, &mut out, FlushDecompress::None) {
                Ok(status) => status,
                Err(e) => {
                    state.finished = true;
                    let error = io::Error::new(io::ErrorKind::InvalidData, e);
                    return Some((Err(error), state));
                }
            };

            let consumed = (state.decompress.total_in() - before_in) as usize;
            let produced = (state.decompress.total_out() - before_out) as usize;
            state.pending = state.pending.slice(consumed..);

            if status == Status::StreamEnd {
                state.finished = true;
                if produced == 0 {
                    return None;
                }
            }

            if produced > 0 {
                out.truncate(produced);
                return Some((Ok(Bytes::from(out)), state));
            }

            if consumed == 0 {
                if state.raw_done {
                    state.finished = true;
                    let error = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected end of file in deflate payload",
                    );
                    return Some((Err(error), state));
                }
                state.needs_input = true;
            }
        }
    })
}

#[inline(always)]
fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

#[inline(always)]
fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
