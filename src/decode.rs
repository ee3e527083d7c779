//! Streaming content decoding.
//!
//! A message may carry a chain of converters; every response body chunk
//! is pushed through the chain before delivery. Converters are plain
//! streaming byte transformers, so the chain works the same for chunked,
//! length-delimited, and EOF-terminated bodies.

use std::cmp;
use std::fmt;
use std::io;

use bytes::Bytes;
use flate2::{Decompress, FlushDecompress, Status as FlateStatus};
use tracing::{debug, warn};

use crate::message::Message;

/// How far one [`Converter::convert`] call got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    /// Progress was made; there may be more of either side left.
    Converted,
    /// The input stream is fully consumed and the converter is done.
    Finished,
    /// No progress was possible; grow the output buffer and retry.
    NoSpace,
}

/// Byte counts for one conversion step.
#[derive(Debug, Clone, Copy)]
pub struct Conversion {
    pub consumed: usize,
    pub produced: usize,
    pub result: Convert,
}

/// A streaming byte transformer. Errors are permanent for the rest of
/// the body.
pub trait Converter: Send {
    fn convert(&mut self, input: &[u8], output: &mut [u8]) -> io::Result<Conversion>;
}

/// Inflates zlib (or raw deflate) streams.
///
/// Servers sometimes send raw deflate data labeled as zlib; when the
/// very first bytes are rejected, the decoder restarts once in raw
/// deflate mode and carries on.
pub struct ZlibDecoder {
    inner: Decompress,
    zlib_header: bool,
    started: bool,
    tried_raw: bool,
}

impl ZlibDecoder {
    /// A decoder expecting the two-byte zlib header.
    pub fn new() -> ZlibDecoder {
        ZlibDecoder {
            inner: Decompress::new(true),
            zlib_header: true,
            started: false,
            tried_raw: false,
        }
    }

    /// A decoder for raw deflate streams.
    pub fn raw() -> ZlibDecoder {
        ZlibDecoder {
            inner: Decompress::new(false),
            zlib_header: false,
            started: false,
            tried_raw: false,
        }
    }
}

impl Default for ZlibDecoder {
    fn default() -> ZlibDecoder {
        ZlibDecoder::new()
    }
}

impl fmt::Debug for ZlibDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZlibDecoder")
            .field("zlib_header", &self.zlib_header)
            .field("started", &self.started)
            .field("tried_raw", &self.tried_raw)
            .finish()
    }
}

impl Converter for ZlibDecoder {
    fn convert(&mut self, input: &[u8], output: &mut [u8]) -> io::Result<Conversion> {
        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            match self.inner.decompress(input, output, FlushDecompress::None) {
                Ok(status) => {
                    let consumed = (self.inner.total_in() - before_in) as usize;
                    let produced = (self.inner.total_out() - before_out) as usize;
                    if consumed > 0 || produced > 0 {
                        self.started = true;
                    }
                    let result = match status {
                        FlateStatus::StreamEnd => Convert::Finished,
                        FlateStatus::Ok | FlateStatus::BufError => {
                            if consumed == 0 && produced == 0 && !input.is_empty() {
                                Convert::NoSpace
                            } else {
                                Convert::Converted
                            }
                        }
                    };
                    return Ok(Conversion {
                        consumed,
                        produced,
                        result,
                    });
                }
                Err(err) => {
                    if self.zlib_header && !self.started && !self.tried_raw {
                        debug!("zlib header rejected, retrying as raw deflate");
                        self.tried_raw = true;
                        self.inner.reset(false);
                        continue;
                    }
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                }
            }
        }
    }
}

/// Runs one converter over `buf`, growing the output until the input is
/// consumed. `None` means the converter buffered everything and produced
/// no output yet.
fn decode_one(converter: &mut dyn Converter, buf: &[u8]) -> io::Result<Option<Bytes>> {
    let mut out = vec![0u8; cmp::max(buf.len() * 2, 1024)];
    let mut out_cur = 0;
    let mut in_cur = 0;

    loop {
        let conv = converter.convert(&buf[in_cur..], &mut out[out_cur..])?;
        in_cur += conv.consumed;
        out_cur += conv.produced;
        match conv.result {
            Convert::NoSpace => {
                let grown = out.len() * 2;
                out.resize(grown, 0);
            }
            Convert::Finished => break,
            Convert::Converted => {
                if in_cur >= buf.len() {
                    break;
                }
                if out_cur == out.len() {
                    let grown = out.len() * 2;
                    out.resize(grown, 0);
                }
            }
        }
    }

    if out_cur > 0 {
        out.truncate(out_cur);
        Ok(Some(Bytes::from(out)))
    } else {
        Ok(None)
    }
}

impl Message {
    /// Pushes one body chunk through the converter chain. `None` means
    /// the chunk was consumed without producing output yet. A permanent
    /// converter error clears the decoded flag and passes the bytes
    /// through as-is for the rest of the body.
    pub(crate) fn decode_chunk(&mut self, buf: Bytes) -> Option<Bytes> {
        let (decoders, flags) = self.decoders_mut();
        let mut buf = buf;
        for decoder in decoders.iter_mut() {
            match decode_one(decoder.as_mut(), &buf) {
                Err(err) => {
                    warn!("content decoding failed: {}", err);
                    flags.content_decoded = false;
                    break;
                }
                Ok(None) => return None,
                Ok(Some(decoded)) => buf = decoded,
            }
        }
        Some(buf)
    }
}
