//! Message bodies as ordered chunk sequences.

use bytes::{Bytes, BytesMut};

/// An ordered sequence of body chunks.
///
/// The write path pulls chunks out by absolute offset, so a body that is
/// retained can be replayed byte-for-byte when a message is restarted on
/// a fresh connection. With accumulation disabled only the running length
/// is tracked and delivered chunks are discarded.
#[derive(Debug, Default)]
pub struct MessageBody {
    chunks: Vec<Bytes>,
    /// Absolute offset of the first retained chunk; advances when
    /// flushed chunks are released.
    start: u64,
    length: u64,
    accumulate: bool,
}

impl MessageBody {
    pub fn new() -> MessageBody {
        MessageBody {
            chunks: Vec::new(),
            start: 0,
            length: 0,
            accumulate: true,
        }
    }

    /// Total number of body bytes seen so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether delivered chunks are retained for later replay.
    pub fn accumulates(&self) -> bool {
        self.accumulate
    }

    pub fn set_accumulate(&mut self, accumulate: bool) {
        self.accumulate = accumulate;
    }

    /// Appends a chunk, retaining it.
    pub fn append<B: Into<Bytes>>(&mut self, data: B) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.length += data.len() as u64;
        self.chunks.push(data);
    }

    /// Records an arriving chunk, retaining it only in accumulate mode.
    pub(crate) fn got_chunk(&mut self, chunk: &Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.length += chunk.len() as u64;
        if self.accumulate {
            self.chunks.push(chunk.clone());
        }
    }

    /// Returns the stored chunk containing `offset`, sliced to start at
    /// that offset.
    ///
    /// An offset exactly at the end of the body yields an empty chunk,
    /// which the write path uses as the end-of-body marker. Offsets past
    /// the end (or inside released data) yield `None`.
    pub fn chunk(&self, offset: u64) -> Option<Bytes> {
        if offset == self.length {
            return Some(Bytes::new());
        }
        if offset < self.start {
            return None;
        }
        let mut base = self.start;
        for chunk in &self.chunks {
            let end = base + chunk.len() as u64;
            if offset < end {
                return Some(chunk.slice((offset - base) as usize..));
            }
            base = end;
        }
        None
    }

    /// Releases retained chunks lying entirely before `offset`. The
    /// write path calls this for streamed bodies once bytes have been
    /// flushed and replay is not required; the running length is
    /// unaffected.
    pub(crate) fn discard_to(&mut self, offset: u64) {
        let mut dropped = 0;
        let mut base = self.start;
        for chunk in &self.chunks {
            let end = base + chunk.len() as u64;
            if end <= offset {
                dropped += 1;
                base = end;
            } else {
                break;
            }
        }
        if dropped > 0 {
            self.chunks.drain(..dropped);
            self.start = base;
        }
    }

    /// Concatenates every retained chunk into one buffer.
    pub fn flatten(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut buf = BytesMut::with_capacity(self.length as usize);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    /// Discards all chunks and resets the length.
    pub fn truncate(&mut self) {
        self.chunks.clear();
        self.start = 0;
        self.length = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::MessageBody;
    use bytes::Bytes;

    #[test]
    fn chunk_by_offset() {
        let mut body = MessageBody::new();
        body.append(&b"hello"[..]);
        body.append(&b" world"[..]);

        assert_eq!(body.chunk(0).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(body.chunk(2).unwrap(), Bytes::from_static(b"llo"));
        assert_eq!(body.chunk(5).unwrap(), Bytes::from_static(b" world"));
        assert_eq!(body.chunk(11).unwrap(), Bytes::new());
        assert!(body.chunk(12).is_none());
    }

    #[test]
    fn flatten_concatenates() {
        let mut body = MessageBody::new();
        body.append(&b"ab"[..]);
        body.append(&b"cd"[..]);
        assert_eq!(body.flatten(), Bytes::from_static(b"abcd"));
    }

    #[test]
    fn discard_to_releases_flushed_chunks() {
        let mut body = MessageBody::new();
        body.append(&b"hello"[..]);
        body.append(&b" world"[..]);

        // Mid-chunk: nothing released yet.
        body.discard_to(3);
        assert_eq!(body.chunk(0).unwrap(), Bytes::from_static(b"hello"));

        body.discard_to(5);
        assert!(body.chunk(0).is_none());
        assert_eq!(body.chunk(5).unwrap(), Bytes::from_static(b" world"));
        assert_eq!(body.len(), 11);

        body.discard_to(11);
        assert!(body.chunk(5).is_none());
        assert_eq!(body.chunk(11).unwrap(), Bytes::new());
    }

    #[test]
    fn no_accumulate_tracks_length_only() {
        let mut body = MessageBody::new();
        body.set_accumulate(false);
        body.got_chunk(&Bytes::from_static(b"hello"));
        assert_eq!(body.len(), 5);
        assert!(body.chunk(0).is_none());
        assert_eq!(body.chunk(5).unwrap(), Bytes::new());
    }
}
