use std::{cell::Cell, rc::Rc, time::Duration};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{error::Error, stream::Reader};

/// Chunk size cap for body reads.
pub(crate) const BODY_CHUNK: usize = 65_536;

/// Streaming request body bounded by `Content-Length`.
///
/// Chunks are pulled lazily off the connection reader; nothing is buffered
/// ahead of the caller. Once the declared length is consumed the stream is
/// exhausted and further calls return `None`. A connection that dies mid
/// body yields whatever partial chunk arrived, then ends.
pub struct BodyReader {
    reader: Rc<Mutex<Reader>>,
    remaining: u64,
    timeout: Option<Duration>,
    // shared with the owning request so the connection knows how much of
    // the declared length actually left the wire.
    consumed: Rc<Cell<u64>>,
}

impl BodyReader {
    pub(crate) fn new(
        reader: Rc<Mutex<Reader>>,
        content_length: u64,
        timeout: Option<Duration>,
        consumed: Rc<Cell<u64>>,
    ) -> Self {
        Self {
            reader,
            remaining: content_length,
            timeout,
            consumed,
        }
    }

    /// Bytes of declared body length not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Next chunk of the body, at most 65536 bytes.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        if self.remaining == 0 {
            return None;
        }

        let want = (self.remaining).min(BODY_CHUNK as u64) as usize;
        let mut reader = self.reader.lock().await;

        match reader.read(want, self.timeout).await {
            Ok(bytes) => {
                self.remaining -= bytes.len() as u64;
                self.consumed.set(self.consumed.get() + bytes.len() as u64);
                Some(Ok(bytes))
            }
            Err(Error::PartialRead(partial)) => {
                self.remaining = 0;
                if partial.is_empty() {
                    None
                } else {
                    Some(Ok(partial))
                }
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    /// Drain the rest of the body into one buffer.
    pub async fn collect(&mut self) -> Result<Bytes, Error> {
        let mut out = bytes::BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}
