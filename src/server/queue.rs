use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use tokio::net::TcpStream;

/// Upper bound on the size of a single queued chunk, in bytes.
pub const MAX_CHUNK_SIZE: usize = 256;

/// A destination that accepts byte slices without blocking.
///
/// `try_send` returns the number of bytes accepted, which may be less than
/// `buf.len()`. A would-block condition must be reported as `Ok(0)` rather
/// than an error so callers can distinguish "not writable right now" from a
/// dead connection.
pub trait ChunkSink {
    fn try_send(&self, buf: &[u8]) -> io::Result<usize>;
}

impl ChunkSink for TcpStream {
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        match self.try_write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

struct QueueInner {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already accepted by the sink.
    sent: usize,
}

/// Per-connection ordered outbound buffer.
///
/// Bytes pushed are split into chunks of at most [`MAX_CHUNK_SIZE`] bytes and
/// drained strictly in order, at most one chunk in flight. Concatenating the
/// unsent remainder of the front chunk with all later chunks always yields
/// exactly the pushed-but-unsent bytes in submission order.
///
/// The queue is unbounded in chunk count: a stalled peer accumulates memory.
/// That is a deliberate simplicity trade-off and a known capacity risk.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::new(),
                sent: 0,
            }),
        }
    }

    /// Appends `source` to the queue, split into bounded chunks.
    ///
    /// Zero-length input is a no-op.
    pub fn push(&self, source: &[u8]) {
        if source.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for piece in source.chunks(MAX_CHUNK_SIZE) {
            inner.chunks.push_back(piece.to_vec());
        }
    }

    /// Attempts to write the unsent remainder of the front chunk to `sink`.
    ///
    /// Returns the number of bytes the sink accepted (0 when the queue is
    /// empty or the sink is not currently writable). On `Err` the queue state
    /// is left untouched; the caller is expected to treat the connection as
    /// dead.
    pub fn send<S: ChunkSink + ?Sized>(&self, sink: &S) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let front = match inner.chunks.front() {
            Some(chunk) => chunk,
            None => return Ok(0),
        };
        let accepted = sink.try_send(&front[inner.sent..])?;
        inner.sent += accepted;
        if inner.sent == inner.chunks.front().map(Vec::len).unwrap_or(0) {
            inner.chunks.pop_front();
            inner.sent = 0;
        }
        Ok(accepted)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().chunks.is_empty()
    }

    #[cfg(test)]
    fn chunk_lengths(&self) -> Vec<usize> {
        self.inner
            .lock()
            .unwrap()
            .chunks
            .iter()
            .map(Vec::len)
            .collect()
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Sink that accepts lengths from a scripted pattern, collecting every
    /// accepted byte. An exhausted pattern repeats its last entry.
    struct PatternSink {
        pattern: RefCell<VecDeque<Accept>>,
        received: RefCell<Vec<u8>>,
    }

    #[derive(Clone, Copy)]
    enum Accept {
        Bytes(usize),
        Fail,
    }

    impl PatternSink {
        fn new(pattern: Vec<Accept>) -> Self {
            Self {
                pattern: RefCell::new(pattern.into()),
                received: RefCell::new(Vec::new()),
            }
        }

        fn all() -> Self {
            Self::new(vec![Accept::Bytes(usize::MAX)])
        }
    }

    impl ChunkSink for PatternSink {
        fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
            let mut pattern = self.pattern.borrow_mut();
            let step = if pattern.len() > 1 {
                pattern.pop_front().unwrap()
            } else {
                *pattern.front().unwrap()
            };
            match step {
                Accept::Fail => Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
                Accept::Bytes(n) => {
                    let n = n.min(buf.len());
                    self.received.borrow_mut().extend_from_slice(&buf[..n]);
                    Ok(n)
                }
            }
        }
    }

    #[test]
    fn push_empty_is_noop() {
        let queue = SendQueue::new();
        queue.push(b"");
        assert!(queue.is_empty());
    }

    #[test]
    fn splits_600_bytes_into_bounded_chunks() {
        let queue = SendQueue::new();
        queue.push(&vec![0xAB; 600]);
        assert_eq!(queue.chunk_lengths(), vec![256, 256, 88]);

        let sink = PatternSink::all();
        for expect_empty in [false, false, true] {
            queue.send(&sink).unwrap();
            assert_eq!(queue.is_empty(), expect_empty);
        }
        assert_eq!(sink.received.borrow().len(), 600);
    }

    #[test]
    fn partial_accepts_preserve_order_and_content() {
        let queue = SendQueue::new();
        let payload: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        queue.push(&payload[..300]);
        queue.push(&payload[300..]);

        let sink = PatternSink::new(vec![
            Accept::Bytes(1),
            Accept::Bytes(0),
            Accept::Bytes(7),
            Accept::Bytes(200),
            Accept::Bytes(3),
            Accept::Bytes(usize::MAX),
        ]);
        let mut guard = 0;
        while !queue.is_empty() {
            queue.send(&sink).unwrap();
            guard += 1;
            assert!(guard < 10_000, "queue failed to drain");
        }
        assert_eq!(*sink.received.borrow(), payload);
    }

    #[test]
    fn failed_send_leaves_queue_untouched() {
        let queue = SendQueue::new();
        queue.push(b"hello world");
        let sink = PatternSink::new(vec![Accept::Bytes(4), Accept::Fail]);

        assert_eq!(queue.send(&sink).unwrap(), 4);
        assert!(queue.send(&sink).is_err());
        // The failure must not have consumed the in-flight chunk.
        assert!(!queue.is_empty());

        let ok = PatternSink::all();
        queue.send(&ok).unwrap();
        assert_eq!(*ok.received.borrow(), b"o world");
    }

    #[test]
    fn send_on_empty_queue_succeeds_trivially() {
        let queue = SendQueue::new();
        let sink = PatternSink::all();
        assert_eq!(queue.send(&sink).unwrap(), 0);
        assert!(sink.received.borrow().is_empty());
    }
}
