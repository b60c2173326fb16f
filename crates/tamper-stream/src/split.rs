use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, ReadBuf};

use crate::circular::DynamicCircularBuffer;

struct SplitShared {
    source: Option<Box<dyn AsyncRead + Send + Unpin>>,
    rings: Vec<DynamicCircularBuffer>,
    eof: bool,
    closed: bool,
    // Readers parked on a Pending source; woken whenever new bytes land or the
    // source reaches a terminal state.
    wakers: Vec<Waker>,
}

impl SplitShared {
    fn wake_parked(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }

    /// One physical read of up to `want` bytes, fanned out to every ring
    /// before any handle consumes them.
    fn pull_source(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<io::Result<()>> {
        let Some(source) = self.source.as_mut() else {
            self.eof = true;
            return Poll::Ready(Ok(()));
        };
        let mut chunk = vec![0_u8; want.max(1)];
        let mut read_buf = ReadBuf::new(&mut chunk);
        match Pin::new(source).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(error)) => {
                self.eof = true;
                self.wake_parked();
                Poll::Ready(Err(error))
            }
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    self.eof = true;
                } else {
                    for ring in &mut self.rings {
                        ring.write(filled);
                    }
                }
                self.wake_parked();
                Poll::Ready(Ok(()))
            }
        }
    }
}

/// One of the `n` handles produced by [`buffered_split`].
///
/// Each handle replays the shared source's byte sequence exactly once. A slow
/// handle never blocks a fast one; it only pays for the bytes parked in its
/// own ring.
pub struct SplitReader {
    shared: Arc<Mutex<SplitShared>>,
    index: usize,
}

impl SplitReader {
    /// Drops this handle's buffered bytes and closes the shared source. The
    /// first close wins; later closes are no-ops. Sibling handles drain what
    /// they already buffered and then observe EOF.
    pub fn close(&mut self) {
        let mut shared = self.shared.lock().expect("split state lock poisoned");
        shared.rings[self.index].clear();
        if !shared.closed {
            shared.closed = true;
            shared.source = None;
        }
        shared.wake_parked();
    }
}

impl AsyncRead for SplitReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock().expect("split state lock poisoned");

        if shared.rings[this.index].len() < buf.remaining() && !shared.eof {
            let deficit = buf.remaining() - shared.rings[this.index].len();
            match shared.pull_source(cx, deficit) {
                Poll::Pending => {
                    if !shared.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                        shared.wakers.push(cx.waker().clone());
                    }
                    return Poll::Pending;
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(())) => {}
            }
        }

        let mut chunk = vec![0_u8; buf.remaining()];
        let n = shared.rings[this.index].read(&mut chunk);
        buf.put_slice(&chunk[..n]);
        // n == 0 with eof set is the replayed end-of-stream.
        Poll::Ready(Ok(()))
    }
}

impl Drop for SplitReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Duplicates `source` into `n` independently readable handles sharing one
/// ring buffer per handle. The source is read at most once.
pub fn buffered_split(
    source: impl AsyncRead + Send + Unpin + 'static,
    n: usize,
) -> Vec<SplitReader> {
    let shared = Arc::new(Mutex::new(SplitShared {
        source: Some(Box::new(source)),
        rings: (0..n).map(|_| DynamicCircularBuffer::new()).collect(),
        eof: false,
        closed: false,
        wakers: Vec::new(),
    }));
    (0..n)
        .map(|index| SplitReader {
            shared: Arc::clone(&shared),
            index,
        })
        .collect()
}
