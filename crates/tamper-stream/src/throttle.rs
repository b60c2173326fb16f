use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, Sleep};

pub const KILOBIT: u64 = 1000;
pub const MEGABIT: u64 = KILOBIT * 1000;
pub const GIGABIT: u64 = MEGABIT * 1000;

/// Shared rate limiter for every stream matching one (client, rule, direction)
/// key, so concurrent requests under the same rule share one rate budget.
///
/// Each read is held for `bytes / (rate / 8)` seconds before its bytes are
/// released, so the final chunk of a stream is paced like every other. Reads
/// across all attached streams serialize on the gate lock, so the budget is
/// strictly ordered rather than fair-share divided.
#[derive(Debug)]
pub struct ThrottleController {
    rate_bits_per_second: AtomicU64,
    gate: Arc<Mutex<()>>,
    attached: AtomicU32,
}

impl ThrottleController {
    pub fn new(rate_bits_per_second: u64) -> Arc<Self> {
        Arc::new(Self {
            rate_bits_per_second: AtomicU64::new(rate_bits_per_second),
            gate: Arc::new(Mutex::new(())),
            attached: AtomicU32::new(0),
        })
    }

    pub fn rate(&self) -> u64 {
        self.rate_bits_per_second.load(Ordering::Relaxed)
    }

    /// Rate changes apply from the next read onward.
    pub fn set_rate(&self, rate_bits_per_second: u64) {
        self.rate_bits_per_second
            .store(rate_bits_per_second, Ordering::Relaxed);
    }

    /// Number of streams currently attached to this controller.
    pub fn attached(&self) -> u32 {
        self.attached.load(Ordering::Relaxed)
    }

    pub fn wrap<R>(self: &Arc<Self>, inner: R) -> ThrottledReader<R> {
        self.attached.fetch_add(1, Ordering::Relaxed);
        ThrottledReader {
            inner,
            controller: Arc::clone(self),
            state: ReadState::Idle,
        }
    }

    fn delay_for(&self, bytes: usize) -> Duration {
        let rate = self.rate();
        if rate == 0 || bytes == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / (rate as f64 / 8.0))
    }
}

type GateFuture = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// Largest slice of the stream read and delayed as one unit.
const READ_QUANTUM: usize = 8192;

enum ReadState {
    Idle,
    Locking(GateFuture),
    Reading {
        guard: OwnedMutexGuard<()>,
        data: Vec<u8>,
    },
    Sleeping {
        guard: OwnedMutexGuard<()>,
        delay: Pin<Box<Sleep>>,
        data: Vec<u8>,
    },
    Emitting {
        data: Vec<u8>,
        pos: usize,
    },
}

/// A readable stream gated by a shared [`ThrottleController`].
pub struct ThrottledReader<R> {
    inner: R,
    controller: Arc<ThrottleController>,
    state: ReadState,
}

impl<R> ThrottledReader<R> {
    pub fn controller(&self) -> &Arc<ThrottleController> {
        &self.controller
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match &mut this.state {
                ReadState::Idle => {
                    let gate = Arc::clone(&this.controller.gate);
                    this.state = ReadState::Locking(Box::pin(gate.lock_owned()));
                }
                ReadState::Locking(future) => {
                    let guard = ready!(future.as_mut().poll(cx));
                    let data = vec![0_u8; buf.remaining().min(READ_QUANTUM)];
                    this.state = ReadState::Reading { guard, data };
                }
                ReadState::Reading { data, .. } => {
                    let mut scratch = ReadBuf::new(data.as_mut_slice());
                    let result = ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch));
                    let read = scratch.filled().len();
                    let ReadState::Reading { guard, mut data } =
                        std::mem::replace(&mut this.state, ReadState::Idle)
                    else {
                        unreachable!()
                    };
                    result?;
                    if read == 0 {
                        drop(guard);
                        return Poll::Ready(Ok(()));
                    }
                    data.truncate(read);
                    let delay = this.controller.delay_for(read);
                    if delay.is_zero() {
                        drop(guard);
                        this.state = ReadState::Emitting { data, pos: 0 };
                    } else {
                        this.state = ReadState::Sleeping {
                            guard,
                            delay: Box::pin(sleep(delay)),
                            data,
                        };
                    }
                }
                ReadState::Sleeping { delay, .. } => {
                    ready!(delay.as_mut().poll(cx));
                    let ReadState::Sleeping { guard, data, .. } =
                        std::mem::replace(&mut this.state, ReadState::Idle)
                    else {
                        unreachable!()
                    };
                    drop(guard);
                    this.state = ReadState::Emitting { data, pos: 0 };
                }
                ReadState::Emitting { data, pos } => {
                    let n = buf.remaining().min(data.len() - *pos);
                    buf.put_slice(&data[*pos..*pos + n]);
                    *pos += n;
                    if *pos == data.len() {
                        this.state = ReadState::Idle;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<R> Drop for ThrottledReader<R> {
    fn drop(&mut self) {
        self.controller.attached.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::ThrottleController;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn reads_take_at_least_the_budgeted_time() {
        // 8000 bits/s is 1000 bytes/s; each 1000-byte read is held one full
        // second before its bytes come back.
        let controller = ThrottleController::new(8_000);
        let mut reader = controller.wrap(std::io::Cursor::new(vec![0x55_u8; 4000]));

        let started = Instant::now();
        let mut chunk = [0_u8; 1000];
        for _ in 0..4 {
            reader.read_exact(&mut chunk).await.expect("throttled read");
        }
        assert!(started.elapsed() >= std::time::Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn a_body_fitting_in_one_read_is_still_paced() {
        // 80 kbit/s is 10000 bytes/s; 4000 bytes read in one pass owe
        // 400 ms before the bytes are released.
        let controller = ThrottleController::new(80_000);
        let mut reader = controller.wrap(std::io::Cursor::new(vec![0_u8; 4000]));

        let started = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("read");
        assert_eq!(out.len(), 4000);
        assert!(started.elapsed() >= std::time::Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_change_applies_to_later_reads() {
        let controller = ThrottleController::new(8_000);
        let mut reader = controller.wrap(std::io::Cursor::new(vec![0_u8; 3000]));

        let mut chunk = [0_u8; 1000];
        reader.read_exact(&mut chunk).await.expect("first read");
        controller.set_rate(80_000);

        let started = Instant::now();
        reader.read_exact(&mut chunk).await.expect("second read");
        reader.read_exact(&mut chunk).await.expect("third read");
        // Both reads after the change are held at 10000 bytes/s.
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(200));
        assert!(elapsed < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn attach_detach_reference_counting() {
        let controller = ThrottleController::new(super::KILOBIT);
        let a = controller.wrap(std::io::Cursor::new(Vec::<u8>::new()));
        let b = controller.wrap(std::io::Cursor::new(Vec::<u8>::new()));
        assert_eq!(controller.attached(), 2);
        drop(a);
        drop(b);
        assert_eq!(controller.attached(), 0);
    }
}
