/// Growable byte ring used as the backing store for stream fan-out.
///
/// Writes never drop data: when free space runs out the storage is reallocated
/// to twice the post-write occupancy. Reads are FIFO and compact the storage
/// back down to `2 * len` once occupancy falls below a quarter of capacity, so
/// a reader that catches up releases the memory a burst allocated.
///
/// Not thread-safe; callers serialize access.
#[derive(Debug, Default)]
pub struct DynamicCircularBuffer {
    start: usize,
    length: usize,
    data: Vec<u8>,
}

impl DynamicCircularBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn init_if_needed(&mut self) {
        if self.data.is_empty() {
            self.data = vec![0; 1];
        }
    }

    fn free_space(&self) -> usize {
        self.data.len() - self.length
    }

    fn change_capacity(&mut self, new_size: usize) {
        let new_size = new_size.max(1);
        let mut new_data = vec![0; new_size];
        let end = self.start + self.length;
        if end > self.data.len() {
            let head = self.data.len() - self.start;
            new_data[..head].copy_from_slice(&self.data[self.start..]);
            new_data[head..self.length].copy_from_slice(&self.data[..self.length - head]);
        } else {
            new_data[..self.length].copy_from_slice(&self.data[self.start..end]);
        }
        self.data = new_data;
        self.start = 0;
    }

    /// Appends `src`, growing storage if there is not enough free space.
    pub fn write(&mut self, src: &[u8]) {
        self.init_if_needed();
        if self.free_space() < src.len() {
            self.change_capacity((self.length + src.len()) * 2);
        }
        let end = (self.start + self.length) % self.data.len();
        let tail = (self.data.len() - end).min(src.len());
        self.data[end..end + tail].copy_from_slice(&src[..tail]);
        self.data[..src.len() - tail].copy_from_slice(&src[tail..]);
        self.length += src.len();
    }

    /// Removes up to `dst.len()` bytes in FIFO order, returning how many were
    /// copied. Returns 0 only when the buffer is empty; whether that means
    /// end-of-stream is the caller's call.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        self.init_if_needed();
        let n = dst.len().min(self.length);
        let tail = (self.data.len() - self.start).min(n);
        dst[..tail].copy_from_slice(&self.data[self.start..self.start + tail]);
        dst[tail..n].copy_from_slice(&self.data[..n - tail]);
        self.length -= n;
        self.start = (self.start + n) % self.data.len();

        if self.length * 4 < self.data.len() {
            self.change_capacity(self.length * 2);
        }
        n
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.length = 0;
        self.data = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicCircularBuffer;
    use proptest::prelude::*;

    #[test]
    fn fifo_across_wrap_boundary() {
        let mut buf = DynamicCircularBuffer::new();
        buf.write(b"abcdef");
        let mut out = [0_u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        // Forces the write cursor to wrap around the read cursor.
        buf.write(b"ghijkl");
        let mut rest = vec![0_u8; 8];
        assert_eq!(buf.read(&mut rest), 8);
        assert_eq!(&rest, b"efghijkl");
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn read_from_empty_returns_zero() {
        let mut buf = DynamicCircularBuffer::new();
        let mut out = [0_u8; 8];
        assert_eq!(buf.read(&mut out), 0);
    }

    #[test]
    fn shrinks_after_occupancy_drops() {
        let mut buf = DynamicCircularBuffer::new();
        buf.write(&[7_u8; 1024]);
        let grown = buf.capacity();
        assert!(grown >= 1024);
        let mut out = vec![0_u8; 1000];
        buf.read(&mut out);
        assert!(buf.capacity() < grown);
        assert!(buf.capacity() >= buf.len());
    }

    proptest! {
        #[test]
        fn interleaved_io_preserves_order(ops in proptest::collection::vec(
            (proptest::collection::vec(any::<u8>(), 0..64), 0_usize..64),
            1..40,
        )) {
            let mut buf = DynamicCircularBuffer::new();
            let mut written: Vec<u8> = Vec::new();
            let mut read_back: Vec<u8> = Vec::new();
            for (chunk, read_len) in ops {
                buf.write(&chunk);
                written.extend_from_slice(&chunk);
                let mut out = vec![0_u8; read_len];
                let n = buf.read(&mut out);
                read_back.extend_from_slice(&out[..n]);
                prop_assert!(buf.capacity() >= buf.len());
            }
            let mut tail = vec![0_u8; buf.len()];
            let n = buf.read(&mut tail);
            read_back.extend_from_slice(&tail[..n]);
            prop_assert_eq!(read_back, written);
        }
    }
}
