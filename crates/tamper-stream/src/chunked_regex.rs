use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use regex::bytes::Regex;
use tokio::io::{AsyncRead, ReadBuf};

/// Streaming regex find/replace over a byte stream of unbounded length.
///
/// Keeps a buffer of two windows. Each round fills the second window with
/// fresh bytes, runs the replacement over the whole buffer, emits the first
/// half of the result, and retains the second half as the head of the next
/// round. Every byte is exposed to the matcher both as the tail of one
/// window and the head of the next, so a match straddling a refill seam is
/// still seen intact. On a short final read the whole remaining tail is
/// replaced once and emitted.
///
/// Approximation bounds: a match longer than one window, or a replacement
/// pair that is not idempotent on already-replaced text, is not guaranteed to
/// behave like a whole-body replace.
pub struct ChunkedRegexReader<R> {
    inner: R,
    find: Regex,
    replace: Vec<u8>,
    window: usize,

    buf: Vec<u8>,
    fill_len: usize,
    fill_target: usize,

    pending: Vec<u8>,
    pending_pos: usize,
    pending_error: Option<io::Error>,
    finished: bool,
}

impl<R> ChunkedRegexReader<R> {
    pub fn new(inner: R, window: usize, find: Regex, replace: Vec<u8>) -> Self {
        let window = window.max(1);
        Self {
            inner,
            find,
            replace,
            window,
            buf: vec![0; window * 2],
            fill_len: 0,
            fill_target: window * 2,
            pending: Vec::new(),
            pending_pos: 0,
            pending_error: None,
            finished: false,
        }
    }

    fn complete_tail(&mut self) {
        let replaced = self
            .find
            .replace_all(&self.buf[..self.fill_len], self.replace.as_slice());
        self.pending = replaced.into_owned();
        self.pending_pos = 0;
        self.finished = true;
    }

    fn complete_window(&mut self) {
        let replaced = self
            .find
            .replace_all(&self.buf[..self.fill_target], self.replace.as_slice())
            .into_owned();
        let mid = replaced.len() / 2;
        self.pending = replaced[..mid].to_vec();
        self.pending_pos = 0;

        // The second half becomes the head of the next round.
        self.buf = replaced[mid..].to_vec();
        self.fill_len = self.buf.len();
        self.fill_target = self.fill_len + self.window;
        self.buf.resize(self.fill_target, 0);
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChunkedRegexReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pending_pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pending_pos);
                buf.put_slice(&this.pending[this.pending_pos..this.pending_pos + n]);
                this.pending_pos += n;
                return Poll::Ready(Ok(()));
            }
            if let Some(error) = this.pending_error.take() {
                this.finished = true;
                return Poll::Ready(Err(error));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut this.buf[this.fill_len..this.fill_target]);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => {
                    // Emit the replaced tail first, then surface the error.
                    this.complete_tail();
                    this.pending_error = Some(error);
                }
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        this.complete_tail();
                    } else {
                        this.fill_len += n;
                        if this.fill_len == this.fill_target {
                            this.complete_window();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkedRegexReader;
    use regex::bytes::Regex;
    use tokio::io::AsyncReadExt;

    async fn rewrite(input: &[u8], window: usize, find: &str, replace: &[u8]) -> Vec<u8> {
        let mut reader = ChunkedRegexReader::new(
            std::io::Cursor::new(input.to_vec()),
            window,
            Regex::new(find).expect("pattern"),
            replace.to_vec(),
        );
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("rewrite");
        out
    }

    #[tokio::test]
    async fn short_input_replaced_in_the_final_pass() {
        let input = b"abccccccdef";
        let out = rewrite(input, 8, "ccccccd", b"X").await;
        assert_eq!(out, b"abXef");
    }

    #[tokio::test]
    async fn match_straddling_a_refill_seam_is_found() {
        // 27 bytes with window 8: the pattern spans the boundary between the
        // first 16-byte fill and the next window.
        let mut input = vec![b'a'; 10];
        input.extend_from_slice(b"ccccccd");
        input.extend_from_slice(&[b'b'; 10]);

        let out = rewrite(&input, 8, "ccccccd", b"X").await;

        let expected = Regex::new("ccccccd")
            .unwrap()
            .replace_all(&input, &b"X"[..])
            .into_owned();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn output_matches_whole_buffer_replace_for_long_bodies() {
        let mut input = Vec::new();
        for i in 0..500_u32 {
            input.extend_from_slice(format!("item-{i};").as_bytes());
        }
        let out = rewrite(&input, 64, "item-", b"entry:").await;
        let expected = Regex::new("item-")
            .unwrap()
            .replace_all(&input, &b"entry:"[..])
            .into_owned();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn small_destination_buffers_drain_pending_output() {
        let input = b"hello hello hello";
        let mut reader = ChunkedRegexReader::new(
            std::io::Cursor::new(input.to_vec()),
            4,
            Regex::new("hello").expect("pattern"),
            b"bye".to_vec(),
        );
        let mut out = Vec::new();
        let mut chunk = [0_u8; 3];
        loop {
            let n = reader.read(&mut chunk).await.expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"bye bye bye");
    }
}
