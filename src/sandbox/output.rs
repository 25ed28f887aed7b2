//! Bounded capture of command output.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Keeps at most `limit` bytes and counts the rest.
#[derive(Debug)]
pub(crate) struct BoundedOutput {
    buf: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl BoundedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let kept = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..kept]);
        self.dropped += (chunk.len() - kept) as u64;
    }

    /// Lossy UTF-8 text and the number of discarded bytes.
    pub fn into_parts(self) -> (String, u64) {
        (String::from_utf8_lossy(&self.buf).into_owned(), self.dropped)
    }
}

/// Drains `reader` to EOF, keeping the first `limit` bytes.
pub(crate) async fn read_bounded<R>(mut reader: R, limit: usize) -> BoundedOutput
where
    R: AsyncRead + Unpin,
{
    let mut output = BoundedOutput::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => output.push(&chunk[..n]),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_truncates_and_counts() {
        let mut out = BoundedOutput::new(5);
        out.push(b"abc");
        out.push(b"defgh");
        let (text, dropped) = out.into_parts();
        assert_eq!(text, "abcde");
        assert_eq!(dropped, 3);
    }

    #[tokio::test]
    async fn test_read_bounded_drains_everything() {
        let data = vec![b'x'; 20_000];
        let out = read_bounded(&data[..], 100).await;
        let (text, dropped) = out.into_parts();
        assert_eq!(text.len(), 100);
        assert_eq!(dropped, 19_900);
    }
}
