//! Splits a TCP byte stream into `\r\n`-delimited logical lines.
//!
//! Built on `AsyncReadExt::read`, not `AsyncBufReadExt::read_line`: the 64
//! KiB cap must be enforced before a full line is known to exist, or a
//! peer that never sends `\r\n` could grow the buffer without bound.

use std::fmt;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

pub const MAX_LINE_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum FramerError {
    LineTooLong,
    Io(std::io::Error),
}

impl fmt::Display for FramerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramerError::LineTooLong => write!(f, "line exceeded {MAX_LINE_BYTES} bytes without a terminator"),
            FramerError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for FramerError {}

impl From<std::io::Error> for FramerError {
    fn from(e: std::io::Error) -> Self {
        FramerError::Io(e)
    }
}

/// Buffers bytes read from one connection and yields complete lines.
pub struct LineFramer {
    buf: Vec<u8>,
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
        }
    }

    /// Returns the next logical line (without the `\r\n`), or `None` on a
    /// clean end-of-stream with no partial line pending.
    pub async fn next_line(
        &mut self,
        reader: &mut OwnedReadHalf,
    ) -> Result<Option<Vec<u8>>, FramerError> {
        loop {
            if let Some(pos) = find_crlf(&self.buf, self.scanned) {
                let line = self.buf[..pos].to_vec();
                self.buf.drain(..pos + 2);
                self.scanned = 0;
                return Ok(Some(line));
            }
            self.scanned = self.buf.len().saturating_sub(1);

            let mut chunk = [0u8; READ_CHUNK];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                // Peer closed, with or without a trailing partial line either way:
                // treat as end-of-stream, not an error.
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(FramerError::LineTooLong);
            }
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let from = from.min(buf.len());
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (OwnedReadHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server.into_split().0, client)
    }

    #[tokio::test]
    async fn yields_one_line_per_write() {
        let (mut read_half, mut client) = pair().await;
        client.write_all(b"PING 1\r\n").await.unwrap();
        let mut framer = LineFramer::new();
        let line = framer.next_line(&mut read_half).await.unwrap().unwrap();
        assert_eq!(line, b"PING 1");
    }

    #[tokio::test]
    async fn byte_at_a_time_still_yields_full_line() {
        let (mut read_half, mut client) = pair().await;
        for b in b"PING 1\r\n" {
            client.write_all(&[*b]).await.unwrap();
        }
        let mut framer = LineFramer::new();
        let line = framer.next_line(&mut read_half).await.unwrap().unwrap();
        assert_eq!(line, b"PING 1");
    }

    #[tokio::test]
    async fn several_lines_in_one_packet() {
        let (mut read_half, mut client) = pair().await;
        client.write_all(b"PING 1\r\nPING 2\r\n").await.unwrap();
        let mut framer = LineFramer::new();
        let first = framer.next_line(&mut read_half).await.unwrap().unwrap();
        let second = framer.next_line(&mut read_half).await.unwrap().unwrap();
        assert_eq!(first, b"PING 1");
        assert_eq!(second, b"PING 2");
    }

    #[tokio::test]
    async fn oversize_line_without_terminator_errors() {
        let (mut read_half, mut client) = pair().await;
        let payload = vec![b'x'; MAX_LINE_BYTES + 1];
        tokio::spawn(async move {
            let _ = client.write_all(&payload).await;
        });
        let mut framer = LineFramer::new();
        let err = framer.next_line(&mut read_half).await.unwrap_err();
        assert!(matches!(err, FramerError::LineTooLong));
    }

    #[tokio::test]
    async fn clean_close_with_no_partial_line_is_end_of_stream() {
        let (mut read_half, client) = pair().await;
        drop(client);
        let mut framer = LineFramer::new();
        let line = framer.next_line(&mut read_half).await.unwrap();
        assert!(line.is_none());
    }
}
