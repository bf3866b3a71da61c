// Newline-delimited record framing

use crate::relay::error::{RelayError, RelayResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Reads one record per line, enforcing a maximum record size.
///
/// Oversized and non-UTF-8 lines are reported as protocol errors and
/// skipped, so the reader stays aligned on the next line and the session can
/// carry on. Blank lines are ignored.
pub struct LineReader<R> {
    reader: BufReader<R>,
    max_line_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_line_bytes,
            buf: Vec::new(),
        }
    }

    /// Next non-blank line without its terminator, or `None` at end of stream
    pub async fn next_line(&mut self) -> RelayResult<Option<String>> {
        loop {
            self.buf.clear();

            let limit = self.max_line_bytes as u64 + 1;
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if n == 0 {
                return Ok(None);
            }

            if self.buf.last() != Some(&b'\n') && n as u64 >= limit {
                self.skip_line().await?;
                return Err(RelayError::protocol(format!(
                    "Record exceeds {} bytes",
                    self.max_line_bytes
                )));
            }

            while matches!(self.buf.last(), Some(b'\n') | Some(b'\r')) {
                self.buf.pop();
            }

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return match std::str::from_utf8(&self.buf) {
                Ok(line) => Ok(Some(line.to_string())),
                Err(_) => Err(RelayError::protocol("Record is not valid UTF-8")),
            };
        }
    }

    /// Discard input up to and including the next newline
    async fn skip_line(&mut self) -> RelayResult<()> {
        loop {
            let available = self.reader.fill_buf().await?;
            let len = available.len();
            if len == 0 {
                return Ok(());
            }

            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => self.reader.consume(len),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_lines_and_skips_blanks() {
        let input: &[u8] = b"first\r\n\n   \nsecond\nlast-without-newline";
        let mut reader = LineReader::new(input, 1024);

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("last-without-newline")
        );
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_line_is_recoverable() {
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\nok\n");
        let mut reader = LineReader::new(input.as_slice(), 10);

        let err = reader.next_line().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Record exceeds 10 bytes");

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let input: &[u8] = b"0123456789\n";
        let mut reader = LineReader::new(input, 10);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("0123456789"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_recoverable() {
        let input: &[u8] = b"\xff\xfe\nfine\n";
        let mut reader = LineReader::new(input, 64);

        let err = reader.next_line().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("fine"));
    }
}
