//! Framed IMAP Connection (spec.md §4.3)
//!
//! Line framing over an arbitrary async duplex stream: the terminator is
//! `CR LF`; the trailing `\r\n` is stripped on read and added on write.
//! Also supports reading a fixed number of raw (non-line-framed) octets,
//! needed for the APPEND literal protocol (spec.md §4.5).

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::model::ImapRequest;

/// A line-framed IMAP connection over any async duplex stream.
pub struct FramedConnection<S> {
    reader: BufReader<S>,
}

impl<S> FramedConnection<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Write `text` followed by `\r\n`. Propagates any I/O error.
    pub async fn send(&mut self, text: &str) -> std::io::Result<()> {
        self.reader.write_all(text.as_bytes()).await?;
        self.reader.write_all(b"\r\n").await?;
        self.reader.flush().await
    }

    /// Read the next line, with the trailing `\r\n` (or bare `\n`)
    /// stripped. Returns `Ok(None)` on a clean EOF with no partial data.
    pub async fn receive(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = String::new();
        let bytes_read = self.reader.read_line(&mut buf).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    /// Read the next line and parse it as an [`ImapRequest`].
    pub async fn receive_request(&mut self) -> std::io::Result<Option<ImapRequest>> {
        let Some(line) = self.receive().await? else {
            return Ok(None);
        };
        Ok(Some(ImapRequest::parse(&line).unwrap_or(ImapRequest {
            tag: "*".to_owned(),
            command: String::new(),
            payload: line,
        })))
    }

    /// Read exactly `len` raw octets (not line-framed), used to consume an
    /// APPEND literal payload after the server announces
    /// `+ Ready for literal data`.
    pub async fn read_exact_bytes(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }
}
