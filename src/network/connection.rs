//! Line-framed connection handling
//!
//! Manages one peer stream, including:
//! - Splitting the byte stream into command lines
//! - Dropping lines over the configured limit
//! - Simple traffic statistics

use bytes::{BufMut, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Lines handed to the caller
    pub lines_received: u64,
    /// Lines dropped for exceeding the length limit
    pub lines_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

const READ_CHUNK: usize = 4096;

/// A newline-delimited text stream
pub struct LineConnection<S> {
    /// Peer label for logs
    remote: String,
    stream: S,
    read_buf: BytesMut,
    max_line_length: usize,
    /// Inside an overlong line, skipping to the next newline
    discarding: bool,
    eof: bool,
    stats: ConnectionStats,
}

impl<S> LineConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, remote: impl Into<String>, max_line_length: usize) -> Self {
        Self {
            remote: remote.into(),
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            max_line_length,
            discarding: false,
            eof: false,
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Next line without its terminator, or `None` at end of stream
    ///
    /// A trailing `\r` is stripped. A final line without a newline is
    /// still returned.
    pub async fn recv_line(&mut self) -> ConnectionResult<Option<String>> {
        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                let raw = self.read_buf.split_to(pos + 1);

                if self.discarding {
                    self.discarding = false;
                    self.drop_line();
                    continue;
                }

                let mut line = &raw[..pos];
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
                if line.len() > self.max_line_length {
                    self.drop_line();
                    continue;
                }

                self.stats.lines_received += 1;
                return Ok(Some(String::from_utf8_lossy(line).into_owned()));
            }

            if self.eof {
                return Ok(None);
            }

            if self.read_buf.len() > self.max_line_length {
                self.discarding = true;
                self.read_buf.clear();
            }

            self.read_buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            self.stats.bytes_received += n as u64;

            if n == 0 {
                self.eof = true;
                if self.discarding {
                    self.discarding = false;
                    self.read_buf.clear();
                    self.drop_line();
                } else if !self.read_buf.is_empty() {
                    self.read_buf.put_u8(b'\n');
                }
            }
        }
    }

    /// [`recv_line`](Self::recv_line) bounded by `timeout`
    pub async fn recv_line_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<String>> {
        match tokio::time::timeout(timeout, self.recv_line()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Write `line` followed by `\n`
    pub async fn send_line(&mut self, line: &str) -> ConnectionResult<()> {
        let mut out = BytesMut::with_capacity(line.len() + 1);
        out.put_slice(line.as_bytes());
        out.put_u8(b'\n');

        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        self.stats.bytes_sent += out.len() as u64;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn drop_line(&mut self) {
        self.stats.lines_dropped += 1;
        warn!(
            "Dropping line from {}: longer than {} bytes",
            self.remote, self.max_line_length
        );
    }
}
