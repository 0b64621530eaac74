//! Bridge client
//!
//! Connects to a running bridge and sends command lines.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::connection::{ConnectionError, LineConnection};
use crate::command::{self, Command};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Bridge at {addr} not reachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("Connection closed by bridge")]
    Closed,
}

pub type ClientResult<T> = Result<T, ClientError>;

const RETRY_INTERVAL: Duration = Duration::from_millis(200);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of the command protocol
pub struct BridgeClient {
    conn: LineConnection<TcpStream>,
}

impl BridgeClient {
    /// Connect, retrying until `wait` has elapsed
    pub async fn connect(host: &str, port: u16, wait: Duration) -> ClientResult<Self> {
        let deadline = Instant::now() + wait;
        let target = format!("{}:{}", host, port);

        loop {
            let attempt = match super::resolve_host(host, port).await {
                Ok(addr) => TcpStream::connect(addr).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(stream) => {
                    info!("Connected to bridge at {}", target);
                    let conn = LineConnection::new(stream, target, usize::MAX);
                    return Ok(Self { conn });
                }
                Err(e) if Instant::now() + RETRY_INTERVAL < deadline => {
                    debug!("Bridge at {} not ready: {}", target, e);
                    sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(ClientError::Unreachable {
                        addr: target,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// Send one line; returns the bridge's reply for `PING`
    pub async fn send(&mut self, line: &str) -> ClientResult<Option<String>> {
        self.conn.send_line(line).await?;

        if !matches!(command::parse(line), Ok(Some(Command::Ping))) {
            return Ok(None);
        }

        match self.conn.recv_line_timeout(REPLY_TIMEOUT).await? {
            Some(reply) => Ok(Some(reply)),
            None => Err(ClientError::Closed),
        }
    }

    pub async fn close(mut self) -> ClientResult<()> {
        self.conn.shutdown().await?;
        Ok(())
    }
}
