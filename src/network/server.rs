//! Command listener
//!
//! Accepts one TCP client at a time and feeds its lines to the session.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionError, ConnectionStats, LineConnection};
use crate::command;
use crate::config::ListenerConfig;
use crate::session::{CommandOutcome, SessionError, SessionHandle};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// TCP listener for the command line protocol
pub struct CommandListener {
    listener: TcpListener,
    max_line_length: usize,
}

impl CommandListener {
    pub async fn bind(config: &ListenerConfig) -> ServerResult<Self> {
        let bind_addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        info!("Command listener on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            max_line_length: config.max_line_length,
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve clients one after another until the session goes away
    pub async fn run(self, session: SessionHandle) -> ServerResult<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            info!("Command client connected: {}", addr);
            let conn = LineConnection::new(stream, addr.to_string(), self.max_line_length);

            match serve_connection(conn, &session).await {
                Ok(stats) => info!(
                    "Command client {} disconnected ({} lines, {} dropped)",
                    addr, stats.lines_received, stats.lines_dropped
                ),
                Err(ServerError::Session(e)) => return Err(e.into()),
                Err(e) => warn!("Command client {} failed: {}", addr, e),
            }
        }
    }
}

/// Read lines until EOF, running each command to completion before the next
pub async fn serve_connection<S>(
    mut conn: LineConnection<S>,
    session: &SessionHandle,
) -> ServerResult<ConnectionStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(line) = conn.recv_line().await? {
        let command = match command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("Dropping line {:?} from {}: {}", line, conn.remote(), e);
                continue;
            }
        };

        match session.execute(command).await? {
            CommandOutcome::Pong => conn.send_line("PONG").await?,
            outcome => debug!("{:?}", outcome),
        }
    }

    if let Err(e) = conn.shutdown().await {
        debug!("Shutdown of {} failed: {}", conn.remote(), e);
    }
    Ok(conn.stats().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::hid::{Modifiers, ReportCodec};
    use crate::planner::Planner;
    use crate::session::{SessionManager, SessionState};
    use crate::transport::mock::{MockHandle, MockTransport};
    use std::time::Duration;
    use tokio_test::io::Builder;

    async fn connected_session() -> (SessionHandle, MockHandle) {
        let (transport, mock) = MockTransport::new();
        let (manager, handle) = SessionManager::new(
            Box::new(transport),
            Planner::new(TimingConfig::fast(), Modifiers::empty()),
            ReportCodec::default(),
            Duration::from_millis(10),
        );
        tokio::spawn(manager.run());
        handle
            .subscribe()
            .wait_for(SessionState::is_connected)
            .await
            .unwrap();
        (handle, mock)
    }

    #[tokio::test]
    async fn test_lines_become_reports() {
        let (session, mock) = connected_session().await;
        let stream = Builder::new()
            .read(b"TAP 0.5 0.5\r\n")
            .read(b"\n   \nPING\n")
            .write(b"PONG\n")
            .read(b"SCROLL 0 1\n")
            .build();

        let stats = serve_connection(LineConnection::new(stream, "test", 4096), &session)
            .await
            .unwrap();

        assert_eq!(stats.lines_received, 5);
        let frames = mock.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_bytes(), &[0x02, 0x00, 0x00, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_dropped() {
        let (session, mock) = connected_session().await;
        let stream = Builder::new()
            .read(b"FOO 1 2\nTAP notanumber 0.5\nKEY_COMBO_SPECIAL 300\nPING\n")
            .write(b"PONG\n")
            .build();

        serve_connection(LineConnection::new(stream, "test", 4096), &session)
            .await
            .unwrap();

        assert!(mock.frames().is_empty());
        assert!(session.state().is_connected());
    }

    #[tokio::test]
    async fn test_overlong_line_is_not_executed() {
        let (session, mock) = connected_session().await;
        let stream = Builder::new()
            .read(b"TYPE this line is far too long\nPING\n")
            .write(b"PONG\n")
            .build();

        let stats = serve_connection(LineConnection::new(stream, "test", 16), &session)
            .await
            .unwrap();

        assert_eq!(stats.lines_dropped, 1);
        assert!(mock.frames().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ListenerConfig {
            bind_address: "127.0.0.1".into(),
            port: taken.local_addr().unwrap().port(),
            max_line_length: 4096,
        };
        assert!(matches!(
            CommandListener::bind(&config).await,
            Err(ServerError::BindFailed(_))
        ));
    }
}
