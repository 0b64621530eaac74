//! Network module - TCP command intake
//!
//! Provides:
//! - The command listener feeding the session
//! - A client for sending commands to a running bridge
//! - Line framing shared by both

mod client;
mod connection;
mod server;

pub use client::BridgeClient;
pub use server::CommandListener;

use std::net::SocketAddr;

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
