//! SyncStream Node -- library crate for the peer-to-peer file transfer node.
//!
//! Exposes the peer link, reconnect policy, configuration and the
//! `SyncNode` orchestrator so the binary and integration tests share them.

pub mod config;
pub mod link;
pub mod node;
pub mod reconnect;

use std::path::PathBuf;

pub use link::{LinkConfig, LinkError, LinkState, PeerInfo, PeerLink};
pub use node::{NodeError, SyncNode};
pub use reconnect::{ReconnectPolicy, ReconnectSchedule};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Split `host`, `host:port`, `ip:port` or `[v6]:port` into host and port.
pub fn split_address(address: &str, default_port: u16) -> (String, u16) {
    if let Ok(sock) = address.parse::<std::net::SocketAddr>() {
        return (sock.ip().to_string(), sock.port());
    }
    if let Some((host, port)) = address.rsplit_once(':') {
        // a bare IPv6 address has more than one colon
        if !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    (address.to_string(), default_port)
}

/// Format a host and port for `TcpStream::connect`.
pub fn join_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
