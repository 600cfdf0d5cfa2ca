//! Construction parameters for listeners, connectors, sessions and send
//! arenas.
//!
//! Every struct derives serde's traits so a host application can keep them in
//! whatever configuration format it already uses. Missing fields fall back to
//! the defaults below.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Default capacity of a session's receive window.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;
/// Default listen backlog handed to the OS.
pub const DEFAULT_BACKLOG: u32 = 100;
/// Default number of accepts kept outstanding at once.
pub const DEFAULT_ACCEPT_TASKS: usize = 10;
/// Default capacity of one send arena.
pub const DEFAULT_ARENA_CAPACITY: usize = 65535 * 16;

/// Per-session buffering and socket options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the receive window. A single packet can never be larger
    /// than this.
    pub recv_buffer_size: usize,
    /// Whether to disable Nagle's algorithm on accepted and connected
    /// sockets. The session already coalesces its own writes.
    pub nodelay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            nodelay: true,
        }
    }
}

/// Where and how a [`Listener`](crate::Listener) accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub address: SocketAddr,
    pub backlog: u32,
    /// The number of accept loops sharing the listening socket.
    pub accept_tasks: usize,
    pub session: SessionConfig,
}

impl ListenerConfig {
    /// A listener on `address` with every other option at its default.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 7777)),
            backlog: DEFAULT_BACKLOG,
            accept_tasks: DEFAULT_ACCEPT_TASKS,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub session: SessionConfig,
}

/// Sizing for a [`SendAllocator`](crate::SendAllocator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Bytes per arena. Too small and the allocator rebinds constantly, too
    /// large and slow peers pin a lot of memory.
    pub capacity: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ARENA_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_listener_config_uses_defaults() {
        let config: ListenerConfig = serde_json::from_str(
            r#"{ "address": "0.0.0.0:9000", "session": { "recv_buffer_size": 4096 } }"#,
        )
        .unwrap();
        assert_eq!(config.address, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.accept_tasks, DEFAULT_ACCEPT_TASKS);
        assert_eq!(config.session.recv_buffer_size, 4096);
        assert!(config.session.nodelay);
    }
}
