//! Connection configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of outbound frames queued ahead of the writer.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Relay address.
    pub addr: SocketAddr,
    /// Bound on TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// Client name sent in HELLO.
    pub client_name: Option<String>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Frames that may wait for the writer before callers block.
    pub write_queue_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            client_name: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:55555".parse().unwrap());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.client_name.is_none());
        assert_eq!(config.write_queue_capacity, DEFAULT_WRITE_QUEUE_CAPACITY);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config =
            ConnectionConfig::new("127.0.0.1:55555".parse().unwrap()).with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("127.0.0.1:55555".parse().unwrap())
            .with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("127.0.0.1:55555".parse().unwrap())
            .with_write_queue_capacity(0);
        assert_eq!(config.write_queue_capacity, 1);
    }
}
