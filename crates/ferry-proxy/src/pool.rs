//! Idle keep-alive pool for upstream SOCKS connections.
//!
//! One parked connection per destination. A connection is only parked after
//! a cleanly framed response (see `socks.rs`), so a checkout hands back a
//! stream positioned at a message boundary. Parked connections expire after
//! the idle timeout; expiry happens lazily on checkout and eagerly on the
//! periodic sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// How long a parked connection stays usable.
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct ConnectionPool {
    idle_timeout: Duration,

    /// Map from destination (`host:port`) to its parked connection.
    entries: Mutex<HashMap<String, IdleConnection>>,
}

struct IdleConnection {
    stream: TcpStream,
    parked_at: Instant,
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Take the parked connection for a destination, if any.
    ///
    /// Expired connections are dropped here rather than returned.
    pub fn checkout(&self, key: &str) -> Option<TcpStream> {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let idle = entries.remove(key)?;
        if idle.parked_at.elapsed() >= self.idle_timeout {
            return None;
        }
        Some(idle.stream)
    }

    /// Park a connection for a destination, replacing any already parked one.
    pub fn checkin(&self, key: String, stream: TcpStream) {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            IdleConnection {
                stream,
                parked_at: Instant::now(),
            },
        );
    }

    /// Drop every parked connection that has sat idle past the timeout.
    pub fn evict_idle(&self) {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, idle| idle.parked_at.elapsed() < self.idle_timeout);
    }

    /// Number of parked connections.
    pub fn len(&self) -> usize {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
