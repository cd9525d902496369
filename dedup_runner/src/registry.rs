// dedup_runner/src/registry.rs
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::connection::LineConnection;
use crate::lifecycle::Lifecycle;

/// Result of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    Admitted(Arc<LineConnection>),
    /// The raw socket is handed back; the caller closes it without reading.
    Rejected(TcpStream),
}

struct RegistryInner {
    active: HashMap<u64, Arc<LineConnection>>,
    next_id: u64,
}

/// Bounded membership of the connections currently being served.
///
/// Entries are membership only. The reader thread of each connection owns
/// its lifetime and removes the entry when it exits, so the registry never
/// keeps a finished connection alive.
///
/// Every mutation, including the capacity check that precedes an insert,
/// happens under the write side of one lock, so admission, removal and
/// bulk close never race each other.
pub struct ConnectionRegistry {
    lifecycle: Arc<Lifecycle>,
    max_connections: usize,
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(lifecycle: Arc<Lifecycle>, max_connections: usize) -> Self {
        Self {
            lifecycle,
            max_connections,
            inner: RwLock::new(RegistryInner {
                active: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn try_admit(&self, stream: TcpStream) -> Admission {
        let mut inner = self.inner.write();
        let running = self.lifecycle.is_running();
        let current = inner.active.len();
        if !running || current >= self.max_connections {
            debug!(
                "rejecting connection: running={}, active={}/{}",
                running, current, self.max_connections
            );
            return Admission::Rejected(stream);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let connection = Arc::new(LineConnection::new(id, stream));
        inner.active.insert(id, connection.clone());
        debug!(
            "admitted connection {} from {:?} ({}/{})",
            id,
            connection.peer_addr(),
            inner.active.len(),
            self.max_connections
        );
        Admission::Admitted(connection)
    }

    /// Forgets a connection. Removing an unknown id is a no-op.
    pub fn remove(&self, id: u64) -> bool {
        self.inner.write().active.remove(&id).is_some()
    }

    /// Empties the set and stops every member that was in it.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<LineConnection>> = {
            let mut inner = self.inner.write();
            inner.active.drain().map(|(_, conn)| conn).collect()
        };
        // Sockets are shut down outside the lock; `stop` never fails, it only
        // reports whether this call was the one that closed the socket.
        let count = drained.len();
        for connection in drained {
            connection.stop();
        }
        if count > 0 {
            info!("closed {} client connection(s)", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
