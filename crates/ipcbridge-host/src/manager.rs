//! Real endpoint I/O behind host-assigned integer ids.
//!
//! The [`ConnectionManager`] is what a privileged host runs on behalf of the sandbox:
//! it dials, listens, accepts, reads, writes and closes Unix sockets (or named pipes)
//! and names each live endpoint by an `i32` id the sandbox can hold on to.
//!
//! - Connection and listener ids are separate counters starting at 0; connect and
//!   accept share the connection counter. Ids are never reused; once a counter passes
//!   `i32::MAX` further allocations fail instead of wrapping into the `-1` sentinel.
//! - Each connection is split into independently locked read and write halves, so a
//!   pending read never holds up a write.
//! - Closing an id cancels operations pending on it. Dropping the manager cancels
//!   everything and releases every endpoint.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;
use ipcbridge::direct::{self, DirectListener, DirectStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;

/// Failure of a manager operation. The `Display` text is what travels back to the
/// sandbox as the host-reported error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid connection id")]
    InvalidConnection,

    #[error("invalid listener id")]
    InvalidListener,

    #[error("{0} ids exhausted")]
    IdsExhausted(&'static str),

    /// Peer closed its end. Sent as exactly `EOF`, which the sandbox recognizes.
    #[error("EOF")]
    Eof,

    #[error("{0}")]
    Io(#[from] io::Error),

    /// The id was closed while this operation was pending.
    #[error("operation aborted: {0} closed")]
    Aborted(&'static str),

    #[error("connection manager shutting down")]
    ShuttingDown,

    #[error("request missing {0}")]
    MissingField(&'static str),

    #[error("request payload not decodable: {0}")]
    InvalidPayload(String),
}

/// A write that stopped early. `written` bytes reached the peer before `error`.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PartialWrite {
    pub written: usize,
    #[source]
    pub error: ManagerError,
}

impl From<ManagerError> for PartialWrite {
    fn from(error: ManagerError) -> Self {
        Self { written: 0, error }
    }
}

struct ConnectionEntry {
    reader: Mutex<ReadHalf<DirectStream>>,
    writer: Mutex<WriteHalf<DirectStream>>,
    cancel: CancellationToken,
}

struct ListenerEntry {
    listener: DirectListener,
    cancel: CancellationToken,
}

pub struct ConnectionManager {
    config: ManagerConfig,
    runtime: Handle,
    connections: DashMap<i32, Arc<ConnectionEntry>>,
    listeners: DashMap<i32, Arc<ListenerEntry>>,
    next_connection_id: AtomicI32,
    next_listener_id: AtomicI32,
    shutdown: CancellationToken,
}

fn allocate(counter: &AtomicI32, kind: &'static str) -> Result<i32, ManagerError> {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
            (id >= 0).then(|| id.checked_add(1).unwrap_or(i32::MIN))
        })
        .map_err(|_| ManagerError::IdsExhausted(kind))
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            connections: DashMap::new(),
            listeners: DashMap::new(),
            next_connection_id: AtomicI32::new(0),
            next_listener_id: AtomicI32::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Run `task` on the manager's runtime. Safe to call from any thread.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn connection(&self, id: i32) -> Result<Arc<ConnectionEntry>, ManagerError> {
        self.connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ManagerError::InvalidConnection)
    }

    fn listener(&self, id: i32) -> Result<Arc<ListenerEntry>, ManagerError> {
        self.listeners
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ManagerError::InvalidListener)
    }

    fn insert_connection(&self, id: i32, stream: DirectStream) {
        let (reader, writer) = tokio::io::split(stream);
        self.connections.insert(
            id,
            Arc::new(ConnectionEntry {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                cancel: self.shutdown.child_token(),
            }),
        );
    }

    pub async fn connect(&self, endpoint: &str) -> Result<i32, ManagerError> {
        let id = allocate(&self.next_connection_id, "connection")?;
        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ManagerError::ShuttingDown),
            stream = direct::dial(endpoint) => stream?,
        };
        self.insert_connection(id, stream);
        tracing::debug!(connection_id = id, endpoint, "Connection established");
        Ok(id)
    }

    /// One read of up to `min(length, max_read_length)` bytes.
    ///
    /// A zero length succeeds at once with no data. End of stream is [`ManagerError::Eof`].
    pub async fn read(&self, connection_id: i32, length: usize) -> Result<Vec<u8>, ManagerError> {
        let entry = self.connection(connection_id)?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; length.min(self.config.max_read_length)];
        let mut reader = tokio::select! {
            _ = entry.cancel.cancelled() => return Err(ManagerError::Aborted("connection")),
            reader = entry.reader.lock() => reader,
        };
        let n = tokio::select! {
            _ = entry.cancel.cancelled() => return Err(ManagerError::Aborted("connection")),
            n = reader.read(&mut buf) => n?,
        };
        if n == 0 {
            return Err(ManagerError::Eof);
        }
        buf.truncate(n);
        tracing::trace!(connection_id, bytes = n, "Read");
        Ok(buf)
    }

    /// Write all of `data`, or report how much got through before the failure.
    pub async fn write(&self, connection_id: i32, data: &[u8]) -> Result<usize, PartialWrite> {
        let entry = self.connection(connection_id)?;
        if data.is_empty() {
            return Ok(0);
        }

        let mut writer = tokio::select! {
            _ = entry.cancel.cancelled() => return Err(ManagerError::Aborted("connection").into()),
            writer = entry.writer.lock() => writer,
        };
        let mut written = 0;
        while written < data.len() {
            let result = tokio::select! {
                _ = entry.cancel.cancelled() => Err(ManagerError::Aborted("connection")),
                n = writer.write(&data[written..]) => n.map_err(ManagerError::from),
            };
            match result {
                Ok(0) => {
                    let error = io::Error::from(io::ErrorKind::WriteZero).into();
                    return Err(PartialWrite { written, error });
                }
                Ok(n) => written += n,
                Err(error) => return Err(PartialWrite { written, error }),
            }
        }
        tracing::trace!(connection_id, bytes = written, "Wrote");
        Ok(written)
    }

    pub async fn close_connection(&self, connection_id: i32) -> Result<(), ManagerError> {
        let (_, entry) = self
            .connections
            .remove(&connection_id)
            .ok_or(ManagerError::InvalidConnection)?;
        entry.cancel.cancel();

        // Pending writes release the lock once they observe the cancellation.
        let mut writer = entry.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(connection_id, error = %e, "Shutdown on close failed");
        }
        tracing::debug!(connection_id, "Connection closed");
        Ok(())
    }

    pub async fn listen(&self, endpoint: &str) -> Result<i32, ManagerError> {
        let id = allocate(&self.next_listener_id, "listener")?;
        if self.config.unlink_existing {
            remove_stale_socket(endpoint);
        }
        let listener = direct::listen(endpoint)?;
        self.listeners.insert(
            id,
            Arc::new(ListenerEntry {
                listener,
                cancel: self.shutdown.child_token(),
            }),
        );
        tracing::debug!(listener_id = id, endpoint, "Listener bound");
        Ok(id)
    }

    /// Wait for the next inbound connection and assign it a connection id.
    pub async fn accept(&self, listener_id: i32) -> Result<i32, ManagerError> {
        let entry = self.listener(listener_id)?;
        let id = allocate(&self.next_connection_id, "connection")?;
        let stream = tokio::select! {
            _ = entry.cancel.cancelled() => return Err(ManagerError::Aborted("listener")),
            stream = entry.listener.accept() => stream?,
        };
        self.insert_connection(id, stream);
        tracing::debug!(listener_id, connection_id = id, "Connection accepted");
        Ok(id)
    }

    /// Close a listener. Its socket file is removed once pending accepts have unwound.
    pub async fn close_listener(&self, listener_id: i32) -> Result<(), ManagerError> {
        let (_, entry) = self
            .listeners
            .remove(&listener_id)
            .ok_or(ManagerError::InvalidListener)?;
        entry.cancel.cancel();
        tracing::debug!(listener_id, endpoint = entry.listener.endpoint(), "Listener closed");
        Ok(())
    }

    #[cfg(test)]
    fn set_next_connection_id(&self, id: i32) {
        self.next_connection_id.store(id, Ordering::Release);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        tracing::debug!(
            connections = self.connections.len(),
            listeners = self.listeners.len(),
            "Connection manager dropped"
        );
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn remove_stale_socket(endpoint: &str) {
    match std::fs::remove_file(endpoint) {
        Ok(()) => tracing::debug!(endpoint, "Removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(endpoint, error = %e, "Failed to remove stale socket file"),
    }
}

#[cfg(not(unix))]
fn remove_stale_socket(_endpoint: &str) {}
