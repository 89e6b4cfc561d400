//! Stream connection emulated on top of a [`Bridge`].
//!
//! A [`Connection`] owns one host-assigned handle. Reads and writes surface partial
//! results alongside errors; close is idempotent. Once closed, the handle is replaced by
//! [`CLOSED_HANDLE`] and further reads and writes fail locally with
//! [`BridgeError::Closed`] without reaching the host.
//!
//! Blocking callers use the [`std::io::Read`] / [`std::io::Write`] impls, which wait on
//! the host's response from the current thread.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::bridge::protocol::{CLOSED_HANDLE, ConnectionHandle};
use crate::bridge::{Bridge, ReadResponse, WriteResponse};
use crate::error::{BridgeError, DeadlineKind, TransferError};

/// Address of an emulated endpoint. Both ends of a connection report the endpoint
/// it was dialed or accepted on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpcAddr {
    endpoint: String,
}

impl IpcAddr {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn network(&self) -> &'static str {
        "ipc"
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for IpcAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)
    }
}

pub struct Connection {
    bridge: Arc<dyn Bridge>,
    handle: AtomicI32,
    addr: IpcAddr,
    /// Error that arrived together with data on a blocking read or write; reported on
    /// the next blocking call.
    deferred: Mutex<Option<BridgeError>>,
    /// Held for the whole host round trip of a close, so overlapping closes dispatch once.
    closing: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Ask the host to connect to `endpoint`.
    pub async fn connect(bridge: Arc<dyn Bridge>, endpoint: &str) -> Result<Self, BridgeError> {
        let handle = bridge.connect(endpoint).await?;
        tracing::debug!(connection = %handle, endpoint, "Connected");
        Ok(Self::new(bridge, handle, IpcAddr::new(endpoint)))
    }

    pub(crate) fn new(bridge: Arc<dyn Bridge>, handle: ConnectionHandle, addr: IpcAddr) -> Self {
        Self {
            bridge,
            handle: AtomicI32::new(handle.as_i32()),
            addr,
            deferred: Mutex::new(None),
            closing: tokio::sync::Mutex::new(()),
        }
    }

    /// The live handle, or `None` once closed.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        let raw = self.handle.load(Ordering::Acquire);
        if raw == CLOSED_HANDLE {
            return None;
        }
        ConnectionHandle::from_wire(i64::from(raw)).ok()
    }

    pub fn is_closed(&self) -> bool {
        self.handle().is_none()
    }

    fn live(&self) -> Result<ConnectionHandle, BridgeError> {
        self.handle().ok_or(BridgeError::Closed)
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns the number of bytes the host delivered; `min(buf.len(), delivered)` of
    /// them are copied into `buf`. On error the delivered count rides along in
    /// [`TransferError::transferred`] and those bytes are in `buf` as well.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let handle = self.live()?;
        let ReadResponse { data, error } = self.bridge.connection_read(handle, buf.len()).await;

        if data.len() > buf.len() {
            tracing::warn!(
                connection = %handle,
                requested = buf.len(),
                delivered = data.len(),
                "Host delivered more bytes than requested, truncating copy"
            );
        }
        let copied = data.len().min(buf.len());
        buf[..copied].copy_from_slice(&data[..copied]);

        match error {
            Some(error) => Err(TransferError::new(data.len(), error)),
            None => Ok(data.len()),
        }
    }

    /// Write the whole buffer in one request. A short count is reported, never retried.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TransferError> {
        let handle = self.live()?;
        let WriteResponse { count, error } = self.bridge.connection_write(handle, buf).await;
        match error {
            Some(error) => Err(TransferError::new(count, error)),
            None => Ok(count),
        }
    }

    /// Close the connection.
    ///
    /// A closed connection closes again trivially. A close that overlaps one in flight
    /// waits for its outcome. If the host reports a failure the connection stays live
    /// and the close may be retried.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let _closing = self.closing.lock().await;
        let Some(handle) = self.handle() else {
            return Ok(());
        };
        self.bridge.connection_close(handle).await?;
        self.handle.store(CLOSED_HANDLE, Ordering::Release);
        tracing::debug!(connection = %handle, "Connection closed");
        Ok(())
    }

    /// Blocking [`close`](Self::close) for plain threads.
    pub fn close_blocking(&self) -> Result<(), BridgeError> {
        futures::executor::block_on(self.close())
    }

    pub fn local_addr(&self) -> &IpcAddr {
        &self.addr
    }

    pub fn remote_addr(&self) -> &IpcAddr {
        &self.addr
    }

    /// Always fails: the host protocol has no cancellation.
    pub fn set_deadline(&self, _deadline: Instant) -> Result<(), BridgeError> {
        Err(BridgeError::DeadlinesUnsupported(DeadlineKind::ReadWrite))
    }

    pub fn set_read_deadline(&self, _deadline: Instant) -> Result<(), BridgeError> {
        Err(BridgeError::DeadlinesUnsupported(DeadlineKind::Read))
    }

    pub fn set_write_deadline(&self, _deadline: Instant) -> Result<(), BridgeError> {
        Err(BridgeError::DeadlinesUnsupported(DeadlineKind::Write))
    }

    fn take_deferred(&self) -> Option<BridgeError> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn defer(&self, error: BridgeError) {
        *self.deferred.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle())
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Release the host side; nobody is left to observe the outcome.
        if let Some(handle) = self.handle() {
            tracing::debug!(connection = %handle, "Dropping live connection, closing on host");
            drop(self.bridge.connection_close(handle));
        }
    }
}

fn eof_or(error: BridgeError) -> io::Result<usize> {
    if error.is_eof() {
        Ok(0)
    } else {
        Err(error.into())
    }
}

impl io::Read for Connection {
    /// Blocks the calling thread. Must not run on a thread that drives the host's
    /// responses.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(error) = self.take_deferred() {
            return eof_or(error);
        }
        match futures::executor::block_on(Connection::read(self, buf)) {
            Ok(n) => Ok(n.min(buf.len())),
            Err(TransferError {
                transferred: 0,
                error,
            }) => eof_or(error),
            Err(TransferError { transferred, error }) => {
                self.defer(error);
                Ok(transferred.min(buf.len()))
            }
        }
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(error) = self.take_deferred() {
            return Err(error.into());
        }
        match futures::executor::block_on(Connection::write(self, buf)) {
            Ok(n) => Ok(n),
            Err(TransferError {
                transferred: 0,
                error,
            }) => Err(error.into()),
            Err(TransferError { transferred, error }) => {
                self.defer(error);
                Ok(transferred)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
