//! Bridge between sandboxed callers and the privileged host.
//!
//! Every operation is asynchronous: the request is dispatched to the host immediately
//! and the caller gets a [`Pending`] that resolves exactly once, when the host answers.
//!
//! # Architecture
//!
//! - **codec**: base64 payload codec and error codec
//! - **protocol**: correlation ids, handles, the message-post wire format
//! - **sequencer**: correlation id allocation + pending response slots
//! - **router**: `Respond*` entry points shared by the sequenced transports
//! - **transport**: one [`Bridge`] implementation per host-embedding mechanism

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::BridgeError;

pub mod codec;
pub mod protocol;
pub mod router;
pub mod sequencer;
pub mod transport;

use protocol::{ConnectionHandle, ListenerHandle};

/// The seven operations a host can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    ConnectionRead,
    ConnectionWrite,
    ConnectionClose,
    Listen,
    ListenerAccept,
    ListenerClose,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Self::Connect,
        Self::ConnectionRead,
        Self::ConnectionWrite,
        Self::ConnectionClose,
        Self::Listen,
        Self::ListenerAccept,
        Self::ListenerClose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ConnectionRead => "connection_read",
            Self::ConnectionWrite => "connection_write",
            Self::ConnectionClose => "connection_close",
            Self::Listen => "listen",
            Self::ListenerAccept => "listener_accept",
            Self::ListenerClose => "listener_close",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ConnectResult = Result<ConnectionHandle, BridgeError>;
pub type ListenResult = Result<ListenerHandle, BridgeError>;
pub type AcceptResult = Result<ConnectionHandle, BridgeError>;
pub type CloseResult = Result<(), BridgeError>;

/// Bytes returned by a read. Data and error may both be present (short read).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub data: Vec<u8>,
    pub error: Option<BridgeError>,
}

/// Bytes accepted by a write. Count and error may both be present (short write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub count: usize,
    pub error: Option<BridgeError>,
}

/// Result shape a [`Pending`] can resolve to.
pub trait Response: Sized + Send + 'static {
    /// Resolution carrying only an error, nothing transferred.
    fn from_error(error: BridgeError) -> Self;

    /// Value reported when the host dropped the response path without answering.
    fn abandoned() -> Self {
        Self::from_error(BridgeError::Abandoned)
    }
}

impl<T: Send + 'static> Response for Result<T, BridgeError> {
    fn from_error(error: BridgeError) -> Self {
        Err(error)
    }
}

impl Response for ReadResponse {
    fn from_error(error: BridgeError) -> Self {
        Self {
            data: Vec::new(),
            error: Some(error),
        }
    }
}

impl Response for WriteResponse {
    fn from_error(error: BridgeError) -> Self {
        Self {
            count: 0,
            error: Some(error),
        }
    }
}

/// Handle to an in-flight request. Resolves exactly once.
///
/// Await it from async code, or [`wait`](Pending::wait) from a plain thread.
/// Dropping it does not cancel the request; the late response is discarded.
#[must_use = "a Pending does nothing unless awaited or waited on"]
pub struct Pending<T> {
    state: PendingState<T>,
}

enum PendingState<T> {
    Ready(Option<T>),
    Waiting(oneshot::Receiver<T>),
}

// Never pin-projects into `T`.
impl<T> Unpin for Pending<T> {}

impl<T: Response> Pending<T> {
    /// A slot the responder can fill without waiting for a reader.
    pub fn channel() -> (oneshot::Sender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: PendingState::Waiting(rx),
            },
        )
    }

    /// Already resolved (e.g. rejected before dispatch).
    pub fn ready(value: T) -> Self {
        Self {
            state: PendingState::Ready(Some(value)),
        }
    }

    /// Already failed without reaching the host.
    pub fn failed(error: BridgeError) -> Self {
        Self::ready(T::from_error(error))
    }

    /// Block the current thread until the host responds.
    ///
    /// Must not be called from inside an async task driving the same runtime that
    /// delivers the response.
    pub fn wait(self) -> T {
        futures::executor::block_on(self)
    }
}

impl<T: Response> Future for Pending<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match &mut self.get_mut().state {
            PendingState::Ready(value) => match value.take() {
                Some(value) => Poll::Ready(value),
                None => Poll::Ready(T::abandoned()),
            },
            PendingState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or_else(|_| T::abandoned())),
        }
    }
}

/// Capability set every transport variant provides.
///
/// Implementations dispatch synchronously and return immediately; the host's answer
/// arrives later, possibly on another thread, through the returned [`Pending`].
pub trait Bridge: Send + Sync {
    fn connect(&self, endpoint: &str) -> Pending<ConnectResult>;

    fn connection_read(
        &self,
        connection: ConnectionHandle,
        length: usize,
    ) -> Pending<ReadResponse>;

    fn connection_write(
        &self,
        connection: ConnectionHandle,
        data: &[u8],
    ) -> Pending<WriteResponse>;

    fn connection_close(&self, connection: ConnectionHandle) -> Pending<CloseResult>;

    fn listen(&self, endpoint: &str) -> Pending<ListenResult>;

    fn listener_accept(&self, listener: ListenerHandle) -> Pending<AcceptResult>;

    fn listener_close(&self, listener: ListenerHandle) -> Pending<CloseResult>;
}
