//! Direct-callback transport.
//!
//! The host registers one function per operation. Each request invokes the registered
//! function with a fresh sequence and the encoded arguments; the host answers later
//! through the `Respond*` entry points of [`CallbackBridge::responder`].
//!
//! An operation with no registered function fails with
//! [`BridgeError::Unsupported`] before a sequence is allocated.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::bridge::codec::{self, ErrorEncoding};
use crate::bridge::protocol::{ConnectionHandle, CorrelationId, ListenerHandle};
use crate::bridge::router::{Respond, ResponseRouter};
use crate::bridge::sequencer::PendingSlot;
use crate::bridge::{
    AcceptResult, Bridge, CloseResult, ConnectResult, ListenResult, Operation, Pending,
    ReadResponse, Response, WriteResponse,
};
use crate::error::BridgeError;

/// Handler for `connect` and `listen`: `(sequence, endpoint)`.
pub type EndpointHandler = dyn Fn(CorrelationId, &str) + Send + Sync;
/// `(sequence, connection, length)`
pub type ConnectionReadHandler = dyn Fn(CorrelationId, ConnectionHandle, usize) + Send + Sync;
/// `(sequence, connection, data64)`
pub type ConnectionWriteHandler = dyn Fn(CorrelationId, ConnectionHandle, &str) + Send + Sync;
pub type ConnectionCloseHandler = dyn Fn(CorrelationId, ConnectionHandle) + Send + Sync;
/// Handler for `listener_accept` and `listener_close`: `(sequence, listener)`.
pub type ListenerHandler = dyn Fn(CorrelationId, ListenerHandle) + Send + Sync;

#[derive(Default)]
struct Handlers {
    connect: Option<Arc<EndpointHandler>>,
    connection_read: Option<Arc<ConnectionReadHandler>>,
    connection_write: Option<Arc<ConnectionWriteHandler>>,
    connection_close: Option<Arc<ConnectionCloseHandler>>,
    listen: Option<Arc<EndpointHandler>>,
    listener_accept: Option<Arc<ListenerHandler>>,
    listener_close: Option<Arc<ListenerHandler>>,
}

impl Handlers {
    fn registered(&self, operation: Operation) -> bool {
        match operation {
            Operation::Connect => self.connect.is_some(),
            Operation::ConnectionRead => self.connection_read.is_some(),
            Operation::ConnectionWrite => self.connection_write.is_some(),
            Operation::ConnectionClose => self.connection_close.is_some(),
            Operation::Listen => self.listen.is_some(),
            Operation::ListenerAccept => self.listener_accept.is_some(),
            Operation::ListenerClose => self.listener_close.is_some(),
        }
    }
}

/// Bridge whose host registers a function per operation.
pub struct CallbackBridge {
    router: Arc<ResponseRouter>,
    handlers: RwLock<Handlers>,
    encoded_endpoints: bool,
}

impl CallbackBridge {
    pub fn new(error_encoding: ErrorEncoding) -> Self {
        Self {
            router: Arc::new(ResponseRouter::new(error_encoding)),
            handlers: RwLock::new(Handlers::default()),
            encoded_endpoints: false,
        }
    }

    /// Pass endpoints to handlers base64-encoded instead of as raw text.
    pub fn with_encoded_endpoints(mut self, encoded: bool) -> Self {
        self.encoded_endpoints = encoded;
        self
    }

    pub fn encoded_endpoints(&self) -> bool {
        self.encoded_endpoints
    }

    /// Where the host sends its answers.
    pub fn responder(&self) -> Arc<ResponseRouter> {
        Arc::clone(&self.router)
    }

    pub fn registered(&self, operation: Operation) -> bool {
        self.handlers().registered(operation)
    }

    pub fn register_connect(&self, handler: impl Fn(CorrelationId, &str) + Send + Sync + 'static) {
        self.handlers_mut(|h| h.connect = Some(Arc::new(handler)));
    }

    pub fn register_connection_read(
        &self,
        handler: impl Fn(CorrelationId, ConnectionHandle, usize) + Send + Sync + 'static,
    ) {
        self.handlers_mut(|h| h.connection_read = Some(Arc::new(handler)));
    }

    pub fn register_connection_write(
        &self,
        handler: impl Fn(CorrelationId, ConnectionHandle, &str) + Send + Sync + 'static,
    ) {
        self.handlers_mut(|h| h.connection_write = Some(Arc::new(handler)));
    }

    pub fn register_connection_close(
        &self,
        handler: impl Fn(CorrelationId, ConnectionHandle) + Send + Sync + 'static,
    ) {
        self.handlers_mut(|h| h.connection_close = Some(Arc::new(handler)));
    }

    pub fn register_listen(&self, handler: impl Fn(CorrelationId, &str) + Send + Sync + 'static) {
        self.handlers_mut(|h| h.listen = Some(Arc::new(handler)));
    }

    pub fn register_listener_accept(
        &self,
        handler: impl Fn(CorrelationId, ListenerHandle) + Send + Sync + 'static,
    ) {
        self.handlers_mut(|h| h.listener_accept = Some(Arc::new(handler)));
    }

    pub fn register_listener_close(
        &self,
        handler: impl Fn(CorrelationId, ListenerHandle) + Send + Sync + 'static,
    ) {
        self.handlers_mut(|h| h.listener_close = Some(Arc::new(handler)));
    }

    fn handlers(&self) -> RwLockReadGuard<'_, Handlers> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_mut(&self, update: impl FnOnce(&mut Handlers)) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut handlers);
    }

    fn endpoint_arg(&self, endpoint: &str) -> String {
        if self.encoded_endpoints {
            codec::encode_str(endpoint)
        } else {
            endpoint.to_string()
        }
    }

    // Handlers are cloned out of the table so a handler may (re)register others.
    fn dispatch<H: ?Sized, T: Response>(
        &self,
        operation: Operation,
        handler: Option<Arc<H>>,
        slot: fn(tokio::sync::oneshot::Sender<T>) -> PendingSlot,
        call: impl FnOnce(&H, CorrelationId),
    ) -> Pending<T> {
        let Some(handler) = handler else {
            tracing::debug!(%operation, "No host handler registered");
            return Pending::failed(BridgeError::Unsupported(operation));
        };
        let (sequence, pending) = self.router.register(slot);
        tracing::trace!(%sequence, %operation, "Dispatching to host handler");
        call(&*handler, sequence);
        pending
    }
}

impl Respond for CallbackBridge {
    fn router(&self) -> &ResponseRouter {
        &self.router
    }
}

impl fmt::Debug for CallbackBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers();
        let registered: Vec<_> = Operation::ALL
            .into_iter()
            .filter(|op| handlers.registered(*op))
            .collect();
        f.debug_struct("CallbackBridge")
            .field("registered", &registered)
            .field("encoded_endpoints", &self.encoded_endpoints)
            .field("router", &self.router)
            .finish()
    }
}

impl Bridge for CallbackBridge {
    fn connect(&self, endpoint: &str) -> Pending<ConnectResult> {
        let handler = self.handlers().connect.clone();
        let endpoint = self.endpoint_arg(endpoint);
        self.dispatch(Operation::Connect, handler, PendingSlot::Connect, |h, seq| {
            h(seq, &endpoint)
        })
    }

    fn connection_read(
        &self,
        connection: ConnectionHandle,
        length: usize,
    ) -> Pending<ReadResponse> {
        let handler = self.handlers().connection_read.clone();
        self.dispatch(
            Operation::ConnectionRead,
            handler,
            PendingSlot::ConnectionRead,
            |h, seq| h(seq, connection, length),
        )
    }

    fn connection_write(
        &self,
        connection: ConnectionHandle,
        data: &[u8],
    ) -> Pending<WriteResponse> {
        let handler = self.handlers().connection_write.clone();
        self.dispatch(
            Operation::ConnectionWrite,
            handler,
            PendingSlot::ConnectionWrite,
            |h, seq| h(seq, connection, &codec::encode_bytes(data)),
        )
    }

    fn connection_close(&self, connection: ConnectionHandle) -> Pending<CloseResult> {
        let handler = self.handlers().connection_close.clone();
        self.dispatch(
            Operation::ConnectionClose,
            handler,
            PendingSlot::ConnectionClose,
            |h, seq| h(seq, connection),
        )
    }

    fn listen(&self, endpoint: &str) -> Pending<ListenResult> {
        let handler = self.handlers().listen.clone();
        let endpoint = self.endpoint_arg(endpoint);
        self.dispatch(Operation::Listen, handler, PendingSlot::Listen, |h, seq| {
            h(seq, &endpoint)
        })
    }

    fn listener_accept(&self, listener: ListenerHandle) -> Pending<AcceptResult> {
        let handler = self.handlers().listener_accept.clone();
        self.dispatch(
            Operation::ListenerAccept,
            handler,
            PendingSlot::ListenerAccept,
            |h, seq| h(seq, listener),
        )
    }

    fn listener_close(&self, listener: ListenerHandle) -> Pending<CloseResult> {
        let handler = self.handlers().listener_close.clone();
        self.dispatch(
            Operation::ListenerClose,
            handler,
            PendingSlot::ListenerClose,
            |h, seq| h(seq, listener),
        )
    }
}
