//! Plug a [`ConnectionManager`] into each bridge transport.
//!
//! Every request is served on the manager's runtime and answered from there, so
//! answers come back on a runtime worker thread and in completion order.

use std::sync::Arc;

use ipcbridge::bridge::codec;
use ipcbridge::bridge::protocol::Action;
use ipcbridge::bridge::transport::{CloseCallback, HandleCallback, ReadCallback, WriteCallback};
use ipcbridge::{
    CallbackBridge, ClosureBridge, ClosureHost, ConnectionHandle, CorrelationId, ErrorEncoding,
    HostMessage, ListenerHandle, MessageBridge, MessageSink, ProxyBridge, ProxyHost, Respond,
    ResponseRouter,
};

use crate::manager::{ConnectionManager, ManagerError, PartialWrite};

const NO_HANDLE: i64 = -1;

fn wire_error(encoding: ErrorEncoding, error: &impl ToString) -> String {
    encoding.encode(Some(&error.to_string()))
}

fn handle_wire(encoding: ErrorEncoding, result: Result<i32, ManagerError>) -> (i64, String) {
    match result {
        Ok(id) => (i64::from(id), String::new()),
        Err(e) => (NO_HANDLE, wire_error(encoding, &e)),
    }
}

fn read_wire(encoding: ErrorEncoding, result: Result<Vec<u8>, ManagerError>) -> (String, String) {
    match result {
        Ok(data) => (codec::encode_bytes(&data), String::new()),
        Err(e) => (String::new(), wire_error(encoding, &e)),
    }
}

fn write_wire(encoding: ErrorEncoding, result: Result<usize, PartialWrite>) -> (usize, String) {
    match result {
        Ok(n) => (n, String::new()),
        Err(e) => (e.written, wire_error(encoding, &e)),
    }
}

fn close_wire(encoding: ErrorEncoding, result: Result<(), ManagerError>) -> String {
    match result {
        Ok(()) => String::new(),
        Err(e) => wire_error(encoding, &e),
    }
}

fn decode_payload(data64: &str) -> Result<Vec<u8>, ManagerError> {
    codec::decode_bytes(data64).map_err(|v| ManagerError::InvalidPayload(v.to_string()))
}

async fn write_payload(
    manager: &ConnectionManager,
    connection_id: i32,
    data64: &str,
) -> Result<usize, PartialWrite> {
    let data = decode_payload(data64)?;
    manager.write(connection_id, &data).await
}

/// Host object for [`ClosureBridge`].
#[derive(Debug, Clone)]
pub struct ManagerHost {
    manager: Arc<ConnectionManager>,
    error_encoding: ErrorEncoding,
}

impl ManagerHost {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            error_encoding: ErrorEncoding::Plain,
        }
    }

    /// Must match the encoding the bridge decodes with.
    pub fn with_error_encoding(mut self, error_encoding: ErrorEncoding) -> Self {
        self.error_encoding = error_encoding;
        self
    }
}

impl ClosureHost for ManagerHost {
    fn connect_with_callback(&self, endpoint: &str, callback: HandleCallback) {
        let (manager, encoding) = (Arc::clone(&self.manager), self.error_encoding);
        let endpoint = endpoint.to_string();
        self.manager.spawn(async move {
            let (id, error) = handle_wire(encoding, manager.connect(&endpoint).await);
            callback(id, error);
        });
    }

    fn connection_read_with_callback(
        &self,
        connection: ConnectionHandle,
        length: usize,
        callback: ReadCallback,
    ) {
        let (manager, encoding) = (Arc::clone(&self.manager), self.error_encoding);
        self.manager.spawn(async move {
            let (data64, error) =
                read_wire(encoding, manager.read(connection.as_i32(), length).await);
            callback(data64, error);
        });
    }

    fn connection_write_with_callback(
        &self,
        connection: ConnectionHandle,
        data64: String,
        callback: WriteCallback,
    ) {
        let (manager, encoding) = (Arc::clone(&self.manager), self.error_encoding);
        self.manager.spawn(async move {
            let result = write_payload(&manager, connection.as_i32(), &data64).await;
            let (count, error) = write_wire(encoding, result);
            callback(count, error);
        });
    }

    fn connection_close_with_callback(
        &self,
        connection: ConnectionHandle,
        callback: CloseCallback,
    ) {
        let (manager, encoding) = (Arc::clone(&self.manager), self.error_encoding);
        self.manager.spawn(async move {
            callback(close_wire(
                encoding,
                manager.close_connection(connection.as_i32()).await,
            ));
        });
    }

    fn listen_with_callback(&self, endpoint: &str, callback: HandleCallback) {
        let (manager, encoding) = (Arc::clone(&self.manager), self.error_encoding);
        let endpoint = endpoint.to_string();
        self.manager.spawn(async move {
            let (id, error) = handle_wire(encoding, manager.listen(&endpoint).await);
            callback(id, error);
        });
    }

    fn listener_accept_with_callback(&self, listener: ListenerHandle, callback: HandleCallback) {
        let (manager, encoding) = (Arc::clone(&self.manager), self.error_encoding);
        self.manager.spawn(async move {
            let (id, error) = handle_wire(encoding, manager.accept(listener.as_i32()).await);
            callback(id, error);
        });
    }

    fn listener_close_with_callback(&self, listener: ListenerHandle, callback: CloseCallback) {
        let (manager, encoding) = (Arc::clone(&self.manager), self.error_encoding);
        self.manager.spawn(async move {
            callback(close_wire(
                encoding,
                manager.close_listener(listener.as_i32()).await,
            ));
        });
    }
}

/// Host proxy object for [`ProxyBridge`], answering through the bridge's router.
#[derive(Debug, Clone)]
pub struct ManagerProxy {
    manager: Arc<ConnectionManager>,
    responder: Arc<ResponseRouter>,
}

impl ManagerProxy {
    pub fn new(manager: Arc<ConnectionManager>, responder: Arc<ResponseRouter>) -> Self {
        Self { manager, responder }
    }

    fn parts(&self) -> (Arc<ConnectionManager>, Arc<ResponseRouter>, ErrorEncoding) {
        (
            Arc::clone(&self.manager),
            Arc::clone(&self.responder),
            self.responder.error_encoding(),
        )
    }
}

impl ProxyHost for ManagerProxy {
    fn connect(&self, sequence: CorrelationId, endpoint: &str) {
        let (manager, responder, encoding) = self.parts();
        let endpoint = endpoint.to_string();
        self.manager.spawn(async move {
            let (id, error) = handle_wire(encoding, manager.connect(&endpoint).await);
            responder.respond_connect(sequence, id, &error);
        });
    }

    fn connection_read(
        &self,
        sequence: CorrelationId,
        connection: ConnectionHandle,
        length: usize,
    ) {
        let (manager, responder, encoding) = self.parts();
        self.manager.spawn(async move {
            let (data64, error) =
                read_wire(encoding, manager.read(connection.as_i32(), length).await);
            responder.respond_connection_read(sequence, &data64, &error);
        });
    }

    fn connection_write(
        &self,
        sequence: CorrelationId,
        connection: ConnectionHandle,
        data64: &str,
    ) {
        let (manager, responder, encoding) = self.parts();
        let data64 = data64.to_string();
        self.manager.spawn(async move {
            let result = write_payload(&manager, connection.as_i32(), &data64).await;
            let (count, error) = write_wire(encoding, result);
            responder.respond_connection_write(sequence, count, &error);
        });
    }

    fn connection_close(&self, sequence: CorrelationId, connection: ConnectionHandle) {
        let (manager, responder, encoding) = self.parts();
        self.manager.spawn(async move {
            let error = close_wire(encoding, manager.close_connection(connection.as_i32()).await);
            responder.respond_connection_close(sequence, &error);
        });
    }

    fn listen(&self, sequence: CorrelationId, endpoint: &str) {
        let (manager, responder, encoding) = self.parts();
        let endpoint = endpoint.to_string();
        self.manager.spawn(async move {
            let (id, error) = handle_wire(encoding, manager.listen(&endpoint).await);
            responder.respond_listen(sequence, id, &error);
        });
    }

    fn listener_accept(&self, sequence: CorrelationId, listener: ListenerHandle) {
        let (manager, responder, encoding) = self.parts();
        self.manager.spawn(async move {
            let (id, error) = handle_wire(encoding, manager.accept(listener.as_i32()).await);
            responder.respond_listener_accept(sequence, id, &error);
        });
    }

    fn listener_close(&self, sequence: CorrelationId, listener: ListenerHandle) {
        let (manager, responder, encoding) = self.parts();
        self.manager.spawn(async move {
            let error = close_wire(encoding, manager.close_listener(listener.as_i32()).await);
            responder.respond_listener_close(sequence, &error);
        });
    }
}

/// Single message handler for [`MessageBridge`].
///
/// A message missing a field its action needs is answered with a host error rather
/// than dropped, so the requester never hangs.
#[derive(Debug, Clone)]
pub struct ManagerSink {
    manager: Arc<ConnectionManager>,
    responder: Arc<ResponseRouter>,
}

impl ManagerSink {
    pub fn new(manager: Arc<ConnectionManager>, responder: Arc<ResponseRouter>) -> Self {
        Self { manager, responder }
    }
}

fn field<T>(value: Option<T>, name: &'static str) -> Result<T, ManagerError> {
    value.ok_or(ManagerError::MissingField(name))
}

async fn serve_message(
    manager: Arc<ConnectionManager>,
    responder: Arc<ResponseRouter>,
    message: HostMessage,
) {
    let encoding = responder.error_encoding();
    let sequence = message.sequence;
    match message.action {
        Action::Connect => {
            let result = match field(message.endpoint, "endpoint") {
                Ok(endpoint) => manager.connect(&endpoint).await,
                Err(e) => Err(e),
            };
            let (id, error) = handle_wire(encoding, result);
            responder.respond_connect(sequence, id, &error);
        }
        Action::ConnectionRead => {
            let result = match (
                field(message.connection_id, "connectionId"),
                field(message.length, "length"),
            ) {
                (Ok(connection), Ok(length)) => manager.read(connection.as_i32(), length).await,
                (Err(e), _) | (_, Err(e)) => Err(e),
            };
            let (data64, error) = read_wire(encoding, result);
            responder.respond_connection_read(sequence, &data64, &error);
        }
        Action::ConnectionWrite => {
            let result = match (
                field(message.connection_id, "connectionId"),
                field(message.data64, "data64"),
            ) {
                (Ok(connection), Ok(data64)) => {
                    write_payload(&manager, connection.as_i32(), &data64).await
                }
                (Err(e), _) | (_, Err(e)) => Err(e.into()),
            };
            let (count, error) = write_wire(encoding, result);
            responder.respond_connection_write(sequence, count, &error);
        }
        Action::ConnectionClose => {
            let result = match field(message.connection_id, "connectionId") {
                Ok(connection) => manager.close_connection(connection.as_i32()).await,
                Err(e) => Err(e),
            };
            responder.respond_connection_close(sequence, &close_wire(encoding, result));
        }
        Action::Listen => {
            let result = match field(message.endpoint, "endpoint") {
                Ok(endpoint) => manager.listen(&endpoint).await,
                Err(e) => Err(e),
            };
            let (id, error) = handle_wire(encoding, result);
            responder.respond_listen(sequence, id, &error);
        }
        Action::ListenerAccept => {
            let result = match field(message.listener_id, "listenerId") {
                Ok(listener) => manager.accept(listener.as_i32()).await,
                Err(e) => Err(e),
            };
            let (id, error) = handle_wire(encoding, result);
            responder.respond_listener_accept(sequence, id, &error);
        }
        Action::ListenerClose => {
            let result = match field(message.listener_id, "listenerId") {
                Ok(listener) => manager.close_listener(listener.as_i32()).await,
                Err(e) => Err(e),
            };
            responder.respond_listener_close(sequence, &close_wire(encoding, result));
        }
    }
}

impl MessageSink for ManagerSink {
    fn post_message(&self, message: HostMessage) {
        let manager = Arc::clone(&self.manager);
        let responder = Arc::clone(&self.responder);
        self.manager.spawn(serve_message(manager, responder, message));
    }
}

/// Install manager-backed handlers for every operation on `bridge`.
///
/// Endpoints arrive base64-encoded when the bridge was built with
/// [`CallbackBridge::with_encoded_endpoints`]; an undecodable one fails the request.
pub fn register_callbacks(bridge: &CallbackBridge, manager: Arc<ConnectionManager>) {
    let responder = bridge.responder();
    let encoding = responder.error_encoding();
    let encoded = bridge.encoded_endpoints();
    let endpoint_of = move |raw: &str| -> Result<String, ManagerError> {
        if encoded {
            codec::decode_str(raw).map_err(|v| ManagerError::InvalidPayload(v.to_string()))
        } else {
            Ok(raw.to_string())
        }
    };

    {
        let (manager, responder) = (Arc::clone(&manager), Arc::clone(&responder));
        bridge.register_connect(move |sequence, endpoint| {
            let (m, r) = (Arc::clone(&manager), Arc::clone(&responder));
            let endpoint = endpoint_of(endpoint);
            manager.spawn(async move {
                let result = match endpoint {
                    Ok(endpoint) => m.connect(&endpoint).await,
                    Err(e) => Err(e),
                };
                let (id, error) = handle_wire(encoding, result);
                r.respond_connect(sequence, id, &error);
            });
        });
    }
    {
        let (manager, responder) = (Arc::clone(&manager), Arc::clone(&responder));
        bridge.register_connection_read(move |sequence, connection, length| {
            let (m, r) = (Arc::clone(&manager), Arc::clone(&responder));
            manager.spawn(async move {
                let result = m.read(connection.as_i32(), length).await;
                let (data64, error) = read_wire(encoding, result);
                r.respond_connection_read(sequence, &data64, &error);
            });
        });
    }
    {
        let (manager, responder) = (Arc::clone(&manager), Arc::clone(&responder));
        bridge.register_connection_write(move |sequence, connection, data64| {
            let (m, r) = (Arc::clone(&manager), Arc::clone(&responder));
            let data64 = data64.to_string();
            manager.spawn(async move {
                let result = write_payload(&m, connection.as_i32(), &data64).await;
                let (count, error) = write_wire(encoding, result);
                r.respond_connection_write(sequence, count, &error);
            });
        });
    }
    {
        let (manager, responder) = (Arc::clone(&manager), Arc::clone(&responder));
        bridge.register_connection_close(move |sequence, connection| {
            let (m, r) = (Arc::clone(&manager), Arc::clone(&responder));
            manager.spawn(async move {
                let error = close_wire(encoding, m.close_connection(connection.as_i32()).await);
                r.respond_connection_close(sequence, &error);
            });
        });
    }
    {
        let (manager, responder) = (Arc::clone(&manager), Arc::clone(&responder));
        bridge.register_listen(move |sequence, endpoint| {
            let (m, r) = (Arc::clone(&manager), Arc::clone(&responder));
            let endpoint = endpoint_of(endpoint);
            manager.spawn(async move {
                let result = match endpoint {
                    Ok(endpoint) => m.listen(&endpoint).await,
                    Err(e) => Err(e),
                };
                let (id, error) = handle_wire(encoding, result);
                r.respond_listen(sequence, id, &error);
            });
        });
    }
    {
        let (manager, responder) = (Arc::clone(&manager), Arc::clone(&responder));
        bridge.register_listener_accept(move |sequence, listener| {
            let (m, r) = (Arc::clone(&manager), Arc::clone(&responder));
            manager.spawn(async move {
                let (id, error) = handle_wire(encoding, m.accept(listener.as_i32()).await);
                r.respond_listener_accept(sequence, id, &error);
            });
        });
    }
    bridge.register_listener_close(move |sequence, listener| {
        let (m, r) = (Arc::clone(&manager), Arc::clone(&responder));
        manager.spawn(async move {
            let error = close_wire(encoding, m.close_listener(listener.as_i32()).await);
            r.respond_listener_close(sequence, &error);
        });
    });
}

/// Closure-transport bridge backed by `manager`, with plain-text errors.
pub fn closure_bridge(manager: Arc<ConnectionManager>) -> ClosureBridge<ManagerHost> {
    ClosureBridge::new(ManagerHost::new(manager))
}

/// Proxy-transport bridge backed by `manager`, with plain-text errors.
pub fn proxy_bridge(manager: Arc<ConnectionManager>) -> ProxyBridge<ManagerProxy> {
    let router = Arc::new(ResponseRouter::new(ErrorEncoding::Plain));
    ProxyBridge::with_router(ManagerProxy::new(manager, Arc::clone(&router)), router)
}

/// Message-transport bridge backed by `manager`, with base64 errors.
pub fn message_bridge(manager: Arc<ConnectionManager>) -> MessageBridge<ManagerSink> {
    let router = Arc::new(ResponseRouter::new(ErrorEncoding::Base64));
    MessageBridge::with_router(ManagerSink::new(manager, Arc::clone(&router)), router)
}

/// Callback-transport bridge with every operation served by `manager`.
pub fn callback_bridge(manager: Arc<ConnectionManager>, encoded_endpoints: bool) -> CallbackBridge {
    let bridge =
        CallbackBridge::new(ErrorEncoding::Plain).with_encoded_endpoints(encoded_endpoints);
    register_callbacks(&bridge, manager);
    bridge
}
