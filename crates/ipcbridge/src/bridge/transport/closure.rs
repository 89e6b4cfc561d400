//! Native-callback transport.
//!
//! Each request calls a method on a host object and hands it a reply closure. The
//! closure is the correlation: no sequence, no pending map. The host may invoke it from
//! any thread; a closure dropped without being invoked resolves as
//! [`BridgeError::Abandoned`](crate::error::BridgeError::Abandoned).

use tokio::sync::oneshot;

use crate::bridge::codec::{self, ErrorEncoding};
use crate::bridge::protocol::{ConnectionHandle, ListenerHandle};
use crate::bridge::router::{close_result, handle_result, read_response, write_response};
use crate::bridge::{
    AcceptResult, Bridge, CloseResult, ConnectResult, ListenResult, Pending, ReadResponse,
    WriteResponse,
};
use crate::error::{ProtocolViolation, fatal};

/// Reply for connect, listen and accept: `(handle, error)`.
pub type HandleCallback = Box<dyn FnOnce(i64, String) + Send>;
/// Reply for reads: `(data64, error)`.
pub type ReadCallback = Box<dyn FnOnce(String, String) + Send>;
/// Reply for writes: `(count, error)`.
pub type WriteCallback = Box<dyn FnOnce(usize, String) + Send>;
/// Reply for closes: `(error)`.
pub type CloseCallback = Box<dyn FnOnce(String) + Send>;

/// Host object exposed to the sandbox.
///
/// Every method must eventually invoke its callback exactly once, with errors encoded
/// per the bridge's [`ErrorEncoding`] and read data base64-encoded.
pub trait ClosureHost: Send + Sync {
    fn connect_with_callback(&self, endpoint: &str, callback: HandleCallback);

    fn connection_read_with_callback(
        &self,
        connection: ConnectionHandle,
        length: usize,
        callback: ReadCallback,
    );

    fn connection_write_with_callback(
        &self,
        connection: ConnectionHandle,
        data64: String,
        callback: WriteCallback,
    );

    fn connection_close_with_callback(&self, connection: ConnectionHandle, callback: CloseCallback);

    fn listen_with_callback(&self, endpoint: &str, callback: HandleCallback);

    fn listener_accept_with_callback(&self, listener: ListenerHandle, callback: HandleCallback);

    fn listener_close_with_callback(&self, listener: ListenerHandle, callback: CloseCallback);
}

#[derive(Debug)]
pub struct ClosureBridge<H> {
    host: H,
    error_encoding: ErrorEncoding,
}

impl<H: ClosureHost> ClosureBridge<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            error_encoding: ErrorEncoding::Plain,
        }
    }

    pub fn with_error_encoding(mut self, error_encoding: ErrorEncoding) -> Self {
        self.error_encoding = error_encoding;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}

// Runs on whatever thread the host calls back from.
fn reply<T>(tx: oneshot::Sender<T>, decoded: Result<T, ProtocolViolation>) {
    let value = decoded.unwrap_or_else(|v| fatal(v));
    if tx.send(value).is_err() {
        tracing::warn!("Requester went away before host callback ran, discarding");
    }
}

impl<H: ClosureHost> Bridge for ClosureBridge<H> {
    fn connect(&self, endpoint: &str) -> Pending<ConnectResult> {
        let (tx, pending) = Pending::channel();
        let encoding = self.error_encoding;
        tracing::trace!(endpoint, "Dispatching connect to host object");
        self.host.connect_with_callback(
            endpoint,
            Box::new(move |connection_id, error| {
                reply(
                    tx,
                    handle_result(encoding, connection_id, &error, ConnectionHandle::from_wire),
                )
            }),
        );
        pending
    }

    fn connection_read(
        &self,
        connection: ConnectionHandle,
        length: usize,
    ) -> Pending<ReadResponse> {
        let (tx, pending) = Pending::channel();
        let encoding = self.error_encoding;
        tracing::trace!(%connection, length, "Dispatching read to host object");
        self.host.connection_read_with_callback(
            connection,
            length,
            Box::new(move |data64, error| reply(tx, read_response(encoding, &data64, &error))),
        );
        pending
    }

    fn connection_write(
        &self,
        connection: ConnectionHandle,
        data: &[u8],
    ) -> Pending<WriteResponse> {
        let (tx, pending) = Pending::channel();
        let encoding = self.error_encoding;
        tracing::trace!(%connection, length = data.len(), "Dispatching write to host object");
        self.host.connection_write_with_callback(
            connection,
            codec::encode_bytes(data),
            Box::new(move |count, error| reply(tx, write_response(encoding, count, &error))),
        );
        pending
    }

    fn connection_close(&self, connection: ConnectionHandle) -> Pending<CloseResult> {
        let (tx, pending) = Pending::channel();
        let encoding = self.error_encoding;
        self.host.connection_close_with_callback(
            connection,
            Box::new(move |error| reply(tx, close_result(encoding, &error))),
        );
        pending
    }

    fn listen(&self, endpoint: &str) -> Pending<ListenResult> {
        let (tx, pending) = Pending::channel();
        let encoding = self.error_encoding;
        tracing::trace!(endpoint, "Dispatching listen to host object");
        self.host.listen_with_callback(
            endpoint,
            Box::new(move |listener_id, error| {
                reply(
                    tx,
                    handle_result(encoding, listener_id, &error, ListenerHandle::from_wire),
                )
            }),
        );
        pending
    }

    fn listener_accept(&self, listener: ListenerHandle) -> Pending<AcceptResult> {
        let (tx, pending) = Pending::channel();
        let encoding = self.error_encoding;
        self.host.listener_accept_with_callback(
            listener,
            Box::new(move |connection_id, error| {
                reply(
                    tx,
                    handle_result(encoding, connection_id, &error, ConnectionHandle::from_wire),
                )
            }),
        );
        pending
    }

    fn listener_close(&self, listener: ListenerHandle) -> Pending<CloseResult> {
        let (tx, pending) = Pending::channel();
        let encoding = self.error_encoding;
        self.host.listener_close_with_callback(
            listener,
            Box::new(move |error| reply(tx, close_result(encoding, &error))),
        );
        pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::BridgeError;

    /// Parks every callback so tests decide when, where, and how to answer.
    #[derive(Default)]
    struct ParkingHost {
        handles: Mutex<Vec<(String, HandleCallback)>>,
        reads: Mutex<Vec<ReadCallback>>,
        writes: Mutex<Vec<(String, WriteCallback)>>,
        closes: Mutex<Vec<CloseCallback>>,
    }

    impl ClosureHost for ParkingHost {
        fn connect_with_callback(&self, endpoint: &str, callback: HandleCallback) {
            self.handles.lock().unwrap().push((endpoint.to_string(), callback));
        }

        fn connection_read_with_callback(
            &self,
            _: ConnectionHandle,
            _: usize,
            callback: ReadCallback,
        ) {
            self.reads.lock().unwrap().push(callback);
        }

        fn connection_write_with_callback(
            &self,
            _: ConnectionHandle,
            data64: String,
            callback: WriteCallback,
        ) {
            self.writes.lock().unwrap().push((data64, callback));
        }

        fn connection_close_with_callback(&self, _: ConnectionHandle, callback: CloseCallback) {
            self.closes.lock().unwrap().push(callback);
        }

        fn listen_with_callback(&self, endpoint: &str, callback: HandleCallback) {
            self.handles.lock().unwrap().push((endpoint.to_string(), callback));
        }

        fn listener_accept_with_callback(&self, _: ListenerHandle, callback: HandleCallback) {
            self.handles.lock().unwrap().push((String::new(), callback));
        }

        fn listener_close_with_callback(&self, _: ListenerHandle, callback: CloseCallback) {
            self.closes.lock().unwrap().push(callback);
        }
    }

    fn conn(id: i64) -> ConnectionHandle {
        ConnectionHandle::from_wire(id).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callbacks_resolve_from_another_thread_in_any_order() {
        let bridge = ClosureBridge::new(ParkingHost::default());
        let first = bridge.connect("/tmp/a.sock");
        let second = bridge.listen("/tmp/b.sock");

        let mut parked: Vec<_> = bridge.host().handles.lock().unwrap().drain(..).collect();
        assert_eq!(parked[0].0, "/tmp/a.sock");
        let (_, listen_cb) = parked.pop().unwrap();
        let (_, connect_cb) = parked.pop().unwrap();
        std::thread::spawn(move || {
            listen_cb(7, String::new());
            connect_cb(-1, "connection refused".to_string());
        })
        .join()
        .unwrap();

        assert_eq!(first.await, Err(BridgeError::host("connection refused")));
        assert_eq!(second.await, Ok(ListenerHandle::from_wire(7).unwrap()));
    }

    #[tokio::test]
    async fn write_data_travels_base64() {
        let bridge = ClosureBridge::new(ParkingHost::default());
        let pending = bridge.connection_write(conn(42), b"ping");

        let (data64, callback) = bridge.host().writes.lock().unwrap().pop().unwrap();
        assert_eq!(data64, "cGluZw==");
        callback(4, String::new());

        let response = pending.await;
        assert_eq!(response.count, 4);
        assert_eq!(response.error, None);
    }

    #[tokio::test]
    async fn read_decodes_data_and_base64_error() {
        let bridge =
            ClosureBridge::new(ParkingHost::default()).with_error_encoding(ErrorEncoding::Base64);
        let pending = bridge.connection_read(conn(1), 16);

        let callback = bridge.host().reads.lock().unwrap().pop().unwrap();
        callback(codec::encode_bytes(b"abc"), codec::encode_str("EOF"));

        let response = pending.await;
        assert_eq!(response.data, b"abc");
        assert!(response.error.unwrap().is_eof());
    }

    #[tokio::test]
    async fn dropped_callback_resolves_abandoned() {
        let bridge = ClosureBridge::new(ParkingHost::default());
        let pending = bridge.connection_close(conn(1));
        bridge.host().closes.lock().unwrap().clear();
        assert_eq!(pending.await, Err(BridgeError::Abandoned));
    }

    #[test]
    #[should_panic(expected = "host sent undecodable payload")]
    fn gibberish_read_data_is_fatal() {
        let bridge = ClosureBridge::new(ParkingHost::default());
        let _pending = bridge.connection_read(conn(1), 16);
        let callback = bridge.host().reads.lock().unwrap().pop().unwrap();
        callback("@@@".to_string(), String::new());
    }
}
