//! Proxy-call transport.
//!
//! Same response path as message-post, but requests are direct method calls on a host
//! proxy object, one method per operation, each carrying the sequence.

use std::sync::Arc;

use crate::bridge::codec::{self, ErrorEncoding};
use crate::bridge::protocol::{ConnectionHandle, CorrelationId, ListenerHandle};
use crate::bridge::router::{Respond, ResponseRouter};
use crate::bridge::sequencer::PendingSlot;
use crate::bridge::{
    AcceptResult, Bridge, CloseResult, ConnectResult, ListenResult, Operation, Pending,
    ReadResponse, WriteResponse,
};

/// Host proxy object. Each call must be answered by exactly one `Respond*` call
/// carrying the same sequence.
pub trait ProxyHost: Send + Sync {
    fn connect(&self, sequence: CorrelationId, endpoint: &str);

    fn connection_read(
        &self,
        sequence: CorrelationId,
        connection: ConnectionHandle,
        length: usize,
    );

    fn connection_write(
        &self,
        sequence: CorrelationId,
        connection: ConnectionHandle,
        data64: &str,
    );

    fn connection_close(&self, sequence: CorrelationId, connection: ConnectionHandle);

    fn listen(&self, sequence: CorrelationId, endpoint: &str);

    fn listener_accept(&self, sequence: CorrelationId, listener: ListenerHandle);

    fn listener_close(&self, sequence: CorrelationId, listener: ListenerHandle);
}

#[derive(Debug)]
pub struct ProxyBridge<P> {
    proxy: P,
    router: Arc<ResponseRouter>,
}

impl<P: ProxyHost> ProxyBridge<P> {
    pub fn new(proxy: P) -> Self {
        Self::with_error_encoding(proxy, ErrorEncoding::Plain)
    }

    pub fn with_error_encoding(proxy: P, error_encoding: ErrorEncoding) -> Self {
        Self::with_router(proxy, Arc::new(ResponseRouter::new(error_encoding)))
    }

    pub fn with_router(proxy: P, router: Arc<ResponseRouter>) -> Self {
        Self { proxy, router }
    }

    pub fn responder(&self) -> Arc<ResponseRouter> {
        Arc::clone(&self.router)
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }
}

impl<P> Respond for ProxyBridge<P> {
    fn router(&self) -> &ResponseRouter {
        &self.router
    }
}

fn trace_call(sequence: CorrelationId, operation: Operation) {
    tracing::trace!(%sequence, %operation, "Calling host proxy");
}

impl<P: ProxyHost> Bridge for ProxyBridge<P> {
    fn connect(&self, endpoint: &str) -> Pending<ConnectResult> {
        let (sequence, pending) = self.router.register(PendingSlot::Connect);
        trace_call(sequence, Operation::Connect);
        self.proxy.connect(sequence, endpoint);
        pending
    }

    fn connection_read(
        &self,
        connection: ConnectionHandle,
        length: usize,
    ) -> Pending<ReadResponse> {
        let (sequence, pending) = self.router.register(PendingSlot::ConnectionRead);
        trace_call(sequence, Operation::ConnectionRead);
        self.proxy.connection_read(sequence, connection, length);
        pending
    }

    fn connection_write(
        &self,
        connection: ConnectionHandle,
        data: &[u8],
    ) -> Pending<WriteResponse> {
        let (sequence, pending) = self.router.register(PendingSlot::ConnectionWrite);
        trace_call(sequence, Operation::ConnectionWrite);
        self.proxy.connection_write(sequence, connection, &codec::encode_bytes(data));
        pending
    }

    fn connection_close(&self, connection: ConnectionHandle) -> Pending<CloseResult> {
        let (sequence, pending) = self.router.register(PendingSlot::ConnectionClose);
        trace_call(sequence, Operation::ConnectionClose);
        self.proxy.connection_close(sequence, connection);
        pending
    }

    fn listen(&self, endpoint: &str) -> Pending<ListenResult> {
        let (sequence, pending) = self.router.register(PendingSlot::Listen);
        trace_call(sequence, Operation::Listen);
        self.proxy.listen(sequence, endpoint);
        pending
    }

    fn listener_accept(&self, listener: ListenerHandle) -> Pending<AcceptResult> {
        let (sequence, pending) = self.router.register(PendingSlot::ListenerAccept);
        trace_call(sequence, Operation::ListenerAccept);
        self.proxy.listener_accept(sequence, listener);
        pending
    }

    fn listener_close(&self, listener: ListenerHandle) -> Pending<CloseResult> {
        let (sequence, pending) = self.router.register(PendingSlot::ListenerClose);
        trace_call(sequence, Operation::ListenerClose);
        self.proxy.listener_close(sequence, listener);
        pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::BridgeError;

    /// Records `(sequence, method)` for every call.
    #[derive(Default)]
    struct RecordingProxy(Mutex<Vec<(CorrelationId, &'static str)>>);

    impl RecordingProxy {
        fn record(&self, sequence: CorrelationId, method: &'static str) {
            self.0.lock().unwrap().push((sequence, method));
        }

        fn calls(&self) -> Vec<(CorrelationId, &'static str)> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ProxyHost for RecordingProxy {
        fn connect(&self, sequence: CorrelationId, _: &str) {
            self.record(sequence, "connect");
        }

        fn connection_read(&self, sequence: CorrelationId, _: ConnectionHandle, _: usize) {
            self.record(sequence, "connection_read");
        }

        fn connection_write(&self, sequence: CorrelationId, _: ConnectionHandle, _: &str) {
            self.record(sequence, "connection_write");
        }

        fn connection_close(&self, sequence: CorrelationId, _: ConnectionHandle) {
            self.record(sequence, "connection_close");
        }

        fn listen(&self, sequence: CorrelationId, _: &str) {
            self.record(sequence, "listen");
        }

        fn listener_accept(&self, sequence: CorrelationId, _: ListenerHandle) {
            self.record(sequence, "listener_accept");
        }

        fn listener_close(&self, sequence: CorrelationId, _: ListenerHandle) {
            self.record(sequence, "listener_close");
        }
    }

    #[tokio::test]
    async fn every_method_carries_a_fresh_sequence() {
        let bridge = ProxyBridge::new(RecordingProxy::default());
        let conn = ConnectionHandle::from_wire(1).unwrap();
        let listener = ListenerHandle::from_wire(2).unwrap();

        let _a = bridge.connect("/tmp/a.sock");
        let _b = bridge.connection_read(conn, 4);
        let _c = bridge.connection_write(conn, b"x");
        let _d = bridge.connection_close(conn);
        let _e = bridge.listen("/tmp/b.sock");
        let _f = bridge.listener_accept(listener);
        let _g = bridge.listener_close(listener);

        let calls = bridge.proxy().calls();
        let sequences: Vec<_> = calls.iter().map(|(seq, _)| seq.as_u64()).collect();
        assert_eq!(sequences, [0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(
            calls.iter().map(|(_, m)| *m).collect::<Vec<_>>(),
            Operation::ALL.map(|op| op.as_str())
        );
        assert_eq!(bridge.responder().sequencer().outstanding(), 7);
    }

    #[tokio::test]
    async fn plain_errors_pass_through_verbatim() {
        let bridge = ProxyBridge::new(RecordingProxy::default());
        let accept = bridge.listener_accept(ListenerHandle::from_wire(2).unwrap());
        bridge.respond_listener_accept(CorrelationId::new(0), -1, "invalid listener id");
        assert_eq!(accept.await, Err(BridgeError::host("invalid listener id")));
    }

    #[test]
    #[should_panic(expected = "listen response routed to pending connect request")]
    fn response_of_wrong_kind_is_fatal() {
        let bridge = ProxyBridge::new(RecordingProxy::default());
        let _connect = bridge.connect("/tmp/a.sock");
        bridge.respond_listen(CorrelationId::new(0), 1, "");
    }
}
