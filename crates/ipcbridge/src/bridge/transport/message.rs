//! Message-post transport.
//!
//! Every request is funneled into one structured [`HostMessage`] posted to a single
//! host-side handler. Responses come back through the `Respond*` entry points of
//! [`MessageBridge::responder`], keyed by the message's sequence.
//!
//! Error strings default to base64 on this transport, since the response path is
//! typically script evaluation where raw text would need escaping.

use std::sync::Arc;

use crate::bridge::codec::{self, ErrorEncoding};
use crate::bridge::protocol::{ConnectionHandle, HostMessage, ListenerHandle};
use crate::bridge::router::{Respond, ResponseRouter};
use crate::bridge::sequencer::PendingSlot;
use crate::bridge::{
    AcceptResult, Bridge, CloseResult, ConnectResult, ListenResult, Pending, ReadResponse,
    WriteResponse,
};

/// The host's single message handler.
pub trait MessageSink: Send + Sync {
    fn post_message(&self, message: HostMessage);
}

impl<F> MessageSink for F
where
    F: Fn(HostMessage) + Send + Sync,
{
    fn post_message(&self, message: HostMessage) {
        self(message)
    }
}

#[derive(Debug)]
pub struct MessageBridge<S> {
    sink: S,
    router: Arc<ResponseRouter>,
}

impl<S: MessageSink> MessageBridge<S> {
    pub fn new(sink: S) -> Self {
        Self::with_error_encoding(sink, ErrorEncoding::Base64)
    }

    pub fn with_error_encoding(sink: S, error_encoding: ErrorEncoding) -> Self {
        Self::with_router(sink, Arc::new(ResponseRouter::new(error_encoding)))
    }

    /// Use a router the host already holds, for sinks that answer through it.
    pub fn with_router(sink: S, router: Arc<ResponseRouter>) -> Self {
        Self { sink, router }
    }

    pub fn responder(&self) -> Arc<ResponseRouter> {
        Arc::clone(&self.router)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn post(&self, message: HostMessage) {
        tracing::trace!(
            sequence = %message.sequence,
            operation = %message.action.operation(),
            "Posting request to host"
        );
        self.sink.post_message(message);
    }
}

impl<S> Respond for MessageBridge<S> {
    fn router(&self) -> &ResponseRouter {
        &self.router
    }
}

impl<S: MessageSink> Bridge for MessageBridge<S> {
    fn connect(&self, endpoint: &str) -> Pending<ConnectResult> {
        let (sequence, pending) = self.router.register(PendingSlot::Connect);
        self.post(HostMessage::connect(sequence, endpoint));
        pending
    }

    fn connection_read(
        &self,
        connection: ConnectionHandle,
        length: usize,
    ) -> Pending<ReadResponse> {
        let (sequence, pending) = self.router.register(PendingSlot::ConnectionRead);
        self.post(HostMessage::connection_read(sequence, connection, length));
        pending
    }

    fn connection_write(
        &self,
        connection: ConnectionHandle,
        data: &[u8],
    ) -> Pending<WriteResponse> {
        let (sequence, pending) = self.router.register(PendingSlot::ConnectionWrite);
        self.post(HostMessage::connection_write(
            sequence,
            connection,
            codec::encode_bytes(data),
        ));
        pending
    }

    fn connection_close(&self, connection: ConnectionHandle) -> Pending<CloseResult> {
        let (sequence, pending) = self.router.register(PendingSlot::ConnectionClose);
        self.post(HostMessage::connection_close(sequence, connection));
        pending
    }

    fn listen(&self, endpoint: &str) -> Pending<ListenResult> {
        let (sequence, pending) = self.router.register(PendingSlot::Listen);
        self.post(HostMessage::listen(sequence, endpoint));
        pending
    }

    fn listener_accept(&self, listener: ListenerHandle) -> Pending<AcceptResult> {
        let (sequence, pending) = self.router.register(PendingSlot::ListenerAccept);
        self.post(HostMessage::listener_accept(sequence, listener));
        pending
    }

    fn listener_close(&self, listener: ListenerHandle) -> Pending<CloseResult> {
        let (sequence, pending) = self.router.register(PendingSlot::ListenerClose);
        self.post(HostMessage::listener_close(sequence, listener));
        pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bridge::protocol::{Action, CorrelationId};
    use crate::error::BridgeError;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<HostMessage>>);

    impl MessageSink for Outbox {
        fn post_message(&self, message: HostMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    impl Outbox {
        fn take(&self) -> Vec<HostMessage> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn listen_accept_write_scenario() {
        let bridge = MessageBridge::new(Outbox::default());

        let listen = bridge.listen("/tmp/s.sock");
        let posted = bridge.sink().take();
        assert_eq!(posted, [HostMessage::listen(CorrelationId::new(0), "/tmp/s.sock")]);
        bridge.respond_listen(CorrelationId::new(0), 7, "");
        let listener = listen.await.unwrap();
        assert_eq!(listener.as_i32(), 7);

        let accept = bridge.listener_accept(listener);
        assert_eq!(bridge.sink().take()[0].sequence, CorrelationId::new(1));
        bridge.respond_listener_accept(CorrelationId::new(1), 42, "");
        let connection = accept.await.unwrap();
        assert_eq!(connection.as_i32(), 42);

        let write = bridge.connection_write(connection, b"ping");
        let posted = bridge.sink().take();
        assert_eq!(posted[0].action, Action::ConnectionWrite);
        assert_eq!(posted[0].data64.as_deref(), Some("cGluZw=="));
        bridge.respond_connection_write(CorrelationId::new(2), 4, "");
        let written = write.await;
        assert_eq!((written.count, written.error), (4, None));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn responses_arrive_out_of_order_from_another_thread() {
        let bridge = MessageBridge::new(Outbox::default());
        let conn = ConnectionHandle::from_wire(3).unwrap();
        let reads: Vec<_> = (0..3).map(|_| bridge.connection_read(conn, 8)).collect();

        let responder = bridge.responder();
        std::thread::spawn(move || {
            for seq in [2u64, 1, 0] {
                let payload = codec::encode_bytes(format!("r{seq}").as_bytes());
                responder.respond_connection_read(CorrelationId::new(seq), &payload, "");
            }
        })
        .join()
        .unwrap();

        for (seq, read) in reads.into_iter().enumerate() {
            assert_eq!(read.await.data, format!("r{seq}").into_bytes());
        }
    }

    #[tokio::test]
    async fn errors_are_base64_by_default() {
        let bridge = MessageBridge::new(Outbox::default());
        let close = bridge.listener_close(ListenerHandle::from_wire(1).unwrap());
        bridge.respond_listener_close(CorrelationId::new(0), &codec::encode_str("bad listener"));
        assert_eq!(close.await, Err(BridgeError::host("bad listener")));
    }

    #[tokio::test]
    async fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let bridge = MessageBridge::with_error_encoding(
            move |message: HostMessage| *record.lock().unwrap() = Some(message.encode().unwrap()),
            ErrorEncoding::Plain,
        );
        let _connect = bridge.connect("/tmp/x.sock");
        assert_eq!(
            seen.lock().unwrap().as_deref(),
            Some(r#"{"sequence":0,"action":0,"endpoint":"/tmp/x.sock"}"#)
        );
    }

    #[test]
    #[should_panic(expected = "invalid sequence 5")]
    fn response_to_unknown_sequence_is_fatal() {
        let bridge = MessageBridge::new(Outbox::default());
        bridge.respond_connection_close(CorrelationId::new(5), "");
    }
}
