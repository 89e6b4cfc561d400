//! Response routing for sequence-tagged transports.
//!
//! The host answers every request by calling the `Respond*` entry point matching the
//! request's operation, passing back the request's [`CorrelationId`]. The router pops
//! the pending slot, checks it is the kind of request this response belongs to,
//! decodes the payload and delivers the result exactly once.
//!
//! Any mismatch (unknown id, wrong kind, undecodable payload) means correlation is
//! lost and is fatal.

use tokio::sync::oneshot;

use super::codec::{self, ErrorEncoding};
use super::protocol::{ConnectionHandle, CorrelationId, ListenerHandle};
use super::sequencer::{PendingSlot, Sequencer};
use super::{CloseResult, Operation, Pending, ReadResponse, Response, WriteResponse};
use crate::error::{BridgeError, ProtocolViolation, fatal};

/// Sequencer plus the decoding rules of one transport.
#[derive(Debug, Default)]
pub struct ResponseRouter {
    sequencer: Sequencer,
    error_encoding: ErrorEncoding,
}

impl ResponseRouter {
    pub fn new(error_encoding: ErrorEncoding) -> Self {
        Self {
            sequencer: Sequencer::new(),
            error_encoding,
        }
    }

    pub fn error_encoding(&self) -> ErrorEncoding {
        self.error_encoding
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Allocate a pending slot of the given kind and its correlation id.
    pub fn register<T: Response>(
        &self,
        slot: fn(oneshot::Sender<T>) -> PendingSlot,
    ) -> (CorrelationId, Pending<T>) {
        let (tx, pending) = Pending::channel();
        let sequence = self.sequencer.push(slot(tx));
        (sequence, pending)
    }

    pub fn try_respond_connect(
        &self,
        sequence: CorrelationId,
        connection_id: i64,
        error: &str,
    ) -> Result<(), ProtocolViolation> {
        let PendingSlot::Connect(tx) = self.pop(sequence, Operation::Connect)? else {
            unreachable!("pop checks the slot kind");
        };
        let result =
            handle_result(self.error_encoding, connection_id, error, ConnectionHandle::from_wire)?;
        deliver(sequence, tx, result);
        Ok(())
    }

    pub fn try_respond_connection_read(
        &self,
        sequence: CorrelationId,
        data64: &str,
        error: &str,
    ) -> Result<(), ProtocolViolation> {
        let PendingSlot::ConnectionRead(tx) = self.pop(sequence, Operation::ConnectionRead)?
        else {
            unreachable!("pop checks the slot kind");
        };
        let response = read_response(self.error_encoding, data64, error)?;
        deliver(sequence, tx, response);
        Ok(())
    }

    pub fn try_respond_connection_write(
        &self,
        sequence: CorrelationId,
        count: usize,
        error: &str,
    ) -> Result<(), ProtocolViolation> {
        let PendingSlot::ConnectionWrite(tx) = self.pop(sequence, Operation::ConnectionWrite)?
        else {
            unreachable!("pop checks the slot kind");
        };
        let response = write_response(self.error_encoding, count, error)?;
        deliver(sequence, tx, response);
        Ok(())
    }

    pub fn try_respond_connection_close(
        &self,
        sequence: CorrelationId,
        error: &str,
    ) -> Result<(), ProtocolViolation> {
        let PendingSlot::ConnectionClose(tx) = self.pop(sequence, Operation::ConnectionClose)?
        else {
            unreachable!("pop checks the slot kind");
        };
        let result = close_result(self.error_encoding, error)?;
        deliver(sequence, tx, result);
        Ok(())
    }

    pub fn try_respond_listen(
        &self,
        sequence: CorrelationId,
        listener_id: i64,
        error: &str,
    ) -> Result<(), ProtocolViolation> {
        let PendingSlot::Listen(tx) = self.pop(sequence, Operation::Listen)? else {
            unreachable!("pop checks the slot kind");
        };
        let result =
            handle_result(self.error_encoding, listener_id, error, ListenerHandle::from_wire)?;
        deliver(sequence, tx, result);
        Ok(())
    }

    pub fn try_respond_listener_accept(
        &self,
        sequence: CorrelationId,
        connection_id: i64,
        error: &str,
    ) -> Result<(), ProtocolViolation> {
        let PendingSlot::ListenerAccept(tx) = self.pop(sequence, Operation::ListenerAccept)?
        else {
            unreachable!("pop checks the slot kind");
        };
        let result =
            handle_result(self.error_encoding, connection_id, error, ConnectionHandle::from_wire)?;
        deliver(sequence, tx, result);
        Ok(())
    }

    pub fn try_respond_listener_close(
        &self,
        sequence: CorrelationId,
        error: &str,
    ) -> Result<(), ProtocolViolation> {
        let PendingSlot::ListenerClose(tx) = self.pop(sequence, Operation::ListenerClose)? else {
            unreachable!("pop checks the slot kind");
        };
        let result = close_result(self.error_encoding, error)?;
        deliver(sequence, tx, result);
        Ok(())
    }

    fn pop(
        &self,
        sequence: CorrelationId,
        response: Operation,
    ) -> Result<PendingSlot, ProtocolViolation> {
        let slot = self.sequencer.pop(sequence)?;
        if slot.operation() != response {
            return Err(ProtocolViolation::ResponseShape {
                expected: slot.operation(),
                found: response,
            });
        }
        Ok(slot)
    }
}

// Response decoding shared with the closure transport, which resolves without a sequencer.

/// A handle-or-error response. The handle is only validated when no error is reported.
pub(crate) fn handle_result<H>(
    encoding: ErrorEncoding,
    raw: i64,
    error: &str,
    from_wire: fn(i64) -> Result<H, ProtocolViolation>,
) -> Result<Result<H, BridgeError>, ProtocolViolation> {
    Ok(match encoding.decode(error)? {
        Some(err) => Err(err),
        None => Ok(from_wire(raw)?),
    })
}

pub(crate) fn read_response(
    encoding: ErrorEncoding,
    data64: &str,
    error: &str,
) -> Result<ReadResponse, ProtocolViolation> {
    Ok(ReadResponse {
        data: codec::decode_bytes(data64)?,
        error: encoding.decode(error)?,
    })
}

pub(crate) fn write_response(
    encoding: ErrorEncoding,
    count: usize,
    error: &str,
) -> Result<WriteResponse, ProtocolViolation> {
    Ok(WriteResponse {
        count,
        error: encoding.decode(error)?,
    })
}

pub(crate) fn close_result(
    encoding: ErrorEncoding,
    error: &str,
) -> Result<CloseResult, ProtocolViolation> {
    Ok(match encoding.decode(error)? {
        Some(err) => Err(err),
        None => Ok(()),
    })
}

fn deliver<T>(sequence: CorrelationId, tx: oneshot::Sender<T>, value: T) {
    // Buffered slot: never waits for the requester.
    if tx.send(value).is_err() {
        tracing::warn!(%sequence, "Requester went away before response arrived, discarding");
    } else {
        tracing::trace!(%sequence, "Response delivered");
    }
}

/// Host-facing `Respond*` entry points.
///
/// Safe to call from any thread. A call that cannot be routed aborts the process.
pub trait Respond {
    fn router(&self) -> &ResponseRouter;

    fn respond_connect(&self, sequence: CorrelationId, connection_id: i64, error: &str) {
        self.router()
            .try_respond_connect(sequence, connection_id, error)
            .unwrap_or_else(|v| fatal(v));
    }

    fn respond_connection_read(&self, sequence: CorrelationId, data64: &str, error: &str) {
        self.router()
            .try_respond_connection_read(sequence, data64, error)
            .unwrap_or_else(|v| fatal(v));
    }

    fn respond_connection_write(&self, sequence: CorrelationId, count: usize, error: &str) {
        self.router()
            .try_respond_connection_write(sequence, count, error)
            .unwrap_or_else(|v| fatal(v));
    }

    fn respond_connection_close(&self, sequence: CorrelationId, error: &str) {
        self.router()
            .try_respond_connection_close(sequence, error)
            .unwrap_or_else(|v| fatal(v));
    }

    fn respond_listen(&self, sequence: CorrelationId, listener_id: i64, error: &str) {
        self.router()
            .try_respond_listen(sequence, listener_id, error)
            .unwrap_or_else(|v| fatal(v));
    }

    fn respond_listener_accept(&self, sequence: CorrelationId, connection_id: i64, error: &str) {
        self.router()
            .try_respond_listener_accept(sequence, connection_id, error)
            .unwrap_or_else(|v| fatal(v));
    }

    fn respond_listener_close(&self, sequence: CorrelationId, error: &str) {
        self.router()
            .try_respond_listener_close(sequence, error)
            .unwrap_or_else(|v| fatal(v));
    }
}

impl Respond for ResponseRouter {
    fn router(&self) -> &ResponseRouter {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_response_resolves_handle() {
        let router = ResponseRouter::new(ErrorEncoding::Plain);
        let (sequence, pending) = router.register(PendingSlot::Connect);
        router.respond_connect(sequence, 42, "");
        assert_eq!(pending.await, Ok(ConnectionHandle::from_wire(42).unwrap()));
        assert_eq!(router.sequencer().outstanding(), 0);
    }

    #[tokio::test]
    async fn error_wins_over_handle() {
        let router = ResponseRouter::new(ErrorEncoding::Plain);
        let (sequence, pending) = router.register(PendingSlot::Listen);
        router.respond_listen(sequence, -1, "address in use");
        assert_eq!(pending.await, Err(BridgeError::host("address in use")));
    }

    #[tokio::test]
    async fn read_keeps_data_alongside_error() {
        let router = ResponseRouter::new(ErrorEncoding::Base64);
        let (sequence, pending) = router.register(PendingSlot::ConnectionRead);
        router.respond_connection_read(
            sequence,
            &codec::encode_bytes(b"abc"),
            &codec::encode_str("connection reset"),
        );
        let response = pending.await;
        assert_eq!(response.data, b"abc");
        assert_eq!(response.error, Some(BridgeError::host("connection reset")));
    }

    #[tokio::test]
    async fn response_for_dropped_requester_is_discarded() {
        let router = ResponseRouter::new(ErrorEncoding::Plain);
        let (sequence, pending) = router.register(PendingSlot::ConnectionClose);
        drop(pending);
        router.respond_connection_close(sequence, "");
        assert_eq!(router.sequencer().outstanding(), 0);
    }

    #[test]
    fn wrong_kind_is_a_violation() {
        let router = ResponseRouter::new(ErrorEncoding::Plain);
        let (sequence, _pending) = router.register(PendingSlot::ConnectionWrite);
        assert_eq!(
            router.try_respond_listener_close(sequence, ""),
            Err(ProtocolViolation::ResponseShape {
                expected: Operation::ConnectionWrite,
                found: Operation::ListenerClose,
            })
        );
    }

    #[test]
    fn negative_handle_on_success_is_a_violation() {
        let router = ResponseRouter::new(ErrorEncoding::Plain);
        let (sequence, _pending) = router.register(PendingSlot::ListenerAccept);
        assert_eq!(
            router.try_respond_listener_accept(sequence, -1, ""),
            Err(ProtocolViolation::InvalidHandle(-1))
        );
    }

    #[test]
    #[should_panic(expected = "invalid sequence 0")]
    fn second_response_is_fatal() {
        let router = ResponseRouter::new(ErrorEncoding::Plain);
        let (sequence, _pending) = router.register(PendingSlot::ConnectionWrite);
        router.respond_connection_write(sequence, 4, "");
        router.respond_connection_write(sequence, 4, "");
    }

    #[test]
    #[should_panic(expected = "invalid sequence 17")]
    fn unknown_sequence_is_fatal() {
        ResponseRouter::default().respond_listener_close(CorrelationId::new(17), "");
    }

    #[test]
    #[should_panic(expected = "host sent undecodable payload")]
    fn gibberish_read_data_is_fatal() {
        let router = ResponseRouter::new(ErrorEncoding::Plain);
        let (sequence, _pending) = router.register(PendingSlot::ConnectionRead);
        router.respond_connection_read(sequence, "**not base64**", "");
    }
}
