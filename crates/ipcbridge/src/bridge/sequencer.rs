//! Correlation id allocation and pending response slots.
//!
//! Used by transports whose host cannot carry a callback across the boundary: the
//! request carries a [`CorrelationId`] instead, and the host's `Respond*` call hands
//! it back so the response can be routed to the right slot.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use super::protocol::CorrelationId;
use super::{
    AcceptResult, CloseResult, ConnectResult, ListenResult, Operation, ReadResponse,
    WriteResponse,
};
use crate::error::{ProtocolViolation, fatal};

/// Single-assignment destination for one response, tagged with the request's kind.
#[derive(Debug)]
pub enum PendingSlot {
    Connect(oneshot::Sender<ConnectResult>),
    ConnectionRead(oneshot::Sender<ReadResponse>),
    ConnectionWrite(oneshot::Sender<WriteResponse>),
    ConnectionClose(oneshot::Sender<CloseResult>),
    Listen(oneshot::Sender<ListenResult>),
    ListenerAccept(oneshot::Sender<AcceptResult>),
    ListenerClose(oneshot::Sender<CloseResult>),
}

impl PendingSlot {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Connect(_) => Operation::Connect,
            Self::ConnectionRead(_) => Operation::ConnectionRead,
            Self::ConnectionWrite(_) => Operation::ConnectionWrite,
            Self::ConnectionClose(_) => Operation::ConnectionClose,
            Self::Listen(_) => Operation::Listen,
            Self::ListenerAccept(_) => Operation::ListenerAccept,
            Self::ListenerClose(_) => Operation::ListenerClose,
        }
    }
}

#[derive(Debug, Default)]
struct SequencerState {
    next_sequence: u64,
    pending: HashMap<CorrelationId, PendingSlot>,
}

/// Allocator of correlation ids paired with the map of outstanding slots.
///
/// One lock covers both the counter and the map. It is held only for the map
/// operation itself, never while waiting on a response.
#[derive(Debug, Default)]
pub struct Sequencer {
    state: Mutex<SequencerState>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a slot and return its fresh id.
    ///
    /// The counter only ever increases, so an id that is still pending can never be
    /// handed out again; hitting one anyway is a bug and aborts.
    pub fn push(&self, slot: PendingSlot) -> CorrelationId {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let sequence = CorrelationId::new(state.next_sequence);
        if state.pending.contains_key(&sequence) {
            drop(state);
            fatal(ProtocolViolation::SequenceOverlap(sequence.as_u64()));
        }
        state.next_sequence += 1;

        tracing::trace!(%sequence, operation = %slot.operation(), "Registered pending request");
        state.pending.insert(sequence, slot);
        sequence
    }

    /// Remove and return the slot bound to `sequence`.
    ///
    /// An id that was never pushed, or was already popped, is a protocol violation.
    pub fn pop(&self, sequence: CorrelationId) -> Result<PendingSlot, ProtocolViolation> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .pending
            .remove(&sequence)
            .ok_or(ProtocolViolation::UnknownSequence(sequence.as_u64()))
    }

    /// Number of requests dispatched and not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    /// The id the next `push` will return.
    pub fn peek_next(&self) -> CorrelationId {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        CorrelationId::new(state.next_sequence)
    }
}
