//! In-process bridge for unit tests: answers every request immediately from a script.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::bridge::protocol::{ConnectionHandle, ListenerHandle};
use crate::bridge::{
    AcceptResult, Bridge, CloseResult, ConnectResult, ListenResult, Operation, Pending,
    ReadResponse, WriteResponse,
};
use crate::error::BridgeError;

/// Unscripted defaults: handles count up from 0, reads hit EOF, writes accept
/// everything, closes succeed.
#[derive(Default)]
pub(crate) struct ScriptedBridge {
    calls: Mutex<Vec<Operation>>,
    next_handle: Mutex<i64>,
    handles: Mutex<VecDeque<Result<i64, BridgeError>>>,
    reads: Mutex<VecDeque<ReadResponse>>,
    writes: Mutex<VecDeque<WriteResponse>>,
    closes: Mutex<VecDeque<CloseResult>>,
}

impl ScriptedBridge {
    /// Next connect, listen, or accept response.
    pub fn script_handle(&self, result: Result<i64, BridgeError>) {
        self.handles.lock().unwrap().push_back(result);
    }

    pub fn script_read(&self, data: &[u8], error: Option<&str>) {
        self.reads.lock().unwrap().push_back(ReadResponse {
            data: data.to_vec(),
            error: error.map(BridgeError::host),
        });
    }

    pub fn script_write(&self, count: usize, error: Option<&str>) {
        self.writes.lock().unwrap().push_back(WriteResponse {
            count,
            error: error.map(BridgeError::host),
        });
    }

    pub fn script_close(&self, result: CloseResult) {
        self.closes.lock().unwrap().push_back(result);
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| **op == operation)
            .count()
    }

    fn record(&self, operation: Operation) {
        self.calls.lock().unwrap().push(operation);
    }

    fn next_raw_handle(&self) -> Result<i64, BridgeError> {
        self.handles.lock().unwrap().pop_front().unwrap_or_else(|| {
            let mut next = self.next_handle.lock().unwrap();
            *next += 1;
            Ok(*next - 1)
        })
    }

    fn close_result(&self) -> CloseResult {
        self.closes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

impl Bridge for ScriptedBridge {
    fn connect(&self, _endpoint: &str) -> Pending<ConnectResult> {
        self.record(Operation::Connect);
        Pending::ready(
            self.next_raw_handle()
                .map(|raw| ConnectionHandle::from_wire(raw).unwrap()),
        )
    }

    fn connection_read(&self, _: ConnectionHandle, _length: usize) -> Pending<ReadResponse> {
        self.record(Operation::ConnectionRead);
        let response = self.reads.lock().unwrap().pop_front();
        Pending::ready(response.unwrap_or(ReadResponse {
            data: Vec::new(),
            error: Some(BridgeError::host("EOF")),
        }))
    }

    fn connection_write(&self, _: ConnectionHandle, data: &[u8]) -> Pending<WriteResponse> {
        self.record(Operation::ConnectionWrite);
        let response = self.writes.lock().unwrap().pop_front();
        Pending::ready(response.unwrap_or(WriteResponse {
            count: data.len(),
            error: None,
        }))
    }

    fn connection_close(&self, _: ConnectionHandle) -> Pending<CloseResult> {
        self.record(Operation::ConnectionClose);
        Pending::ready(self.close_result())
    }

    fn listen(&self, _endpoint: &str) -> Pending<ListenResult> {
        self.record(Operation::Listen);
        Pending::ready(
            self.next_raw_handle()
                .map(|raw| ListenerHandle::from_wire(raw).unwrap()),
        )
    }

    fn listener_accept(&self, _: ListenerHandle) -> Pending<AcceptResult> {
        self.record(Operation::ListenerAccept);
        Pending::ready(
            self.next_raw_handle()
                .map(|raw| ConnectionHandle::from_wire(raw).unwrap()),
        )
    }

    fn listener_close(&self, _: ListenerHandle) -> Pending<CloseResult> {
        self.record(Operation::ListenerClose);
        Pending::ready(self.close_result())
    }
}
