//! Wire-level identifiers and the message-post request format.
//!
//! - **CorrelationId**: routes exactly one response to exactly one request
//! - **ConnectionHandle / ListenerHandle**: opaque host-assigned ids for live endpoints
//! - **HostMessage**: the single structured message used by the message-post transport

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Operation;
use crate::error::ProtocolViolation;

/// Request/response correlation tag, unique among outstanding requests of one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value the emulation layer stores in place of a handle once it is closed.
///
/// Hosts never assign it.
pub const CLOSED_HANDLE: i32 = -1;

macro_rules! host_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i32);

        impl $name {
            /// Validate a handle reported by the host alongside a success.
            pub fn from_wire(raw: i64) -> Result<Self, ProtocolViolation> {
                i32::try_from(raw)
                    .ok()
                    .filter(|id| *id >= 0)
                    .map(Self)
                    .ok_or(ProtocolViolation::InvalidHandle(raw))
            }

            pub fn as_i32(self) -> i32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

host_handle!(
    /// Host-assigned id of one live stream connection.
    ConnectionHandle
);

host_handle!(
    /// Host-assigned id of one live listening endpoint.
    ListenerHandle
);

/// Operation code carried by a [`HostMessage`]. Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect = 0,
    ConnectionRead = 1,
    ConnectionWrite = 2,
    ConnectionClose = 3,
    Listen = 4,
    ListenerAccept = 5,
    ListenerClose = 6,
}

impl Action {
    pub fn operation(self) -> Operation {
        match self {
            Self::Connect => Operation::Connect,
            Self::ConnectionRead => Operation::ConnectionRead,
            Self::ConnectionWrite => Operation::ConnectionWrite,
            Self::ConnectionClose => Operation::ConnectionClose,
            Self::Listen => Operation::Listen,
            Self::ListenerAccept => Operation::ListenerAccept,
            Self::ListenerClose => Operation::ListenerClose,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Connect,
            1 => Self::ConnectionRead,
            2 => Self::ConnectionWrite,
            3 => Self::ConnectionClose,
            4 => Self::Listen,
            5 => Self::ListenerAccept,
            6 => Self::ListenerClose,
            _ => return None,
        })
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown action code {code}")))
    }
}

/// Request posted to the host's single message handler.
///
/// Only the fields relevant to `action` are present; binary payloads are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMessage {
    pub sequence: CorrelationId,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_id: Option<ListenerHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data64: Option<String>,
}

impl HostMessage {
    fn bare(sequence: CorrelationId, action: Action) -> Self {
        Self {
            sequence,
            action,
            endpoint: None,
            connection_id: None,
            listener_id: None,
            length: None,
            data64: None,
        }
    }

    pub fn connect(sequence: CorrelationId, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::bare(sequence, Action::Connect)
        }
    }

    pub fn connection_read(
        sequence: CorrelationId,
        connection: ConnectionHandle,
        length: usize,
    ) -> Self {
        Self {
            connection_id: Some(connection),
            length: Some(length),
            ..Self::bare(sequence, Action::ConnectionRead)
        }
    }

    pub fn connection_write(
        sequence: CorrelationId,
        connection: ConnectionHandle,
        data64: String,
    ) -> Self {
        Self {
            connection_id: Some(connection),
            data64: Some(data64),
            ..Self::bare(sequence, Action::ConnectionWrite)
        }
    }

    pub fn connection_close(sequence: CorrelationId, connection: ConnectionHandle) -> Self {
        Self {
            connection_id: Some(connection),
            ..Self::bare(sequence, Action::ConnectionClose)
        }
    }

    pub fn listen(sequence: CorrelationId, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::bare(sequence, Action::Listen)
        }
    }

    pub fn listener_accept(sequence: CorrelationId, listener: ListenerHandle) -> Self {
        Self {
            listener_id: Some(listener),
            ..Self::bare(sequence, Action::ListenerAccept)
        }
    }

    pub fn listener_close(sequence: CorrelationId, listener: ListenerHandle) -> Self {
        Self {
            listener_id: Some(listener),
            ..Self::bare(sequence, Action::ListenerClose)
        }
    }

    /// Serialize for hosts whose message channel only carries strings.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: i64) -> ConnectionHandle {
        ConnectionHandle::from_wire(id).unwrap()
    }

    #[test]
    fn handles_reject_negative_and_oversized() {
        assert_eq!(conn(42).as_i32(), 42);
        assert_eq!(
            ConnectionHandle::from_wire(-1),
            Err(ProtocolViolation::InvalidHandle(-1))
        );
        assert_eq!(
            ListenerHandle::from_wire(i64::from(i32::MAX) + 1),
            Err(ProtocolViolation::InvalidHandle(i64::from(i32::MAX) + 1))
        );
    }

    #[test]
    fn action_codes_are_stable() {
        for code in 0..7u8 {
            let action = Action::from_code(code).unwrap();
            assert_eq!(action as u8, code);
        }
        assert_eq!(Action::from_code(7), None);
    }

    #[test]
    fn connect_message_serializes() {
        let msg = HostMessage::connect(CorrelationId::new(0), "/tmp/s.sock");
        insta::assert_json_snapshot!(msg, @r#"
        {
          "sequence": 0,
          "action": 0,
          "endpoint": "/tmp/s.sock"
        }
        "#);
    }

    #[test]
    fn read_message_serializes() {
        let msg = HostMessage::connection_read(CorrelationId::new(3), conn(42), 512);
        insta::assert_json_snapshot!(msg, @r#"
        {
          "sequence": 3,
          "action": 1,
          "connectionId": 42,
          "length": 512
        }
        "#);
    }

    #[test]
    fn write_message_serializes() {
        let msg = HostMessage::connection_write(CorrelationId::new(2), conn(42), "cGluZw==".into());
        insta::assert_json_snapshot!(msg, @r#"
        {
          "sequence": 2,
          "action": 2,
          "connectionId": 42,
          "data64": "cGluZw=="
        }
        "#);
    }

    #[test]
    fn accept_message_serializes() {
        let listener = ListenerHandle::from_wire(7).unwrap();
        let msg = HostMessage::listener_accept(CorrelationId::new(1), listener);
        insta::assert_json_snapshot!(msg, @r#"
        {
          "sequence": 1,
          "action": 5,
          "listenerId": 7
        }
        "#);
    }

    #[test]
    fn decode_rejects_unknown_action() {
        let err = HostMessage::decode(r#"{"sequence":0,"action":9}"#).unwrap_err();
        assert!(err.to_string().contains("unknown action code 9"));
    }

    #[test]
    fn decode_accepts_encoded_message() {
        let listener = ListenerHandle::from_wire(1).unwrap();
        let msg = HostMessage::listener_close(CorrelationId::new(5), listener);
        let text = msg.encode().unwrap();
        assert_eq!(HostMessage::decode(&text).unwrap(), msg);
    }
}
