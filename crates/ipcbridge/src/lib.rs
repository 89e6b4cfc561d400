//! ipcbridge: stream IPC for sandboxed code, delegated to a privileged host.
//!
//! The sandbox has no sockets or pipes of its own. Every operation is sent to a host
//! through a [`Bridge`], which correlates the host's asynchronous (possibly
//! out-of-order, possibly cross-thread) answers back to the waiting caller.
//! [`Connection`] and [`Listener`] turn that into ordinary stream semantics.

pub mod bridge;
pub mod connection;
pub mod direct;
pub mod error;
pub mod handshake;
pub mod listener;

#[cfg(test)]
mod testing;

pub use bridge::codec::ErrorEncoding;
pub use bridge::protocol::{ConnectionHandle, CorrelationId, HostMessage, ListenerHandle};
pub use bridge::router::{Respond, ResponseRouter};
pub use bridge::transport::{
    CallbackBridge, ClosureBridge, ClosureHost, MessageBridge, MessageSink, ProxyBridge,
    ProxyHost,
};
pub use bridge::{Bridge, Operation, Pending, ReadResponse, WriteResponse};
pub use connection::{Connection, IpcAddr};
pub use direct::{DirectListener, DirectStream};
pub use error::{BridgeError, HandshakeError, ProtocolViolation, TransferError};
pub use handshake::{Control, HostInit, Ipc, handshake};
pub use listener::Listener;
