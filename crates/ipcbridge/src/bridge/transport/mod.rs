//! One [`Bridge`](super::Bridge) implementation per host-embedding mechanism.
//!
//! | Variant | Request path | Response path |
//! |---|---|---|
//! | [`CallbackBridge`] | host-registered function per operation | `Respond*` by sequence |
//! | [`ClosureBridge`] | host object method + reply closure | the closure itself |
//! | [`MessageBridge`] | one `HostMessage` to a single handler | `Respond*` by sequence |
//! | [`ProxyBridge`] | named method on a host proxy, with sequence | `Respond*` by sequence |
//!
//! The sequenced variants share a [`ResponseRouter`](super::router::ResponseRouter);
//! [`responder`](CallbackBridge::responder) hands the host a reference it can call from
//! any thread without keeping the bridge itself alive.

mod callback;
mod closure;
mod message;
mod proxy;

pub use callback::{
    CallbackBridge, ConnectionCloseHandler, ConnectionReadHandler, ConnectionWriteHandler,
    EndpointHandler, ListenerHandler,
};
pub use closure::{
    CloseCallback, ClosureBridge, ClosureHost, HandleCallback, ReadCallback, WriteCallback,
};
pub use message::{MessageBridge, MessageSink};
pub use proxy::{ProxyBridge, ProxyHost};
