//! Listening endpoint emulated on top of a [`Bridge`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::bridge::Bridge;
use crate::bridge::protocol::{CLOSED_HANDLE, ListenerHandle};
use crate::connection::{Connection, IpcAddr};
use crate::error::BridgeError;

pub struct Listener {
    bridge: Arc<dyn Bridge>,
    handle: AtomicI32,
    addr: IpcAddr,
    closing: tokio::sync::Mutex<()>,
}

impl Listener {
    /// Ask the host to listen on `endpoint`.
    pub async fn bind(bridge: Arc<dyn Bridge>, endpoint: &str) -> Result<Self, BridgeError> {
        let handle = bridge.listen(endpoint).await?;
        tracing::debug!(listener = %handle, endpoint, "Listening");
        Ok(Self {
            bridge,
            handle: AtomicI32::new(handle.as_i32()),
            addr: IpcAddr::new(endpoint),
            closing: tokio::sync::Mutex::new(()),
        })
    }

    /// The live handle, or `None` once closed.
    pub fn handle(&self) -> Option<ListenerHandle> {
        let raw = self.handle.load(Ordering::Acquire);
        if raw == CLOSED_HANDLE {
            return None;
        }
        ListenerHandle::from_wire(i64::from(raw)).ok()
    }

    pub fn is_closed(&self) -> bool {
        self.handle().is_none()
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> Result<Connection, BridgeError> {
        let listener = self.handle().ok_or(BridgeError::Closed)?;
        let connection = self.bridge.listener_accept(listener).await?;
        tracing::debug!(%listener, %connection, "Accepted connection");
        Ok(Connection::new(
            Arc::clone(&self.bridge),
            connection,
            self.addr.clone(),
        ))
    }

    /// Close the listener. Idempotent, and overlapping closes reach the host once; a
    /// failed close leaves it live.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let _closing = self.closing.lock().await;
        let Some(listener) = self.handle() else {
            return Ok(());
        };
        self.bridge.listener_close(listener).await?;
        self.handle.store(CLOSED_HANDLE, Ordering::Release);
        tracing::debug!(%listener, "Listener closed");
        Ok(())
    }

    pub fn addr(&self) -> &IpcAddr {
        &self.addr
    }

    /// Blocking [`accept`](Self::accept) for plain threads.
    pub fn accept_blocking(&self) -> Result<Connection, BridgeError> {
        futures::executor::block_on(self.accept())
    }

    pub fn close_blocking(&self) -> Result<(), BridgeError> {
        futures::executor::block_on(self.close())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("handle", &self.handle())
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(listener) = self.handle() {
            tracing::debug!(%listener, "Dropping live listener, closing on host");
            drop(self.bridge.listener_close(listener));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::bridge::Operation;
    use crate::bridge::codec::ErrorEncoding;
    use crate::bridge::protocol::CorrelationId;
    use crate::bridge::router::Respond;
    use crate::bridge::transport::CallbackBridge;
    use crate::testing::ScriptedBridge;

    async fn bind(bridge: &Arc<ScriptedBridge>) -> Listener {
        Listener::bind(Arc::clone(bridge) as Arc<dyn Bridge>, "/tmp/s.sock")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn accept_wraps_host_connection() {
        let bridge = Arc::new(ScriptedBridge::default());
        bridge.script_handle(Ok(7));
        bridge.script_handle(Ok(42));
        let listener = bind(&bridge).await;
        assert_eq!(listener.handle().map(ListenerHandle::as_i32), Some(7));

        let connection = listener.accept().await.unwrap();
        assert_eq!(connection.handle().map(|h| h.as_i32()), Some(42));
        assert_eq!(connection.local_addr(), listener.addr());
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn accept_error_is_returned() {
        let bridge = Arc::new(ScriptedBridge::default());
        let listener = bind(&bridge).await;
        bridge.script_handle(Err(BridgeError::host("accept failed")));
        assert_eq!(
            listener.accept().await.unwrap_err(),
            BridgeError::host("accept failed")
        );
    }

    #[tokio::test]
    async fn bind_error_is_returned() {
        let bridge = Arc::new(ScriptedBridge::default());
        bridge.script_handle(Err(BridgeError::host("address already in use")));
        let result = Listener::bind(bridge as Arc<dyn Bridge>, "/tmp/s.sock").await;
        assert_eq!(result.unwrap_err(), BridgeError::host("address already in use"));
    }

    #[tokio::test]
    async fn double_close_dispatches_once() {
        let bridge = Arc::new(ScriptedBridge::default());
        let listener = bind(&bridge).await;

        assert_eq!(listener.close().await, Ok(()));
        assert_eq!(listener.close().await, Ok(()));
        assert_eq!(bridge.count(Operation::ListenerClose), 1);

        assert_eq!(listener.accept().await.unwrap_err(), BridgeError::Closed);
        assert_eq!(bridge.count(Operation::ListenerAccept), 0);
    }

    #[tokio::test]
    async fn overlapping_closes_dispatch_once() {
        let bridge = Arc::new(CallbackBridge::new(ErrorEncoding::Plain));
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);
        bridge.register_listener_close(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let listener = Listener {
            bridge: Arc::clone(&bridge) as Arc<dyn Bridge>,
            handle: AtomicI32::new(4),
            addr: IpcAddr::new("/tmp/s.sock"),
            closing: tokio::sync::Mutex::new(()),
        };

        let responder = bridge.responder();
        let answer = async {
            while responder.sequencer().outstanding() == 0 {
                tokio::task::yield_now().await;
            }
            responder.respond_listener_close(CorrelationId::new(0), "");
        };
        let (first, second, ()) = tokio::join!(listener.close(), listener.close(), answer);

        assert_eq!((first, second), (Ok(()), Ok(())));
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
        assert!(listener.is_closed());
        assert_eq!(responder.sequencer().outstanding(), 0);
    }

    #[test]
    fn blocking_accept_and_close() {
        let bridge = Arc::new(ScriptedBridge::default());
        let bind = Listener::bind(Arc::clone(&bridge) as Arc<dyn Bridge>, "/tmp/b.sock");
        let listener = futures::executor::block_on(bind).unwrap();
        let connection = listener.accept_blocking().unwrap();
        assert_eq!(connection.remote_addr().endpoint(), "/tmp/b.sock");
        listener.close_blocking().unwrap();
        drop(listener);
        assert_eq!(bridge.count(Operation::ListenerClose), 1);
    }
}
