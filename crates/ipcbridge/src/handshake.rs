//! One-time initialization handshake between the sandbox and its host.
//!
//! The sandbox creates the pair with [`handshake`] before any I/O and keeps the
//! [`Control`] end; the [`HostInit`] end goes to whatever code the host calls once its
//! handlers are registered. [`HostInit::initialize`] installs the bridge and delivers a
//! single configuration message (e.g. the endpoint to dial). It never blocks: the
//! channel buffers exactly that one message.
//!
//! Dropping or [`shutting down`](HostInit::shutdown) the host end closes the channel,
//! which the sandbox observes through [`Control::wait_shutdown`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::bridge::Bridge;
use crate::bridge::codec;
use crate::connection::Connection;
use crate::error::{BridgeError, HandshakeError, fatal};
use crate::listener::Listener;

type Installed = Arc<OnceLock<Arc<dyn Bridge>>>;

/// Create a fresh control channel.
pub fn handshake() -> (HostInit, Control) {
    let (tx, rx) = mpsc::channel(1);
    let installed = Installed::default();
    (
        HostInit {
            tx,
            installed: Arc::clone(&installed),
        },
        Control { rx, installed },
    )
}

/// Host-held end of the handshake.
pub struct HostInit {
    tx: mpsc::Sender<String>,
    installed: Installed,
}

impl HostInit {
    /// Install `bridge` and hand `message` to the sandbox.
    ///
    /// Succeeds at most once; later attempts report
    /// [`HandshakeError::AlreadyInitialized`] and leave the first bridge in place.
    pub fn initialize(
        &self,
        bridge: Arc<dyn Bridge>,
        message: impl Into<String>,
    ) -> Result<(), HandshakeError> {
        if self.installed.set(bridge).is_err() {
            tracing::warn!("Rejected second bridge initialization");
            return Err(HandshakeError::AlreadyInitialized);
        }
        match self.tx.try_send(message.into()) {
            Ok(()) => {
                tracing::debug!("Bridge initialized");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(HandshakeError::AlreadyInitialized),
            Err(TrySendError::Closed(_)) => Err(HandshakeError::ShutDown),
        }
    }

    /// [`initialize`](Self::initialize) with a base64-encoded message, for hosts that
    /// can only pass escaped text into the sandbox. An undecodable message is fatal.
    pub fn initialize_encoded(
        &self,
        bridge: Arc<dyn Bridge>,
        message64: &str,
    ) -> Result<(), HandshakeError> {
        let message = codec::decode_str(message64).unwrap_or_else(|v| fatal(v));
        self.initialize(bridge, message)
    }

    pub fn is_initialized(&self) -> bool {
        self.installed.get().is_some()
    }

    /// Begin shutdown: the sandbox's control channel closes.
    pub fn shutdown(self) {
        tracing::debug!("Bridge shutting down");
    }
}

impl fmt::Debug for HostInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInit")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Sandbox-held end of the handshake.
pub struct Control {
    rx: mpsc::Receiver<String>,
    installed: Installed,
}

impl Control {
    /// Wait for the host's initialization message.
    pub async fn ready(&mut self) -> Result<(Ipc, String), HandshakeError> {
        let message = self.rx.recv().await.ok_or(HandshakeError::ShutDown)?;
        let bridge = self
            .installed
            .get()
            .cloned()
            .ok_or(HandshakeError::ShutDown)?;
        Ok((Ipc::new(bridge), message))
    }

    /// Blocking [`ready`](Self::ready) for plain threads.
    pub fn ready_blocking(&mut self) -> Result<(Ipc, String), HandshakeError> {
        futures::executor::block_on(self.ready())
    }

    /// Resolve once the host has shut the channel down.
    pub async fn wait_shutdown(&mut self) {
        while self.rx.recv().await.is_some() {}
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("initialized", &self.installed.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Entry point for emulated IPC over an installed bridge.
#[derive(Clone)]
pub struct Ipc {
    bridge: Arc<dyn Bridge>,
}

impl Ipc {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    pub async fn dial(&self, endpoint: &str) -> Result<Connection, BridgeError> {
        Connection::connect(Arc::clone(&self.bridge), endpoint).await
    }

    pub async fn listen(&self, endpoint: &str) -> Result<Listener, BridgeError> {
        Listener::bind(Arc::clone(&self.bridge), endpoint).await
    }

    pub fn dial_blocking(&self, endpoint: &str) -> Result<Connection, BridgeError> {
        futures::executor::block_on(self.dial(endpoint))
    }

    pub fn listen_blocking(&self, endpoint: &str) -> Result<Listener, BridgeError> {
        futures::executor::block_on(self.listen(endpoint))
    }
}

impl fmt::Debug for Ipc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ipc").finish_non_exhaustive()
    }
}
