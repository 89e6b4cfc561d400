//! Native dial/listen for code that is not sandboxed.
//!
//! Unix domain sockets on Unix, named pipes on Windows, both on tokio. The privileged
//! host builds on these too.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Connected stream to a local endpoint.
#[derive(Debug)]
pub struct DirectStream {
    inner: imp::Stream,
}

/// Bound local endpoint.
#[derive(Debug)]
pub struct DirectListener {
    inner: imp::Listener,
}

/// Connect to `endpoint` (socket path or pipe name).
pub async fn dial(endpoint: &str) -> io::Result<DirectStream> {
    let inner = imp::dial(endpoint).await?;
    tracing::debug!(endpoint, "Dialed endpoint");
    Ok(DirectStream { inner })
}

/// Bind `endpoint`. Must be called from within a tokio runtime.
pub fn listen(endpoint: &str) -> io::Result<DirectListener> {
    let inner = imp::Listener::bind(endpoint)?;
    tracing::debug!(endpoint, "Listening on endpoint");
    Ok(DirectListener { inner })
}

impl DirectListener {
    pub async fn accept(&self) -> io::Result<DirectStream> {
        let inner = self.inner.accept().await?;
        Ok(DirectStream { inner })
    }

    pub fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }
}

impl AsyncRead for DirectStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DirectStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(unix)]
mod imp {
    use std::io;
    use std::path::PathBuf;

    use tokio::net::{UnixListener, UnixStream};

    pub(super) type Stream = UnixStream;

    pub(super) async fn dial(endpoint: &str) -> io::Result<Stream> {
        UnixStream::connect(endpoint).await
    }

    #[derive(Debug)]
    pub(super) struct Listener {
        inner: UnixListener,
        endpoint: String,
    }

    impl Listener {
        pub(super) fn bind(endpoint: &str) -> io::Result<Self> {
            Ok(Self {
                inner: UnixListener::bind(endpoint)?,
                endpoint: endpoint.to_string(),
            })
        }

        pub(super) async fn accept(&self) -> io::Result<Stream> {
            let (stream, _) = self.inner.accept().await?;
            Ok(stream)
        }

        pub(super) fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            // The socket file outlives the listener unless removed.
            let path = PathBuf::from(&self.endpoint);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to remove socket file"
                    );
                }
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };
    use tokio::sync::Mutex;

    const ERROR_PIPE_BUSY: i32 = 231;
    const BUSY_RETRY: Duration = Duration::from_millis(50);

    #[derive(Debug)]
    pub(super) enum Stream {
        Client(NamedPipeClient),
        Server(NamedPipeServer),
    }

    pub(super) async fn dial(endpoint: &str) -> io::Result<Stream> {
        loop {
            match ClientOptions::new().open(endpoint) {
                Ok(client) => return Ok(Stream::Client(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(BUSY_RETRY).await;
        }
    }

    /// Keeps one unconnected server instance so clients can always find the pipe.
    #[derive(Debug)]
    pub(super) struct Listener {
        pending: Mutex<NamedPipeServer>,
        endpoint: String,
    }

    impl Listener {
        pub(super) fn bind(endpoint: &str) -> io::Result<Self> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(endpoint)?;
            Ok(Self {
                pending: Mutex::new(first),
                endpoint: endpoint.to_string(),
            })
        }

        pub(super) async fn accept(&self) -> io::Result<Stream> {
            let mut pending = self.pending.lock().await;
            pending.connect().await?;
            let next = ServerOptions::new().create(&self.endpoint)?;
            Ok(Stream::Server(std::mem::replace(&mut *pending, next)))
        }

        pub(super) fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    impl AsyncRead for Stream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Self::Client(c) => Pin::new(c).poll_read(cx, buf),
                Self::Server(s) => Pin::new(s).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for Stream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut() {
                Self::Client(c) => Pin::new(c).poll_write(cx, buf),
                Self::Server(s) => Pin::new(s).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Self::Client(c) => Pin::new(c).poll_flush(cx),
                Self::Server(s) => Pin::new(s).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Self::Client(c) => Pin::new(c).poll_shutdown(cx),
                Self::Server(s) => Pin::new(s).poll_shutdown(cx),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn dial_and_accept_exchange_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direct.sock");
        let endpoint = path.to_str().unwrap();

        let listener = listen(endpoint).unwrap();
        assert_eq!(listener.endpoint(), endpoint);

        let (accepted, dialed) = tokio::join!(listener.accept(), dial(endpoint));
        let (mut server, mut client) = (accepted.unwrap(), dialed.unwrap());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dropping_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sock");

        let listener = listen(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dial_missing_endpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let err = dial(path.to_str().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
