//! Listening transports and their discovery records
//!
//! A transport is "a listening endpoint that yields client connections"
//! plus a filesystem discovery artifact: the socket path itself for the
//! Unix transport, a pid- and port-tagged marker file for TCP. Discovery
//! names always embed the owning process id so a forked worker's server is
//! distinguishable from its parent's, and so nobody mistakes a stale
//! record from a previous process generation for a live endpoint.

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

/// Which transport a server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Unix,
    Tcp,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unix" => Ok(TransportKind::Unix),
            "tcp" => Ok(TransportKind::Tcp),
            _ => anyhow::bail!("invalid transport {}", s),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Unix => "unix",
            TransportKind::Tcp => "tcp",
        })
    }
}

/// It is only safe to serve profiles on loopback.
const TCP_ADDRESS: &str = "127.0.0.1";

/// Where a bound transport can be reached.
#[derive(Debug, Clone)]
pub(crate) enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "AF_UNIX {}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// The discovery record on disk and the process generation that owns it.
#[derive(Debug)]
pub(crate) struct Discovery {
    path: PathBuf,
    owner_pid: u32,
}

impl Discovery {
    /// Remove the record, unless this process merely inherited it across a
    /// fork; then it is abandoned so the parent's live record survives.
    pub fn remove_if_owner(&self) {
        if std::process::id() == self.owner_pid {
            if let Err(err) = fs::remove_file(&self.path) {
                debug!(
                    "could not remove discovery record {}: {}",
                    self.path.display(),
                    err
                );
            }
        } else {
            debug!(
                "abandoning discovery record {} owned by pid {}",
                self.path.display(),
                self.owner_pid
            );
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound, listening transport.
pub(crate) struct Transport {
    listener: Listener,
    endpoint: Endpoint,
    discovery: Discovery,
}

impl Transport {
    /// Bind a listener and create its discovery record. Failures here are
    /// fatal: the server cannot come up without its endpoint.
    pub async fn bind(kind: TransportKind, port: u16, runtime_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(runtime_dir).with_context(|| {
            format!("failed to create runtime directory {}", runtime_dir.display())
        })?;
        let pid = std::process::id();

        match kind {
            TransportKind::Unix => {
                let path = runtime_dir.join(format!("profileserver-{pid}.sock"));
                // A file left at our own path is stale by construction: it
                // names this pid, and this process is not listening on it.
                if path.exists() {
                    fs::remove_file(&path).with_context(|| {
                        format!("failed to remove stale socket {}", path.display())
                    })?;
                }
                let listener = UnixListener::bind(&path)
                    .with_context(|| format!("failed to bind {}", path.display()))?;
                Ok(Self {
                    listener: Listener::Unix(listener),
                    endpoint: Endpoint::Unix(path.clone()),
                    discovery: Discovery {
                        path,
                        owner_pid: pid,
                    },
                })
            }
            TransportKind::Tcp => {
                let listener = TcpListener::bind((TCP_ADDRESS, port))
                    .await
                    .with_context(|| format!("failed to bind {TCP_ADDRESS}:{port}"))?;
                let addr = listener
                    .local_addr()
                    .context("failed to read bound address")?;

                remove_stale_port_markers(runtime_dir, pid);
                let marker = runtime_dir.join(format!("profileserver-{pid}-port-{}", addr.port()));
                fs::write(&marker, b"").with_context(|| {
                    format!("failed to create port marker {}", marker.display())
                })?;

                Ok(Self {
                    listener: Listener::Tcp(listener),
                    endpoint: Endpoint::Tcp(addr),
                    discovery: Discovery {
                        path: marker,
                        owner_pid: pid,
                    },
                })
            }
        }
    }

    pub async fn accept(&self) -> io::Result<Connection> {
        match &self.listener {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::Unix(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::Tcp(stream))
            }
        }
    }

    /// Recreate the listener on the same endpoint after the descriptor was
    /// invalidated underneath the accept loop (e.g. by a fork).
    pub async fn rebind(&mut self) -> anyhow::Result<()> {
        match &self.endpoint {
            Endpoint::Unix(path) => {
                if path.exists() {
                    fs::remove_file(path).with_context(|| {
                        format!("failed to remove stale socket {}", path.display())
                    })?;
                }
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("failed to rebind {}", path.display()))?;
                self.listener = Listener::Unix(listener);
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to rebind {addr}"))?;
                self.listener = Listener::Tcp(listener);
            }
        }
        warn!("listener rebound on {}", self.endpoint);
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn discovery_path(&self) -> &Path {
        self.discovery.path()
    }

    /// Close the listener and retire the discovery record.
    pub fn stop(self) {
        drop(self.listener);
        self.discovery.remove_if_owner();
    }
}

/// Enforce one live record per (transport kind, pid): markers naming this
/// pid are leftovers of an earlier server generation in the same process.
fn remove_stale_port_markers(runtime_dir: &Path, pid: u32) {
    let prefix = format!("profileserver-{pid}-port-");
    let Ok(entries) = fs::read_dir(runtime_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// One accepted server-side connection.
#[derive(Debug)]
pub(crate) enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Client side of one request/response exchange, mainly for tests and
/// local tooling.
#[derive(Debug)]
pub struct ClientConnection {
    stream: Connection,
}

impl ClientConnection {
    pub(crate) async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        let stream = match endpoint {
            Endpoint::Unix(path) => Connection::Unix(UnixStream::connect(path).await?),
            Endpoint::Tcp(addr) => Connection::Tcp(TcpStream::connect(addr).await?),
        };
        Ok(Self { stream })
    }

    pub async fn send(&mut self, raw: &[u8]) -> io::Result<()> {
        self.stream.write_all(raw).await
    }

    /// Read until the server closes the connection.
    pub async fn read_response(&mut self) -> io::Result<String> {
        let mut response = String::new();
        self.stream.read_to_string(&mut response).await?;
        Ok(response)
    }

    /// Write one request line (plus the terminating blank line) and read
    /// the full response.
    pub async fn request(&mut self, line: &str) -> io::Result<String> {
        self.send(format!("{line}\r\n\r\n").as_bytes()).await?;
        self.read_response().await
    }
}
