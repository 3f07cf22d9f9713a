//! Remote control server: accept loop and lifecycle
//!
//! One task accepts connections for the server's lifetime; each accepted
//! connection is handled on its own one-shot task (profiling requests are
//! rare and short, so there is no pool). A failing accept, typically a
//! descriptor invalidated by a fork, re-binds the listener transparently
//! instead of terminating the loop.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use periscope::Profiler;

use crate::application::ProfileApplication;
use crate::config::ServerConfig;
use crate::request::Request;
use crate::transport::{ClientConnection, Connection, Endpoint, Transport, TransportKind};

const REBIND_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProfileServer {
    kind: TransportKind,
    endpoint: Endpoint,
    discovery_path: PathBuf,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl ProfileServer {
    /// Bind the configured transport and start serving. Bind failures are
    /// fatal: without its endpoint the server cannot come up.
    pub async fn start(config: &ServerConfig, profiler: Arc<Profiler>) -> anyhow::Result<Self> {
        let transport =
            Transport::bind(config.transport, config.port, &config.runtime_dir).await?;
        info!("profile server listening on addr={}", transport.endpoint());

        let endpoint = transport.endpoint().clone();
        let discovery_path = transport.discovery_path().to_path_buf();
        let app = Arc::new(ProfileApplication::new(profiler, config));
        let cancel = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(transport, app, cancel.clone()));

        Ok(Self {
            kind: config.transport,
            endpoint,
            discovery_path,
            cancel,
            accept_task: Some(accept_task),
        })
    }

    /// Stop accepting, close the listener, and retire the discovery record
    /// (unless a forked child merely inherited it). Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await {
                error!("accept loop ended abnormally: {}", err);
            }
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.kind
    }

    /// Bound TCP port, when serving over TCP.
    pub fn port(&self) -> Option<u16> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => Some(addr.port()),
            Endpoint::Unix(_) => None,
        }
    }

    /// The discovery record on disk (the socket path itself for Unix, the
    /// pid+port marker for TCP).
    pub fn discovery_path(&self) -> &std::path::Path {
        &self.discovery_path
    }

    /// Open a client connection to the live endpoint. Mainly for tests.
    pub async fn client(&self) -> io::Result<ClientConnection> {
        ClientConnection::connect(&self.endpoint).await
    }
}

impl Drop for ProfileServer {
    fn drop(&mut self) {
        // Backstop for callers that never reached `stop`; the accept task
        // owns the transport and retires it on cancellation.
        self.cancel.cancel();
    }
}

async fn accept_loop(
    mut transport: Transport,
    app: Arc<ProfileApplication>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = transport.accept() => accepted,
        };

        match accepted {
            Ok(connection) => {
                let app = Arc::clone(&app);
                tokio::spawn(handle_connection(connection, app));
            }
            Err(err) => {
                warn!("accept failed: {}; rebinding listener", err);
                if let Err(err) = transport.rebind().await {
                    warn!("rebind failed: {:#}", err);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(REBIND_BACKOFF) => {}
                    }
                }
            }
        }
    }
    transport.stop();
}

/// Read one request line, dispatch, write the response, close. The
/// connection is closed on every path out of here, write failures
/// included.
async fn handle_connection(connection: Connection, app: Arc<ProfileApplication>) {
    let mut reader = BufReader::new(connection);

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => return,
        Ok(_) => {}
        Err(err) => {
            debug!("failed to read request line: {}", err);
            return;
        }
    }

    let request_line = line.trim_end();
    let Some(request) = Request::parse(request_line) else {
        debug!("unparseable request line {:?}", request_line);
        return;
    };

    let response = app.handle(&request).await;
    let bytes = response.into_bytes(&request.http_version);

    let mut connection = reader.into_inner();
    if let Err(err) = connection.write_all(&bytes).await {
        error!(
            "exception responding to request {:?}: {}",
            request_line, err
        );
    }
    let _ = connection.shutdown().await;
}
