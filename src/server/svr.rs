use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::protocol::{FileDescriptor, Request, encode_catalog};
use crate::server::fs::LocalCatalog;

/// State shared by every connection handler of one node.
pub struct AppState {
    catalog: LocalCatalog,
    downloads: Arc<ProgressTracker>,
}

impl AppState {
    pub fn new(catalog: LocalCatalog, downloads: Arc<ProgressTracker>) -> Self {
        Self { catalog, downloads }
    }

    /// The local catalog minus files this node is still downloading.
    pub fn advertised(&self) -> io::Result<Vec<FileDescriptor>> {
        Ok(self
            .catalog
            .list_local()?
            .into_iter()
            .filter(|file| !self.downloads.is_unfinished(file.id))
            .collect())
    }
}

/// Longest request line accepted, newline included.
pub const MAX_REQUEST_LINE: u64 = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Responses written at once. Connections waiting for their next request
    /// hold no slot, so idle peers never lock others out.
    pub max_transfers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { max_transfers: 64 }
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<AppState>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(addr: &str, state: Arc<AppState>, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state,
            config,
        })
    }

    /// Binds the first port of `ports` that is free on `host`.
    pub async fn bind_first_available(
        host: &str,
        ports: &[u16],
        state: Arc<AppState>,
        config: ServerConfig,
    ) -> io::Result<Self> {
        for port in ports {
            match TcpListener::bind((host, *port)).await {
                Ok(listener) => {
                    return Ok(Self {
                        listener,
                        state,
                        config,
                    });
                }
                Err(err) => tracing::debug!(port, %err, "candidate port unavailable"),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("no available port among {:?}", ports),
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires, then waits for the
    /// in-flight handlers, which stop at their next request boundary.
    pub async fn serve(self, shutdown: CancellationToken) -> io::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "serving peers");

        let transfers = Arc::new(Semaphore::new(self.config.max_transfers));
        let mut connections = JoinSet::new();
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept a connection");
                        continue;
                    }
                },
            };

            while let Some(result) = connections.try_join_next() {
                log_handler_exit(result);
            }

            let state = Arc::clone(&self.state);
            let transfers = Arc::clone(&transfers);
            let shutdown = shutdown.clone();
            connections.spawn(async move {
                if let Err(err) = handle_connection(stream, &state, &transfers, shutdown).await {
                    tracing::warn!(%peer, %err, "connection failed");
                }
            });
        }

        while let Some(result) = connections.join_next().await {
            log_handler_exit(result);
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

fn log_handler_exit(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        tracing::error!(%err, "connection handler panicked");
    }
}

/// Serves requests on one connection until the peer closes it, a request is
/// not recognized, or a `FETCH` cannot be answered in full.
#[tracing::instrument(level = "debug", skip_all, fields(peer = ?stream.peer_addr().ok()))]
async fn handle_connection(
    stream: TcpStream,
    state: &AppState,
    transfers: &Semaphore,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_REQUEST_LINE);
        let n = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = limited.read_line(&mut line) => read?,
        };
        if n == 0 {
            break;
        }
        if n as u64 == MAX_REQUEST_LINE && !line.ends_with('\n') {
            tracing::warn!(limit = MAX_REQUEST_LINE, "request line too long, closing");
            break;
        }

        let request = Request::parse(line.trim_end());
        let _permit = transfers.acquire().await.map_err(io::Error::other)?;
        match request {
            Some(Request::List) => {
                let files = state.advertised()?;
                writer.write_all(encode_catalog(&files).as_bytes()).await?;
                tracing::debug!(entries = files.len(), "sent catalog");
            }
            Some(Request::Fetch {
                file_id,
                start_offset,
                length,
            }) => match serve_range(state, &mut writer, file_id, start_offset, length).await {
                Ok(()) => {}
                Err(Error::NotFound(file_id)) => {
                    tracing::info!(file_id, "requested file not found, closing");
                    break;
                }
                Err(err) => return Err(err),
            },
            None => {
                tracing::warn!(request = line.trim_end(), "unrecognized request, closing");
                break;
            }
        }
    }
    Ok(())
}

async fn serve_range<W: AsyncWrite + Unpin>(
    state: &AppState,
    writer: &mut W,
    file_id: u64,
    start_offset: u64,
    length: u64,
) -> Result<()> {
    if state.downloads.is_unfinished(file_id) {
        return Err(Error::NotFound(file_id));
    }
    let path = state
        .catalog
        .file_path(file_id)?
        .ok_or(Error::NotFound(file_id))?;

    let mut file = tokio::fs::File::open(&path).await?;
    file.seek(SeekFrom::Start(start_offset)).await?;
    let sent = tokio::io::copy(&mut file.take(length), writer).await?;
    if sent < length {
        // The caller sees the close as a short read
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{:?} holds only {} of {} requested bytes", path, sent, length),
        )
        .into());
    }

    tracing::debug!(file_id, start_offset, length, "sent range");
    Ok(())
}
