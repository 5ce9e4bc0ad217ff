//! Composition root.
//!
//! [`TarpitServer::bind`] does everything that can fail at startup (host key,
//! listener, credential store) before any connection is accepted.
//! [`TarpitServer::run`] then accepts until the shutdown token fires, and
//! returns once the drain loop has written and flushed what was captured.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::Disconnect;
use russh::server;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::capture::CredentialBuffer;
use crate::config::{ConfigError, TarpitConfig};
use crate::drain::DrainLoop;
use crate::gate::ConnectionGate;
use crate::session::{ConnectionObserver, TarpitSession};
use crate::sink::{CsvSink, SinkError};
use crate::ssh::{HostKeyError, KeySource, TarpitHandler, disconnect_packet, russh_config};

/// Pause after a failed accept so a persistent error (fd exhaustion) does
/// not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long a refused peer may take to hang up after our disconnect.
const REFUSE_LINGER: Duration = Duration::from_secs(5);

/// Fatal startup errors.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to open credential store: {0}")]
    Store(#[from] SinkError),
}

pub struct TarpitServer {
    listener: TcpListener,
    russh_config: Arc<server::Config>,
    banner: Arc<str>,
    gate: ConnectionGate,
    buffer: CredentialBuffer,
    sink: CsvSink,
    stall_delay: Duration,
}

impl TarpitServer {
    pub async fn bind(config: &TarpitConfig, keys: KeySource) -> Result<Self, StartupError> {
        let host_key = keys.load()?;
        let addr = config.socket_addr()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })?;

        let (sink, _existed) = CsvSink::open(&config.output_path, config.flush_buffer_size)?;

        let buffer = match config.drain_threshold {
            Some(threshold) => CredentialBuffer::with_threshold(threshold),
            None => CredentialBuffer::new(),
        };

        Ok(Self {
            listener,
            russh_config: Arc::new(russh_config(config, host_key, TarpitSession::METHODS)),
            banner: Arc::from(config.server_id.as_str()),
            gate: ConnectionGate::new(config.max_active_connections),
            buffer,
            sink,
            stall_delay: config.stall_delay(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn gate(&self) -> ConnectionGate {
        self.gate.clone()
    }

    pub fn buffer(&self) -> CredentialBuffer {
        self.buffer.clone()
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Stalled sessions still in flight are abandoned. Anything they already
    /// captured is drained and flushed before this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            listener,
            russh_config,
            banner,
            gate,
            buffer,
            sink,
            stall_delay,
        } = self;

        tracing::info!("Writing credentials to {}", sink.path().display());
        let drain = DrainLoop::new(buffer.clone(), sink).spawn(shutdown.clone());

        match listener.local_addr() {
            Ok(addr) => tracing::info!("Running loop on {}", addr),
            Err(_) => tracing::info!("Running loop"),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session =
                            TarpitSession::new(peer, gate.clone(), buffer.clone(), stall_delay);
                        tokio::spawn(serve_connection(
                            russh_config.clone(),
                            banner.clone(),
                            stream,
                            session,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!("Shutting down, {} connections abandoned", gate.active());
        if let Err(e) = drain.await {
            tracing::error!("CSV writer task failed: {}", e);
        }
    }
}

/// Drive one connection to completion.
///
/// A connection the gate turns away never reaches russh: it is refused
/// before key exchange, so no handler exists that could capture or stall.
async fn serve_connection(
    config: Arc<server::Config>,
    banner: Arc<str>,
    stream: TcpStream,
    mut session: TarpitSession,
) {
    let peer = session.remote_ip().to_string();
    if !session.connection_made() {
        if let Err(e) = refuse(stream, &banner).await {
            tracing::debug!("refusing {} failed: {}", peer, e);
        }
        return;
    }

    let handler = TarpitHandler::new(session);
    let running = match server::run_stream(config, stream, handler).await {
        Ok(running) => running,
        Err(e) => {
            tracing::debug!("connection setup with {} failed: {:?}", peer, e);
            return;
        }
    };

    match running.await {
        Ok(()) => tracing::debug!("connection with {} closed", peer),
        Err(e) => tracing::debug!("connection with {} closed with error: {:?}", peer, e),
    }
}

/// Send our identification line followed by a clear-text
/// TOO_MANY_CONNECTIONS disconnect with an empty description, then close.
///
/// The peer's own identification and KEXINIT are read and discarded until it
/// hangs up (or [`REFUSE_LINGER`] passes), so closing never races unread
/// input into a reset that would hide the disconnect from the client.
async fn refuse<S>(mut stream: S, banner: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(banner.len() + 32);
    out.extend_from_slice(banner.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&disconnect_packet(Disconnect::TooManyConnections, ""));

    stream.write_all(&out).await?;
    stream.shutdown().await?;

    let mut discard = [0u8; 1024];
    let drained = tokio::time::timeout(REFUSE_LINGER, async {
        while stream.read(&mut discard).await? > 0 {}
        Ok::<_, io::Error>(())
    })
    .await;
    drained.unwrap_or(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refusal_sends_banner_then_disconnect() {
        let (server_end, mut client_end) = tokio::io::duplex(4096);
        let refusing = tokio::spawn(refuse(server_end, "SSH-2.0-Test"));

        client_end.write_all(b"SSH-2.0-Client\r\n").await.unwrap();
        let mut received = Vec::new();
        client_end.read_to_end(&mut received).await.unwrap();
        drop(client_end);
        refusing.await.unwrap().unwrap();

        let (banner, packet) = received.split_at(b"SSH-2.0-Test\r\n".len());
        assert_eq!(banner, b"SSH-2.0-Test\r\n");
        assert_eq!(packet, disconnect_packet(Disconnect::TooManyConnections, "").as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn refusal_gives_up_on_a_silent_peer() {
        let (server_end, client_end) = tokio::io::duplex(4096);
        // The client never reads nor closes.
        let result = refuse(server_end, "SSH-2.0-Test").await;
        assert!(result.is_ok());
        drop(client_end);
    }

    #[tokio::test]
    async fn rejected_connection_gets_no_ssh_session() {
        let gate = ConnectionGate::new(0);
        let buffer = CredentialBuffer::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"SSH-2.0-Client\r\n").await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let session = TarpitSession::new(peer, gate.clone(), buffer.clone(), Duration::from_secs(10));
        let key = crate::ssh::KeySource::Ephemeral.load().unwrap();
        let config = Arc::new(russh_config(
            &TarpitConfig::default(),
            key,
            TarpitSession::METHODS,
        ));
        serve_connection(config, Arc::from("SSH-2.0-Test"), stream, session).await;

        let received = client.await.unwrap();
        assert!(received.starts_with(b"SSH-2.0-Test\r\n"));
        assert!(received.ends_with(&disconnect_packet(Disconnect::TooManyConnections, "")));
        assert_eq!(gate.active(), 0);
        assert!(buffer.is_empty());
    }
}
