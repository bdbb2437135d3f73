// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TCP accept loop for log producers.
//!
//! Every read is charged against a process-wide byte budget and every decoded
//! frame against a per-connection line budget. Both limiters block instead of
//! dropping, so a fast producer is slowed down by TCP back-pressure. A bad
//! frame is logged and skipped; only EOF, an I/O error or the idle timeout
//! closes a connection.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use super::codec::NullFrameCodec;
use super::handler::LogHandler;
use super::ratelimit::RateLimiter;
use super::IngestError;
use crate::config::TcpConfig;
use crate::metrics;

const READ_CHUNK: usize = 1024;

pub struct LogServer {
    config: TcpConfig,
    handler: Arc<LogHandler>,
    global: RateLimiter,
    line_rate: u64,
    connections: AtomicUsize,
}

impl LogServer {
    #[must_use]
    pub fn new(config: TcpConfig, line_rate: u64, handler: Arc<LogHandler>) -> Self {
        let global = RateLimiter::new(config.global_rate_bytes, 0);
        Self { config, handler, global, line_rate, connections: AtomicUsize::new(0) }
    }

    /// Bind the configured address. Failure here is fatal for the process.
    pub async fn bind(&self) -> Result<TcpListener, IngestError> {
        let addr = format!("{}:{}", self.config.addr, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Log server listening");
        Ok(listener)
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Accept until shutdown, then give open connections `drain_timeout` to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let this = Arc::clone(&self);
                        tasks.spawn(async move { this.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        drop(listener);

        let drain = Duration::from_secs(self.config.drain_timeout_secs);
        info!(open = tasks.len(), drain_secs = drain.as_secs(), "Log server stopping");
        let drained = tokio::time::timeout(drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(open = tasks.len(), "Drain timeout reached, closing remaining connections");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("Log server stopped");
    }

    /// Read frames from one producer until EOF, error or idle timeout.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + Unpin + Send,
    {
        let open = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_tcp_connections(open);
        debug!(peer = %peer, "Producer connected");

        let lines = RateLimiter::new(self.line_rate, 0);
        let idle = Duration::from_secs(self.config.idle_timeout_secs.max(1));
        let mut codec = NullFrameCodec::new(self.config.max_frame_bytes);
        let mut buf = BytesMut::with_capacity(READ_CHUNK * 4);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            self.global.acquire(READ_CHUNK as u64).await;
            let n = match tokio::time::timeout(idle, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "Producer read failed");
                    break;
                }
                Err(_) => {
                    debug!(peer = %peer, "Producer idle, closing");
                    break;
                }
            };
            metrics::record_ingest_bytes(n);
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        lines.acquire(1).await;
                        self.process_frame(&frame, peer).await;
                    }
                    Ok(None) => break,
                    Err(e) => warn!(peer = %peer, error = %e, "Frame discarded"),
                }
            }
        }

        if let Ok(Some(frame)) = codec.decode_eof(&mut buf) {
            self.process_frame(&frame, peer).await;
        }
        let open = self.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_tcp_connections(open);
        debug!(peer = %peer, "Producer disconnected");
    }

    async fn process_frame(&self, frame: &[u8], peer: SocketAddr) {
        match self.handler.handle_frame(frame).await {
            Ok(outcome) => debug!(peer = %peer, ?outcome, "Frame handled"),
            Err(e) if e.is_auth() => warn!(peer = %peer, error = %e, "Unauthenticated frame rejected"),
            Err(e) => debug!(peer = %peer, error = %e, "Frame rejected"),
        }
    }
}
