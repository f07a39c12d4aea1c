//! Receiving TCP server.
//!
//! Binds the listen address and serves sessions until cancelled. With
//! `reuseport`, `workers` sockets are bound to the same address with
//! SO_REUSEPORT so the kernel load-balances accepts across the accept
//! loops; each accepted connection runs in its own task.

pub mod session;

pub use session::SessionConfig;

use crate::config::{ReceiverConfig, IDLE_TIMEOUT, READ_TIMEOUT};
use crate::error::{Result, TransferError};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Listener {
    config: ReceiverConfig,
    listeners: Vec<TcpListener>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Validate the configuration, create the output directory, and bind.
    /// Bind or directory failures are fatal.
    pub async fn bind(config: ReceiverConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.out_dir).await?;

        let mut addr = SocketAddr::new(config.listen_ip, config.port);
        let sockets = if config.reuseport { config.workers } else { 1 };

        let mut listeners = Vec::with_capacity(sockets);
        let first = bind_socket(addr, config.reuseport)?;
        // Port 0 resolves on the first bind; the rest share the real port.
        addr = first.local_addr()?;
        listeners.push(TcpListener::from_std(first)?);
        for _ in 1..sockets {
            let listener = bind_socket(addr, config.reuseport)?;
            listeners.push(TcpListener::from_std(listener)?);
        }

        info!(
            addr = %addr,
            out_dir = %config.out_dir.display(),
            sockets,
            dest_paths = config.use_dest_paths,
            "listening"
        );

        Ok(Self {
            config,
            listeners,
            local_addr: addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve sessions until cancelled.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let session_config = Arc::new(SessionConfig {
            out_dir: self.config.out_dir.clone(),
            use_dest_paths: self.config.use_dest_paths,
            expect_count_first: self.config.expect_count_first,
            fsync: self.config.fsync,
            read_timeout: READ_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
        });
        let next_session = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::with_capacity(self.listeners.len());
        for (worker_id, listener) in self.listeners.into_iter().enumerate() {
            handles.push(tokio::spawn(accept_loop(
                worker_id,
                listener,
                Arc::clone(&session_config),
                Arc::clone(&next_session),
                cancel.clone(),
            )));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn bind_socket(addr: SocketAddr, reuseport: bool) -> Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let bind = || -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        if reuseport {
            socket.set_reuse_port(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(512)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    };
    bind().map_err(|e| {
        TransferError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to bind {addr}: {e}"),
        ))
    })
}

async fn accept_loop(
    worker_id: usize,
    listener: TcpListener,
    config: Arc<SessionConfig>,
    next_session: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let session_id = next_session.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(worker_id, session_id, %peer, "connection accepted");
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Err(e) = session::run_session(stream, peer, session_id, &config).await {
                        warn!(session_id, %peer, error = format!("{e:#}"), "session failed");
                    }
                });
            }
            Err(e) => {
                warn!(worker_id, error = %e, "accept failed");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
