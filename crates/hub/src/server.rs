use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::handshake;
use crate::protocol::FrameFormat;
use crate::registry::Registry;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after the `failures`-th consecutive accept error. Errors such as
/// EMFILE repeat immediately, so each one doubles the wait up to a cap.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Accepts agents, gates them through the handshake and registers them.
pub struct Acceptor {
    listener: TcpListener,
    registry: Arc<Registry>,
    format: FrameFormat,
    handshake_timeout: Duration,
}

impl Acceptor {
    /// Bind the configured address with the configured backlog.
    pub async fn bind(config: &Config, registry: Arc<Registry>) -> io::Result<Self> {
        let addr = lookup_host(config.bind_addr())
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} did not resolve", config.bind_addr()),
                )
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        info!(addr = %listener.local_addr()?, backlog = config.backlog, "listening for agents");

        Ok(Self::from_listener(
            listener,
            registry,
            config.format,
            config.handshake_timeout,
        ))
    }

    pub fn from_listener(
        listener: TcpListener,
        registry: Arc<Registry>,
        format: FrameFormat,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            registry,
            format,
            handshake_timeout,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Admit the next agent that completes its handshake.
    ///
    /// `timeout` bounds the wait for incoming connections only; a handshake
    /// already in progress runs to its own deadline. Returns `None` once the
    /// deadline passes with nobody admitted.
    pub async fn accept(&self, timeout: Option<Duration>) -> Option<Arc<Connection>> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut failures = 0;

        loop {
            let accepted = match deadline {
                Some(deadline) => match time::timeout_at(deadline, self.listener.accept()).await {
                    Ok(result) => result,
                    Err(_) => return None,
                },
                None => self.listener.accept().await,
            };

            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    failures += 1;
                    let pause = accept_backoff(failures);
                    warn!(error = %err, ?pause, "accept failed");
                    match deadline {
                        Some(deadline) => {
                            time::sleep_until(deadline.min(Instant::now() + pause)).await
                        }
                        None => time::sleep(pause).await,
                    }
                    continue;
                }
            };
            failures = 0;
            debug!(addr = %addr, "incoming connection");

            let conn = match handshake::admit(stream, addr, self.format, self.handshake_timeout)
                .await
            {
                Ok(conn) => Arc::new(conn),
                Err(_) => continue,
            };

            let label = self.registry.insert(Arc::clone(&conn)).await;
            info!(label = %label, addr = %addr, "agent connected");
            return Some(conn);
        }
    }

    /// Admit agents until the task is aborted.
    pub async fn run(self) {
        loop {
            self.accept(None).await;
        }
    }
}
