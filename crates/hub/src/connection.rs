use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::protocol::{Frame, FrameFormat, MessageKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection, stable across relabels.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One live agent connection.
///
/// The label is only rewritten by the registry while it holds its map lock,
/// so a registered connection's label always equals its registry key.
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    label: RwLock<String>,
    channel: Channel,
}

impl Connection {
    /// Wrap a freshly accepted stream. The label starts as the remote port.
    pub fn new(stream: TcpStream, addr: SocketAddr, format: FrameFormat) -> Self {
        Self {
            id: ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            addr,
            label: RwLock::new(addr.port().to_string()),
            channel: Channel::new(stream, format),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn label(&self) -> String {
        self.label
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_label(&self, label: String) {
        *self.label.write().unwrap_or_else(PoisonError::into_inner) = label;
    }

    /// Fallback label used when the requested one is missing or taken.
    pub fn port_label(&self) -> String {
        self.addr.port().to_string()
    }

    pub async fn send(
        &self,
        kind: MessageKind,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        self.channel.send(kind, payload, timeout).await
    }

    /// Send unless a write is already in progress on this connection.
    /// `Ok(false)` means nothing was written.
    pub async fn send_if_idle(
        &self,
        kind: MessageKind,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        self.channel.send_if_idle(kind, payload, timeout).await
    }

    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Frame, ChannelError> {
        self.channel.recv(timeout).await
    }

    pub async fn expect(
        &self,
        kind: MessageKind,
        timeout: Option<Duration>,
        retries: u32,
    ) -> Result<Vec<u8>, ChannelError> {
        self.channel.expect(kind, timeout, retries).await
    }

    pub async fn close(&self) {
        self.channel.shutdown().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("label", &self.label())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn accepted() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, remote) = accepted.unwrap();
        (
            Connection::new(stream, remote, FrameFormat::default()),
            client.unwrap(),
        )
    }

    #[tokio::test]
    async fn default_label_is_remote_port() {
        let (conn, client) = accepted().await;
        let port = client.local_addr().unwrap().port();
        assert_eq!(conn.label(), port.to_string());
        assert_eq!(conn.port_label(), port.to_string());
        assert_eq!(conn.addr().port(), port);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let (a, _ca) = accepted().await;
        let (b, _cb) = accepted().await;
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn set_label_is_visible() {
        let (conn, _client) = accepted().await;
        conn.set_label("alpha".to_string());
        assert_eq!(conn.label(), "alpha");
        assert!(format!("{conn:?}").contains("alpha"));
    }
}
