use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::HandshakeError;
use crate::protocol::{FrameFormat, MessageKind};

/// Gate a freshly accepted stream: the agent must identify itself with a
/// single `Handshake` message within `timeout`.
///
/// A non-empty label is adopted as the proposed label; an empty one keeps
/// the port default. On any failure the stream is shut down before the
/// error is returned.
pub async fn admit(
    stream: TcpStream,
    addr: SocketAddr,
    format: FrameFormat,
    timeout: Duration,
) -> Result<Connection, HandshakeError> {
    let conn = Connection::new(stream, addr, format);

    match read_label(&conn, timeout).await {
        Ok(label) => {
            if !label.is_empty() {
                conn.set_label(label);
            }
            debug!(addr = %addr, label = %conn.label(), "handshake complete");
            Ok(conn)
        }
        Err(err) => {
            warn!(addr = %addr, error = %err, "handshake rejected");
            conn.close().await;
            Err(err)
        }
    }
}

async fn read_label(conn: &Connection, timeout: Duration) -> Result<String, HandshakeError> {
    let payload = conn.expect(MessageKind::Handshake, Some(timeout), 0).await?;
    Ok(String::from_utf8(payload)?)
}
