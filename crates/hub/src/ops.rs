//! Request/reply exchanges with one agent.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::connection::Connection;
use crate::error::ChannelError;
use crate::protocol::{MessageKind, CWD_REQUEST_PAYLOAD};

/// How long to wait for replies, and how many unrelated messages to skip
/// while waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExchangePolicy {
    pub timeout: Option<Duration>,
    pub retries: u32,
}

impl Default for ExchangePolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 2,
        }
    }
}

/// Result of a remote shell command, sent as `[exit_code, output]`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "(i64, String)")]
pub struct CommandOutput {
    pub exit_code: i64,
    pub output: String,
}

impl From<(i64, String)> for CommandOutput {
    fn from((exit_code, output): (i64, String)) -> Self {
        Self { exit_code, output }
    }
}

pub async fn run_command(
    conn: &Connection,
    command: &str,
    policy: ExchangePolicy,
) -> Result<CommandOutput, ChannelError> {
    conn.send(MessageKind::Cmd, command.as_bytes(), policy.timeout)
        .await?;
    let reply = conn
        .expect(MessageKind::Output, policy.timeout, policy.retries)
        .await?;
    serde_json::from_slice(&reply)
        .map_err(|err| ChannelError::protocol(format!("malformed command output: {err}")))
}

/// Ask the agent to change directory. The agent sends no ack; the next
/// `current_dir` shows the effect.
pub async fn change_dir(
    conn: &Connection,
    dir: &str,
    policy: ExchangePolicy,
) -> Result<(), ChannelError> {
    conn.send(MessageKind::Cwd, dir.as_bytes(), policy.timeout)
        .await
}

pub async fn current_dir(conn: &Connection, policy: ExchangePolicy) -> Result<String, ChannelError> {
    conn.send(MessageKind::GetCwd, CWD_REQUEST_PAYLOAD, policy.timeout)
        .await?;
    let reply = conn
        .expect(MessageKind::GetCwd, policy.timeout, policy.retries)
        .await?;
    String::from_utf8(reply)
        .map_err(|_| ChannelError::protocol("working directory is not valid UTF-8"))
}

/// Download `remote`. `None` when the agent reports it does not exist.
pub async fn fetch_file(
    conn: &Connection,
    remote: &str,
    policy: ExchangePolicy,
) -> Result<Option<Vec<u8>>, ChannelError> {
    conn.send(MessageKind::Get, remote.as_bytes(), policy.timeout)
        .await?;
    let exists = conn
        .expect(MessageKind::Response, policy.timeout, policy.retries)
        .await?;
    match exists.as_slice() {
        b"0" => {
            debug!(label = %conn.label(), path = remote, "remote file missing");
            Ok(None)
        }
        b"1" => {
            let content = conn
                .expect(MessageKind::Content, policy.timeout, policy.retries)
                .await?;
            Ok(Some(content))
        }
        other => Err(ChannelError::protocol(format!(
            "file response must be \"0\" or \"1\", got {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Upload `content` to `remote`: the path, then the bytes.
pub async fn push_file(
    conn: &Connection,
    remote: &str,
    content: &[u8],
    policy: ExchangePolicy,
) -> Result<(), ChannelError> {
    conn.send(MessageKind::Put, remote.as_bytes(), policy.timeout)
        .await?;
    conn.send(MessageKind::Content, content, policy.timeout)
        .await
}
