use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::console::Console;
use crate::error::HubError;
use crate::focus::Focus;
use crate::keepalive::run_keepalive;
use crate::ops::ExchangePolicy;
use crate::server::Acceptor;

/// Background tasks are aborted when this goes out of scope.
struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Wait for the first agent, start the accept and keepalive loops, then
/// hand the terminal to the operator console until its input ends.
pub async fn run_controller<R, W>(
    acceptor: Acceptor,
    config: &Config,
    input: R,
    mut output: W,
) -> Result<(), HubError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output
        .write_all(b"Waiting for initial connection . . .\n")
        .await?;
    output.flush().await?;

    let first = acceptor.accept(None).await.ok_or(HubError::NoAgents)?;
    let addr = first.addr();
    output
        .write_all(
            format!(
                "Connected to {}! ({}:{})\n",
                first.label(),
                addr.ip(),
                addr.port()
            )
            .as_bytes(),
        )
        .await?;
    output.flush().await?;

    let registry = Arc::clone(acceptor.registry());
    let mut tasks = TaskGuard(vec![tokio::spawn(acceptor.run())]);
    if let Some(interval) = config.ping_interval {
        tasks.0.push(tokio::spawn(run_keepalive(
            Arc::clone(&registry),
            interval,
            config.ping_timeout,
        )));
    }

    let mut focus = Focus::new(
        registry,
        ExchangePolicy {
            timeout: config.reply_timeout,
            retries: config.expect_retries,
        },
    );
    focus.focus_on(&first);
    drop(first);

    let result = Console::new(focus, input, output).run().await;
    info!(ok = result.is_ok(), "operator console finished");
    drop(tasks);
    result
}
