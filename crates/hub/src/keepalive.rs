use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::protocol::{MessageKind, PING_PAYLOAD};
use crate::registry::{BroadcastReport, Registry};

/// Ping every registered agent each `interval`, pruning the ones that fail.
///
/// The first pass runs one full interval after the call. Returns at once if
/// `interval` is zero.
pub async fn run_keepalive(registry: Arc<Registry>, interval: Duration, timeout: Duration) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        ping_all(&registry, timeout).await;
    }
}

/// One keepalive pass.
pub async fn ping_all(registry: &Registry, timeout: Duration) -> BroadcastReport {
    let report = registry
        .broadcast(MessageKind::Ping, PING_PAYLOAD, Some(timeout))
        .await;
    for label in &report.pruned {
        info!(label = %label, "pruned unreachable agent");
    }
    debug!(
        delivered = report.delivered.len(),
        busy = report.busy.len(),
        pruned = report.pruned.len(),
        "keepalive pass"
    );
    report
}
