//! The Monitor (C4): a single periodic task owning the worker roster,
//! doing verify-pending / timeout-sweep / close-stale / reject-unsatisfiable
//! on every tick (§4.4).

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio::time::interval;

use crate::codec::{self, Head, StartLine};
use crate::queue::DispatchQueue;
use crate::worker::{live_nodes_and_models, Roster, Status, TimeoutClass};

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

/// Runs the Monitor loop until the process shuts down. Never returns under
/// normal operation; intended to be spawned as its own task.
pub async fn run(
    roster: Arc<Roster>,
    queue: Arc<DispatchQueue>,
    period: Duration,
    polling_timeout: Duration,
    working_timeout: Duration,
) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        tick(&roster, &queue, polling_timeout, working_timeout).await;
    }
}

async fn tick(
    roster: &Arc<Roster>,
    queue: &Arc<DispatchQueue>,
    polling_timeout: Duration,
    working_timeout: Duration,
) {
    let snapshot = roster.snapshot();

    // Step 1: verify pending — a Waiting session becomes Verified unless
    // another live Verified session shares its name with a different nonce.
    for handle in &snapshot {
        if handle.state.status().await != Status::Waiting {
            continue;
        }
        let Some(name) = handle.state.name().await else {
            continue;
        };
        let nonce = handle.state.nonce().await;
        let mut split_brain = false;
        for other in &snapshot {
            if Arc::ptr_eq(other, handle) {
                continue;
            }
            if other.state.status().await == Status::Verified
                && other.state.name().await.as_deref() == Some(name.as_str())
                && other.state.nonce().await != nonce
            {
                split_brain = true;
                break;
            }
        }
        if split_brain {
            handle.state.set_status(Status::Rejected).await;
            tracing::warn!(worker = %name, "rejected duplicate worker name (split-brain nonce)");
        } else {
            handle.state.set_status(Status::Verified).await;
            tracing::info!(worker = %name, "worker verified");
        }
    }
    roster.notify_tick();

    // Step 2 + 3: timeout sweep and close-stale.
    for handle in &snapshot {
        let status = handle.state.status().await;
        let stale = match status {
            Status::Closed | Status::Rejected => true,
            _ => match status.timeout_class() {
                Some(TimeoutClass::Polling) => handle.state.idle_for().await > polling_timeout,
                Some(TimeoutClass::Working) => handle.state.idle_for().await > working_timeout,
                None => false,
            },
        };
        if stale {
            let name = handle.state.name().await.unwrap_or_default();
            tracing::info!(worker = %name, ?status, "closing stale worker session");
            handle.request_close();
            roster.remove(handle);
        }
    }

    // Step 4: reject tasks no live worker can serve.
    let (live_nodes, live_models) = live_nodes_and_models(roster).await;
    while let Some(task) = queue.fetch_unsatisfiable(&live_nodes, &live_models) {
        tracing::warn!(
            task_id = task.id,
            route = %task.route.as_label(),
            "rejecting unroutable task"
        );
        let mut client = task.client.writer.lock().await;
        let _ = write_405(&mut *client).await;
    }
}

async fn write_405<W: tokio::io::AsyncWrite + Unpin>(w: &mut W) -> crate::error::Result<()> {
    let head = Head {
        start: StartLine::Response {
            status: 405,
            reason: "Method Not Allowed".to_string(),
        },
        headers: HeaderMap::new(),
    };
    codec::write_head(w, &head).await
}
