//! Worker Session (C3): state machine per worker TCP connection, plus the
//! Roster the Monitor (C4) owns to track them all.

mod session;
pub mod state;

pub use session::{run_session, SessionConfig};
pub use state::{Status, TimeoutClass, Versions, WorkerState};

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Notify;

/// A Roster entry: the shared state plus a signal the owner (a session
/// task) listens on so the Monitor can ask it to close without reaching
/// into its socket directly (§9 "back-references for lookup only").
#[derive(Debug)]
pub struct WorkerHandle {
    pub state: Arc<WorkerState>,
    pub close: Arc<Notify>,
}

impl WorkerHandle {
    pub fn new(peer: std::net::SocketAddr) -> WorkerHandle {
        WorkerHandle {
            state: Arc::new(WorkerState::new(peer)),
            close: Arc::new(Notify::new()),
        }
    }

    pub fn request_close(&self) {
        self.close.notify_waiters();
    }
}

/// The Monitor-owned collection of live worker sessions (GLOSSARY:
/// "Roster"). Mutex-guarded; sessions append on authentication, Monitor
/// removes (§4.4 step 3, §5 "sessions append ... Monitor removes").
#[derive(Debug, Default)]
pub struct Roster {
    sessions: parking_lot::Mutex<Vec<Arc<WorkerHandle>>>,
    tick: Notify,
}

impl Roster {
    pub fn new() -> Roster {
        Roster::default()
    }

    pub fn add(&self, handle: Arc<WorkerHandle>) {
        self.sessions.lock().push(handle);
    }

    pub fn remove(&self, handle: &Arc<WorkerHandle>) {
        self.sessions.lock().retain(|h| !Arc::ptr_eq(h, handle));
    }

    /// A short-lived snapshot clone, per §4.4's "snapshots it into a local
    /// list before iterating, to keep the critical section short."
    pub fn snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.sessions.lock().clone()
    }

    /// Wakes every session parked in Waiting, called once per Monitor tick
    /// (§9: replaces busy-polling with a signaling primitive).
    pub fn notify_tick(&self) {
        self.tick.notify_waiters();
    }

    pub async fn tick_notified(&self) {
        self.tick.notified().await
    }
}

impl Clone for WorkerHandle {
    fn clone(&self) -> Self {
        WorkerHandle {
            state: Arc::clone(&self.state),
            close: Arc::clone(&self.close),
        }
    }
}

/// Live node names and the union of live advertised tags, as required by
/// `Queue::FetchUnsatisfiable` (§4.4 step 4).
pub async fn live_nodes_and_models(roster: &Roster) -> (Vec<String>, Vec<String>) {
    let snapshot = roster.snapshot();
    let mut nodes = Vec::new();
    let mut models: HashSet<String> = HashSet::new();
    for handle in &snapshot {
        if let Some(name) = handle.state.name().await {
            nodes.push(name);
        }
        models.extend(handle.state.tags().await);
    }
    (nodes, models.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_round_trip() {
        let roster = Roster::new();
        let handle = Arc::new(WorkerHandle::new("127.0.0.1:1".parse().unwrap()));
        roster.add(Arc::clone(&handle));
        assert_eq!(roster.snapshot().len(), 1);
        roster.remove(&handle);
        assert_eq!(roster.snapshot().len(), 0);
    }

    #[tokio::test]
    async fn live_nodes_and_models_union_tags() {
        let roster = Roster::new();
        let h1 = Arc::new(WorkerHandle::new("127.0.0.1:1".parse().unwrap()));
        h1.state.record_identity("w1".into(), "n1".into()).await;
        h1.state
            .replace_tags(["m1".to_string(), "m2".to_string()].into_iter().collect())
            .await;
        roster.add(h1);

        let h2 = Arc::new(WorkerHandle::new("127.0.0.1:2".parse().unwrap()));
        h2.state.record_identity("w2".into(), "n2".into()).await;
        h2.state
            .replace_tags(["m2".to_string()].into_iter().collect())
            .await;
        roster.add(h2);

        let (nodes, models) = live_nodes_and_models(&roster).await;
        assert_eq!(nodes.len(), 2);
        assert!(models.contains(&"m1".to_string()));
        assert!(models.contains(&"m2".to_string()));
        assert_eq!(models.len(), 2);
    }
}
