//! Per-connection mutable worker record (§3 WorkerState, §4.3 states).

use std::collections::HashSet;
use std::time::{Instant, SystemTime};

use tokio::sync::RwLock;

/// A Worker Session's lifecycle state. Transitions monotonically
/// SettingUp -> Waiting -> {Verified|Rejected}; from Verified it cycles
/// {Polling <-> Working, with transient CompletedWork} until Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    SettingUp,
    Waiting,
    Verified,
    Rejected,
    Closed,
    Polling,
    Working,
    CompletedWork,
}

impl Status {
    /// Whether the Monitor's timeout sweep (§4.4 step 2) applies to this
    /// status, and if so, which threshold.
    pub fn timeout_class(&self) -> Option<TimeoutClass> {
        match self {
            Status::Polling | Status::CompletedWork => Some(TimeoutClass::Polling),
            Status::Working => Some(TimeoutClass::Working),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Polling,
    Working,
}

/// Versions reported via the `VERSION` control message.
#[derive(Debug, Clone, Default)]
pub struct Versions {
    pub worker: Option<String>,
    pub backend: Option<String>,
}

/// The mutable fields of a WorkerState, guarded by one `RwLock` (§5: "reads
/// may be concurrent, writes exclusive").
#[derive(Debug)]
struct Fields {
    status: Status,
    name: Option<String>,
    nonce: Option<String>,
    tags: HashSet<String>,
    versions: Versions,
    last_activity: Instant,
    /// Wall-clock mirror of `last_activity`, kept only for admin reporting
    /// (`/worker/pings`, §4.5), since `Instant` has no epoch to format.
    last_ping_wall: SystemTime,
    exception_count: u32,
}

/// Per-connection record for one worker's TCP session. Identity (`peer`) is
/// fixed at construction; everything else lives behind the `RwLock`.
#[derive(Debug)]
pub struct WorkerState {
    pub peer: std::net::SocketAddr,
    fields: RwLock<Fields>,
}

impl WorkerState {
    pub fn new(peer: std::net::SocketAddr) -> WorkerState {
        WorkerState {
            peer,
            fields: RwLock::new(Fields {
                status: Status::SettingUp,
                name: None,
                nonce: None,
                tags: HashSet::new(),
                versions: Versions::default(),
                last_activity: Instant::now(),
                last_ping_wall: SystemTime::now(),
                exception_count: 0,
            }),
        }
    }

    pub async fn status(&self) -> Status {
        self.fields.read().await.status
    }

    pub async fn set_status(&self, status: Status) {
        self.fields.write().await.status = status;
    }

    pub async fn name(&self) -> Option<String> {
        self.fields.read().await.name.clone()
    }

    pub async fn nonce(&self) -> Option<String> {
        self.fields.read().await.nonce.clone()
    }

    /// Records identity after a successful `AUTH`, moving to Waiting.
    pub async fn record_identity(&self, name: String, nonce: String) {
        let mut f = self.fields.write().await;
        f.name = Some(name);
        f.nonce = Some(nonce);
        f.status = Status::Waiting;
        f.last_activity = Instant::now();
        f.last_ping_wall = SystemTime::now();
    }

    pub async fn replace_tags(&self, tags: HashSet<String>) {
        let mut f = self.fields.write().await;
        f.tags = tags;
        f.last_activity = Instant::now();
        f.last_ping_wall = SystemTime::now();
    }

    pub async fn tags(&self) -> HashSet<String> {
        self.fields.read().await.tags.clone()
    }

    pub async fn set_versions(&self, versions: Versions) {
        let mut f = self.fields.write().await;
        f.versions = versions;
        f.last_activity = Instant::now();
        f.last_ping_wall = SystemTime::now();
    }

    pub async fn versions(&self) -> Versions {
        self.fields.read().await.versions.clone()
    }

    pub async fn touch(&self) {
        let mut f = self.fields.write().await;
        f.last_activity = Instant::now();
        f.last_ping_wall = SystemTime::now();
    }

    pub async fn last_activity(&self) -> Instant {
        self.fields.read().await.last_activity
    }

    pub async fn last_ping_wall(&self) -> SystemTime {
        self.fields.read().await.last_ping_wall
    }

    pub async fn idle_for(&self) -> std::time::Duration {
        self.last_activity().await.elapsed()
    }

    /// Increments the protocol-exception counter, returning the new count.
    pub async fn record_exception(&self) -> u32 {
        let mut f = self.fields.write().await;
        f.exception_count += 1;
        f.exception_count
    }
}
