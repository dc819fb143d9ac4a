//! The `Task` type: one queued client inference request.

use std::time::Instant;

use http::{HeaderMap, Method};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Where a `Task` must be routed: an explicit worker name, or a model tag
/// extracted from the request body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Routed by the `Node:` header; only that worker may serve it.
    Node(String),
    /// Routed by the JSON `model` field; any worker advertising it may serve it.
    Model(String),
}

impl Route {
    pub fn as_label(&self) -> String {
        match self {
            Route::Node(n) => format!("Node:{n}"),
            Route::Model(m) => format!("Model:{m}"),
        }
    }
}

/// The parsed client request, buffered in full (per Non-goals, the proxy
/// never streams the client->worker direction incrementally; the body is
/// small inference payload JSON, not a large upload).
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub uri: String,
    pub version_tag: &'static str,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// A handle on the client's socket, retained so whichever component
/// ultimately resolves the task (a `WorkerSession` or the `Monitor`) can
/// write the response without re-threading the connection through them.
#[derive(Debug)]
pub struct ClientHandle {
    pub peer: std::net::SocketAddr,
    pub writer: Mutex<OwnedWriteHalf>,
}

/// Enqueue / dequeue / completion timestamps for a `Task`.
#[derive(Debug, Clone, Copy)]
pub struct Timestamps {
    pub enqueued: Instant,
    pub dequeued: Option<Instant>,
    pub completed: Option<Instant>,
}

impl Timestamps {
    fn new() -> Self {
        Timestamps {
            enqueued: Instant::now(),
            dequeued: None,
            completed: None,
        }
    }

    pub fn queue_time(&self) -> std::time::Duration {
        self.dequeued.unwrap_or_else(Instant::now) - self.enqueued
    }

    pub fn proxy_time(&self) -> Option<std::time::Duration> {
        Some(self.completed? - self.dequeued?)
    }

    pub fn total_time(&self) -> std::time::Duration {
        self.completed.unwrap_or_else(Instant::now) - self.enqueued
    }
}

pub type TaskId = u64;

/// One unit of work: a client's request plus enough metadata to route,
/// serve, time, and eventually respond to it.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub client: ClientHandle,
    pub request: RawRequest,
    pub route: Route,
    pub timestamps: Timestamps,
}

impl Task {
    pub fn new(id: TaskId, client: ClientHandle, request: RawRequest, route: Route) -> Task {
        Task {
            id,
            client,
            request,
            route,
            timestamps: Timestamps::new(),
        }
    }

    pub fn mark_dequeued(&mut self, now: Instant) {
        self.timestamps.dequeued = Some(now);
    }

    pub fn mark_completed(&mut self, now: Instant) {
        self.timestamps.completed = Some(now);
    }
}
