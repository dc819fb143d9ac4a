//! The Dispatch Queue (C2): model-keyed and node-keyed FIFO sub-queues.
//!
//! Each sub-queue is its own `Mutex<VecDeque<Task>>` so `Admit`/`Fetch` on
//! different keys never contend, matching §4.2's "concurrent `Admit` +
//! `Fetch` on the same key is safe and linearizable per sub-queue."

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;

use crate::codec::extract_json_string_field;
use crate::task::{Route, Task};

#[derive(Debug, Default)]
struct SubQueues {
    by_model: HashMap<String, VecDeque<Task>>,
    by_node: HashMap<String, VecDeque<Task>>,
}

/// The model-keyed and node-keyed FIFO dispatch queue.
#[derive(Debug)]
pub struct DispatchQueue {
    inner: Mutex<SubQueues>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> DispatchQueue {
        DispatchQueue {
            inner: Mutex::new(SubQueues::default()),
        }
    }

    /// Admits a task into the sub-queue implied by its route. The
    /// HIVE-control-dialect and missing-model rejection cases from §4.2 are
    /// screened by intake before a `Task` is ever constructed, so by the
    /// time a caller reaches `admit` the route is already known-valid.
    pub fn admit(&self, task: Task) {
        let mut inner = self.inner.lock();
        match task.route.clone() {
            Route::Node(name) => inner.by_node.entry(name).or_default().push_back(task),
            Route::Model(model) => inner.by_model.entry(model).or_default().push_back(task),
        }
    }

    /// Tries `ByNode[node_name]` first, then walks `model_list` in the
    /// caller-supplied order (§9 Open Question: order is preserved, not
    /// reordered for fairness), returning the first dequeued Task.
    pub fn fetch(&self, model_list: &[String], node_name: &str) -> Option<Task> {
        let mut inner = self.inner.lock();
        if let Some(q) = inner.by_node.get_mut(node_name) {
            if let Some(mut task) = q.pop_front() {
                task.mark_dequeued(Instant::now());
                return Some(task);
            }
        }
        for model in model_list {
            if let Some(q) = inner.by_model.get_mut(model) {
                if let Some(mut task) = q.pop_front() {
                    task.mark_dequeued(Instant::now());
                    return Some(task);
                }
            }
        }
        None
    }

    /// Returns one queued task whose route cannot be served by any
    /// currently live worker: a node-routed task whose node isn't in
    /// `live_nodes`, or a model-routed task whose model isn't in
    /// `live_models`. Removes exactly the task it returns.
    pub fn fetch_unsatisfiable(
        &self,
        live_nodes: &[String],
        live_models: &[String],
    ) -> Option<Task> {
        let mut inner = self.inner.lock();
        for (node, q) in inner.by_node.iter_mut() {
            if !live_nodes.iter().any(|n| n == node) {
                if let Some(task) = q.pop_front() {
                    return Some(task);
                }
            }
        }
        for (model, q) in inner.by_model.iter_mut() {
            if !live_models.iter().any(|m| m == model) {
                if let Some(task) = q.pop_front() {
                    return Some(task);
                }
            }
        }
        None
    }

    /// A read-only snapshot of sub-queue sizes; does not mutate state.
    pub fn lengths(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock();
        let mut out = HashMap::with_capacity(inner.by_model.len() + inner.by_node.len());
        for (model, q) in inner.by_model.iter() {
            out.insert(format!("Model:{model}"), q.len());
        }
        for (node, q) in inner.by_node.iter() {
            out.insert(format!("Node:{node}"), q.len());
        }
        out
    }
}

/// Determines a task's route from its headers/body, per §4.2: an explicit
/// `node` header wins; otherwise the `model` JSON field is required.
pub fn route_for(headers: &http::HeaderMap, body: &[u8]) -> Option<Route> {
    if let Some(node) = headers.get("node").and_then(|v| v.to_str().ok()) {
        return Some(Route::Node(node.to_string()));
    }
    extract_json_string_field(body, "model").map(Route::Model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ClientHandle, RawRequest};
    use http::{HeaderMap, Method};
    use tokio::net::TcpListener;

    async fn dummy_client() -> ClientHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = tokio::net::TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connector);
        let (stream, peer) = accepted.unwrap();
        drop(connected.unwrap());
        let (_r, w) = stream.into_split();
        ClientHandle {
            peer,
            writer: tokio::sync::Mutex::new(w),
        }
    }

    fn req() -> RawRequest {
        RawRequest {
            method: Method::POST,
            uri: "/api/generate".into(),
            version_tag: "HTTP/1.1",
            headers: HeaderMap::new(),
            body: br#"{"model":"m1"}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn fifo_within_a_model() {
        let q = DispatchQueue::new();
        let t1 = Task::new(1, dummy_client().await, req(), Route::Model("m1".into()));
        let t2 = Task::new(2, dummy_client().await, req(), Route::Model("m1".into()));
        q.admit(t1);
        q.admit(t2);
        let got1 = q.fetch(&["m1".to_string()], "w1").unwrap();
        let got2 = q.fetch(&["m1".to_string()], "w1").unwrap();
        assert_eq!(got1.id, 1);
        assert_eq!(got2.id, 2);
        assert!(q.fetch(&["m1".to_string()], "w1").is_none());
    }

    #[tokio::test]
    async fn node_route_beats_model_fallback_order() {
        let q = DispatchQueue::new();
        let targeted = Task::new(1, dummy_client().await, req(), Route::Node("w1".into()));
        q.admit(targeted);
        // w2 polling for m1 should not see the node-targeted task.
        assert!(q.fetch(&["m1".to_string()], "w2").is_none());
        // only w1 asking (regardless of model list) sees it.
        let got = q.fetch(&["unrelated".to_string()], "w1").unwrap();
        assert_eq!(got.id, 1);
    }

    #[tokio::test]
    async fn lengths_does_not_mutate() {
        let q = DispatchQueue::new();
        q.admit(Task::new(1, dummy_client().await, req(), Route::Model("m1".into())));
        let _ = q.lengths();
        let _ = q.lengths();
        assert_eq!(q.fetch(&["m1".to_string()], "anyone").unwrap().id, 1);
    }

    #[tokio::test]
    async fn fetch_unsatisfiable_removes_returned_task_only() {
        let q = DispatchQueue::new();
        q.admit(Task::new(1, dummy_client().await, req(), Route::Model("ghost".into())));
        q.admit(Task::new(2, dummy_client().await, req(), Route::Model("m1".into())));
        let live_models = vec!["m1".to_string()];
        let rejected = q.fetch_unsatisfiable(&[], &live_models).unwrap();
        assert_eq!(rejected.id, 1);
        assert!(q.fetch_unsatisfiable(&[], &live_models).is_none());
        assert_eq!(q.fetch(&["m1".to_string()], "w1").unwrap().id, 2);
    }

    #[test]
    fn route_for_prefers_node_header() {
        let mut headers = HeaderMap::new();
        headers.insert("node", "w1".parse().unwrap());
        let route = route_for(&headers, br#"{"model":"m1"}"#).unwrap();
        assert_eq!(route, Route::Node("w1".into()));
    }

    #[test]
    fn route_for_falls_back_to_model() {
        let headers = HeaderMap::new();
        let route = route_for(&headers, br#"{"model":"m1"}"#).unwrap();
        assert_eq!(route, Route::Model("m1".into()));
    }

    #[test]
    fn route_for_none_when_neither_present() {
        let headers = HeaderMap::new();
        assert!(route_for(&headers, br#"{"prompt":"hi"}"#).is_none());
    }
}
