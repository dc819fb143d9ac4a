//! Client Intake (C5, proxy-port half): accepts inbound HTTP, parses one
//! request per connection, and hands it to the Dispatch Queue as a `Task`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::codec::{self, Head, StartLine};
use crate::error::Result;
use crate::keystore::{Role, SqliteKeyStore};
use crate::queue::{route_for, DispatchQueue};
use crate::task::{ClientHandle, RawRequest, Task};

#[derive(Debug, Clone, Copy)]
pub struct IntakeConfig {
    pub user_authentication: bool,
    pub read_timeout: Duration,
}

/// Accepts connections on the proxy port until the listener errors.
pub async fn run(
    listener: TcpListener,
    queue: Arc<DispatchQueue>,
    keystore: Arc<SqliteKeyStore>,
    config: Arc<IntakeConfig>,
    next_id: Arc<AtomicU64>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "intake accept failed");
                continue;
            }
        };
        let queue = Arc::clone(&queue);
        let keystore = Arc::clone(&keystore);
        let config = Arc::clone(&config);
        let next_id = Arc::clone(&next_id);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, queue, keystore, config, next_id).await {
                tracing::debug!(error = %e, peer = %peer, "intake connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    queue: Arc<DispatchQueue>,
    keystore: Arc<SqliteKeyStore>,
    config: Arc<IntakeConfig>,
    next_id: Arc<AtomicU64>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let message = tokio::time::timeout(config.read_timeout, codec::read_message(&mut reader, false))
        .await
        .map_err(|_| crate::error::Error::timeout())??;

    if message.head.start.is_hive() {
        write_405(&mut write_half).await;
        return Ok(());
    }
    let (method, uri) = match &message.head.start {
        StartLine::Request { method, uri, .. } => (method.clone(), uri.clone()),
        StartLine::Response { .. } => {
            write_405(&mut write_half).await;
            return Ok(());
        }
    };

    if config.user_authentication {
        match authorize(&message.head.headers, &keystore) {
            Some(role) if matches!(role, Role::Admin | Role::Client) => {
                if is_targeted(&message.head.headers) && role != Role::Admin {
                    write_403(&mut write_half).await;
                    return Ok(());
                }
            }
            _ => {
                write_403(&mut write_half).await;
                return Ok(());
            }
        }
    }

    let Some(route) = route_for(&message.head.headers, &message.body) else {
        write_405(&mut write_half).await;
        return Ok(());
    };

    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let http_method = http::Method::from_bytes(method.as_bytes()).unwrap_or(http::Method::GET);
    let request = RawRequest {
        method: http_method,
        uri,
        version_tag: "HTTP/1.1",
        headers: message.head.headers,
        body: message.body,
    };
    let client = ClientHandle {
        peer,
        writer: tokio::sync::Mutex::new(write_half),
    };
    queue.admit(Task::new(id, client, request, route));
    Ok(())
}

fn is_targeted(headers: &HeaderMap) -> bool {
    headers.get("node").is_some()
}

fn authorize(headers: &HeaderMap, keystore: &SqliteKeyStore) -> Option<Role> {
    let token = bearer_token(headers)?;
    keystore.lookup(&token).ok().flatten().map(|(_, role)| role)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

async fn write_405(w: &mut (impl tokio::io::AsyncWrite + Unpin)) {
    let head = Head {
        start: StartLine::Response {
            status: 405,
            reason: "Method Not Allowed".to_string(),
        },
        headers: HeaderMap::new(),
    };
    let _ = codec::write_head(w, &head).await;
    let _ = w.shutdown().await;
}

async fn write_403(w: &mut (impl tokio::io::AsyncWrite + Unpin)) {
    let head = Head {
        start: StartLine::Response {
            status: 403,
            reason: "Unauthorized".to_string(),
        },
        headers: HeaderMap::new(),
    };
    let _ = codec::write_head(w, &head).await;
    let _ = w.shutdown().await;
}
