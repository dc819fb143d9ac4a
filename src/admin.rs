//! Admin Snapshot (C5, management-port half): read-only JSON views over
//! the Dispatch Queue and worker roster, plus key management (§4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::TcpListener;

use crate::codec::{self, Head, StartLine};
use crate::error::Result;
use crate::keystore::{Role, SqliteKeyStore};
use crate::queue::DispatchQueue;
use crate::worker::Roster;

const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepts connections on the management port until the listener errors.
pub async fn run(
    listener: TcpListener,
    queue: Arc<DispatchQueue>,
    roster: Arc<Roster>,
    keystore: Arc<SqliteKeyStore>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "admin accept failed");
                continue;
            }
        };
        let queue = Arc::clone(&queue);
        let roster = Arc::clone(&roster);
        let keystore = Arc::clone(&keystore);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, queue, roster, keystore).await {
                tracing::debug!(error = %e, peer = %peer, "admin connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    queue: Arc<DispatchQueue>,
    roster: Arc<Roster>,
    keystore: Arc<SqliteKeyStore>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let message = tokio::time::timeout(READ_TIMEOUT, codec::read_message(&mut reader, false))
        .await
        .map_err(|_| crate::error::Error::timeout())??;

    let (method, uri) = match &message.head.start {
        StartLine::Request { method, uri, .. } => (method.clone(), uri.clone()),
        StartLine::Response { .. } => return Ok(()),
    };

    if !is_admin(&message.head.headers, &keystore) {
        write_json(&mut write_half, 403, &json!({"error": "unauthorized"})).await;
        return Ok(());
    }

    let body: Value = match (method.as_str(), uri.as_str()) {
        ("GET", "/queue") => json!(queue.lengths()),
        ("GET", "/worker/connections") => connections(&roster).await,
        ("GET", "/worker/status") => status_map(&roster).await,
        ("GET", "/worker/pings") => pings_map(&roster).await,
        ("GET", "/worker/tags") => tags_map(&roster).await,
        ("GET", "/worker/versions") => versions_map(&roster).await,
        ("GET", "/key") => match keystore.list() {
            Ok(keys) => json!(keys
                .into_iter()
                .map(|k| json!({
                    "id": k.id,
                    "name": k.name,
                    "value": k.value,
                    "role": role_str(k.role),
                }))
                .collect::<Vec<_>>()),
            Err(e) => {
                write_json(&mut write_half, 400, &json!({"error": e.to_string()})).await;
                return Ok(());
            }
        },
        ("POST", "/key") => {
            match handle_key_insert(&keystore, &message.body) {
                Ok(value) => json!({"value": value}),
                Err(e) => {
                    write_json(&mut write_half, 400, &json!({"error": e})).await;
                    return Ok(());
                }
            }
        }
        _ => {
            write_json(&mut write_half, 405, &json!({"error": "unknown route"})).await;
            return Ok(());
        }
    };

    write_json(&mut write_half, 200, &body).await;
    Ok(())
}

fn handle_key_insert(keystore: &SqliteKeyStore, body: &[u8]) -> std::result::Result<String, String> {
    let name = codec::extract_json_string_field(body, "name").ok_or("missing \"name\"")?;
    let role_str = codec::extract_json_string_field(body, "role").ok_or("missing \"role\"")?;
    let role = match role_str.as_str() {
        "Admin" => Role::Admin,
        "Worker" => Role::Worker,
        "Client" => Role::Client,
        other => return Err(format!("unknown role {other:?}")),
    };
    keystore.insert(&name, role).map_err(|e| e.to_string())
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Admin => "Admin",
        Role::Worker => "Worker",
        Role::Client => "Client",
    }
}

async fn connections(roster: &Roster) -> Value {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for handle in roster.snapshot() {
        if let Some(name) = handle.state.name().await {
            *counts.entry(name).or_insert(0) += 1;
        }
    }
    json!(counts)
}

async fn status_map(roster: &Roster) -> Value {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for handle in roster.snapshot() {
        if let Some(name) = handle.state.name().await {
            map.entry(name).or_default().push(format!("{:?}", handle.state.status().await));
        }
    }
    json!(map)
}

async fn pings_map(roster: &Roster) -> Value {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for handle in roster.snapshot() {
        if let Some(name) = handle.state.name().await {
            let wall = handle.state.last_ping_wall().await;
            map.entry(name).or_default().push(format_iso8601(wall));
        }
    }
    json!(map)
}

async fn tags_map(roster: &Roster) -> Value {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for handle in roster.snapshot() {
        if let Some(name) = handle.state.name().await {
            let mut tags: Vec<String> = handle.state.tags().await.into_iter().collect();
            tags.sort();
            map.insert(name, tags);
        }
    }
    json!(map)
}

async fn versions_map(roster: &Roster) -> Value {
    let mut map: HashMap<String, Value> = HashMap::new();
    for handle in roster.snapshot() {
        if let Some(name) = handle.state.name().await {
            let versions = handle.state.versions().await;
            map.insert(
                name,
                json!({"worker": versions.worker, "backend": versions.backend}),
            );
        }
    }
    json!(map)
}

/// Formats a `SystemTime` as `YYYY-MM-DDTHH:MM:SS.nnnnnnnnnZ` (§4.5: "ISO-8601,
/// nanosecond precision if available"). No crate in the dependency stack
/// covers ISO-8601 formatting, so this is a small civil-calendar conversion
/// from the Unix epoch — the same algorithm used by most libc `gmtime`
/// implementations.
fn format_iso8601(t: std::time::SystemTime) -> String {
    let since_epoch = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs() as i64;
    let (days, secs_of_day) = (secs.div_euclid(86_400), secs.rem_euclid(86_400));
    let (year, month, day) = civil_from_days(days);
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;
    format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{:09}Z",
        since_epoch.subsec_nanos()
    )
}

/// Howard Hinnant's days-from-civil / civil-from-days algorithm, proleptic
/// Gregorian, days since 1970-01-01.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day)
}

fn is_admin(headers: &HeaderMap, keystore: &SqliteKeyStore) -> bool {
    let Some(token) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    matches!(keystore.lookup(token), Ok(Some((_, Role::Admin))))
}

async fn write_json(w: &mut (impl tokio::io::AsyncWrite + Unpin), status: u16, body: &Value) {
    use tokio::io::AsyncWriteExt;
    let pretty = serde_json::to_vec_pretty(body).unwrap_or_default();
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );
    headers.insert(
        http::header::CONTENT_LENGTH,
        pretty.len().to_string().parse().unwrap(),
    );
    let head = Head {
        start: StartLine::Response {
            status,
            reason: reason_for(status).to_string(),
        },
        headers,
    };
    let _ = codec::write_head(w, &head).await;
    let _ = w.write_all(&pretty).await;
    let _ = w.flush().await;
    let _ = w.shutdown().await;
}

fn reason_for(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Unauthorized",
        405 => "Method Not Allowed",
        _ => "Error",
    }
}
