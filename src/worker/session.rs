//! The per-connection Worker Session task (§4.3): authenticate, then
//! repeatedly poll/serve, with a single-writer mutex around the socket.

use std::sync::Arc;

use http::HeaderMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::codec::{self, Head, StartLine};
use crate::error::{Error, Result};
use crate::keystore::{Role, SqliteKeyStore};
use crate::queue::DispatchQueue;
use crate::task::Task;
use crate::worker::state::Status;
use crate::worker::{Roster, WorkerHandle};

/// Knobs the session needs from `Config`, threaded through explicitly
/// rather than depending on the whole `Config` type.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub exception_threshold: u32,
    pub chunk_buffer_size: usize,
}

/// Runs one worker connection to completion. Removes `handle` from
/// `roster` on every exit path.
pub async fn run_session(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    keystore: Arc<SqliteKeyStore>,
    queue: Arc<DispatchQueue>,
    roster: Arc<Roster>,
    config: SessionConfig,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));

    let handle = Arc::new(WorkerHandle::new(peer));

    let result = drive(&mut reader, &writer, &handle, &keystore, &queue, &roster, config).await;

    handle.state.set_status(Status::Closed).await;
    roster.remove(&handle);
    let _ = writer.lock().await.shutdown().await;
    result
}

async fn drive(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    handle: &Arc<WorkerHandle>,
    keystore: &Arc<SqliteKeyStore>,
    queue: &Arc<DispatchQueue>,
    roster: &Arc<Roster>,
    config: SessionConfig,
) -> Result<()> {
    authenticate(reader, handle, keystore).await?;
    roster.add(Arc::clone(handle));

    // Block (without busy-polling, per §9 REDESIGN FLAGS) until the
    // Monitor's next tick verifies or rejects this session.
    loop {
        match handle.state.status().await {
            Status::Waiting => {
                tokio::select! {
                    _ = roster.tick_notified() => {}
                    _ = handle.close.notified() => return Ok(()),
                }
            }
            Status::Verified => break,
            Status::Rejected => return Ok(()),
            _ => return Ok(()),
        }
    }

    loop {
        let head = tokio::select! {
            head = codec::read_head(reader) => head?,
            _ = handle.close.notified() => return Ok(()),
        };
        if !head.start.is_hive() {
            return Err(Error::malformed());
        }
        handle.state.touch().await;

        let method = head.start.method().unwrap_or_default().to_ascii_uppercase();
        let args = head.start.hive_args();

        match method.as_str() {
            "POLL" => {
                handle_poll(reader, writer, handle, queue, args, config).await?;
            }
            "TAGS" => {
                handle.state.replace_tags(args.into_iter().collect()).await;
            }
            "VERSION" => {
                let mut versions = crate::worker::Versions::default();
                for arg in args {
                    if let Some(v) = arg.strip_prefix("worker=") {
                        versions.worker = Some(v.to_string());
                    } else if let Some(v) = arg.strip_prefix("backend=") {
                        versions.backend = Some(v.to_string());
                    }
                }
                handle.state.set_versions(versions).await;
            }
            _ => {
                // Treated as a ping: heartbeat already touched above.
            }
        }

        if handle.state.status().await == Status::Closed {
            return Ok(());
        }
    }
}

async fn authenticate(
    reader: &mut BufReader<OwnedReadHalf>,
    handle: &Arc<WorkerHandle>,
    keystore: &Arc<SqliteKeyStore>,
) -> Result<()> {
    let head = codec::read_head(reader).await?;
    if !head.start.is_hive() || head.start.method() != Some("AUTH") {
        return Err(Error::auth());
    }
    let args = head.start.hive_args();
    let (token, nonce) = match (args.first(), args.get(1)) {
        (Some(t), Some(n)) => (t.clone(), n.clone()),
        _ => return Err(Error::auth()),
    };

    let looked_up = keystore.lookup(&token).map_err(|_| Error::auth())?;
    let (name, role) = looked_up.ok_or_else(Error::auth)?;
    if !matches!(role, Role::Admin | Role::Worker) {
        return Err(Error::auth());
    }

    handle.state.record_identity(name, nonce).await;
    Ok(())
}

/// Handles one `POLL`: fetches a task if one matches, proxies it if so,
/// otherwise replies `PONG /` (§4.3).
async fn handle_poll(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    handle: &Arc<WorkerHandle>,
    queue: &Arc<DispatchQueue>,
    models: Vec<String>,
    config: SessionConfig,
) -> Result<()> {
    handle.state.set_status(Status::Polling).await;
    let name = handle.state.name().await.unwrap_or_default();
    let Some(mut task) = queue.fetch(&models, &name) else {
        let mut w = writer.lock().await;
        codec::write_hive(&mut *w, "PONG", &[]).await?;
        return Ok(());
    };

    handle.state.set_status(Status::Working).await;
    let outcome = proxy_task(reader, writer, &mut task, handle, config).await;
    task.mark_completed(std::time::Instant::now());
    log_task_completion(&task, &outcome);

    if outcome.is_err() {
        let forced_close = outcome.as_ref().err().is_some_and(|e| e.is_timeout());
        let count = handle.state.record_exception().await;
        if forced_close || count >= config.exception_threshold {
            handle.state.set_status(Status::Closed).await;
            return outcome;
        }
    }
    handle.state.set_status(Status::CompletedWork).await;
    handle.state.set_status(Status::Polling).await;
    Ok(())
}

fn log_task_completion(task: &Task, outcome: &Result<()>) {
    let queue_time = task.timestamps.queue_time();
    let total_time = task.timestamps.total_time();
    match outcome {
        Ok(()) => tracing::info!(
            task_id = task.id,
            queue_time_ms = queue_time.as_millis() as u64,
            total_time_ms = total_time.as_millis() as u64,
            "task completed"
        ),
        Err(e) => tracing::warn!(
            task_id = task.id,
            error = %e,
            "task proxy failed"
        ),
    }
}

/// The single hot path: proxy one task end to end over the already-open
/// worker socket, with a `headers_written` flag tracking how far the
/// client response got so a failure can choose 502 vs silent close (§9).
async fn proxy_task(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    task: &mut Task,
    handle: &Arc<WorkerHandle>,
    config: SessionConfig,
) -> Result<()> {
    task.mark_dequeued(std::time::Instant::now());
    let mut headers_written = false;

    // Races the proxy against a Monitor-requested close so a worker that
    // stops reading from its backend is torn down at the working timeout
    // instead of holding this task (and its client) open forever.
    let result = tokio::select! {
        r = proxy_inner(reader, writer, task, &mut headers_written, config) => r,
        _ = handle.close.notified() => Err(Error::timeout()),
    };

    if let Err(ref e) = result {
        let mut client = task.client.writer.lock().await;
        if !headers_written {
            // A malformed worker response is local to the reading side and
            // not an I/O failure; everything else (IO error, proxy timeout)
            // before any client headers were written synthesizes a Bad
            // Gateway instead (§4.3/§7).
            let status = if e.is_protocol() { 500 } else { 502 };
            let _ = write_simple_status(&mut *client, status).await;
        } else {
            // Partial body already sent; it cannot be recalled, so just
            // terminate the connection rather than corrupt it further.
            let _ = client.shutdown().await;
        }
    }
    result
}

async fn proxy_inner(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    task: &Task,
    headers_written: &mut bool,
    config: SessionConfig,
) -> Result<()> {
    // Step 1: write the client's request verbatim to the worker.
    let request_head = Head {
        start: StartLine::Request {
            method: task.request.method.as_str().to_string(),
            uri: task.request.uri.clone(),
            hive: false,
        },
        headers: task.request.headers.clone(),
    };
    {
        let mut w = writer.lock().await;
        codec::write_head(&mut *w, &request_head).await?;
        if !task.request.body.is_empty() {
            w.write_all(&task.request.body).await?;
        }
        w.flush().await?;
    }

    // Step 2: read the status line + headers from the worker.
    let response_head = codec::read_head(reader).await?;
    let status = match &response_head.start {
        StartLine::Response { status, .. } => *status,
        StartLine::Request { .. } => return Err(Error::malformed()),
    };
    if status != 200 {
        tracing::warn!(
            status,
            method = %task.request.method,
            uri = %task.request.uri,
            "worker returned non-200 status"
        );
    }

    // Steps 3-4: forward the status line and headers to the client, then flush.
    {
        let mut client = task.client.writer.lock().await;
        codec::write_head(&mut *client, &response_head).await?;
    }
    *headers_written = true;

    // Step 5: stream the body per the response's framing.
    let framing = response_head.framing(true);
    let mut client = task.client.writer.lock().await;
    match framing {
        codec::Framing::Fixed(0) | codec::Framing::None => {}
        codec::Framing::Fixed(n) => {
            codec::stream_fixed_body(reader, &mut *client, n).await?
        }
        codec::Framing::Chunked => {
            codec::stream_chunked_body(reader, &mut *client, config.chunk_buffer_size).await?
        }
        codec::Framing::UntilEof => codec::stream_until_eof(reader, &mut *client).await?,
    }
    Ok(())
}

async fn write_simple_status<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, status: u16) -> Result<()> {
    let reason = match status {
        405 => "Method Not Allowed",
        502 => "Bad Gateway",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let head = Head {
        start: StartLine::Response {
            status,
            reason: reason.to_string(),
        },
        headers: HeaderMap::new(),
    };
    codec::write_head(w, &head).await
}
