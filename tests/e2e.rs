//! End-to-end scenarios driving the real listeners over loopback sockets:
//! a raw-byte "worker" script and a raw-byte "client" script talking to the
//! actual intake/worker-acceptor/monitor tasks, the way a real `hived`
//! deployment would be exercised.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use hive_core::intake::{self, IntakeConfig};
use hive_core::keystore::{Role, SqliteKeyStore};
use hive_core::monitor;
use hive_core::queue::DispatchQueue;
use hive_core::worker::{run_session, Roster, SessionConfig};

fn spawn_worker_acceptor(
    listener: TcpListener,
    keystore: Arc<SqliteKeyStore>,
    queue: Arc<DispatchQueue>,
    roster: Arc<Roster>,
) {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = listener.accept().await.unwrap();
            let keystore = Arc::clone(&keystore);
            let queue = Arc::clone(&queue);
            let roster = Arc::clone(&roster);
            tokio::spawn(async move {
                let _ = run_session(
                    stream,
                    peer,
                    keystore,
                    queue,
                    roster,
                    SessionConfig {
                        exception_threshold: 5,
                        chunk_buffer_size: 4096,
                    },
                )
                .await;
            });
        }
    });
}

fn spawn_intake(
    listener: TcpListener,
    queue: Arc<DispatchQueue>,
    keystore: Arc<SqliteKeyStore>,
    user_authentication: bool,
) {
    tokio::spawn(intake::run(
        listener,
        queue,
        keystore,
        Arc::new(IntakeConfig {
            user_authentication,
            read_timeout: Duration::from_secs(5),
        }),
        Arc::new(AtomicU64::new(1)),
    ));
}

fn spawn_monitor(roster: Arc<Roster>, queue: Arc<DispatchQueue>, period: Duration, polling_timeout: Duration) {
    tokio::spawn(monitor::run(roster, queue, period, polling_timeout, Duration::from_secs(300)));
}

fn spawn_monitor_with_working_timeout(
    roster: Arc<Roster>,
    queue: Arc<DispatchQueue>,
    period: Duration,
    working_timeout: Duration,
) {
    tokio::spawn(monitor::run(roster, queue, period, Duration::from_secs(30), working_timeout));
}

#[tokio::test]
async fn happy_path_model_routed_chunked_response() {
    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let intake_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker_listener.local_addr().unwrap();
    let intake_addr = intake_listener.local_addr().unwrap();

    let keystore = Arc::new(SqliteKeyStore::open(":memory:").unwrap());
    let token = keystore.insert("w1", Role::Worker).unwrap();
    let queue = Arc::new(DispatchQueue::new());
    let roster = Arc::new(Roster::new());

    spawn_worker_acceptor(worker_listener, Arc::clone(&keystore), Arc::clone(&queue), Arc::clone(&roster));
    spawn_intake(intake_listener, Arc::clone(&queue), Arc::clone(&keystore), false);
    spawn_monitor(Arc::clone(&roster), Arc::clone(&queue), Duration::from_millis(10), Duration::from_secs(30));

    let mut worker = TcpStream::connect(worker_addr).await.unwrap();
    worker
        .write_all(format!("AUTH /{token};nonce1 HIVE\r\n\r\n").as_bytes())
        .await
        .unwrap();

    // Give the Monitor at least one tick to move this session Waiting -> Verified
    // before anything is queued for it to poll.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let body = br#"{"model":"model1"}"#;
    let mut client = TcpStream::connect(intake_addr).await.unwrap();
    let request = format!(
        "POST /api/generate HTTP/1.1\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    client.write_all(body).await.unwrap();

    // Only poll once the task is admitted, so this POLL is guaranteed to
    // fetch it directly rather than racing a PONG reply.
    tokio::time::sleep(Duration::from_millis(20)).await;
    worker.write_all(b"POLL /model1 HIVE\r\n\r\n").await.unwrap();

    // The worker session now has the task: it should see the proxied request
    // arrive over the same socket it authenticated and polled on. Everything
    // is read through one `BufReader` so bytes the kernel delivered together
    // (head and the start of the body) aren't stranded in its internal buffer.
    {
        let mut worker_reader = BufReader::new(&mut worker);
        let mut head_buf = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = tokio::io::AsyncBufReadExt::read_until(&mut worker_reader, b'\n', &mut line)
                .await
                .unwrap();
            assert!(n > 0, "worker socket closed before request head arrived");
            let done = line == b"\r\n";
            head_buf.extend_from_slice(&line);
            if done {
                break;
            }
        }
        let head_text = String::from_utf8(head_buf).unwrap();
        assert!(head_text.starts_with("POST /api/generate HTTP/1.1\r\n"));
        assert!(head_text
            .to_ascii_lowercase()
            .contains(&format!("content-length: {}", body.len())));

        let mut forwarded_body = vec![0u8; body.len()];
        worker_reader.read_exact(&mut forwarded_body).await.unwrap();
        assert_eq!(forwarded_body, body);
    }

    // Reply with a chunked response whose middle chunk happens to contain
    // raw CRLF bytes, verifying the proxy forwards it byte-for-byte.
    let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n\r\n\r\n\r\n0\r\n\r\n";
    worker.write_all(response).await.unwrap();

    let mut client_reader = BufReader::new(&mut client);
    let mut received = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = tokio::io::AsyncBufReadExt::read_until(&mut client_reader, b'\n', &mut line)
            .await
            .unwrap();
        assert!(n > 0);
        received.extend_from_slice(&line);
        if line == b"\r\n" {
            break;
        }
    }
    let status_text = String::from_utf8(received.clone()).unwrap();
    assert!(status_text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(status_text.to_ascii_lowercase().contains("transfer-encoding: chunked"));

    let expected_tail = b"4\r\n\r\n\r\n\r\n0\r\n\r\n";
    let mut chunked_tail = vec![0u8; expected_tail.len()];
    client_reader.read_exact(&mut chunked_tail).await.unwrap();
    assert_eq!(chunked_tail, expected_tail);
}

#[tokio::test]
async fn unroutable_task_rejected_within_one_monitor_tick() {
    let intake_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let intake_addr = intake_listener.local_addr().unwrap();

    let keystore = Arc::new(SqliteKeyStore::open(":memory:").unwrap());
    let queue = Arc::new(DispatchQueue::new());
    let roster = Arc::new(Roster::new());

    spawn_intake(intake_listener, Arc::clone(&queue), Arc::clone(&keystore), false);
    spawn_monitor(Arc::clone(&roster), Arc::clone(&queue), Duration::from_millis(10), Duration::from_secs(30));

    let body = br#"{"model":"nobody-serves-this"}"#;
    let mut client = TcpStream::connect(intake_addr).await.unwrap();
    let request = format!(
        "POST /api/generate HTTP/1.1\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    client.write_all(body).await.unwrap();

    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_millis(500), client.read(&mut buf))
        .await
        .expect("monitor should reject the task within a few ticks")
        .unwrap();
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.starts_with("HTTP/1.1 405"));
}

#[tokio::test]
async fn targeted_node_routing_requires_admin_bearer() {
    let intake_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let intake_addr = intake_listener.local_addr().unwrap();

    let keystore = Arc::new(SqliteKeyStore::open(":memory:").unwrap());
    let client_token = keystore.insert("some-client", Role::Client).unwrap();
    let admin_token = keystore.insert("some-admin", Role::Admin).unwrap();
    let queue = Arc::new(DispatchQueue::new());

    spawn_intake(intake_listener, Arc::clone(&queue), Arc::clone(&keystore), true);

    // A Client bearer token targeting a specific node is refused (§6: node
    // targeting requires Admin).
    let mut client = TcpStream::connect(intake_addr).await.unwrap();
    let body = br#"{"model":"m1"}"#;
    let request = format!(
        "POST /api/generate HTTP/1.1\r\nauthorization: Bearer {client_token}\r\nnode: w1\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    client.write_all(body).await.unwrap();
    let mut buf = [0u8; 256];
    let n = client.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 403"));

    // The same request with an Admin bearer token is admitted (queued by node).
    let mut admin_client = TcpStream::connect(intake_addr).await.unwrap();
    let request = format!(
        "POST /api/generate HTTP/1.1\r\nauthorization: Bearer {admin_token}\r\nnode: w1\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    admin_client.write_all(request.as_bytes()).await.unwrap();
    admin_client.write_all(body).await.unwrap();

    // Give intake a moment to admit it, then confirm it landed in the
    // node-keyed sub-queue rather than being rejected.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.lengths().get("Node:w1").copied().unwrap_or(0), 1);
}

#[tokio::test]
async fn idle_polling_worker_is_closed_after_timeout() {
    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker_listener.local_addr().unwrap();

    let keystore = Arc::new(SqliteKeyStore::open(":memory:").unwrap());
    let token = keystore.insert("w1", Role::Worker).unwrap();
    let queue = Arc::new(DispatchQueue::new());
    let roster = Arc::new(Roster::new());

    spawn_worker_acceptor(worker_listener, Arc::clone(&keystore), Arc::clone(&queue), Arc::clone(&roster));
    spawn_monitor(Arc::clone(&roster), Arc::clone(&queue), Duration::from_millis(10), Duration::from_millis(40));

    let mut worker = TcpStream::connect(worker_addr).await.unwrap();
    worker
        .write_all(format!("AUTH /{token};nonce1 HIVE\r\n\r\n").as_bytes())
        .await
        .unwrap();
    // One POLL with nothing queued: status becomes Polling and stays idle
    // from here on, so the Monitor's polling timeout applies to it.
    worker.write_all(b"POLL /model1 HIVE\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 64];
    let n = worker.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("PONG"));

    // Past the 40ms polling timeout, the Monitor should request_close() this
    // session, which the dispatch loop observes and the socket closes.
    let n = tokio::time::timeout(Duration::from_millis(500), worker.read(&mut buf))
        .await
        .expect("monitor should close the idle session")
        .unwrap();
    assert_eq!(n, 0, "expected EOF once the session is closed");
}

#[tokio::test]
async fn worker_stuck_mid_proxy_is_closed_after_working_timeout() {
    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let intake_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker_listener.local_addr().unwrap();
    let intake_addr = intake_listener.local_addr().unwrap();

    let keystore = Arc::new(SqliteKeyStore::open(":memory:").unwrap());
    let token = keystore.insert("w1", Role::Worker).unwrap();
    let queue = Arc::new(DispatchQueue::new());
    let roster = Arc::new(Roster::new());

    spawn_worker_acceptor(worker_listener, Arc::clone(&keystore), Arc::clone(&queue), Arc::clone(&roster));
    spawn_intake(intake_listener, Arc::clone(&queue), Arc::clone(&keystore), false);
    spawn_monitor_with_working_timeout(
        Arc::clone(&roster),
        Arc::clone(&queue),
        Duration::from_millis(10),
        Duration::from_millis(40),
    );

    let mut worker = TcpStream::connect(worker_addr).await.unwrap();
    worker
        .write_all(format!("AUTH /{token};nonce1 HIVE\r\n\r\n").as_bytes())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let body = br#"{"model":"model1"}"#;
    let mut client = TcpStream::connect(intake_addr).await.unwrap();
    let request = format!(
        "POST /api/generate HTTP/1.1\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    client.write_all(body).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Worker pulls the task but never replies: it stops reading from its
    // backend, leaving the session blocked on the worker's response head.
    worker.write_all(b"POLL /model1 HIVE\r\n\r\n").await.unwrap();

    // Past the 40ms working timeout, the Monitor should request_close() this
    // session, which must unblock the in-flight proxy, answer the client
    // with a synthesized Bad Gateway (no response headers were ever written),
    // and close the worker socket.
    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_millis(500), client.read(&mut buf))
        .await
        .expect("monitor should close the stuck session and answer the client")
        .unwrap();
    assert!(n > 0, "client should receive a synthesized response, not hang");
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 502"));

    let n = tokio::time::timeout(Duration::from_millis(500), worker.read(&mut buf))
        .await
        .expect("monitor should close the stuck worker session")
        .unwrap();
    assert_eq!(n, 0, "expected EOF once the session is closed");
}
