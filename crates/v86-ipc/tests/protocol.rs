use std::{
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    net::UnixListener,
    sync::oneshot,
    time::{self, Instant},
};
use v86_cpu::CpuState;
use v86_ipc::{
    accept_unix, read_frame, write_frame, ChannelId, ClientConfig, ClientError, Handled,
    HelperSpawner, MemoryTransport, Request, ServeExit, Server, TaskClient, Transport,
    TransportError, UnixTransport,
};
use v86_task::{
    relocate::PointerField,
    testing::{fabricated_engine, info_block_task, NullPorts, OEM_STRING},
    vbe::InfoBlock,
    Task, TaskFlags,
};

fn config() -> ClientConfig {
    ClientConfig {
        helper: None,
        ..Default::default()
    }
}

fn server() -> Server<v86_cpu::EmulatorBackend<NullPorts>> {
    Server::new(fabricated_engine(), ChannelId::V86D)
}

/// Runs `client_side` against a fabricated engine serving `requests`, then
/// stops the server.
async fn with_server<F, T>(
    requests: tokio::sync::mpsc::UnboundedReceiver<Request>,
    client_side: F,
) -> (T, ServeExit)
where
    F: Future<Output = T>,
{
    let mut server = server();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let shutdown = async {
        let _ = stop_rx.await;
    };
    let client_side = async {
        let out = client_side.await;
        let _ = stop_tx.send(());
        out
    };
    let (out, exit) = tokio::join!(client_side, server.run(requests, shutdown));
    (out, exit)
}

fn field(buf: &[u8], field: PointerField) -> u32 {
    let at = field.offset();
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

#[tokio::test]
async fn info_block_round_trip_through_memory_transport() {
    let (transport, requests) = MemoryTransport::channel();
    let client = TaskClient::new(config(), transport);
    let mut task = info_block_task(512);

    let (result, exit) = with_server(requests, client.execute(&mut task)).await;
    result.unwrap();
    assert_eq!(exit, ServeExit::Shutdown);

    assert_eq!(task.regs.ax() & 0xFF, 0x4F);
    assert_eq!(field(&task.buf, PointerField::ModeList), 0x22);
    assert_eq!(field(&task.buf, PointerField::OemString), 0x100);
    let ib = InfoBlock::parse(&task.buf).unwrap();
    assert_eq!(ib.string(PointerField::OemString), Some(OEM_STRING));
}

#[tokio::test]
async fn several_calls_reuse_one_client() {
    let (transport, requests) = MemoryTransport::channel();
    let client = TaskClient::new(config(), transport);

    let (results, _) = with_server(requests, async {
        let mut out = Vec::new();
        for mode in [0x0101u32, 0x0112, 0x0118] {
            let mut task = Task::new(
                TaskFlags::BUF_ES_DI | TaskFlags::BUF_RETURN,
                CpuState {
                    eax: 0x4F01,
                    ecx: mode,
                    ..Default::default()
                },
                vec![0; 256],
            );
            client.execute(&mut task).await.unwrap();
            out.push((task.regs.ax(), task.regs.cx(), task.buf[25]));
        }
        out
    })
    .await;

    assert_eq!(
        results,
        vec![(0x4F, 0x0101, 32), (0x4F, 0x0112, 32), (0x4F, 0x0118, 32)]
    );
}

#[tokio::test]
async fn engine_failure_is_reported_without_waiting() {
    let (transport, requests) = MemoryTransport::channel();
    let client = TaskClient::new(config(), transport);
    let mut task = info_block_task(64);

    let start = Instant::now();
    let (result, _) = with_server(requests, client.execute(&mut task)).await;
    let err = result.unwrap_err();
    assert!(matches!(err, ClientError::Engine { .. }));
    assert_eq!(err.status(), libc::EINVAL);
    assert!(start.elapsed() < client.config().timeout);
    // The caller's task is left untouched.
    assert_eq!(task.regs.ax(), 0x4F00);
}

/// Accepts everything and never answers.
#[derive(Debug, Default)]
struct SilentTransport {
    sent: AtomicUsize,
}

impl Transport for SilentTransport {
    async fn send(&self, _frame: Vec<u8>) -> Result<(), TransportError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn silent_engine_times_out_at_configured_limit() {
    let client = TaskClient::new(
        ClientConfig {
            timeout: Duration::from_secs(10),
            ..config()
        },
        SilentTransport::default(),
    );
    let mut task = info_block_task(512);

    let start = Instant::now();
    let err = client.execute(&mut task).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert_eq!(err.status(), libc::ETIMEDOUT);
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(start.elapsed() < Duration::from_secs(10) + Duration::from_millis(100));
    assert_eq!(client.transport().sent.load(Ordering::SeqCst), 1);
    assert_eq!(&task.buf[..4], b"VBE2");
}

#[tokio::test(start_paused = true)]
async fn abandoned_call_frees_its_slot() {
    let client = TaskClient::new(
        ClientConfig {
            table_capacity: 1,
            ..config()
        },
        SilentTransport::default(),
    );
    let mut task = info_block_task(512);

    let gave_up = time::timeout(Duration::from_secs(1), client.execute(&mut task)).await;
    assert!(gave_up.is_err());

    // The only slot is free again, so the next call reaches the engine and
    // waits out its own timeout.
    let err = client.execute(&mut task).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }), "{err}");
    assert_eq!(client.transport().sent.load(Ordering::SeqCst), 2);
}

/// Reports no listener until the flag is set.
struct DormantTransport {
    listening: Arc<AtomicBool>,
    attempts: AtomicUsize,
    inner: MemoryTransport,
}

impl Transport for DormantTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.listening.load(Ordering::SeqCst) {
            return Err(TransportError::NoListener);
        }
        self.inner.send(frame).await
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        self.inner.recv().await
    }
}

struct FlagSpawner {
    starts: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    brings_up_engine: bool,
}

impl HelperSpawner for FlagSpawner {
    async fn spawn(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.brings_up_engine {
            self.starts.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn dormant(brings_up_engine: bool) -> (
    TaskClient<DormantTransport, FlagSpawner>,
    tokio::sync::mpsc::UnboundedReceiver<Request>,
    Arc<AtomicUsize>,
) {
    let (inner, requests) = MemoryTransport::channel();
    let listening = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = DormantTransport {
        listening: Arc::clone(&listening),
        attempts: AtomicUsize::new(0),
        inner,
    };
    let spawner = FlagSpawner {
        starts: listening,
        calls: Arc::clone(&calls),
        brings_up_engine,
    };
    (
        TaskClient::with_spawner(config(), transport, spawner),
        requests,
        calls,
    )
}

#[tokio::test]
async fn missing_engine_is_started_and_request_resent() {
    let (client, requests, calls) = dormant(true);
    let mut task = info_block_task(512);

    let (result, _) = with_server(requests, client.execute(&mut task)).await;
    result.unwrap();
    assert_eq!(task.regs.ax(), 0x004F);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.transport().attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn resend_happens_exactly_once() {
    let (client, _requests, calls) = dormant(false);
    let mut task = info_block_task(512);

    let err = client.execute(&mut task).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::NoListener)
    ));
    assert_eq!(err.status(), libc::ESRCH);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.transport().attempts.load(Ordering::SeqCst), 2);

    // The failed request's slot was retired, so the next one proceeds.
    let err = client.execute(&mut task).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
}

#[tokio::test]
async fn unix_socket_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v86d.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (requests, accept) = accept_unix(listener);

    let client = TaskClient::new(config(), UnixTransport::new(&path));
    let mut first = info_block_task(1024);
    let mut second = info_block_task(512);

    let (results, exit) = with_server(requests, async {
        let a = client.execute(&mut first).await;
        let b = client.execute(&mut second).await;
        (a, b)
    })
    .await;
    accept.abort();

    results.0.unwrap();
    results.1.unwrap();
    assert_eq!(exit, ServeExit::Shutdown);
    assert_eq!(field(&first.buf, PointerField::OemVendorName), 512);
    assert_eq!(field(&second.buf, PointerField::OemVendorName), 0);
}

/// Accepts one connection, answers one request, then hangs up and stops
/// listening, as an engine that exits would.
async fn serve_once(server: &mut Server<v86_cpu::EmulatorBackend<NullPorts>>, listener: UnixListener) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let frame = read_frame(&mut stream).await.unwrap().unwrap();
    match server.handle_frame(&frame) {
        Handled::Reply(reply) => write_frame(&mut stream, &reply).await.unwrap(),
        other => panic!("expected a reply, got {other:?}"),
    }
}

/// Starts a fresh listener on the socket path and hands it to the test.
struct RestartSpawner {
    path: PathBuf,
    started: Mutex<Option<oneshot::Sender<UnixListener>>>,
    calls: Arc<AtomicUsize>,
}

impl HelperSpawner for RestartSpawner {
    async fn spawn(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path).unwrap();
        if let Some(started) = self.started.lock().unwrap().take() {
            let _ = started.send(listener);
        }
        Ok(())
    }
}

#[tokio::test]
async fn engine_restart_is_spawned_once_and_reached() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v86d.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let (started_tx, started_rx) = oneshot::channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let client = TaskClient::with_spawner(
        config(),
        UnixTransport::new(&path),
        RestartSpawner {
            path: path.clone(),
            started: Mutex::new(Some(started_tx)),
            calls: Arc::clone(&calls),
        },
    );
    let mut server = server();

    let mut first = info_block_task(512);
    let (result, ()) = tokio::join!(client.execute(&mut first), serve_once(&mut server, listener));
    result.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The engine is gone: the cached connection is dead and nothing listens.
    let mut second = info_block_task(512);
    let (result, ()) = tokio::join!(client.execute(&mut second), async {
        let listener = started_rx.await.unwrap();
        serve_once(&mut server, listener).await;
    });
    result.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.regs.ax(), 0x004F);
}
