//! End-to-end graceful shutdown tests.
//!
//! 1. An in-flight request outlives the shutdown deadline and is
//!    force-closed.
//! 2. A WebSocket-tagged connection receives the close frame.
//! 3. A handler waiting on its request signal is released with the
//!    shutdown error and the propagated deadline.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use trellis_core::ConnectionKind;
use trellis_server::{
    App, MemoryConn, Registrar, ServerResult, ShutdownConfig, ShutdownContext, ShutdownError,
    WEBSOCKET_CLOSE_FRAME,
};

async fn serve(app: &App) -> (SocketAddr, JoinHandle<ServerResult<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = app.clone();
    (addr, tokio::spawn(async move { server.listener(listener).await }))
}

async fn send_get(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let head = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(head.as_bytes()).await.unwrap();
    stream
}

#[tokio::test]
async fn test_deadline_exceeded_force_closes() {
    let app = App::default();
    let entered = Arc::new(Notify::new());
    let signal = Arc::clone(&entered);
    app.get("/slow", move |c| {
        let signal = Arc::clone(&signal);
        Box::pin(async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_secs(10)).await;
            c.send_string("too late")
        })
    })
    .unwrap();

    let posts = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&posts);
    app.on_post_shutdown(move |err| {
        let captured = Arc::clone(&captured);
        async move {
            captured.lock().push(err);
            Ok(())
        }
    });

    let (addr, task) = serve(&app).await;
    let mut client = send_get(addr, "/slow").await;
    entered.notified().await;

    let forced = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&forced);
    let config = ShutdownConfig::new()
        .drain_interval(Duration::from_millis(20))
        .on_force_close(move |remaining| seen.lock().push(remaining));
    let ctx = ShutdownContext::with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let result = app.shutdown_with_config(&ctx, config).await;
    assert_eq!(result, Err(ShutdownError::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(forced.lock().len(), 1);
    assert!(forced.lock()[0] >= 1);
    assert_eq!(*posts.lock(), vec![Some(ShutdownError::DeadlineExceeded)]);

    let telemetry = app.last_shutdown_telemetry().unwrap();
    assert!(telemetry.timed_out);
    assert!(telemetry.forced_conns >= 1);
    assert_eq!(telemetry.initial_conns, telemetry.drained_conns + telemetry.forced_conns);
    assert_eq!(app.active_connections(), 0);

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "force-closed socket reaches end of stream");
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_websocket_close_frame() {
    let app = App::default();
    let (answering, mut answering_client) = MemoryConn::pair(64);
    let (silent, mut silent_client) = MemoryConn::pair(64);
    let answering = app.track_connection(Arc::new(answering));
    let silent = app.track_connection(Arc::new(silent));
    answering.set_kind(ConnectionKind::WebSocket);
    silent.set_kind(ConnectionKind::WebSocket);

    let echo = tokio::spawn(async move {
        let mut frame = [0u8; 4];
        answering_client.read_exact(&mut frame).await.unwrap();
        answering_client.write_all(&frame).await.unwrap();
        frame
    });

    let results = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&results);
    let config = ShutdownConfig::new()
        .websocket_close_timeout(Duration::from_millis(200))
        .on_websocket_close(move |id, err| seen.lock().push((id, err)));
    app.shutdown_with_config(&ShutdownContext::background(), config)
        .await
        .unwrap();

    assert_eq!(echo.await.unwrap(), WEBSOCKET_CLOSE_FRAME);
    let mut frame = [0u8; 4];
    silent_client.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, [0x88, 0x02, 0x03, 0xE9]);

    let mut results = results.lock().clone();
    results.sort_by_key(|(id, _)| *id);
    assert_eq!(
        results,
        vec![
            (answering.id(), None),
            (silent.id(), Some(ShutdownError::WebSocketCloseTimeout)),
        ]
    );

    let telemetry = app.last_shutdown_telemetry().unwrap();
    assert_eq!(telemetry.web_sockets_closed, 1);
    assert_eq!(telemetry.forced_conns, 1);
    assert_eq!(app.active_connections(), 0);
}

#[tokio::test]
async fn test_request_signal_carries_deadline() {
    let app = App::default();
    let observed = Arc::new(Mutex::new(None));
    let record = Arc::clone(&observed);
    let entered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&entered);
    app.get("/wait", move |c| {
        let record = Arc::clone(&record);
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let done = c.done();
            done.await;
            let err = c.err().map(|e| e.is_request_shutdown());
            *record.lock() = Some((err, c.deadline()));
            c.send_string("released")
        })
    })
    .unwrap();

    let (addr, task) = serve(&app).await;
    let mut client = send_get(addr, "/wait").await;
    while entered.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let request_deadline = Instant::now() + Duration::from_secs(1);
    let config = ShutdownConfig::new()
        .drain_interval(Duration::from_millis(20))
        .request_context(ShutdownContext::with_deadline(request_deadline));
    let started = Instant::now();
    app.shutdown_with_config(&ShutdownContext::with_timeout(Duration::from_secs(5)), config)
        .await
        .unwrap();
    assert!(started.elapsed() <= Duration::from_secs(2));

    assert_eq!(*observed.lock(), Some((Some(true), Some(request_deadline))));

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("released"));

    let telemetry = app.last_shutdown_telemetry().unwrap();
    assert_eq!(telemetry.forced_conns, 0);
    assert_eq!(telemetry.drained_conns, 1);
    task.await.unwrap().unwrap();
}
