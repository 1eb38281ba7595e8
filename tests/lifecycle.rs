//! Server lifecycle tests over real sockets.
//!
//! Each test binds an ephemeral loopback port, drives the server with reqwest
//! and checks how it stops.
use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use gatehouse::config::HttpConfig;
use gatehouse::http::{
    drain_on, HttpServer, Lifecycle, RequestContext, ServerError, ShutdownError, StopCause,
};
use gatehouse::tls::{ensure_certificate, CertificateOrigin};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LOOPBACK: &str = "127.0.0.1:0";
const STARTUP: Duration = Duration::from_secs(5);

/// Routes used by every test:
/// - `/ping` answers immediately
/// - `/park` reports its context, then waits for it to be cancelled
/// - `/slow` reports its context, then sleeps far longer than any test
fn router(contexts: mpsc::UnboundedSender<RequestContext>) -> Router {
    let park = contexts.clone();
    let slow = contexts;
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route(
            "/park",
            get(move |ctx: RequestContext| {
                let tx = park.clone();
                async move {
                    let _ = tx.send(ctx.clone());
                    ctx.cancelled().await;
                    "cancelled"
                }
            }),
        )
        .route(
            "/slow",
            get(move |ctx: RequestContext| {
                let tx = slow.clone();
                async move {
                    let _ = tx.send(ctx);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    "slow"
                }
            }),
        )
}

fn insecure_server() -> (HttpServer, mpsc::UnboundedReceiver<RequestContext>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = HttpServer::new(HttpConfig::insecure(LOOPBACK), router(tx), None);
    (server, rx)
}

fn spawn(
    server: &HttpServer,
    scope: &CancellationToken,
) -> JoinHandle<Result<StopCause, ServerError>> {
    let server = server.clone();
    let scope = scope.clone();
    tokio::spawn(async move { server.start(scope).await })
}

async fn listening(server: &HttpServer) -> SocketAddr {
    tokio::time::timeout(STARTUP, server.local_addr())
        .await
        .expect("server did not start listening")
        .expect("server stopped before listening")
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

async fn get_text(url: String) -> String {
    client().get(url).send().await.unwrap().text().await.unwrap()
}

async fn stopped(
    running: JoinHandle<Result<StopCause, ServerError>>,
) -> Result<StopCause, ServerError> {
    tokio::time::timeout(STARTUP, running)
        .await
        .expect("server did not stop")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_cancellation_stops_server_without_error() {
    let (server, _rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;

    assert_eq!(server.lifecycle(), Lifecycle::Running);
    assert_eq!(get_text(format!("http://{addr}/ping")).await, "pong");

    scope.cancel();

    assert_eq!(stopped(running).await.unwrap(), StopCause::ScopeCancelled);
    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_cancellation_reaches_in_flight_request() {
    let (server, mut rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;

    // Completed before cancellation and unaffected by it
    assert_eq!(get_text(format!("http://{addr}/ping")).await, "pong");

    let request = tokio::spawn(client().get(format!("http://{addr}/park")).send());
    let ctx = rx.recv().await.unwrap();
    assert!(!ctx.is_cancelled());

    scope.cancel();

    tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
        .await
        .expect("in-flight request context was not cancelled");
    assert_eq!(stopped(running).await.unwrap(), StopCause::ScopeCancelled);
    request.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_shutdown_stops_server_without_error() {
    let (server, _rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;
    assert_eq!(get_text(format!("http://{addr}/ping")).await, "pong");

    server
        .shutdown_with_timeout(&CancellationToken::new(), STARTUP)
        .await
        .unwrap();

    assert_eq!(stopped(running).await.unwrap(), StopCause::Shutdown);
    assert!(!scope.is_cancelled());
    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_times_out_on_slow_request() {
    let (server, mut rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;

    let request = tokio::spawn(client().get(format!("http://{addr}/slow")).send());
    let ctx = rx.recv().await.unwrap();

    let err = server
        .shutdown_with_timeout(&CancellationToken::new(), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, ShutdownError::Timeout(_)), "{err}");
    assert_eq!(server.lifecycle(), Lifecycle::Running);
    assert!(!ctx.is_cancelled());

    // Escalate
    server.close();

    assert_eq!(stopped(running).await.unwrap(), StopCause::Closed);
    tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
        .await
        .expect("closed connection did not cancel its request context");
    request.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_aborts_when_parent_is_cancelled() {
    let (server, mut rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;

    let request = tokio::spawn(client().get(format!("http://{addr}/slow")).send());
    rx.recv().await.unwrap();

    let parent = CancellationToken::new();
    let canceller = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = server
        .shutdown_with_timeout(&parent, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, ShutdownError::Aborted), "{err}");

    scope.cancel();
    assert_eq!(stopped(running).await.unwrap(), StopCause::ScopeCancelled);
    request.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_failure_is_an_error() {
    let occupied = std::net::TcpListener::bind(LOOPBACK).unwrap();
    let addr = occupied.local_addr().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let server = HttpServer::new(HttpConfig::insecure(addr.to_string()), router(tx), None);

    let err = server.start(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ServerError::Bind { .. }), "{err}");
    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
    assert!(server.local_addr().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_after_bind_failure_reports_stopped() {
    let occupied = std::net::TcpListener::bind(LOOPBACK).unwrap();
    let addr = occupied.local_addr().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let server = HttpServer::new(HttpConfig::insecure(addr.to_string()), router(tx), None);

    let err = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ServerError::Bind { .. }), "{err}");

    // Quiescent already; the failure is only reported by start
    tokio::time::timeout(STARTUP, server.shutdown(&CancellationToken::new()))
        .await
        .expect("shutdown of a stopped server did not return")
        .unwrap();
    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_trigger_shuts_down_gracefully() {
    let (server, _rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;
    assert_eq!(get_text(format!("http://{addr}/ping")).await, "pong");

    let (trigger, fired) = oneshot::channel::<()>();
    let drain = drain_on(server.clone(), scope.clone(), STARTUP, async {
        let _ = fired.await;
    });
    assert_eq!(server.lifecycle(), Lifecycle::Running);

    trigger.send(()).unwrap();

    assert_eq!(stopped(running).await.unwrap(), StopCause::Shutdown);
    tokio::time::timeout(STARTUP, drain)
        .await
        .expect("drain task did not finish")
        .unwrap();
    assert!(!scope.is_cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_timeout_cancels_scope() {
    let (server, mut rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;

    let request = tokio::spawn(client().get(format!("http://{addr}/slow")).send());
    let ctx = rx.recv().await.unwrap();

    let drain = drain_on(
        server.clone(),
        scope.clone(),
        Duration::from_millis(100),
        std::future::ready(()),
    );

    assert_eq!(stopped(running).await.unwrap(), StopCause::ScopeCancelled);
    assert!(scope.is_cancelled());
    tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
        .await
        .expect("forced drain did not cancel the slow request");
    tokio::time::timeout(STARTUP, drain)
        .await
        .expect("drain task did not finish")
        .unwrap();
    request.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_exits_when_scope_is_cancelled_first() {
    let (server, _rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    listening(&server).await;

    let drain = drain_on(
        server.clone(),
        scope.clone(),
        STARTUP,
        std::future::pending::<()>(),
    );

    scope.cancel();

    tokio::time::timeout(STARTUP, drain)
        .await
        .expect("drain task outlived the scope")
        .unwrap();
    assert_eq!(stopped(running).await.unwrap(), StopCause::ScopeCancelled);
}

// Single-threaded so the runtime's task count is exact.
#[tokio::test]
async fn run_bind_failure_leaves_no_task_behind() {
    let occupied = std::net::TcpListener::bind(LOOPBACK).unwrap();
    let addr = occupied.local_addr().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let metrics = tokio::runtime::Handle::current().metrics();
    let before = metrics.num_alive_tasks();

    let err = gatehouse::run(
        HttpConfig::insecure(addr.to_string()),
        router(tx),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(
        matches!(err, gatehouse::Error::Server(ServerError::Bind { .. })),
        "{err}"
    );
    assert_eq!(metrics.num_alive_tasks(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_cannot_be_restarted() {
    let (server, _rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    listening(&server).await;

    let second = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(second, ServerError::AlreadyStarted));

    scope.cancel();
    stopped(running).await.unwrap();

    let third = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(third, ServerError::AlreadyStarted));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_before_start_prevents_serving() {
    let (server, _rx) = insecure_server();

    server.shutdown(&CancellationToken::new()).await.unwrap();

    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
    let err = server.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ServerError::AlreadyStarted));
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_without_certificate_is_rejected() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let config = HttpConfig {
        listen: LOOPBACK.to_string(),
        ..HttpConfig::default()
    };
    let server = HttpServer::new(config, router(tx), None);

    let err = server.start(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, ServerError::CertificateUnresolved), "{err}");
    assert_eq!(server.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_https_with_generated_certificate() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = HttpConfig {
        listen: LOOPBACK.to_string(),
        hostname: "gate.test".to_string(),
        ..HttpConfig::default()
    };
    let material = ensure_certificate(&config, &dir.path().join("self-signed"))
        .unwrap()
        .unwrap();
    assert_eq!(material.origin(), CertificateOrigin::Generated);

    let (tx, _rx) = mpsc::unbounded_channel();
    let server = HttpServer::new(config, router(tx), Some(material));
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;

    assert_eq!(get_text(format!("https://{addr}/ping")).await, "pong");
    assert!(client()
        .get(format!("http://{addr}/ping"))
        .send()
        .await
        .is_err());

    scope.cancel();
    assert_eq!(stopped(running).await.unwrap(), StopCause::ScopeCancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_contexts_are_retired_under_load() {
    let (server, _rx) = insecure_server();
    let scope = CancellationToken::new();
    let running = spawn(&server, &scope);
    let addr = listening(&server).await;
    let client = client();

    let requests: Vec<_> = (0..64)
        .map(|_| {
            let request = client.get(format!("http://{addr}/ping")).send();
            tokio::spawn(async move { request.await.unwrap().text().await.unwrap() })
        })
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap(), "pong");
    }

    assert_eq!(server.in_flight(), 0);
    assert!(!scope.is_cancelled());

    scope.cancel();
    stopped(running).await.unwrap();
}
