//! Acceptor/connector behaviour on a shared channel group

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ncproxy_transport::{
    AsyncIoService, CloseMode, IoHandler, IoSession, TransportError, TransportResult,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;

/// Echoes everything back until the peer closes.
struct EchoHandler {
    sessions: AtomicUsize,
}

#[async_trait]
impl IoHandler for EchoHandler {
    async fn session_created(&self, session: IoSession) -> TransportResult<()> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        let mut stream = session.into_stream();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n]).await?;
        }
    }
}

/// Holds the connection open and never answers.
struct SilentHandler;

#[async_trait]
impl IoHandler for SilentHandler {
    async fn session_created(&self, session: IoSession) -> TransportResult<()> {
        let _stream = session.into_stream();
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acceptor_and_connector_share_group() {
    init_logging();

    let service = AsyncIoService::new(Handle::current()).unwrap();
    let handler = Arc::new(EchoHandler {
        sessions: AtomicUsize::new(0),
    });
    let acceptor = service.create_acceptor(handler.clone());
    let addr = acceptor.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    assert_eq!(acceptor.local_addr(), Some(addr));

    let connector = service.create_connector();
    let mut stream = connector.connect(addr).await.unwrap().into_stream();

    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    assert_eq!(handler.sessions.load(Ordering::SeqCst), 1);

    drop(stream);
    acceptor.unbind().await.unwrap();
    service.close(CloseMode::Immediate).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_frees_port_and_rejects_connects() {
    init_logging();

    let service = AsyncIoService::new(Handle::current()).unwrap();
    let acceptor = service.create_acceptor(Arc::new(SilentHandler));
    let addr = acceptor.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

    acceptor.unbind().await.unwrap();
    service.close(CloseMode::Immediate).await;

    // The port can be taken again right away
    let rebound = tokio::net::TcpListener::bind(addr).await;
    assert!(rebound.is_ok(), "port should be free after close");

    let result = service.create_connector().connect(addr).await;
    assert!(matches!(result, Err(TransportError::GroupShutdown)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_terminates_live_sessions_within_bound() {
    init_logging();

    let service = AsyncIoService::new(Handle::current()).unwrap();
    let acceptor = service.create_acceptor(Arc::new(SilentHandler));
    let addr = acceptor.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(tokio::net::TcpStream::connect(addr).await.unwrap());
    }
    // Let the acceptor hand the sessions off
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.group().active_tasks() >= 4);

    let started = std::time::Instant::now();
    service.close(CloseMode::Immediate).await;
    assert!(started.elapsed() < ncproxy_transport::CLOSE_TIMEOUT);
    assert!(service.group().is_terminated());

    // Server side hung up on every client
    for mut client in clients {
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should see the close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bind_conflict_reports_bind_error() {
    init_logging();

    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let service = AsyncIoService::new(Handle::current()).unwrap();
    let acceptor = service.create_acceptor(Arc::new(SilentHandler));

    let result = acceptor.bind(addr).await;
    match result {
        Err(TransportError::Bind { port, .. }) => assert_eq!(port, addr.port()),
        other => panic!("expected bind error, got {:?}", other.map(|_| ())),
    }
    assert!(!acceptor.is_bound());

    service.close(CloseMode::Immediate).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_bind_is_rejected() {
    let service = AsyncIoService::new(Handle::current()).unwrap();
    let acceptor = service.create_acceptor(Arc::new(SilentHandler));
    let addr = acceptor.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let result = acceptor.bind("127.0.0.1:0".parse().unwrap()).await;
    assert!(matches!(result, Err(TransportError::AlreadyBound(a)) if a == addr));

    service.close(CloseMode::Immediate).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_refused_is_reported() {
    let service = AsyncIoService::new(Handle::current()).unwrap();

    // Grab a free port, then release it so nothing listens there
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let result = service.create_connector().connect(addr).await;
    assert!(matches!(result, Err(TransportError::Connect { address, .. }) if address == addr));

    service.close(CloseMode::Immediate).await;
}

/// A listener whose accept queue is full: further handshakes go unanswered.
async fn saturated_listener() -> (tokio::net::TcpListener, Vec<tokio::net::TcpStream>) {
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    loop {
        assert!(queued.len() < 16, "accept queue never filled up");
        let attempt =
            tokio::time::timeout(Duration::from_millis(200), tokio::net::TcpStream::connect(addr));
        match attempt.await {
            Ok(Ok(stream)) => queued.push(stream),
            _ => break,
        }
    }
    (listener, queued)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unanswered_connect_times_out() {
    init_logging();

    let (listener, _queued) = saturated_listener().await;
    let addr = listener.local_addr().unwrap();

    let service = AsyncIoService::new(Handle::current()).unwrap();
    let connector = service
        .create_connector()
        .with_connect_timeout(Duration::from_millis(500));
    assert_eq!(connector.connect_timeout(), Duration::from_millis(500));

    let started = std::time::Instant::now();
    let result = connector.connect(addr).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    match result {
        Err(TransportError::Connect { address, source }) => {
            assert_eq!(address, addr);
            assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
        }
        other => panic!("expected connect timeout, got {:?}", other.map(|_| ())),
    }

    service.close(CloseMode::Immediate).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_connect_timeout() {
    let service = AsyncIoService::new(Handle::current()).unwrap();
    assert_eq!(
        service.create_connector().connect_timeout(),
        ncproxy_transport::DEFAULT_CONNECT_TIMEOUT
    );
    service.close(CloseMode::Immediate).await;
}
