//! Tests for server runtime behaviour.

use std::{
    io,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use rstest::rstest;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::yield_now,
    time::{Duration, Instant, advance, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AcceptLoopOptions, BackoffConfig, MockAcceptListener, accept_loop};
use crate::{
    event::EventKind,
    plugin::Plugin,
    server::{
        Server,
        test_util::{bind_server, free_listener, listener_addr},
    },
};

fn options(
    token: &CancellationToken,
    tracker: &TaskTracker,
    backoff: BackoffConfig,
) -> AcceptLoopOptions {
    AcceptLoopOptions {
        shutdown: token.clone(),
        tracker: tracker.clone(),
        backoff,
        read_buffer_capacity: 1024,
    }
}

#[rstest]
#[tokio::test]
async fn run_with_immediate_shutdown(free_listener: std::net::TcpListener) {
    let runner = bind_server(Server::new(), free_listener);
    let shutdown_future = async { tokio::time::sleep(Duration::from_millis(10)).await };
    let result = timeout(
        Duration::from_millis(1000),
        runner.run_with_shutdown(shutdown_future),
    )
    .await;
    assert!(result.expect("server did not finish in time").is_ok());
}

#[rstest]
#[tokio::test]
async fn listening_event_precedes_ready_signal(free_listener: std::net::TcpListener) {
    let server = Server::new();
    let expected = free_listener.local_addr().expect("listener address");
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    server.events().on(EventKind::ServerListening, 0, move |event| {
        if let crate::event::EventPayload::ServerListening { local_addr } = event.payload() {
            *sink.lock().expect("sink lock") = *local_addr;
        }
        Ok(())
    });

    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let runner = bind_server(server, free_listener).ready_signal(ready_tx);
    let handle = tokio::spawn(runner.run_with_shutdown(async {
        let _ = shutdown_rx.await;
    }));

    ready_rx.await.expect("ready signal");
    assert_eq!(*seen.lock().expect("sink lock"), Some(expected));

    let _ = shutdown_tx.send(());
    handle
        .await
        .expect("server join error")
        .expect("server run failed");
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listening_event_precedes_queued_connections(free_listener: std::net::TcpListener) {
    let addr = listener_addr(&free_listener);
    // Sits in the accept backlog before the server starts.
    let queued = std::net::TcpStream::connect(addr).expect("connect queued client");

    let server = Server::new();
    let (tx, mut kinds) = mpsc::unbounded_channel();
    for kind in [EventKind::ServerListening, EventKind::Connected] {
        let tx = tx.clone();
        server.events().on(kind, 0, move |event| {
            let _ = tx.send(event.kind());
            Ok(())
        });
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let runner = bind_server(server, free_listener).workers(4);
    let handle = tokio::spawn(runner.run_with_shutdown(async {
        let _ = shutdown_rx.await;
    }));

    let first = timeout(Duration::from_secs(5), kinds.recv()).await;
    let second = timeout(Duration::from_secs(5), kinds.recv()).await;
    assert_eq!(first.expect("first event in time"), Some(EventKind::ServerListening));
    assert_eq!(second.expect("second event in time"), Some(EventKind::Connected));

    drop(queued);
    let _ = shutdown_tx.send(());
    handle
        .await
        .expect("server join error")
        .expect("server run failed");
}

struct CountingPlugin {
    unloads: Arc<AtomicUsize>,
}

impl Plugin for CountingPlugin {
    fn id(&self) -> &str { "counting" }

    fn on_unload(&self, _server: &Server) { self.unloads.fetch_add(1, Ordering::SeqCst); }
}

#[rstest]
#[tokio::test]
async fn plugins_are_unloaded_after_shutdown(free_listener: std::net::TcpListener) {
    let server = Server::new();
    let unloads = Arc::new(AtomicUsize::new(0));
    server
        .load_plugin(Arc::new(CountingPlugin {
            unloads: Arc::clone(&unloads),
        }))
        .expect("load plugin");

    let runner = bind_server(server.clone(), free_listener);
    runner
        .run_with_shutdown(async {})
        .await
        .expect("server run failed");

    assert_eq!(unloads.load(Ordering::SeqCst), 1);
    assert!(server.plugins().is_empty());
}

#[rstest]
#[tokio::test]
async fn accept_loop_stops_on_shutdown_signal() {
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let listener = Arc::new(
        TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener"),
    );

    tracker.spawn(accept_loop(
        listener,
        Server::new(),
        options(&token, &tracker, BackoffConfig::default()),
    ));

    token.cancel();
    tracker.close();

    let result = timeout(Duration::from_millis(100), tracker.wait()).await;
    assert!(result.is_ok());
}

/// Creates a mock listener that always fails, recording when it was called.
fn failing_listener(calls: &Arc<Mutex<Vec<Instant>>>, num_calls: usize) -> MockAcceptListener {
    let mut listener = MockAcceptListener::new();
    let call_log = Arc::clone(calls);
    listener
        .expect_accept()
        .returning(move || {
            let call_log = Arc::clone(&call_log);
            Box::pin(async move {
                call_log.lock().expect("lock").push(Instant::now());
                Err(io::Error::other("mock error"))
            })
        })
        .times(num_calls);
    listener
        .expect_local_addr()
        .returning(|| Ok("127.0.0.1:0".parse().expect("addr parse")))
        .times(num_calls);
    listener
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn accept_failures_back_off_exponentially() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let listener = Arc::new(failing_listener(&calls, 4));
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let backoff = BackoffConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    };

    tracker.spawn(accept_loop(
        listener,
        Server::new(),
        options(&token, &tracker, backoff),
    ));
    yield_now().await;
    assert_eq!(calls.lock().expect("lock").len(), 1);

    for ms in [5, 10, 20] {
        advance(Duration::from_millis(ms)).await;
        yield_now().await;
    }

    token.cancel();
    tracker.close();
    tracker.wait().await;

    let calls = calls.lock().expect("lock");
    let intervals: Vec<_> = calls
        .windows(2)
        .map(|pair| pair[1].duration_since(pair[0]))
        .collect();
    assert_eq!(
        intervals,
        [
            Duration::from_millis(5),
            Duration::from_millis(10),
            Duration::from_millis(20),
        ]
    );
}

#[rstest]
#[case(Duration::from_millis(5), Duration::from_millis(10))]
#[case(Duration::from_millis(15), Duration::from_millis(20))]
#[case(Duration::from_millis(20), Duration::from_millis(20))]
fn next_delay_doubles_up_to_cap(#[case] current: Duration, #[case] expected: Duration) {
    let backoff = BackoffConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    };
    assert_eq!(backoff.next_delay(current), expected);
}
