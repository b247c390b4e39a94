//! Subprocess lifecycle against real (tiny) child processes.

#![cfg(unix)]

use std::time::{Duration, Instant};

use pmoproc::{HandlerStub, Manager, Subprocess};

fn sleeper_stub() -> HandlerStub {
    // The appended address and token land in $0/$1 and are ignored.
    HandlerStub::new(["/bin/sh", "-c", "sleep 30"])
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_terminates_quickly() {
    let mut subprocess = Subprocess::new(sleeper_stub());
    subprocess.start("127.0.0.1:1").unwrap();

    // Freshly started, not yet registered: within the registration
    // window nothing is wrong.
    assert!(!subprocess.erroneous_state_requires_stop());

    let before = Instant::now();
    subprocess.stop().await;
    // SIGTERM is enough for a shell; the kill escalation must not be
    // needed.
    assert!(before.elapsed() < Duration::from_secs(4));
}

#[tokio::test(flavor = "multi_thread")]
async fn an_exited_child_is_detected_as_erroneous() {
    let mut subprocess = Subprocess::new(HandlerStub::new(["/bin/sh", "-c", "exit 0"]));
    subprocess.start("127.0.0.1:1").unwrap();

    // Give the stderr reader a moment to hit EOF.
    let deadline = Instant::now() + Duration::from_secs(3);
    while !subprocess.erroneous_state_requires_stop() {
        assert!(Instant::now() < deadline, "exit never detected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    subprocess.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn manager_tracks_running_handlers_by_uri() {
    let manager = Manager::new("127.0.0.1:0", "test manager");
    manager.add_handler("file", sleeper_stub());
    manager.start().await.unwrap();

    let stub = manager.uri_handler_stub("file:///tmp/feed.xml").unwrap();
    let id = manager.start_handler(stub).await.unwrap();

    assert_eq!(
        manager
            .lookup_running_handler_for_uri("file:///tmp/feed.xml")
            .await,
        Some(id)
    );
    assert!(manager
        .lookup_running_handler_for_uri("file:///elsewhere.xml")
        .await
        .is_none());

    manager.stop().await;
    assert!(manager
        .lookup_running_handler_for_uri("file:///tmp/feed.xml")
        .await
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn handlers_cannot_start_on_a_stopped_manager() {
    let manager = Manager::new("127.0.0.1:0", "test manager");
    manager.start().await.unwrap();
    manager.stop().await;
    assert!(manager.start_handler(sleeper_stub()).await.is_err());
}
