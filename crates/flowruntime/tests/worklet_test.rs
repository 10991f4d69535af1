mod common;

use common::{start_host, wait_until, Journal, Napper};
use flowcore::{FlowError, FlowEvent, FlowId};
use flowruntime::{FlowStore, HostEvent, StopReason, TimeoutHandler};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn append(text: &str) -> FlowEvent {
    FlowEvent::domain("Append", json!(text))
}

fn nap(ms: u64) -> FlowEvent {
    FlowEvent::domain("Nap", json!(ms))
}

#[tokio::test]
async fn test_events_are_processed_in_submission_order() {
    let test = start_host(4);
    let id = FlowId::new("Journal", "ordering");
    let worklet = test.host.worklet(&id).unwrap();

    // Queued back to back before any of them is awaited.
    let pending: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|text| worklet.handle_event(append(text), CancellationToken::new()))
        .collect();
    let versions: Vec<u64> = futures::future::join_all(pending)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    // Reset stores v1; every append stores twice (Recording, then the chained Echo).
    assert_eq!(versions, vec![3, 5, 7, 9]);

    let stored = test.store.get(&id).unwrap();
    let journal: Journal = serde_json::from_value(stored.data).unwrap();
    assert_eq!(
        journal.entries,
        vec!["a", "echo:a", "b", "echo:b", "c", "echo:c", "d", "echo:d"],
        "each event's step chain must complete before the next event starts"
    );
}

#[tokio::test]
async fn test_auto_resume_chains_steps() {
    let test = start_host(4);
    let id = FlowId::new("Journal", "chain");

    let first = test.host.process_event(&id, append("x"), CancellationToken::new()).await.unwrap();
    assert_eq!(first, 3);
    let stored = test.store.get(&id).unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.step, "Recording", "the chained Echo step should have run");

    let second = test.host.process_event(&id, append("y"), CancellationToken::new()).await.unwrap();
    assert_eq!(second, 5);
}

#[tokio::test]
async fn test_failed_step_rolls_back() {
    let test = start_host(4);
    let id = FlowId::new("Journal", "rollback");
    let mut events = test.host.subscribe();

    let version = test.host.process_event(&id, append("kept"), CancellationToken::new()).await.unwrap();

    let error = test
        .host
        .process_event(&id, FlowEvent::signal("Fail"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, FlowError::Step(_)), "unexpected error: {error}");

    let stored = test.store.get(&id).unwrap();
    assert_eq!(stored.version, version);
    assert_eq!(stored.step, "Recording");

    // The in-memory flow was rolled back too: the partial entry is gone.
    let next = test.host.process_event(&id, append("after"), CancellationToken::new()).await.unwrap();
    assert_eq!(next, version + 2);
    let journal: Journal = serde_json::from_value(test.store.get(&id).unwrap().data).unwrap();
    assert_eq!(journal.entries, vec!["kept", "echo:kept", "after", "echo:after"]);

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if let HostEvent::StepFailed { step, .. } = event {
            assert_eq!(step, "Recording");
            failures += 1;
        }
    }
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_unhandled_event_fails_without_changes() {
    let test = start_host(2);
    let id = FlowId::new("Journal", "unhandled");
    let version = test.host.process_event(&id, append("a"), CancellationToken::new()).await.unwrap();

    let error = test
        .host
        .process_event(&id, FlowEvent::signal("Unknown"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, FlowError::UnhandledEvent { .. }));
    assert_eq!(test.store.get(&id).unwrap().version, version);
}

#[tokio::test]
async fn test_idle_worklet_is_evicted_and_recreated() {
    let test = start_host(2);
    let id = FlowId::new("Napper", "idle");
    let mut events = test.host.subscribe();

    let version = test.host.process_event(&id, nap(0), CancellationToken::new()).await.unwrap();
    assert_eq!(version, 2);
    assert_eq!(test.host.worklet_count(), 1);

    assert!(
        wait_until(Duration::from_secs(2), || test.host.worklet_count() == 0).await,
        "idle worklet should be evicted after its keep-alive"
    );
    let mut evicted = false;
    while let Ok(event) = events.try_recv() {
        if let HostEvent::WorkletStopped { reason, .. } = event {
            evicted |= reason == StopReason::Idle;
        }
    }
    assert!(evicted);

    // A new event transparently recreates the worklet from the stored state.
    let version = test.host.process_event(&id, nap(0), CancellationToken::new()).await.unwrap();
    assert_eq!(version, 3);
    assert_eq!(test.store.get(&id).unwrap().data["naps"], json!(2));
}

#[tokio::test]
async fn test_disposed_worklet_rejects_events() {
    let test = start_host(2);
    let id = FlowId::new("Journal", "disposed");
    let worklet = test.host.worklet(&id).unwrap();
    worklet.handle_event(append("a"), CancellationToken::new()).await.unwrap();

    worklet.dispose_and_wait().await;
    assert!(worklet.is_stopped());
    // Fails on first poll, without waiting on the stopped run loop.
    let mut rejected = tokio_test::task::spawn(worklet.handle_event(append("b"), CancellationToken::new()));
    let result = tokio_test::assert_ready!(rejected.poll());
    assert!(result.unwrap_err().is_channel_closed());

    // The host routes to a fresh worklet instead.
    let version = test.host.process_event(&id, append("b"), CancellationToken::new()).await.unwrap();
    assert_eq!(version, 5);
}

#[tokio::test]
async fn test_hard_stop_cancels_in_flight_step() {
    let test = start_host(2);
    let id = FlowId::new("Napper", "hard-stop");
    let worklet = test.host.worklet(&id).unwrap();

    let pending = worklet.handle_event(nap(10_000), CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    worklet.dispose();

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("in-flight step should be cancelled after the grace window");
    assert!(matches!(result, Err(FlowError::Cancelled)));

    worklet.wait_stopped().await;
    let stored = test.store.get(&id).unwrap();
    assert_eq!(stored.version, 1, "only the reset should have been stored");
    assert_eq!(stored.data["naps"], json!(0));
}

#[tokio::test]
async fn test_cancelled_entry_is_skipped() {
    let test = start_host(2);
    let id = FlowId::new("Napper", "cancelled-entry");
    let worklet = test.host.worklet(&id).unwrap();

    let first = worklet.handle_event(nap(100), CancellationToken::new());
    let token = CancellationToken::new();
    let second = worklet.handle_event(nap(0), token.clone());
    let third = worklet.handle_event(nap(0), CancellationToken::new());
    token.cancel();

    assert_eq!(first.await.unwrap(), 2);
    assert!(matches!(second.await, Err(FlowError::Cancelled)));
    assert_eq!(third.await.unwrap(), 3);
}

#[tokio::test]
async fn test_idle_timeout_spares_busy_worklet() {
    let test = start_host(2);
    let id = FlowId::new("Napper", "busy");
    let worklet = test.host.worklet(&id).unwrap();

    // A step is running.
    let in_flight = worklet.handle_event(nap(100), CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(20)).await;
    worklet.on_timeout();
    assert!(!worklet.is_stopping());
    assert_eq!(in_flight.await.unwrap(), 2);

    // Parked, with an entry queued before the run loop woke up.
    let queued = worklet.handle_event(nap(0), CancellationToken::new());
    worklet.on_timeout();
    assert!(!worklet.is_stopping());
    assert_eq!(queued.await.unwrap(), 3);

    // Parked with nothing queued.
    worklet.on_timeout();
    assert!(worklet.is_stopping());
    worklet.wait_stopped().await;
    assert_eq!(test.store.get(&id).unwrap().data["naps"], json!(2));
}

#[tokio::test]
async fn test_concurrent_write_reloads_flow() {
    let test = start_host(2);
    let id = FlowId::new("Journal", "overwritten");
    let version = test.host.process_event(&id, append("a"), CancellationToken::new()).await.unwrap();
    assert_eq!(version, 3);

    // Another writer moves the stored flow on.
    let mut stored = test.store.get(&id).unwrap();
    stored.data = json!({ "entries": ["external"] });
    assert_eq!(test.store.save(&id, version, Some(stored), Vec::new()).await.unwrap(), 4);

    let error = test
        .host
        .process_event(&id, append("b"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(error, FlowError::VersionMismatch { expected: 3, actual: 4, .. }),
        "unexpected error: {error}"
    );

    // The worklet picked up the external write and keeps going.
    let version = test.host.process_event(&id, append("c"), CancellationToken::new()).await.unwrap();
    assert_eq!(version, 6);
    let journal: Journal = serde_json::from_value(test.store.get(&id).unwrap().data).unwrap();
    assert_eq!(journal.entries, vec!["external", "c", "echo:c"]);
}
