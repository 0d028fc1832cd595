//! End-to-end sync scenarios against a scripted transport.

use progsync_engine::{
    AuthProvider, CircuitBreakerState, HttpMethod, HttpResponse, ManualClock, MemoryApplier,
    MockTransport, NoAuth, OperationStatus, PassOutcome, RecordingSink, RetryConfig, StaticAuth,
    SyncConfig, SyncEngine, SyncEvent,
};
use progsync_protocol::{
    Channel, CustomProblem, DedupeKey, DifficultyUpdate, MarkSolved, NoteUpdate, Operation, SettingsUpdate,
    Timestamp,
};
use progsync_storage::{FileStore, InMemoryStore, KvStore};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const START: i64 = 1_700_000_000_000;
const BATCH: &str = "/api/progress/batch";
const SESSION: &str = "/api/auth/session";
const SETTINGS: &str = "/api/settings";

struct Harness {
    engine: SyncEngine,
    transport: Arc<MockTransport>,
    sink: Arc<RecordingSink>,
    applier: Arc<MemoryApplier>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with(Arc::new(InMemoryStore::new()), Arc::new(NoAuth))
}

fn harness_with(store: Arc<dyn KvStore>, auth: Arc<dyn AuthProvider>) -> Harness {
    harness_configured(store, auth, config())
}

fn config() -> SyncConfig {
    SyncConfig::new().with_device_id("device-a")
}

fn harness_configured(
    store: Arc<dyn KvStore>,
    auth: Arc<dyn AuthProvider>,
    config: SyncConfig,
) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let sink = Arc::new(RecordingSink::new());
    let applier = Arc::new(MemoryApplier::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(START)));

    let engine = SyncEngine::builder(store, transport.clone())
        .with_auth(auth)
        .with_sink(sink.clone())
        .with_applier(applier.clone())
        .with_clock(clock.clone())
        .with_config(config)
        .build()
        .unwrap();

    Harness {
        engine,
        transport,
        sink,
        applier,
        clock,
    }
}

fn solved(problem: &str, count: u32) -> Operation {
    Operation::MarkSolved(MarkSolved {
        problem_id: problem.into(),
        solve_count: count,
        solved_at: Timestamp::from_millis(START),
        next_review_at: None,
    })
}

fn difficulty(problem: &str, value: u8) -> Operation {
    Operation::UpdateDifficulty(DifficultyUpdate {
        problem_id: problem.into(),
        difficulty: value,
    })
}

fn note(problem: &str, notes: &str) -> Operation {
    Operation::AddNote(NoteUpdate {
        problem_id: problem.into(),
        notes: notes.into(),
    })
}

fn custom(id: &str, name: &str) -> Operation {
    Operation::AddCustomProblem(CustomProblem {
        id: id.into(),
        name: name.into(),
        url: format!("https://example.com/{id}"),
        category: "graphs".into(),
        pattern: "bfs".into(),
        difficulty: 3,
    })
}

fn settings(key: &str, value: Value) -> Operation {
    let mut values = BTreeMap::new();
    values.insert(key.to_string(), value);
    Operation::UpdateSettings(SettingsUpdate { values })
}

fn body(request: &progsync_engine::HttpRequest) -> Value {
    serde_json::from_slice(request.body.as_deref().unwrap()).unwrap()
}

#[tokio::test]
async fn simple_success() {
    let h = harness();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();

    let result = h.engine.force_sync().await.unwrap();
    assert!(result.success);
    assert_eq!(result.synced, 1);
    assert_eq!(result.failed, 0);

    let record = h.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Completed);

    let sent = h.transport.requests_to(HttpMethod::Post, BATCH);
    assert_eq!(sent.len(), 1);
    let sent = body(&sent[0]);
    assert_eq!(sent["operations"][0]["entityId"], "p1");
    assert_eq!(sent["operations"][0]["deviceId"], "device-a");

    assert_eq!(
        h.sink.events_of("sync-started"),
        vec![SyncEvent::SyncStarted { pending_count: 1 }]
    );
    assert_eq!(
        h.sink.events_of("sync-completed"),
        vec![SyncEvent::SyncCompleted {
            synced_count: 1,
            failed_count: 0,
            still_pending_count: 0,
        }]
    );

    let status = h.engine.status().unwrap();
    assert_eq!(status.pending_count, 0);
    assert!(!status.is_syncing);
    assert_eq!(status.last_sync_at, Some(Timestamp::from_millis(START)));
}

#[tokio::test]
async fn conflict_is_merged_and_written_back() {
    let h = harness();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.transport.push_response(
        HttpMethod::Post,
        BATCH,
        HttpResponse::json(
            409,
            &json!({"problemId": "p1", "solved": true, "solveCount": 2, "timestamp": START - 60_000}),
        ),
    );

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 1);

    let put = h.transport.requests_to(HttpMethod::Put, "/api/progress/p1");
    assert_eq!(put.len(), 1);
    assert_eq!(body(&put[0])["data"]["solveCount"], 3);

    assert_eq!(h.applier.progress("p1").unwrap().solve_count, 3);
    assert_eq!(
        h.engine.queue().get(&id).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    assert_eq!(h.sink.events_of("conflict-resolved").len(), 1);
}

#[tokio::test]
async fn conflicts_listed_in_batch_response_are_merged() {
    let h = harness();
    h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.engine.enqueue(solved("p2", 1), None).unwrap();
    h.transport.push_response(
        HttpMethod::Post,
        BATCH,
        HttpResponse::json(
            200,
            &json!({"conflicts": [{
                "entityId": "p2",
                "clientData": {"problemId": "p2", "solveCount": 1, "timestamp": START},
                "serverData": {"problemId": "p2", "solved": true, "solveCount": 4, "timestamp": START - 1},
            }]}),
        ),
    );

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 2);
    assert!(h.transport.requests_to(HttpMethod::Put, "/api/progress/p1").is_empty());
    assert_eq!(h.applier.progress("p2").unwrap().solve_count, 5);
}

#[tokio::test]
async fn multi_item_batch_conflict_falls_back_to_single_sends() {
    let h = harness();
    h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.engine.enqueue(solved("p2", 1), None).unwrap();
    h.transport
        .push_response(HttpMethod::Post, BATCH, HttpResponse::new(409));

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 2);
    assert_eq!(h.transport.requests_to(HttpMethod::Post, "/api/progress/p1").len(), 1);
    assert_eq!(h.transport.requests_to(HttpMethod::Post, "/api/progress/p2").len(), 1);
}

#[tokio::test]
async fn exhausted_retries_end_failed() {
    let h = harness();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.transport
        .set_response(HttpMethod::Post, BATCH, HttpResponse::new(500));

    for attempt in 1..=2 {
        let result = h.engine.force_sync().await.unwrap();
        assert!(result.success);
        let record = h.engine.queue().get(&id).unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Pending);
        assert_eq!(record.retry_count, attempt);
        assert_eq!(h.engine.pending_retries().unwrap().len(), 1);
    }

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.failed, 1);
    let record = h.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(h.engine.pending_retries().unwrap().is_empty());

    match &h.sink.events_of("operation-failed")[..] {
        [SyncEvent::OperationFailed { operation_id, retry_count, .. }] => {
            assert_eq!(operation_id, &id);
            assert_eq!(*retry_count, 3);
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn scheduled_retries_wait_for_their_time() {
    let h = harness();
    h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.transport
        .push_response(HttpMethod::Post, BATCH, HttpResponse::new(503));

    h.engine.sync().await.unwrap();
    let report = h.engine.sync().await.unwrap();
    assert_eq!(report.outcome, PassOutcome::NothingPending);
    assert_eq!(h.transport.requests_to(HttpMethod::Post, BATCH).len(), 1);

    h.clock.advance(Duration::from_secs(2));
    let report = h.engine.sync().await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Completed);
    assert_eq!(report.synced, 1);
}

#[tokio::test]
async fn offline_enqueue_then_online_drain() {
    let h = harness();
    h.transport.set_online(false);

    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
    let result = h.engine.force_sync().await.unwrap();
    assert!(!result.success);
    assert!(h.transport.requests_to(HttpMethod::Post, BATCH).is_empty());
    assert_eq!(h.engine.status().unwrap().pending_count, 1);

    h.transport.set_online(true);
    h.engine.connectivity().set_external_signal(true);
    let result = h.engine.force_sync().await.unwrap();
    assert!(result.success);
    assert_eq!(result.synced, 1);
    assert_eq!(
        h.engine.queue().get(&id).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    assert_eq!(
        h.sink.events_of("connectivity-changed"),
        vec![SyncEvent::ConnectivityChanged { online: true }]
    );
}

#[tokio::test]
async fn repeated_edits_are_folded() {
    let h = harness();
    let first = h
        .engine
        .enqueue(difficulty("p1", 2), Some(DedupeKey::for_operation(&difficulty("p1", 2))))
        .unwrap();
    let second = h
        .engine
        .enqueue(difficulty("p1", 4), Some(DedupeKey::for_operation(&difficulty("p1", 4))))
        .unwrap();
    assert_eq!(first, second);

    // Without dedupe keys the pass collapses them instead.
    h.engine.enqueue(solved("p2", 1), None).unwrap();
    h.engine.enqueue(solved("p2", 2), None).unwrap();

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 3);

    let sent = body(&h.transport.requests_to(HttpMethod::Post, BATCH)[0]);
    let operations = sent["operations"].as_array().unwrap();
    assert_eq!(operations.len(), 2);
    assert_eq!(operations[0]["operation"]["payload"]["difficulty"], 4);
    assert_eq!(operations[1]["operation"]["payload"]["solveCount"], 2);
    assert_eq!(h.engine.status().unwrap().stats.completed, 3);
}

#[tokio::test]
async fn missing_credentials_abort_the_pass() {
    let h = harness_with(Arc::new(InMemoryStore::new()), Arc::new(StaticAuth::signed_out()));
    h.transport
        .set_response(HttpMethod::Get, SESSION, HttpResponse::new(401));
    h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.engine.enqueue(custom("c1", "Word Ladder"), None).unwrap();

    let result = h.engine.force_sync().await.unwrap();
    assert!(!result.success);
    assert_eq!(
        h.sink.events_of("auth-required"),
        vec![SyncEvent::AuthRequired { pending_count: 2 }]
    );
    assert!(h.sink.events_of("sync-started").is_empty());
    assert!(h.transport.requests_to(HttpMethod::Post, BATCH).is_empty());
    assert_eq!(h.engine.status().unwrap().pending_count, 2);
}

#[tokio::test]
async fn rejected_payloads_fail_without_retry() {
    let h = harness();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.transport
        .push_response(HttpMethod::Post, BATCH, HttpResponse::new(422));

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.failed, 1);
    let record = h.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Failed);
    assert_eq!(record.retry_count, 0);
    assert!(record.error_message.unwrap().contains("422"));
    assert!(h.engine.pending_retries().unwrap().is_empty());
}

#[tokio::test]
async fn diverging_notes_need_a_human() {
    let h = harness();
    let id = h
        .engine
        .enqueue(note("p1", "use two pointers from both ends"), None)
        .unwrap();
    h.transport.push_response(
        HttpMethod::Post,
        BATCH,
        HttpResponse::json(
            409,
            &json!({"problemId": "p1", "notes": "memoized recursion over subsets", "timestamp": START - 1}),
        ),
    );

    h.engine.force_sync().await.unwrap();
    let record = h.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::ManualResolution);
    assert!(record.error_message.unwrap().contains("notes"));
    assert_eq!(h.sink.events_of("manual-resolution-required").len(), 1);
    assert!(h.transport.requests_to(HttpMethod::Put, "/api/progress/p1").is_empty());
}

#[tokio::test]
async fn custom_problem_conflicts_are_last_write_wins() {
    let h = harness();
    h.engine.enqueue(custom("older", "Local Name"), None).unwrap();
    h.engine.enqueue(custom("newer", "Local Name"), None).unwrap();

    let remote = |id: &str, ts: i64| {
        json!({
            "id": id, "name": "Remote Name", "url": "https://example.com", "category": "graphs",
            "pattern": "bfs", "difficulty": 3, "timestamp": ts,
        })
    };
    h.transport.push_response(
        HttpMethod::Post,
        "/api/custom-problems",
        HttpResponse::json(409, &remote("older", START - 1_000)),
    );
    h.transport.push_response(
        HttpMethod::Post,
        "/api/custom-problems",
        HttpResponse::json(409, &remote("newer", START + 60_000)),
    );

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 2);

    // The local edit is newer than the remote copy of "older".
    let put = h.transport.requests_to(HttpMethod::Put, "/api/custom-problems/older");
    assert_eq!(put.len(), 1);
    assert_eq!(body(&put[0])["data"]["name"], "Local Name");

    // The remote copy of "newer" wins and is applied locally.
    assert!(h
        .transport
        .requests_to(HttpMethod::Put, "/api/custom-problems/newer")
        .is_empty());
    assert_eq!(h.applier.custom_problem("newer").unwrap().name, "Remote Name");
}

#[tokio::test]
async fn settings_are_folded_into_one_write() {
    let h = harness();
    h.engine.enqueue(settings("theme", json!("dark")), None).unwrap();
    h.engine.enqueue(settings("fontSize", json!(14)), None).unwrap();
    h.engine.enqueue(settings("theme", json!("light")), None).unwrap();

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 3);

    let put = h.transport.requests_to(HttpMethod::Put, "/api/settings");
    assert_eq!(put.len(), 1);
    let values = &body(&put[0])["data"]["values"];
    assert_eq!(values["theme"], "light");
    assert_eq!(values["fontSize"], 14);
}

#[tokio::test]
async fn persisted_retries_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.log");

    let id = {
        let h = harness_with(Arc::new(FileStore::open(&path).unwrap()), Arc::new(NoAuth));
        let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
        h.transport
            .push_response(HttpMethod::Post, BATCH, HttpResponse::new(500));
        h.engine.force_sync().await.unwrap();
        assert_eq!(h.engine.pending_retries().unwrap().len(), 1);
        h.engine.shutdown();
        id
    };

    let h = harness_with(Arc::new(FileStore::open(&path).unwrap()), Arc::new(NoAuth));
    assert_eq!(h.engine.device_id(), "device-a");
    h.clock.advance(Duration::from_secs(5));

    assert_eq!(h.engine.resume_persisted_retries().await.unwrap(), 1);
    let record = h.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Completed);
    assert_eq!(record.retry_count, 1);
    assert!(h.engine.pending_retries().unwrap().is_empty());

    // A second resume finds nothing to claim.
    assert_eq!(h.engine.resume_persisted_retries().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn only_one_pass_runs_at_a_time() {
    let h = harness();
    h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.transport.set_latency(Some(Duration::from_millis(200)));

    let (first, second) = tokio::join!(h.engine.force_sync(), h.engine.force_sync());
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.success);
    assert_eq!(first.synced, 1);
    assert!(!second.success);
    assert_eq!(h.transport.requests_to(HttpMethod::Post, BATCH).len(), 1);
}

#[tokio::test]
async fn clear_all_forgets_everything() {
    let h = harness();
    h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.transport
        .push_response(HttpMethod::Post, BATCH, HttpResponse::new(500));
    h.engine.force_sync().await.unwrap();
    assert_eq!(h.engine.pending_retries().unwrap().len(), 1);

    h.engine.clear_all().unwrap();
    assert_eq!(h.engine.status().unwrap().stats.total(), 0);
    assert!(h.engine.pending_retries().unwrap().is_empty());
    assert_eq!(h.engine.device_id(), "device-a");
}

#[tokio::test(start_paused = true)]
async fn driver_drains_after_enqueue() {
    let h = harness();
    h.engine.start();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        h.engine.queue().get(&id).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn driver_resumes_when_connectivity_returns() {
    let h = harness();
    h.transport.set_online(false);
    h.engine.start();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        h.engine.queue().get(&id).unwrap().unwrap().status,
        OperationStatus::Pending
    );

    h.transport.set_online(true);
    h.engine.connectivity().set_external_signal(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        h.engine.queue().get(&id).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    h.engine.shutdown();
}

#[tokio::test]
async fn older_edits_stay_pending_when_the_newest_needs_a_human() {
    let h = harness();
    let older = h
        .engine
        .enqueue(note("p1", "use two pointers from both ends"), None)
        .unwrap();
    let newer = h
        .engine
        .enqueue(note("p1", "two pointers meeting in the middle"), None)
        .unwrap();
    h.transport.push_response(
        HttpMethod::Post,
        BATCH,
        HttpResponse::json(
            409,
            &json!({"problemId": "p1", "notes": "memoized recursion over subsets", "timestamp": START - 1}),
        ),
    );

    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 0);
    assert_eq!(
        h.engine.queue().get(&newer).unwrap().unwrap().status,
        OperationStatus::ManualResolution
    );
    assert_eq!(
        h.engine.queue().get(&older).unwrap().unwrap().status,
        OperationStatus::Pending
    );
    assert!(h.transport.requests_to(HttpMethod::Put, "/api/progress/p1").is_empty());
    assert_eq!(h.engine.status().unwrap().pending_count, 1);
}

#[tokio::test(start_paused = true)]
async fn engine_syncs_again_after_a_restart() {
    let h = harness();
    h.engine.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.engine.shutdown();

    h.engine.start();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        h.engine.queue().get(&id).unwrap().unwrap().status,
        OperationStatus::Completed
    );
    assert_eq!(h.engine.connectivity().state().consecutive_failures, 0);
    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failing_channel_trips_its_breaker_until_the_cooldown() {
    // Long retry delays keep retry timers out of the way.
    let retry = RetryConfig::default()
        .with_max_attempts(100)
        .with_initial_delay(Duration::from_secs(3_600))
        .with_max_delay(Duration::from_secs(3_600));
    let h = harness_configured(
        Arc::new(InMemoryStore::new()),
        Arc::new(NoAuth),
        config().with_retry(retry),
    );
    h.transport
        .set_response(HttpMethod::Put, SETTINGS, HttpResponse::new(500));
    let id = h.engine.enqueue(settings("theme", json!("dark")), None).unwrap();

    for _ in 0..5 {
        h.engine.force_sync().await.unwrap();
    }
    let state = h.engine.breaker_state(Channel::Settings);
    assert!(state.is_open);
    assert_eq!(state.failures, 5);
    assert!(!h.engine.breaker_state(Channel::Progress).is_open);

    // While open the channel is skipped.
    h.engine.force_sync().await.unwrap();
    assert_eq!(h.transport.requests_to(HttpMethod::Put, SETTINGS).len(), 5);

    tokio::time::advance(Duration::from_secs(61)).await;
    h.transport
        .set_response(HttpMethod::Put, SETTINGS, HttpResponse::new(200));
    let result = h.engine.force_sync().await.unwrap();
    assert_eq!(result.synced, 1);
    assert_eq!(h.transport.requests_to(HttpMethod::Put, SETTINGS).len(), 6);
    assert_eq!(
        h.engine.breaker_state(Channel::Settings),
        CircuitBreakerState::default()
    );
    assert_eq!(
        h.engine.queue().get(&id).unwrap().unwrap().status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn clear_all_closes_breakers() {
    let retry = RetryConfig::default().with_max_attempts(100);
    let h = harness_configured(
        Arc::new(InMemoryStore::new()),
        Arc::new(NoAuth),
        config().with_retry(retry),
    );
    h.transport
        .set_response(HttpMethod::Put, SETTINGS, HttpResponse::new(503));
    h.engine.enqueue(settings("theme", json!("dark")), None).unwrap();
    for _ in 0..5 {
        h.engine.force_sync().await.unwrap();
    }
    assert!(h.engine.breaker_state(Channel::Settings).is_open);

    h.engine.clear_all().unwrap();
    assert!(!h.engine.breaker_state(Channel::Settings).is_open);
    assert_eq!(h.engine.breaker_state(Channel::Settings).failures, 0);
}

#[tokio::test]
async fn failing_channel_does_not_block_the_others() {
    let h = harness();
    h.transport
        .set_response(HttpMethod::Put, SETTINGS, HttpResponse::new(500));
    let progress = h.engine.enqueue(solved("p1", 1), None).unwrap();
    let problem = h.engine.enqueue(custom("c1", "Word Ladder"), None).unwrap();
    let theme = h.engine.enqueue(settings("theme", json!("dark")), None).unwrap();

    let result = h.engine.force_sync().await.unwrap();
    assert!(result.success);
    assert_eq!(result.synced, 2);
    assert_eq!(result.failed, 0);

    let status = |id: &str| h.engine.queue().get(id).unwrap().unwrap();
    assert_eq!(status(&progress).status, OperationStatus::Completed);
    assert_eq!(status(&problem).status, OperationStatus::Completed);
    assert_eq!(status(&theme).status, OperationStatus::Pending);
    assert_eq!(status(&theme).retry_count, 1);

    assert_eq!(h.engine.breaker_state(Channel::Settings).failures, 1);
    assert_eq!(h.engine.breaker_state(Channel::Progress).failures, 0);
    assert_eq!(h.engine.breaker_state(Channel::Custom).failures, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_leaves_operations_pending_without_spending_a_retry() {
    let h = harness();
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
    // Each request takes 200ms, so the batch is in flight from 400ms to 600ms.
    h.transport.set_latency(Some(Duration::from_millis(200)));

    let engine = h.engine.clone();
    let pass = tokio::spawn(async move { engine.sync().await });
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.engine.cancel();

    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.outcome, PassOutcome::Cancelled);
    assert_eq!(h.transport.requests_to(HttpMethod::Post, BATCH).len(), 1);

    let record = h.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Pending);
    assert_eq!(record.retry_count, 0);
    assert!(h.engine.pending_retries().unwrap().is_empty());
    assert!(h.sink.events_of("sync-completed").is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_pass_times_out() {
    let h = harness_configured(
        Arc::new(InMemoryStore::new()),
        Arc::new(NoAuth),
        config().with_request_timeout(Duration::from_secs(90)),
    );
    let id = h.engine.enqueue(solved("p1", 1), None).unwrap();
    h.engine.connectivity().set_external_signal(true);
    // The session check ends at 40s; the batch would end at 80s.
    h.transport.set_latency(Some(Duration::from_secs(40)));

    let report = h.engine.sync().await.unwrap();
    assert_eq!(report.outcome, PassOutcome::TimedOut);
    assert_eq!(report.synced, 0);
    assert_eq!(report.still_pending, 1);

    let record = h.engine.queue().get(&id).unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Pending);
    assert_eq!(record.retry_count, 0);
    assert!(!h.engine.status().unwrap().is_syncing);
}

#[tokio::test]
async fn dropped_engine_stops_forwarding_connectivity() {
    let h = harness();
    let oracle = h.engine.connectivity().clone();
    let sink = h.sink.clone();
    drop(h);

    oracle.set_external_signal(true);
    assert!(sink.events_of("connectivity-changed").is_empty());
}
