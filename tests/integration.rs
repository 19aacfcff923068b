use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, Utc};
use delivery_tracker::api::rest::router;
use delivery_tracker::config::TrackingSettings;
use delivery_tracker::engine::ingest::{IngestOutcome, RejectReason, ingest};
use delivery_tracker::engine::lifecycle::{self, expire_idle_sessions, prune_archive};
use delivery_tracker::engine::notifier::{Notifier, run_notification_dispatcher};
use delivery_tracker::error::AppError;
use delivery_tracker::models::event::{ProximityEvent, ProximityKind};
use delivery_tracker::models::fix::{GeoPoint, PositionFix};
use delivery_tracker::models::session::{
    DeliveryMetadata, DeliveryStatus, EndReason, SessionView, ThresholdState,
};
use delivery_tracker::presentation::{
    MarkerRenderer, PresentationAdapter, PresentationSettings, TrackingText,
};
use delivery_tracker::state::AppState;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

const METERS_PER_DEGREE: f64 = 111_194.926_644_558_73;

fn setup_state() -> (Arc<AppState>, mpsc::Receiver<ProximityEvent>) {
    let (state, rx) = AppState::new(TrackingSettings::default(), 1024, 1024);
    (Arc::new(state), rx)
}

fn setup() -> (axum::Router, mpsc::Receiver<ProximityEvent>) {
    let (state, rx) = setup_state();
    (router(state), rx)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn base_time() -> DateTime<Utc> {
    Utc::now() - Duration::minutes(10)
}

/// A fix `meters` due north of (0, 0), captured `secs` after `base`.
fn fix_north(base: DateTime<Utc>, meters: f64, secs: i64) -> PositionFix {
    PositionFix::new(
        GeoPoint::new(meters / METERS_PER_DEGREE, 0.0),
        base + Duration::seconds(secs),
    )
}

fn start(state: &AppState, delivery_id: &str) {
    lifecycle::start_session(
        state,
        delivery_id,
        GeoPoint::new(0.0, 0.0),
        DeliveryMetadata::default(),
    )
    .unwrap();
}

fn accepted(outcome: IngestOutcome) -> delivery_tracker::models::update::TrackingUpdate {
    match outcome {
        IngestOutcome::Accepted(update) => update,
        IngestOutcome::Rejected(reason) => panic!("fix rejected: {reason:?}"),
    }
}

fn drain(rx: &mut mpsc::Receiver<ProximityEvent>) -> Vec<ProximityKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
    assert_eq!(body["archived_sessions"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_sessions"));
}

#[tokio::test]
async fn start_session_returns_session() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/deliveries",
            json!({
                "delivery_id": "order-42",
                "destination": { "lat": 52.52, "lng": 13.405 },
                "metadata": { "address": "Alexanderplatz 1", "items": ["pizza"] }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["delivery_id"], "order-42");
    assert_eq!(body["status"], "Assigned");
    assert_eq!(body["last_crossed_threshold"], "None");
    assert_eq!(body["metadata"]["address"], "Alexanderplatz 1");
    assert!(body["latest_fix"].is_null());
}

#[tokio::test]
async fn starting_an_active_session_twice_returns_409() {
    let (app, _rx) = setup();
    let payload = json!({
        "delivery_id": "order-1",
        "destination": { "lat": 52.52, "lng": 13.405 }
    });

    let first = app
        .clone()
        .oneshot(json_request("POST", "/deliveries", payload.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(json_request("POST", "/deliveries", payload))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn start_session_rejects_bad_input() {
    let (app, _rx) = setup();

    let blank_id = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/deliveries",
            json!({ "delivery_id": "  ", "destination": { "lat": 1.0, "lng": 1.0 } }),
        ))
        .await
        .unwrap();
    assert_eq!(blank_id.status(), StatusCode::BAD_REQUEST);

    let bad_destination = app
        .oneshot(json_request(
            "POST",
            "/deliveries",
            json!({ "delivery_id": "x", "destination": { "lat": 123.0, "lng": 1.0 } }),
        ))
        .await
        .unwrap();
    assert_eq!(bad_destination.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fix_for_unknown_delivery_returns_404() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/deliveries/nope/fixes",
            json!({ "latitude": 1.0, "longitude": 1.0, "captured_at": Utc::now() }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fix_lifecycle_over_http() {
    let (state, _rx) = setup_state();
    start(&state, "order-7");
    let app = router(state.clone());
    let captured_at = Utc::now() - Duration::seconds(5);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/deliveries/order-7/fixes",
            json!({ "latitude": 0.0, "longitude": 0.0, "captured_at": captured_at }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body = body_json(res).await;
    assert_eq!(body["outcome"], "accepted");
    assert_eq!(body["update"]["distance_meters"], 0.0);
    assert_eq!(body["update"]["threshold_state"], "Arrived");
    assert_eq!(body["update"]["status"], "Arrived");

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/deliveries/order-7/fixes",
            json!({ "latitude": 0.0, "longitude": 0.0, "captured_at": captured_at }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["outcome"], "rejected");
    assert_eq!(body["rejection"]["reason"], "stale_fix");

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/deliveries/order-7/fixes",
            json!({ "latitude": 95.0, "longitude": 0.0, "captured_at": Utc::now() }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .oneshot(get_request("/deliveries/order-7"))
        .await
        .unwrap();
    let body = body_json(res).await;
    assert_eq!(body["state"], "active");
    assert_eq!(body["recent_fixes"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn status_updates_move_forward_and_terminal_status_archives() {
    let (state, _rx) = setup_state();
    start(&state, "order-9");
    let app = router(state.clone());

    let res = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/deliveries/order-9/status",
            json!({ "status": "EnRoute" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "EnRoute");

    let res = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/deliveries/order-9/status",
            json!({ "status": "PickedUp" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/deliveries/order-9/status",
            json!({ "status": "Delivered" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["state"], "ended");
    assert_eq!(body["final_status"], "Delivered");
    assert_eq!(body["reason"], "Delivered");

    let res = app
        .oneshot(get_request("/deliveries/order-9"))
        .await
        .unwrap();
    let body = body_json(res).await;
    assert_eq!(body["state"], "ended");
    assert!(state.sessions.is_empty());
}

#[tokio::test]
async fn end_session_over_http_and_unknown_returns_404() {
    let (state, _rx) = setup_state();
    start(&state, "order-3");
    let app = router(state.clone());

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/deliveries/order-3/end",
            json!({ "reason": "Cancelled" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["final_status"], "Cancelled");

    let res = app
        .oneshot(json_request(
            "POST",
            "/deliveries/order-3/end",
            json!({ "reason": "Cancelled" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn nearby_then_arrived_emits_exactly_two_events() {
    let (state, mut rx) = setup_state();
    start(&state, "d-1");
    let base = base_time();

    let far = accepted(ingest(&state, "d-1", fix_north(base, 5_000.0, 0)).await);
    assert_eq!(far.threshold_state, ThresholdState::None);
    assert!(drain(&mut rx).is_empty());

    let near = accepted(ingest(&state, "d-1", fix_north(base, 800.0, 10)).await);
    assert_eq!(near.threshold_state, ThresholdState::Nearby);
    assert_eq!(near.status, DeliveryStatus::Nearby);
    assert_eq!(drain(&mut rx), vec![ProximityKind::Nearby]);

    let there = accepted(ingest(&state, "d-1", fix_north(base, 50.0, 20)).await);
    assert_eq!(there.threshold_state, ThresholdState::Arrived);
    assert_eq!(drain(&mut rx), vec![ProximityKind::Arrived]);

    accepted(ingest(&state, "d-1", fix_north(base, 20.0, 30)).await);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn jitter_near_boundary_does_not_repeat_nearby() {
    let (state, mut rx) = setup_state();
    start(&state, "d-1");
    let base = base_time();

    for (i, meters) in [900.0, 1_200.0, 850.0, 1_050.0, 700.0].into_iter().enumerate() {
        let update = accepted(ingest(&state, "d-1", fix_north(base, meters, i as i64 * 5)).await);
        assert_eq!(update.threshold_state, ThresholdState::Nearby);
    }

    assert_eq!(drain(&mut rx), vec![ProximityKind::Nearby]);
}

#[tokio::test]
async fn arrived_never_regresses() {
    let (state, _rx) = setup_state();
    start(&state, "d-1");
    let base = base_time();

    accepted(ingest(&state, "d-1", fix_north(base, 30.0, 0)).await);
    for (i, meters) in [600.0, 5_000.0, 90.0].into_iter().enumerate() {
        let update =
            accepted(ingest(&state, "d-1", fix_north(base, meters, 10 + i as i64)).await);
        assert_eq!(update.threshold_state, ThresholdState::Arrived);
    }
}

#[tokio::test]
async fn stale_fix_is_rejected_and_not_published() {
    let (state, _rx) = setup_state();
    start(&state, "d-1");
    let base = base_time();
    let mut subscription = state.broadcaster.subscribe("d-1").unwrap();

    accepted(ingest(&state, "d-1", fix_north(base, 3_000.0, 10)).await);
    let first = subscription.recv().await.unwrap();

    for secs in [10, 5] {
        match ingest(&state, "d-1", fix_north(base, 2_000.0, secs)).await {
            IngestOutcome::Rejected(RejectReason::StaleFix { latest_captured_at }) => {
                assert_eq!(latest_captured_at, first.captured_at);
            }
            other => panic!("expected stale rejection, got {other:?}"),
        }
    }

    assert_eq!(state.broadcaster.latest("d-1").unwrap(), first);
    let next = tokio::time::timeout(StdDuration::from_millis(50), subscription.recv()).await;
    assert!(next.is_err(), "stale fix produced an update");
}

#[tokio::test]
async fn ingest_for_unknown_delivery_has_no_active_session() {
    let (state, _rx) = setup_state();
    let outcome = ingest(&state, "ghost", fix_north(base_time(), 100.0, 0)).await;

    assert!(matches!(
        outcome,
        IngestOutcome::Rejected(RejectReason::NoActiveSession)
    ));
}

#[tokio::test]
async fn subscribers_observe_strictly_increasing_captured_at() {
    let (state, _rx) = setup_state();
    start(&state, "d-1");
    let base = base_time();
    let subscription = state.broadcaster.subscribe("d-1").unwrap();

    let collector = tokio::spawn(async move {
        let mut subscription = subscription;
        let mut seen = Vec::new();
        while let Some(update) = subscription.recv().await {
            seen.push(update.captured_at);
        }
        seen
    });

    let offsets = [1, 3, 2, 5, 5, 4, 8, 6, 9];
    let mut writers = Vec::new();
    for secs in offsets {
        let state = state.clone();
        writers.push(tokio::spawn(async move {
            ingest(&state, "d-1", fix_north(base, 2_000.0 - secs as f64, secs)).await
        }));
        tokio::task::yield_now().await;
    }
    for writer in writers {
        writer.await.unwrap();
    }

    lifecycle::end_session(&state, "d-1", EndReason::Delivered)
        .await
        .unwrap();

    let seen = collector.await.unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{seen:?}");
    assert_eq!(*seen.last().unwrap(), base + Duration::seconds(9));
}

#[tokio::test]
async fn slow_subscriber_resumes_at_latest_update() {
    let (state, _rx) = setup_state();
    start(&state, "d-1");
    let base = base_time();
    let mut slow = state.broadcaster.subscribe("d-1").unwrap();

    for secs in 1..=8 {
        accepted(ingest(&state, "d-1", fix_north(base, 4_000.0 - 100.0 * secs as f64, secs)).await);
    }

    let resumed = slow.recv().await.unwrap();
    assert_eq!(resumed.captured_at, base + Duration::seconds(8));
}

#[tokio::test]
async fn ending_a_session_closes_subscriptions() {
    let (state, _rx) = setup_state();
    start(&state, "d-1");
    let mut subscription = state.broadcaster.subscribe("d-1").unwrap();

    let archived = lifecycle::end_session(&state, "d-1", EndReason::Cancelled)
        .await
        .unwrap();

    assert_eq!(archived.final_status, DeliveryStatus::Cancelled);
    assert!(subscription.recv().await.is_none());
    assert!(matches!(
        ingest(&state, "d-1", fix_north(base_time(), 10.0, 0)).await,
        IngestOutcome::Rejected(RejectReason::NoActiveSession)
    ));
}

#[tokio::test]
async fn restarted_session_tracks_thresholds_afresh() {
    let (state, mut rx) = setup_state();
    start(&state, "d-1");
    let base = base_time();
    accepted(ingest(&state, "d-1", fix_north(base, 800.0, 0)).await);
    lifecycle::end_session(&state, "d-1", EndReason::Delivered)
        .await
        .unwrap();

    start(&state, "d-1");
    accepted(ingest(&state, "d-1", fix_north(base, 800.0, 0)).await);

    assert_eq!(
        drain(&mut rx),
        vec![ProximityKind::Nearby, ProximityKind::Nearby]
    );
    assert!(matches!(
        lifecycle::get_session(&state, "d-1").await.unwrap(),
        SessionView::Active(_)
    ));
}

#[tokio::test]
async fn idle_sessions_expire_and_archive_is_pruned() {
    let (state, _rx) = setup_state();
    start(&state, "idle");
    start(&state, "busy");
    accepted(ingest(&state, "busy", fix_north(Utc::now(), 3_000.0, 0)).await);

    let later = Utc::now() + Duration::minutes(9);
    assert!(expire_idle_sessions(&state, later).await.is_empty());

    // only "busy" got a fix, but both are past the timeout by now
    let much_later = Utc::now() + Duration::minutes(11);
    let mut expired = expire_idle_sessions(&state, much_later).await;
    expired.sort();
    assert_eq!(expired, vec!["busy".to_string(), "idle".to_string()]);
    assert!(state.sessions.is_empty());

    match lifecycle::get_session(&state, "idle").await.unwrap() {
        SessionView::Ended(archived) => {
            assert_eq!(archived.reason, EndReason::InactivityTimeout);
            assert_eq!(archived.final_status, DeliveryStatus::Assigned);
        }
        SessionView::Active(_) => panic!("session should have expired"),
    }

    assert_eq!(prune_archive(&state, Utc::now()), 0);
    assert_eq!(prune_archive(&state, Utc::now() + Duration::hours(2)), 2);
    assert!(lifecycle::get_session(&state, "idle").await.is_err());
}

struct RecordingNotifier {
    seen: Mutex<Vec<(String, ProximityKind)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &ProximityEvent) -> Result<(), AppError> {
        self.seen
            .lock()
            .unwrap()
            .push((event.delivery_id.clone(), event.kind));
        Ok(())
    }
}

#[tokio::test]
async fn dispatcher_delivers_events_to_notifier() {
    let (state, rx) = setup_state();
    let notifier = Arc::new(RecordingNotifier {
        seen: Mutex::new(Vec::new()),
    });
    tokio::spawn(run_notification_dispatcher(
        state.clone(),
        notifier.clone(),
        rx,
    ));

    start(&state, "d-1");
    let base = base_time();
    accepted(ingest(&state, "d-1", fix_north(base, 900.0, 0)).await);
    accepted(ingest(&state, "d-1", fix_north(base, 0.0, 10)).await);

    tokio::time::sleep(StdDuration::from_millis(100)).await;

    let seen = notifier.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("d-1".to_string(), ProximityKind::Nearby),
            ("d-1".to_string(), ProximityKind::Arrived),
        ]
    );
}

#[derive(Default)]
struct FrameLog {
    marker: Vec<GeoPoint>,
    text: Vec<TrackingText>,
    ended: bool,
}

impl MarkerRenderer for FrameLog {
    fn move_marker(&mut self, position: GeoPoint) {
        self.marker.push(position);
    }

    fn show_text(&mut self, text: &TrackingText) {
        self.text.push(text.clone());
    }

    fn stream_ended(&mut self) {
        self.ended = true;
    }
}

#[tokio::test]
async fn presentation_adapter_renders_until_session_ends() {
    let (state, _rx) = setup_state();
    start(&state, "d-1");
    let subscription = state.broadcaster.subscribe("d-1").unwrap();

    let adapter = PresentationAdapter::new(
        FrameLog::default(),
        PresentationSettings {
            animation_window: StdDuration::from_millis(100),
            frame_interval: StdDuration::from_millis(10),
            ..PresentationSettings::default()
        },
    );
    let rendering = tokio::spawn(adapter.run(subscription));

    let base = base_time();
    accepted(ingest(&state, "d-1", fix_north(base, 2_000.0, 0)).await);
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    accepted(ingest(&state, "d-1", fix_north(base, 1_500.0, 10)).await);
    tokio::time::sleep(StdDuration::from_millis(200)).await;

    lifecycle::end_session(&state, "d-1", EndReason::Delivered)
        .await
        .unwrap();
    let log = rendering.await.unwrap();

    assert!(log.ended);
    assert_eq!(log.text.len(), 2);
    assert_eq!(log.text[0].distance, "2.0 km");
    assert_eq!(log.text[1].distance, "1.5 km");

    let last = *log.marker.last().unwrap();
    assert!((last.lat - 1_500.0 / METERS_PER_DEGREE).abs() < 1e-12);
    // intermediate frames sit strictly between the two fixes
    let start_lat = 2_000.0 / METERS_PER_DEGREE;
    let end_lat = 1_500.0 / METERS_PER_DEGREE;
    assert!(
        log.marker
            .iter()
            .any(|p| p.lat < start_lat && p.lat > end_lat)
    );
}

#[tokio::test]
async fn tracking_websocket_streams_updates_and_releases_on_disconnect() {
    let (state, _rx) = setup_state();
    start(&state, "d-ws");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/deliveries/d-ws/ws"))
            .await
            .unwrap();
    assert_eq!(state.broadcaster.subscriber_count("d-ws"), 1);

    accepted(ingest(&state, "d-ws", fix_north(base_time(), 800.0, 1)).await);
    let message = tokio::time::timeout(StdDuration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let update: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
    assert_eq!(update["delivery_id"], "d-ws");

    socket.close(None).await.unwrap();
    drop(socket);

    let released = async {
        while state.broadcaster.subscriber_count("d-ws") > 0 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(StdDuration::from_secs(2), released)
        .await
        .expect("subscription still held after the client disconnected");

    // session itself is untouched
    assert!(matches!(
        lifecycle::get_session(&state, "d-ws").await.unwrap(),
        SessionView::Active(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_racing_end_leaves_no_archive_entry() {
    let (state, _rx) = setup_state();

    for round in 0..200 {
        let id = format!("d-race-{round}");
        start(&state, &id);

        let ending = {
            let state = state.clone();
            let id = id.clone();
            tokio::spawn(async move { lifecycle::end_session(&state, &id, EndReason::Delivered).await })
        };

        while lifecycle::start_session(
            &state,
            &id,
            GeoPoint::new(0.0, 0.0),
            DeliveryMetadata::default(),
        )
        .is_err()
        {
            tokio::task::yield_now().await;
        }
        ending.await.unwrap().unwrap();

        assert!(state.archive.get(&id).is_none(), "{id} archived while active");
        assert!(matches!(
            lifecycle::get_session(&state, &id).await.unwrap(),
            SessionView::Active(_)
        ));
    }
}
