//! HTTP Surface — the stable external contract: route table, CORS, request
//! logging, and graceful shutdown. Handlers are thin `async fn`s over shared
//! `Arc` state, matching axum's own idioms.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::audio::AudioAdapter;
use crate::bus::{Event, EventBus};
use crate::confirmation::{self, ConfirmationRegistry, Source};
use crate::config::SettingsStore;
use crate::logring::LogRing;
use crate::state::BridgeState;
use crate::wire::*;

pub struct AppState {
    pub bus: Arc<EventBus>,
    pub confirmations: Arc<ConfirmationRegistry>,
    pub bridge: Arc<BridgeState>,
    pub settings: SettingsStore,
    pub audio: Arc<dyn AudioAdapter>,
    pub log_ring: Arc<LogRing>,
    /// Signals the Supervisor to cycle the HTTP component (`POST /restart`).
    pub restart: mpsc::UnboundedSender<()>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(landing_page))
        .route("/toggle-mic", post(toggle_mic))
        .route("/toggle-mic/fast", post(toggle_mic_fast))
        .route("/status", get(status))
        .route("/bridge/mic-state", post(mic_state_report))
        .route("/bridge/poll", get(poll))
        .route("/volume/increase", post(volume_increase))
        .route("/volume/decrease", post(volume_decrease))
        .route("/volume/set", post(volume_set))
        .route("/volume/toggle-mute", post(volume_toggle_mute))
        .route("/restart", post(restart))
        .route("/logs", get(logs))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), log_request))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Logs every request except the long-poll endpoint (`GET /bridge/poll`,
/// which is expected to take an unbounded amount of time) into the Log Ring
/// with method, path, client address, status, and duration.
async fn log_request(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/bridge/poll" {
        return next.run(request).await;
    }

    let addr = addr
        .map(|ConnectInfo(a)| a.to_string())
        .unwrap_or_else(|| "unknown".into());
    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed();

    state.log_ring.push_request(format!(
        "{method} {path} {addr} {} {}ms",
        response.status().as_u16(),
        elapsed.as_millis()
    ));
    response
}

fn apply_local_mic_mute(state: &AppState, muted: bool) {
    if let Err(e) = state.audio.set_hardware_mute(muted) {
        tracing::warn!(error = %e, "local hardware mute failed, state still updated optimistically");
    }
}

async fn toggle_mic(State(state): State<Arc<AppState>>) -> Json<ToggleResponse> {
    let current = state.bridge.snapshot();
    let expected_new_state = !current.mic_muted;
    let attached = current.extension_attached;

    // Step 3: optimistic update so the UI stays responsive immediately.
    state.bridge.apply_local_mic_mute(expected_new_state);
    apply_local_mic_mute(&state, expected_new_state);
    state.settings.bump_request_count();

    if !attached {
        // Scenario 3: never attached — reply immediately, no registry entry.
        state.bus.broadcast(if expected_new_state {
            Event::MuteMic
        } else {
            Event::UnmuteMic
        });
        state.bus.broadcast(Event::ToggleMic);
        return Json(ToggleResponse {
            status: Status::Ok,
            muted: expected_new_state,
            confirmed: false,
            source: ReportedSource::Local,
        });
    }

    let (id, rx) = state.confirmations.register();

    // Step 4: specific direction first, generic toggle second (ordering is
    // part of the contract).
    state.bus.broadcast(if expected_new_state {
        Event::MuteMic
    } else {
        Event::UnmuteMic
    });
    state.bus.broadcast(Event::ToggleMic);

    let outcome = confirmation::await_with_deadline(
        &state.confirmations,
        id,
        rx,
        expected_new_state,
        confirmation::T_CONF,
    )
    .await;

    Json(ToggleResponse {
        status: if outcome.timed_out {
            Status::Timeout
        } else {
            Status::Ok
        },
        muted: outcome.muted,
        confirmed: outcome.confirmed,
        source: match outcome.source {
            Source::Extension => ReportedSource::Extension,
            Source::Local => ReportedSource::Local,
        },
    })
}

/// Apply a fast mic toggle: flip `BridgeState`, attempt the hardware mute,
/// bump the request counter, and broadcast the specific mute/unmute event
/// followed by the generic toggle. Shared by `POST /toggle-mic/fast` and the
/// global hotkey, which take the same fast-mode path.
pub fn fast_toggle_mic(state: &AppState) -> ToggleResponse {
    let current = state.bridge.snapshot();
    let new_state = !current.mic_muted;

    state.bridge.apply_local_mic_mute(new_state);
    apply_local_mic_mute(state, new_state);
    state.settings.bump_request_count();

    state.bus.broadcast(if new_state {
        Event::MuteMic
    } else {
        Event::UnmuteMic
    });
    state.bus.broadcast(Event::ToggleMic);

    ToggleResponse {
        status: Status::Ok,
        muted: new_state,
        confirmed: false,
        source: ReportedSource::Local,
    }
}

async fn toggle_mic_fast(State(state): State<Arc<AppState>>) -> Json<ToggleResponse> {
    Json(fast_toggle_mic(&state))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snap = state.bridge.snapshot();
    let settings = state.settings.current();
    Json(StatusResponse {
        muted: snap.mic_muted,
        output_volume: snap.output_scalar,
        output_muted: snap.output_muted,
        mute_mode: settings.mute_mode.to_string(),
        current_input_device: snap.input_device_name,
        real_mic: state.audio.hardware_mute_supported(),
    })
}

async fn mic_state_report(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MicStateReport>, axum::extract::rejection::JsonRejection>,
) -> axum::response::Response {
    let Ok(Json(report)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "missing or malformed 'muted' field".into(),
            }),
        )
            .into_response();
    };

    state.bridge.apply_mic_report(report.muted);
    let resolved = state.confirmations.resolve_all(report.muted);
    tracing::info!(muted = report.muted, resolved, "extension reported mic state");

    Json(ToggleResponse {
        status: Status::Ok,
        muted: report.muted,
        confirmed: true,
        source: ReportedSource::Extension,
    })
    .into_response()
}

async fn poll(State(state): State<Arc<AppState>>) -> axum::response::Response {
    state.bridge.mark_attached();
    let result = state.bus.wait_next().await;
    state.bridge.mark_detached();

    match result {
        Ok(event) => Json(PollResponse {
            event: event.as_wire(),
        })
        .into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn volume_increase(State(state): State<Arc<AppState>>) -> Json<VolumeResponse> {
    let step = state.settings.current().volume_step;
    adjust_output_volume(&state, step).await
}

async fn volume_decrease(State(state): State<Arc<AppState>>) -> Json<VolumeResponse> {
    let step = state.settings.current().volume_step;
    adjust_output_volume(&state, -step).await
}

async fn adjust_output_volume(state: &AppState, delta: f32) -> Json<VolumeResponse> {
    let current = state.audio.output_volume().unwrap_or(0.0);
    let target = crate::audio::clamp01(current + delta);
    if let Err(e) = state.audio.set_output_volume(target) {
        tracing::warn!(error = %e, "set_output_volume failed");
    }
    state.bridge.apply_output_change(target);

    state.bus.broadcast(if delta >= 0.0 {
        Event::VolumeUp
    } else {
        Event::VolumeDown
    });

    Json(VolumeResponse {
        status: Status::Ok,
        volume: target,
        muted: target == 0.0,
    })
}

#[derive(serde::Deserialize)]
struct VolumeSetBody {
    volume: f32,
}

async fn volume_set(
    State(state): State<Arc<AppState>>,
    body: Result<Json<VolumeSetBody>, axum::extract::rejection::JsonRejection>,
) -> axum::response::Response {
    let Ok(Json(set)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "missing or malformed 'volume' field".into(),
            }),
        )
            .into_response();
    };
    let target = crate::audio::clamp01(set.volume);
    if let Err(e) = state.audio.set_output_volume(target) {
        tracing::warn!(error = %e, "set_output_volume failed");
    }
    state.bridge.apply_output_change(target);
    Json(VolumeResponse {
        status: Status::Ok,
        volume: target,
        muted: target == 0.0,
    })
    .into_response()
}

async fn volume_toggle_mute(State(state): State<Arc<AppState>>) -> Json<VolumeResponse> {
    let current = state.audio.output_volume().unwrap_or(0.0);
    let target = if current > 0.0 { 0.0 } else { 1.0 };
    if let Err(e) = state.audio.set_output_volume(target) {
        tracing::warn!(error = %e, "set_output_volume failed");
    }
    state.bridge.apply_output_change(target);
    state.bus.broadcast(Event::ToggleSpeaker);
    Json(VolumeResponse {
        status: Status::Ok,
        volume: target,
        muted: target == 0.0,
    })
}

async fn restart(State(state): State<Arc<AppState>>) -> Json<RestartResponse> {
    let restart = state.restart.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = restart.send(());
    });
    Json(RestartResponse {
        status: "restarting",
        message: "restart scheduled".into(),
    })
}

async fn logs(State(state): State<Arc<AppState>>) -> Json<LogsResponse> {
    let entries = state
        .log_ring
        .snapshot()
        .into_iter()
        .map(|e| LogEntryWire {
            timestamp: humantime_rfc3339(e.timestamp),
            level: e.level.as_wire(),
            message: e.message,
        })
        .collect();
    Json(LogsResponse { entries })
}

fn humantime_rfc3339(t: std::time::SystemTime) -> String {
    let since_epoch = t
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", since_epoch.as_secs())
}

async fn landing_page() -> Html<&'static str> {
    Html(
        "<html><body><h1>Bridge Coordinator</h1><p>Local control plane is running.</p></body></html>",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stub::StubAdapter;
    use crate::config::Settings;
    use tower::ServiceExt;

    fn test_app() -> Arc<AppState> {
        let (restart_tx, _restart_rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(AppState {
            bus: Arc::new(EventBus::new()),
            confirmations: Arc::new(ConfirmationRegistry::new()),
            bridge: Arc::new(BridgeState::new()),
            settings: SettingsStore::new(Settings::default()),
            audio: Arc::new(StubAdapter::new(1.0, 1.0)),
            log_ring: Arc::new(LogRing::new(10)),
            restart: restart_tx,
        })
    }

    #[tokio::test]
    async fn status_returns_default_state() {
        let app = router(test_app());
        let request = axum::http::Request::builder()
            .uri("/status")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn toggle_mic_fast_replies_immediately_unconfirmed() {
        let state = test_app();
        let app = router(Arc::clone(&state));
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/toggle-mic/fast")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["confirmed"], false);
        assert_eq!(json["source"], "local");
        assert_eq!(json["muted"], true);
    }

    #[tokio::test]
    async fn toggle_mic_no_extension_attached_replies_immediately() {
        let state = test_app();
        let app = router(Arc::clone(&state));
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/toggle-mic")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["confirmed"], false);
    }

    #[tokio::test]
    async fn mic_state_report_with_no_pending_still_updates_state() {
        let state = test_app();
        let app = router(Arc::clone(&state));
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/bridge/mic-state")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(r#"{"muted": true}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.bridge.snapshot().mic_muted);
    }

    #[tokio::test]
    async fn mic_state_report_missing_field_is_bad_request() {
        let state = test_app();
        let app = router(state);
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/bridge/mic-state")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(r#"{}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn volume_increase_clamps_at_one() {
        let state = test_app();
        state.audio.set_output_volume(0.95).unwrap();
        let app = router(Arc::clone(&state));
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/volume/increase")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["volume"], 1.0);
    }

    #[tokio::test]
    async fn restart_responds_before_teardown() {
        let app = router(test_app());
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/restart")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn restart_signals_supervisor_after_delay() {
        let (restart_tx, mut restart_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut state = test_app();
        Arc::get_mut(&mut state).unwrap().restart = restart_tx;
        let app = router(Arc::clone(&state));
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/restart")
            .body(axum::body::Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap();

        assert!(restart_rx.try_recv().is_err(), "signal must not fire immediately");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(restart_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn logs_endpoint_reflects_ring_contents() {
        let state = test_app();
        state.log_ring.push(crate::logring::LogLevel::Info, "hello".into());
        let app = router(Arc::clone(&state));
        let request = axum::http::Request::builder()
            .uri("/logs")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["entries"][0]["message"], "hello");
    }

    #[tokio::test]
    async fn request_middleware_logs_non_poll_requests() {
        let state = test_app();
        let app = router(Arc::clone(&state));
        let request = axum::http::Request::builder()
            .uri("/status")
            .body(axum::body::Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap();

        let snap = state.log_ring.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].level, crate::logring::LogLevel::Request);
        assert!(snap[0].message.contains("GET /status"));
        assert!(snap[0].message.contains("200"));
    }
}
