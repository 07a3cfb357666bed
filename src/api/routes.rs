//! API route definitions.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::provider::ProviderId;
use crate::scheduler::{ConfigError, ScheduleConfig};
use crate::storage::{ExportFormat, HistoryFilter};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/providers", get(list_providers))
        .route("/speedtest/run", post(run_speedtest))
        .route("/history", get(list_history).delete(clear_history))
        .route("/history/export", get(export_history))
        .route("/config", get(get_config).put(put_config))
        .route("/scheduler/status", get(scheduler_status))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "cycle_running": state.scheduler.gate().is_busy()
        },
        "meta": meta()
    }))
}

async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let providers = state.scheduler.runner().probes().metas();
    Json(json!({ "data": providers, "meta": meta() }))
}

async fn run_speedtest(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    // The handle is dropped; the cycle keeps running detached.
    let _cycle = state.scheduler.trigger_manual()?;
    let config = state.config.get();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "data": {
                "status": "started",
                "provider": config.provider,
                "delay_secs": config.delay_secs
            },
            "meta": meta()
        })),
    ))
}

/// Query parameters shared by the history endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub provider: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub format: Option<String>,
}

impl HistoryQuery {
    fn filter(&self) -> ApiResult<HistoryFilter> {
        let provider = self
            .provider
            .as_deref()
            .map(str::parse::<ProviderId>)
            .transpose()?;
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ApiError::bad_request("'from' must not be after 'to'"));
            }
        }
        Ok(HistoryFilter {
            provider,
            from: self.from,
            to: self.to,
        })
    }
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let filter = query.filter()?;
    let records = state.history.list(&filter).await?;
    Ok(Json(json!({
        "data": records,
        "meta": { "total": records.len(), "timestamp": Utc::now().to_rfc3339() }
    })))
}

async fn clear_history(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.history.clear().await?;
    Ok(Json(json!({ "data": { "cleared": true }, "meta": meta() })))
}

async fn export_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let format: ExportFormat = query.format.as_deref().unwrap_or("json").parse()?;
    let filter = query.filter()?;
    let body = state.history.export(format, &filter).await?;
    let headers = [
        (header::CONTENT_TYPE, format.content_type().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", format.file_name()),
        ),
    ];
    Ok((headers, body))
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.config.get(), "meta": meta() }))
}

/// Partial schedule update. Absent fields keep their current value; the
/// merged result replaces the stored config as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
}

impl ConfigPatch {
    pub fn apply(&self, base: ScheduleConfig) -> Result<ScheduleConfig, ConfigError> {
        let provider = match &self.provider {
            Some(p) => p.parse()?,
            None => base.provider,
        };
        Ok(ScheduleConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            interval_secs: self.interval_secs.unwrap_or(base.interval_secs),
            provider,
            delay_secs: self.delay_secs.unwrap_or(base.delay_secs),
        })
    }
}

async fn put_config(
    State(state): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<Json<Value>> {
    let updated = state.config.update(|current| patch.apply(current)).await?;
    Ok(Json(json!({ "data": updated, "meta": meta() })))
}

async fn scheduler_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.scheduler.status(), "meta": meta() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::clock::{Clock, SystemClock};
    use crate::provider::ProbeSet;
    use crate::scheduler::runner::testing::ScriptedProbe;
    use crate::scheduler::{ConfigStore, ProbeRunner, ProviderSelection, RunnerSettings, Scheduler};
    use crate::storage::{HistoryStore, MeasurementRecord};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        app: Router,
        state: AppState,
    }

    async fn test_app(work: Duration) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryStore::open(dir.path()).await.unwrap();
        let schedule = ScheduleConfig {
            enabled: false,
            interval_secs: 3600,
            provider: ProviderSelection::SpeedSmart,
            delay_secs: 0,
        };
        let config = Arc::new(ConfigStore::load(dir.path(), schedule).await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let probes = ProbeSet::new().with(
            ProviderId::SpeedSmart,
            ScriptedProbe::ok(ProviderId::SpeedSmart, work),
        );
        let runner = Arc::new(ProbeRunner::new(
            probes,
            history,
            clock.clone(),
            RunnerSettings::default(),
        ));
        let scheduler = Scheduler::new(
            config,
            runner,
            clock,
            Duration::from_secs(10),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let state = AppState::new(scheduler);
        TestApp {
            _dir: dir,
            app: router(state.clone()),
            state,
        }
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let t = test_app(Duration::ZERO).await;
        let resp = t.app.oneshot(get("/api/v1/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["status"], "ok");
        assert!(json["meta"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let t = test_app(Duration::ZERO).await;
        let resp = t.app.oneshot(get("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_concurrent_run_requests_admit_exactly_one() {
        let t = test_app(Duration::from_secs(60)).await;

        let requests = (0..8).map(|_| {
            let app = t.app.clone();
            async move {
                let req = Request::builder()
                    .method("POST")
                    .uri("/api/v1/speedtest/run")
                    .body(Body::empty())
                    .unwrap();
                app.oneshot(req).await.unwrap().status()
            }
        });
        let statuses = futures::future::join_all(requests).await;

        let accepted = statuses.iter().filter(|s| **s == StatusCode::ACCEPTED).count();
        let conflicts = statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count();
        assert_eq!(accepted, 1);
        assert_eq!(conflicts, 7);

        let status = body_json(t.app.oneshot(get("/api/v1/scheduler/status")).await.unwrap()).await;
        assert_eq!(status["data"]["running"], true);
        assert_eq!(status["data"]["running_trigger"], "manual");
    }

    #[tokio::test]
    async fn test_config_put_validates_and_keeps_previous() {
        let t = test_app(Duration::ZERO).await;

        let resp = t
            .app
            .clone()
            .oneshot(put_json("/api/v1/config", json!({ "interval_secs": 0 })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");

        let resp = t
            .app
            .clone()
            .oneshot(put_json("/api/v1/config", json!({ "provider": "fast" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(t.state.config.get().interval_secs, 3600);

        let resp = t
            .app
            .clone()
            .oneshot(put_json(
                "/api/v1/config",
                json!({ "enabled": true, "interval_secs": 60, "provider": "both" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["interval_secs"], 60);
        assert_eq!(json["data"]["provider"], "both");
        assert_eq!(json["data"]["delay_secs"], 0);

        let json = body_json(t.app.oneshot(get("/api/v1/config")).await.unwrap()).await;
        assert_eq!(json["data"]["enabled"], true);
    }

    #[tokio::test]
    async fn test_history_filter_export_and_clear() {
        let t = test_app(Duration::ZERO).await;
        let now = Utc::now();
        t.state
            .history
            .append(MeasurementRecord::failed(ProviderId::OpenSpeedTest, now, "timeout"))
            .await
            .unwrap();
        t.state
            .history
            .append(MeasurementRecord::failed(ProviderId::SpeedSmart, now, "timeout"))
            .await
            .unwrap();

        let json = body_json(
            t.app
                .clone()
                .oneshot(get("/api/v1/history?provider=speedsmart"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["meta"]["total"], 1);
        assert_eq!(json["data"][0]["provider"], "speedsmart");

        let resp = t
            .app
            .clone()
            .oneshot(get("/api/v1/history?provider=ookla"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = t
            .app
            .clone()
            .oneshot(get("/api/v1/history/export?format=csv"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/csv");
        assert!(resp.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("speedtest_history.csv"));
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.lines().count(), 3);

        let resp = t
            .app
            .clone()
            .oneshot(get("/api/v1/history/export?format=xml"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = t
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(t.app.oneshot(get("/api/v1/history")).await.unwrap()).await;
        assert_eq!(json["meta"]["total"], 0);
    }

    #[test]
    fn test_config_patch_merges_onto_current() {
        let patch = ConfigPatch {
            delay_secs: Some(5),
            ..ConfigPatch::default()
        };
        let merged = patch.apply(ScheduleConfig::default()).unwrap();
        assert_eq!(merged.delay_secs, 5);
        assert_eq!(merged.interval_secs, 86_400);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({ "delay_secs": 5 })
        );
    }
}
