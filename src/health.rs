//! # Health and Metrics Endpoints
//!
//! Operational HTTP surface of the reference server. `/health` answers the
//! original health-check contract (status, service, version) extended with
//! uptime and connection counts; `/metrics` exposes the full transport
//! counter snapshot.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-shopper-transport",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "pipeline_backend": config.pipeline.backend
        },
        "connections": {
            "active": metrics.active_connections,
            "total": metrics.total_connections
        }
    }))
}

pub async fn transport_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "connections": {
            "active": metrics.active_connections,
            "total": metrics.total_connections,
            "protocol_violations": metrics.protocol_violations,
            "idle_timeouts": metrics.idle_timeouts
        },
        "frames": {
            "audio_in": metrics.audio_frames_in,
            "audio_out": metrics.audio_frames_out,
            "control_out": metrics.control_messages_out,
            "dropped": metrics.frames_dropped
        },
        "errored_sessions": metrics.errored_sessions
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::body::to_bytes;

    #[actix_rt::test]
    async fn test_health_payload() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        state.connection_opened();

        let resp = health_check(state).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::OK);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"]["active"], 1);
    }
}
