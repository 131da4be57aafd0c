//! # Session HTTP Handlers
//!
//! REST surface for session lifecycle: create a session before opening the
//! WebSocket, inspect it, and end it. Ending a session also closes any live
//! connection attached to it.

use crate::error::VoiceError;
use crate::session::LifecycleManager;
use actix_web::{web, HttpResponse, Result as ActixResult};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub state: String,
}

/// POST /api/v1/sessions
pub async fn create_session(
    lifecycle: web::Data<LifecycleManager>,
    body: web::Json<CreateSessionRequest>,
) -> ActixResult<HttpResponse> {
    let user_id = body.user_id.clone().unwrap_or_else(|| "anonymous".to_string());
    let session_id = lifecycle.create_session(&user_id).await?;
    info!(%session_id, %user_id, "session created via http");
    Ok(HttpResponse::Created().json(CreateSessionResponse {
        session_id,
        state: "pending".to_string(),
    }))
}

/// GET /api/v1/sessions/{session_id}
pub async fn get_session(
    lifecycle: web::Data<LifecycleManager>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    match lifecycle.get_session(&session_id).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("unknown session '{}'", session_id)
        }))),
    }
}

/// POST /api/v1/sessions/{session_id}/end
pub async fn end_session(
    lifecycle: web::Data<LifecycleManager>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    if lifecycle.get_session(&session_id).await?.is_none() {
        return Err(VoiceError::ProtocolViolation(format!(
            "unknown session '{}'",
            session_id
        ))
        .into());
    }
    lifecycle.end_session(&session_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "session_id": session_id,
        "state": "ended"
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn lifecycle() -> web::Data<LifecycleManager> {
        web::Data::new(LifecycleManager::new(Arc::new(InMemorySessionStore::new())))
    }

    #[actix_rt::test]
    async fn test_create_then_end_session() {
        let lifecycle = lifecycle();
        let app = test::init_service(
            App::new()
                .app_data(lifecycle.clone())
                .route("/sessions", web::post().to(create_session))
                .route("/sessions/{id}", web::get().to(get_session))
                .route("/sessions/{id}/end", web::post().to(end_session)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/sessions")
            .set_json(serde_json::json!({"user_id": "u1"}))
            .to_request();
        let created: CreateSessionResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(created.state, "pending");

        let req = test::TestRequest::post()
            .uri(&format!("/sessions/{}/end", created.session_id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get()
            .uri(&format!("/sessions/{}", created.session_id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "ended");
    }

    #[actix_rt::test]
    async fn test_end_unknown_session_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(lifecycle())
                .route("/sessions/{id}/end", web::post().to(end_session)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/sessions/nope/end")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }
}
