// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{error::ErrorBody, geohash::Precision, state::AppState};

pub mod channels;
pub mod health;
pub mod notifications;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/notifications", post(notifications::send_notification))
        .route("/notifications/identity", get(notifications::server_identity))
        .route("/channels/resolve", get(channels::resolve_channel))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state);

    Router::new()
        .nest("/v1", v1_routes)
        .merge(health_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        notifications::send_notification,
        notifications::server_identity,
        channels::resolve_channel,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            notifications::NotifyRequest,
            notifications::NotifyResponse,
            notifications::ServerIdentityResponse,
            channels::ChannelInfo,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            Precision,
            ErrorBody
        )
    ),
    tags(
        (name = "Notifications", description = "Private notifications over relays"),
        (name = "Channels", description = "Location channel lookup"),
        (name = "Health", description = "Liveness and readiness checks")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::dm::open_private_dm;
    use crate::keys::{Keys, ToNpub};
    use crate::relay::MemoryRelay;
    use crate::state::test_support::state_with;

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn notification_is_accepted_and_readable() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let app = router(state_with(std::slice::from_ref(&relay)));
        let user = Keys::generate();

        let (status, body) = call(
            app,
            post_json(
                "/v1/notifications",
                serde_json::json!({
                    "recipient": user.public_key().to_hex(),
                    "title": "New Like",
                    "body": "Someone liked your post!",
                    "link": "https://soundchain.io/posts/1"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["delivered"], true);

        let message = open_private_dm(&relay.published()[0], &user).unwrap();
        assert_eq!(body["message_id"], message.id.as_str());
        assert!(message.content.contains("🔗 https://soundchain.io/posts/1"));
    }

    #[tokio::test]
    async fn malformed_recipient_is_bad_request() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        let app = router(state_with(std::slice::from_ref(&relay)));

        let (status, body) = call(
            app,
            post_json(
                "/v1/notifications",
                serde_json::json!({"recipient": "npub1xyz", "title": "t", "body": "b"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid recipient"));
        assert!(relay.published().is_empty());
    }

    #[tokio::test]
    async fn undelivered_notification_is_still_accepted() {
        let relay = Arc::new(MemoryRelay::new("memory://a"));
        relay.set_online(false);
        let app = router(state_with(std::slice::from_ref(&relay)));

        let (status, body) = call(
            app,
            post_json(
                "/v1/notifications",
                serde_json::json!({"recipient": Keys::generate().public_key().to_npub(), "title": "t", "body": "b"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["delivered"], false);
    }

    #[tokio::test]
    async fn server_identity_matches_dispatcher() {
        let state = state_with(&[Arc::new(MemoryRelay::new("memory://a"))]);
        let expected = state.notifications.server_public_key();
        let request = Request::get("/v1/notifications/identity").body(Body::empty()).unwrap();

        let (status, body) = call(router(state), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pubkey"], expected.to_hex());
        assert_eq!(body["npub"], expected.to_npub());
    }

    #[tokio::test]
    async fn resolves_channel_for_coordinate() {
        let app = router(state_with(&[Arc::new(MemoryRelay::new("memory://a"))]));
        let request = Request::get("/v1/channels/resolve?lat=37.7749&lon=-122.4194&precision=district")
            .body(Body::empty())
            .unwrap();

        let (status, body) = call(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"], "9q8yy");
        assert_eq!(body["precision"], "district");
        assert_eq!(body["hierarchy"].as_array().unwrap().len(), 5);
        assert_eq!(body["deep_link"], "bitchat://channel/9q8yy");
        assert_eq!(body["description"], "District (37.77, -122.41)");
    }

    #[tokio::test]
    async fn default_precision_and_range_checks() {
        let state = state_with(&[Arc::new(MemoryRelay::new("memory://a"))]);

        let request = Request::get("/v1/channels/resolve?lat=37.7749&lon=-122.4194").body(Body::empty()).unwrap();
        let (status, body) = call(router(state.clone()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"].as_str().unwrap().len(), 7);

        let request = Request::get("/v1/channels/resolve?lat=95&lon=0").body(Body::empty()).unwrap();
        let (status, _) = call(router(state), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn serves_openapi_document() {
        let app = router(state_with(&[Arc::new(MemoryRelay::new("memory://a"))]));
        let request = Request::get("/api-doc/openapi.json").body(Body::empty()).unwrap();
        let (status, body) = call(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/v1/notifications"].is_object());
        let schemas = &body["components"]["schemas"];
        assert!(schemas["NotifyRequest"].is_object());
        assert!(schemas.get("ConnectionMode").is_none());
    }
}
