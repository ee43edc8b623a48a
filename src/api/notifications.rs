// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiError, ErrorBody};
use crate::keys::ToNpub;
use crate::notification::{Notification, NotificationError};
use crate::state::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct NotifyRequest {
    /// Recipient public key, hex or `npub`.
    pub recipient: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NotifyResponse {
    /// Whether at least one relay accepted the recipient's copy.
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServerIdentityResponse {
    pub pubkey: String,
    pub npub: String,
}

/// Send a private notification.
///
/// Delivery is best effort: relay failures still answer 202 with
/// `delivered: false`. Only a malformed recipient is an error.
#[utoipa::path(
    post,
    path = "/v1/notifications",
    tag = "Notifications",
    request_body = NotifyRequest,
    responses(
        (status = 202, description = "Notification handed to relays", body = NotifyResponse),
        (status = 400, description = "Malformed recipient", body = ErrorBody)
    )
)]
pub async fn send_notification(
    State(state): State<AppState>,
    Json(request): Json<NotifyRequest>,
) -> Result<(StatusCode, Json<NotifyResponse>), ApiError> {
    let mut notification = Notification::new(request.title, request.body);
    notification.link = request.link.filter(|l| !l.trim().is_empty());

    let response = match state.notifications.try_notify(&request.recipient, &notification).await {
        Ok(report) => NotifyResponse {
            delivered: true,
            message_id: Some(report.rumor_id),
        },
        Err(e @ NotificationError::InvalidRecipient(_)) => return Err(e.into()),
        Err(e) => {
            tracing::warn!(error = %e, "Notification not delivered");
            NotifyResponse {
                delivered: false,
                message_id: None,
            }
        }
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Public key notifications are sent from.
#[utoipa::path(
    get,
    path = "/v1/notifications/identity",
    tag = "Notifications",
    responses(
        (status = 200, description = "Server notification identity", body = ServerIdentityResponse)
    )
)]
pub async fn server_identity(State(state): State<AppState>) -> Json<ServerIdentityResponse> {
    let key = state.notifications.server_public_key();
    Json(ServerIdentityResponse {
        pubkey: key.to_hex(),
        npub: key.to_npub(),
    })
}
