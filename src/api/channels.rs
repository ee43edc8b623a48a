// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::Query, Json};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::channel::{channel_hierarchy, deep_link, location_to_channel, COMPANION_INSTALL_URL};
use crate::error::{ApiError, ErrorBody};
use crate::geohash::{self, Precision};

#[derive(Debug, Deserialize, IntoParams)]
pub struct ResolveQuery {
    pub lat: f64,
    pub lon: f64,
    /// Channel size; defaults to `stage`.
    #[serde(default)]
    #[param(value_type = Option<Precision>)]
    pub precision: Precision,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChannelInfo {
    pub channel: String,
    pub precision: Precision,
    pub approximate_size: String,
    /// Enclosing channels, shortest first, ending with `channel`.
    pub hierarchy: Vec<String>,
    pub description: String,
    pub deep_link: String,
    pub install_url: String,
}

/// Resolve a coordinate to its location channel.
#[utoipa::path(
    get,
    path = "/v1/channels/resolve",
    tag = "Channels",
    params(ResolveQuery),
    responses(
        (status = 200, description = "Channel for the coordinate", body = ChannelInfo),
        (status = 400, description = "Coordinate out of range", body = ErrorBody)
    )
)]
pub async fn resolve_channel(Query(query): Query<ResolveQuery>) -> Result<Json<ChannelInfo>, ApiError> {
    let channel = location_to_channel(query.lat, query.lon, query.precision)?;
    Ok(Json(ChannelInfo {
        hierarchy: channel_hierarchy(&channel),
        description: geohash::describe(&channel)?,
        deep_link: deep_link(&channel),
        install_url: COMPANION_INSTALL_URL.to_string(),
        precision: query.precision,
        approximate_size: query.precision.approximate_size().to_string(),
        channel,
    }))
}
