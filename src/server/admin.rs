// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Admin-plane handlers: DMS lifecycle over HAL+JSON.

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use serde_json::json;

use crate::auth::Claims;
use crate::error::{EnrollerError, Result};
use crate::models::{Dms, DmsStatus, DmsSubject, KeyRequest};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct CreateDmsRequest {
    csr: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateDmsFormRequest {
    #[serde(default)]
    subject: DmsSubject,
    key_metadata: KeyRequest,
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdateStatusRequest {
    status: String,
    #[serde(default)]
    authorized_cas: Vec<String>,
}

pub(super) async fn health() -> Response {
    Json(json!({
        "alive": true,
        "version": env!("CARGO_PKG_VERSION"),
        "ts": chrono::Utc::now(),
    }))
    .into_response()
}

pub(super) async fn create_dms(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<CreateDmsRequest>,
) -> Result<Response> {
    let dms = state.dms.create_dms(&body.csr, &name).await?;
    Ok(hal_json(dms_resource(&dms)?))
}

pub(super) async fn create_dms_form(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<CreateDmsFormRequest>,
) -> Result<Response> {
    let (priv_key, dms) = state
        .dms
        .create_dms_form(body.subject, body.key_metadata, &name)
        .await?;
    Ok(hal_json(json!({
        "priv_key": priv_key,
        "dms": dms_resource(&dms)?,
    })))
}

pub(super) async fn get_dmss(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Response> {
    let all = state.dms.get_dmss().await?;
    let visible = visible_rows(all, &claims);

    let embedded: Vec<serde_json::Value> = visible
        .iter()
        .map(dms_resource)
        .collect::<Result<Vec<_>>>()?;

    Ok(hal_json(json!({
        "total": embedded.len(),
        "_links": { "self": { "href": "/v1/" } },
        "_embedded": { "dms": embedded },
    })))
}

pub(super) async fn get_dms_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let dms = state.dms.get_dms_by_id(&id).await?;
    Ok(hal_json(dms_resource(&dms)?))
}

pub(super) async fn update_dms_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Response> {
    let new_status = DmsStatus::parse(&body.status)?;
    let dms = state
        .dms
        .update_dms_status(&id, new_status, body.authorized_cas)
        .await?;
    Ok(hal_json(dms_resource(&dms)?))
}

pub(super) async fn delete_dms(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    state.dms.delete_dms(&id).await?;
    Ok(Json(json!({ "deleted": id })).into_response())
}

pub(super) async fn get_dms_certificate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let cert_der = state.dms.get_dms_certificate(&id).await?;
    let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert_der));
    Ok(Json(json!({ "crt": general_purpose::STANDARD.encode(cert_pem) })).into_response())
}

/// Without the admin role the caller only sees its own registrations,
/// matched by certificate CN (DMS name before a certificate is issued).
fn visible_rows(all: Vec<Dms>, claims: &Claims) -> Vec<Dms> {
    if claims.is_admin() {
        return all;
    }
    let username = claims.username();
    all.into_iter()
        .filter(|dms| {
            let cn = if dms.subject.common_name.is_empty() {
                &dms.name
            } else {
                &dms.subject.common_name
            };
            cn == username
        })
        .collect()
}

fn dms_resource(dms: &Dms) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(dms)
        .map_err(|e| EnrollerError::store(format!("response encoding failed: {}", e)))?;
    value["_links"] = json!({ "self": { "href": format!("/v1/{}", dms.id) } });
    Ok(value)
}

fn hal_json(value: serde_json::Value) -> Response {
    (
        [(CONTENT_TYPE, "application/hal+json")],
        value.to_string(),
    )
        .into_response()
}
