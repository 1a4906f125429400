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

//! OpenAPI description and a minimal docs page.

use axum::response::{Html, IntoResponse, Json, Response};
use serde_json::json;

pub(super) async fn spec_json() -> Response {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": "DMS Enroller",
            "description": "Device Management System enrollment service with an RFC 7030 (EST) device-facing endpoint",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/v1/health": {
                "get": { "summary": "Liveness probe", "responses": { "200": { "description": "alive" } } }
            },
            "/v1/": {
                "get": { "summary": "List DMSs", "responses": { "200": { "description": "HAL collection of DMS records" } } }
            },
            "/v1/{id}": {
                "post": { "summary": "Create DMS from a base64 PEM CSR", "responses": { "200": { "description": "DMS record" }, "409": { "description": "duplicate name" } } },
                "get": { "summary": "Read one DMS", "responses": { "200": { "description": "DMS record" }, "404": { "description": "unknown id" } } },
                "put": { "summary": "Change DMS status", "responses": { "200": { "description": "updated record" }, "400": { "description": "illegal transition" } } },
                "delete": { "summary": "Delete a DENIED or REVOKED DMS", "responses": { "200": { "description": "deleted" }, "400": { "description": "not deletable" } } }
            },
            "/v1/{id}/form": {
                "post": { "summary": "Create DMS with a server-generated key", "responses": { "200": { "description": "private key and DMS record" } } }
            },
            "/v1/{id}/crt": {
                "get": { "summary": "Fetch the issued certificate", "responses": { "200": { "description": "base64 PEM certificate" } } }
            },
            "/.well-known/est/cacerts": {
                "get": { "summary": "EST CA certificates", "responses": { "200": { "description": "certs-only PKCS#7" } } }
            },
            "/.well-known/est/{aps}/simpleenroll": {
                "post": { "summary": "EST enrollment (mTLS)", "responses": { "200": { "description": "issued certificate" }, "401": { "description": "missing or unauthorized client certificate" } } }
            },
            "/.well-known/est/simplereenroll": {
                "post": { "summary": "EST re-enrollment (mTLS)", "responses": { "200": { "description": "renewed certificate" }, "400": { "description": "subject changed" } } }
            },
            "/.well-known/est/{aps}/serverkeygen": {
                "post": { "summary": "EST enrollment with server-generated key (mTLS)", "responses": { "200": { "description": "multipart key and certificate" } } }
            }
        }
    }))
    .into_response()
}

pub(super) async fn docs_ui() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>DMS Enroller API</title>
  <meta charset="utf-8"/>
</head>
<body>
  <redoc spec-url="/v1/docs/spec.json"></redoc>
  <script src="https://cdn.redoc.ly/redoc/latest/bundles/redoc.standalone.js"></script>
</body>
</html>"#,
    )
}
