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

//! HTTP transport: router assembly, TLS termination, Consul registration.
//!
//! The HTTPS listener runs its own accept loop instead of `axum::serve` so
//! the TLS peer certificate can be pulled off the finished handshake and
//! attached to the request as a [`PeerCertificates`] extension before the
//! router sees it. Client certificate verification itself happens in the
//! rustls handshake; unauthenticated peers are admitted so `cacerts` works
//! without a client certificate, and the mTLS-gated handlers reject requests
//! whose extension is absent.

mod admin;
mod docs;
mod est;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{KeycloakVerifier, PeerCertificates};
use crate::config::{Config, ConsulConfig, Protocol};
use crate::error::{EnrollerError, Result};
use crate::est::EstService;
use crate::metrics::Metrics;
use crate::service::DmsService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub dms: Arc<dyn DmsService>,
    pub est: Arc<dyn EstService>,
    pub verifier: Arc<KeycloakVerifier>,
    pub metrics: Arc<Metrics>,
}

impl IntoResponse for EnrollerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_internal() {
            tracing::error!(error = %self, "request failed");
            (status, Json(json!({ "error": "internal server error" }))).into_response()
        } else {
            (status, Json(json!({ "error": self.to_string() }))).into_response()
        }
    }
}

/// Assemble the full router: admin plane behind bearer auth, public probes,
/// and the EST surface.
pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/v1/", get(admin::get_dmss))
        .route(
            "/v1/{id}",
            post(admin::create_dms)
                .get(admin::get_dms_by_id)
                .put(admin::update_dms_status)
                .delete(admin::delete_dms),
        )
        .route("/v1/{id}/form", post(admin::create_dms_form))
        .route("/v1/{id}/crt", get(admin::get_dms_certificate))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth));

    let public = Router::new()
        .route("/v1/health", get(admin::health))
        .route("/metrics", get(export_metrics))
        .route("/v1/docs/spec.json", get(docs::spec_json))
        .route("/v1/docs/", get(docs::docs_ui));

    let est = Router::new()
        .route("/.well-known/est/cacerts", get(est::cacerts))
        .route("/.well-known/est/{aps}/cacerts", get(est::cacerts_labeled))
        .route("/.well-known/est/{aps}/simpleenroll", post(est::simpleenroll))
        .route("/.well-known/est/simplereenroll", post(est::simplereenroll))
        .route("/.well-known/est/{aps}/serverkeygen", post(est::serverkeygen))
        .route("/.well-known/est/csrattrs", get(est::csrattrs))
        .route("/.well-known/est/{aps}/csrattrs", get(est::csrattrs_labeled));

    Router::new()
        .merge(admin)
        .merge(public)
        .merge(est)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([ORIGIN, CONTENT_TYPE, AUTHORIZATION]),
        )
        .with_state(state)
}

/// Run the service until SIGINT/SIGTERM, registering with Consul when
/// configured.
pub async fn serve(config: Config, state: AppState) -> Result<()> {
    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let registrar = match &config.consul {
        Some(consul) => {
            let registrar = ConsulRegistrar::new(consul)?;
            registrar.register(config.port).await?;
            Some(registrar)
        }
        None => None,
    };

    let result = match config.protocol {
        Protocol::Http => {
            let listener = TcpListener::bind(addr).await?;
            tracing::info!(%addr, "listening (http)");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(EnrollerError::Io)
        }
        Protocol::Https => serve_tls(&config, addr, router).await,
    };

    if let Some(registrar) = registrar {
        if let Err(e) = registrar.deregister().await {
            tracing::warn!(error = %e, "service deregistration failed");
        }
    }

    result
}

async fn serve_tls(config: &Config, addr: SocketAddr, router: Router) -> Result<()> {
    let tls_config = build_tls_config(config)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, mutual_tls = config.mutual_tls_enabled, "listening (https)");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(handle_tls_connection(
                            acceptor.clone(),
                            stream,
                            router.clone(),
                            remote,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_tls_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    router: Router,
    remote: SocketAddr,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(%remote, error = %e, "TLS handshake failed");
            return;
        }
    };

    let peer = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|chain| PeerCertificates(chain.iter().map(|c| c.as_ref().to_vec()).collect()));

    let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        let router = router.clone();
        let peer = peer.clone();
        async move {
            if let Some(peer) = peer {
                req.extensions_mut().insert(peer);
            }
            router.oneshot(req).await
        }
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        tracing::debug!(%remote, error = %e, "connection error");
    }
}

fn build_tls_config(config: &Config) -> Result<Arc<rustls::ServerConfig>> {
    use std::fs::File;
    use std::io::BufReader;

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&config.cert_file)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&config.key_file)?))?
        .ok_or_else(|| EnrollerError::Config("no private key found in KEY_FILE".to_string()))?;

    let builder = rustls::ServerConfig::builder();
    let mut tls = if config.mutual_tls_enabled {
        let ca_path = config.mutual_tls_client_ca.as_ref().ok_or_else(|| {
            EnrollerError::Config("MUTUAL_TLS_ENABLED requires MUTUAL_TLS_CLIENT_CA".to_string())
        })?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(ca_path)?)) {
            roots
                .add(cert?)
                .map_err(|e| EnrollerError::Config(format!("bad client CA certificate: {}", e)))?;
        }

        // Anonymous peers are admitted at handshake time; cacerts has no
        // client certificate, and the enroll handlers enforce presence.
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .map_err(|e| EnrollerError::Config(format!("client verifier build failed: {}", e)))?;

        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| EnrollerError::Config(format!("TLS configuration failed: {}", e)))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| EnrollerError::Config(format!("TLS configuration failed: {}", e)))?
    };

    tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(tls))
}

/// Bearer-token middleware for the admin plane. Verified claims land in the
/// request extensions for the handlers that filter by caller.
async fn bearer_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return EnrollerError::unauthorized("missing bearer token").into_response();
    };

    match state.verifier.verify(token).await {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

async fn export_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export() {
        Ok(text) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Registers the service with the Consul agent and removes it on shutdown.
struct ConsulRegistrar {
    http: reqwest::Client,
    base_url: String,
    service_id: String,
}

impl ConsulRegistrar {
    fn new(config: &ConsulConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(ca_file) = &config.ca {
            let pem = std::fs::read(ca_file)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url(),
            service_id: format!("enroller-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn register(&self, port: u16) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let body = json!({
            "ID": self.service_id,
            "Name": "enroller",
            "Port": port,
            "Tags": ["dms", "est"],
        });
        self.http
            .put(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| EnrollerError::Config(format!("service registration failed: {}", e)))?;
        tracing::info!(service_id = %self.service_id, "registered with consul");
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, self.service_id
        );
        self.http.put(&url).send().await?.error_for_status().map_err(|e| {
            EnrollerError::Config(format!("service deregistration failed: {}", e))
        })?;
        tracing::info!(service_id = %self.service_id, "deregistered from consul");
        Ok(())
    }
}
