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

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use dms_enroller::auth::KeycloakVerifier;
use dms_enroller::ca::LamassuCaClient;
use dms_enroller::config::Config;
use dms_enroller::est::{EstAdapter, EstService};
use dms_enroller::logging::Logged;
use dms_enroller::metrics::{Instrumented, Metrics};
use dms_enroller::server::{self, AppState};
use dms_enroller::service::{DmsService, Enroller};
use dms_enroller::store::PostgresDmsStore;
use dms_enroller::Result;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("dms-enroller: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let default_filter = if config.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting dms-enroller");

    let store = Arc::new(PostgresDmsStore::connect(&config.postgres).await?);
    let ca = Arc::new(LamassuCaClient::from_config(&config)?);
    let verifier = Arc::new(KeycloakVerifier::from_config(&config.keycloak)?);
    let metrics = Arc::new(Metrics::new()?);

    let dms: Arc<dyn DmsService> = Arc::new(Logged::new(Instrumented::new(
        Enroller::new(store.clone(), ca.clone()),
        metrics.clone(),
    )));
    let est: Arc<dyn EstService> = Arc::new(Logged::new(Instrumented::new(
        EstAdapter::new(ca, store),
        metrics.clone(),
    )));

    server::serve(
        config,
        AppState {
            dms,
            est,
            verifier,
            metrics,
        },
    )
    .await
}
