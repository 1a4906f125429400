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

//! DMS enrollment service for a PKI platform.
//!
//! Mediates between certificate consumers and an external CA: it queues
//! Device-Management-System registrations for approval, forwards approved
//! CSRs to the CA, tracks the issued certificates' lifecycle, and exposes an
//! RFC 7030 (EST) endpoint for device enrollment and re-enrollment.
//!
//! Crate layout:
//!
//! - [`models`] — the DMS record and its status state machine
//! - [`csr`] / [`pkcs7`] — PKCS#10 and CMS handling
//! - [`store`] — durable DMS storage (Postgres)
//! - [`ca`] — outbound CA client
//! - [`service`] — the enrollment business core
//! - [`est`] — the RFC 7030 adapter
//! - [`auth`] — bearer-token and client-certificate identity
//! - [`server`] — HTTP/HTTPS transport, routing, mTLS termination
//! - [`logging`] / [`metrics`] — decorators around the service traits

pub mod auth;
pub mod ca;
pub mod config;
pub mod csr;
pub mod error;
pub mod est;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pkcs7;
pub mod server;
pub mod service;
pub mod store;

pub use ca::{CaClient, CaInfo, LamassuCaClient};
pub use config::Config;
pub use error::{EnrollerError, Result};
pub use est::{EstAdapter, EstService};
pub use models::{Dms, DmsStatus, DmsSubject, KeyMetadata, KeyRequest, KeyStrength, KeyType};
pub use service::{DmsService, Enroller, ENROLLER_PROFILE};
pub use store::{DmsStore, PostgresDmsStore};
