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

//! Logging decorator around the service traits.
//!
//! Observes `(method, latency, error)` only. Domain payloads, and in
//! particular generated private keys, never reach the log stream.

use std::time::Instant;

use async_trait::async_trait;
use x509_cert::Certificate;

use crate::error::Result;
use crate::est::EstService;
use crate::models::{Dms, DmsStatus, DmsSubject, KeyRequest};
use crate::service::DmsService;

pub struct Logged<S> {
    inner: S,
}

impl<S> Logged<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    fn log<T>(&self, method: &str, started: Instant, result: Result<T>) -> Result<T> {
        let took_us = started.elapsed().as_micros();
        match &result {
            Ok(_) => tracing::info!(method, took_us, "operation completed"),
            Err(e) => tracing::warn!(method, took_us, error = %e, "operation failed"),
        }
        result
    }
}

#[async_trait]
impl<S: DmsService> DmsService for Logged<S> {
    async fn create_dms(&self, csr_base64: &str, name: &str) -> Result<Dms> {
        let started = Instant::now();
        let result = self.inner.create_dms(csr_base64, name).await;
        self.log("CreateDMS", started, result)
    }

    async fn create_dms_form(
        &self,
        subject: DmsSubject,
        key: KeyRequest,
        name: &str,
    ) -> Result<(String, Dms)> {
        let started = Instant::now();
        let result = self.inner.create_dms_form(subject, key, name).await;
        self.log("CreateDMSForm", started, result)
    }

    async fn update_dms_status(
        &self,
        id: &str,
        new_status: DmsStatus,
        authorized_cas: Vec<String>,
    ) -> Result<Dms> {
        let started = Instant::now();
        let result = self
            .inner
            .update_dms_status(id, new_status, authorized_cas)
            .await;
        self.log("UpdateDMSStatus", started, result)
    }

    async fn delete_dms(&self, id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.delete_dms(id).await;
        self.log("DeleteDMS", started, result)
    }

    async fn get_dmss(&self) -> Result<Vec<Dms>> {
        let started = Instant::now();
        let result = self.inner.get_dmss().await;
        self.log("GetDMSs", started, result)
    }

    async fn get_dms_by_id(&self, id: &str) -> Result<Dms> {
        let started = Instant::now();
        let result = self.inner.get_dms_by_id(id).await;
        self.log("GetDMSbyID", started, result)
    }

    async fn get_dms_certificate(&self, id: &str) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.inner.get_dms_certificate(id).await;
        self.log("GetDMSCertificate", started, result)
    }
}

#[async_trait]
impl<S: EstService> EstService for Logged<S> {
    async fn cacerts(&self, aps: &str) -> Result<Vec<Certificate>> {
        let started = Instant::now();
        let result = self.inner.cacerts(aps).await;
        self.log("CACerts", started, result)
    }

    async fn enroll(
        &self,
        aps: &str,
        csr_der: &[u8],
        peer_cert_der: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.inner.enroll(aps, csr_der, peer_cert_der).await;
        self.log("Enroll", started, result)
    }

    async fn reenroll(&self, csr_der: &[u8], peer_cert_der: Option<&[u8]>) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.inner.reenroll(csr_der, peer_cert_der).await;
        self.log("Reenroll", started, result)
    }

    async fn serverkeygen(
        &self,
        aps: &str,
        csr_der: &[u8],
        peer_cert_der: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let started = Instant::now();
        let result = self.inner.serverkeygen(aps, csr_der, peer_cert_der).await;
        self.log("ServerKeyGen", started, result)
    }

    async fn csrattrs(&self, aps: &str) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let result = self.inner.csrattrs(aps).await;
        self.log("CSRAttrs", started, result)
    }
}
