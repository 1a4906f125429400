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

//! Prometheus metrics and the instrumenting decorator.
//!
//! Every public operation is counted and timed with `{method, error}` labels.
//! The decorator never inspects domain payloads.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use x509_cert::Certificate;

use crate::error::{EnrollerError, Result};
use crate::est::EstService;
use crate::models::{Dms, DmsStatus, DmsSubject, KeyRequest};
use crate::service::DmsService;

/// Shared metric vectors plus the registry that exports them.
pub struct Metrics {
    registry: Registry,
    request_count: IntCounterVec,
    request_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let request_count = IntCounterVec::new(
            prometheus::Opts::new("request_count", "Number of requests received"),
            &["method", "error"],
        )
        .map_err(map_prom)?;

        let request_latency = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "request_latency_microseconds",
                "Total duration of requests in microseconds",
            )
            .buckets(prometheus::exponential_buckets(100.0, 10.0, 6).map_err(map_prom)?),
            &["method", "error"],
        )
        .map_err(map_prom)?;

        registry
            .register(Box::new(request_count.clone()))
            .map_err(map_prom)?;
        registry
            .register(Box::new(request_latency.clone()))
            .map_err(map_prom)?;

        Ok(Self {
            registry,
            request_count,
            request_latency,
        })
    }

    /// Record one completed operation.
    pub fn observe(&self, method: &str, error: bool, started: Instant) {
        let labels = [method, if error { "true" } else { "false" }];
        self.request_count.with_label_values(&labels).inc();
        self.request_latency
            .with_label_values(&labels)
            .observe(started.elapsed().as_micros() as f64);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn export(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(map_prom)?;
        String::from_utf8(buffer)
            .map_err(|e| EnrollerError::store(format!("metrics encoding was not UTF-8: {}", e)))
    }
}

fn map_prom(err: prometheus::Error) -> EnrollerError {
    EnrollerError::store(format!("metrics error: {}", err))
}

/// Metrics decorator around the service traits.
pub struct Instrumented<S> {
    inner: S,
    metrics: Arc<Metrics>,
}

impl<S> Instrumented<S> {
    pub fn new(inner: S, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }

    fn record<T>(&self, method: &str, started: Instant, result: Result<T>) -> Result<T> {
        self.metrics.observe(method, result.is_err(), started);
        result
    }
}

#[async_trait]
impl<S: DmsService> DmsService for Instrumented<S> {
    async fn create_dms(&self, csr_base64: &str, name: &str) -> Result<Dms> {
        let started = Instant::now();
        let result = self.inner.create_dms(csr_base64, name).await;
        self.record("CreateDMS", started, result)
    }

    async fn create_dms_form(
        &self,
        subject: DmsSubject,
        key: KeyRequest,
        name: &str,
    ) -> Result<(String, Dms)> {
        let started = Instant::now();
        let result = self.inner.create_dms_form(subject, key, name).await;
        self.record("CreateDMSForm", started, result)
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
        self.record("UpdateDMSStatus", started, result)
    }

    async fn delete_dms(&self, id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.delete_dms(id).await;
        self.record("DeleteDMS", started, result)
    }

    async fn get_dmss(&self) -> Result<Vec<Dms>> {
        let started = Instant::now();
        let result = self.inner.get_dmss().await;
        self.record("GetDMSs", started, result)
    }

    async fn get_dms_by_id(&self, id: &str) -> Result<Dms> {
        let started = Instant::now();
        let result = self.inner.get_dms_by_id(id).await;
        self.record("GetDMSbyID", started, result)
    }

    async fn get_dms_certificate(&self, id: &str) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.inner.get_dms_certificate(id).await;
        self.record("GetDMSCertificate", started, result)
    }
}

#[async_trait]
impl<S: EstService> EstService for Instrumented<S> {
    async fn cacerts(&self, aps: &str) -> Result<Vec<Certificate>> {
        let started = Instant::now();
        let result = self.inner.cacerts(aps).await;
        self.record("CACerts", started, result)
    }

    async fn enroll(
        &self,
        aps: &str,
        csr_der: &[u8],
        peer_cert_der: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.inner.enroll(aps, csr_der, peer_cert_der).await;
        self.record("Enroll", started, result)
    }

    async fn reenroll(&self, csr_der: &[u8], peer_cert_der: Option<&[u8]>) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.inner.reenroll(csr_der, peer_cert_der).await;
        self.record("Reenroll", started, result)
    }

    async fn serverkeygen(
        &self,
        aps: &str,
        csr_der: &[u8],
        peer_cert_der: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let started = Instant::now();
        let result = self.inner.serverkeygen(aps, csr_der, peer_cert_der).await;
        self.record("ServerKeyGen", started, result)
    }

    async fn csrattrs(&self, aps: &str) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let result = self.inner.csrattrs(aps).await;
        self.record("CSRAttrs", started, result)
    }
}
