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

//! Durable DMS storage.
//!
//! [`DmsStore`] is the seam between the enrollment service and the SQL
//! engine. All mutations on a single record are serialized by the store;
//! status updates carry the expected current status so a stale writer fails
//! its pre-condition instead of clobbering a concurrent transition.

mod postgres;

pub use postgres::PostgresDmsStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Dms, DmsStatus};

#[async_trait]
pub trait DmsStore: Send + Sync {
    /// Insert a new DMS row. Duplicate id or name yields a duplicate error.
    async fn insert(&self, dms: &Dms) -> Result<String>;

    /// All DMS rows, each with its authorized CAs loaded.
    async fn select_all(&self) -> Result<Vec<Dms>>;

    /// One DMS by id; not-found error when absent.
    async fn select_by_id(&self, id: &str) -> Result<Dms>;

    /// One DMS by certificate serial number; not-found error when absent.
    async fn select_by_serial(&self, serial: &str) -> Result<Dms>;

    /// Guarded status write: updates status, serial and modification time on
    /// the row whose current status equals `expected`. Zero rows updated
    /// means the guard lost and the call fails without mutating anything.
    async fn update_status(
        &self,
        id: &str,
        expected: DmsStatus,
        new_status: DmsStatus,
        serial: &str,
    ) -> Result<Dms>;

    /// Approval compound write: the guarded `PENDING_APPROVAL → APPROVED`
    /// update plus the authorized-CA inserts, in one transaction.
    async fn approve(&self, id: &str, serial: &str, authorized_cas: &[String]) -> Result<Dms>;

    /// Delete the DMS row and its authorized-CA rows atomically.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Bind CA names to a DMS.
    async fn insert_authorized_cas(&self, dms_id: &str, ca_names: &[String]) -> Result<()>;

    /// Remove every CA binding for a DMS.
    async fn delete_authorized_cas(&self, dms_id: &str) -> Result<()>;

    /// CA names bound to one DMS.
    async fn select_authorized_cas(&self, dms_id: &str) -> Result<Vec<String>>;

    /// Every `(dms_id, ca_name)` pair in the relation.
    async fn select_all_authorized_cas(&self) -> Result<Vec<(String, String)>>;
}
