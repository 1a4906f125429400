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

//! Postgres-backed [`DmsStore`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::PostgresConfig;
use crate::error::{EnrollerError, Result};
use crate::models::{Dms, DmsStatus, DmsSubject, KeyMetadata, KeyType};
use crate::store::DmsStore;

const CONNECT_ATTEMPTS: u32 = 12;
const CONNECT_BACKOFF: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dms_store (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    "serialNumber"  TEXT NOT NULL DEFAULT '',
    "keyType"       TEXT NOT NULL,
    "keyBits"       INTEGER NOT NULL,
    "csrBase64"     TEXT NOT NULL,
    status          TEXT NOT NULL,
    creation_ts     TIMESTAMPTZ NOT NULL DEFAULT now(),
    modification_ts TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS authorized_cas (
    dmsid  TEXT NOT NULL,
    caname TEXT NOT NULL,
    PRIMARY KEY (dmsid, caname)
);
CREATE UNIQUE INDEX IF NOT EXISTS dms_store_serial_unique
    ON dms_store ("serialNumber") WHERE "serialNumber" <> ''
"#;

/// Spellings that satisfy a status guard. Rows written by older deployments
/// carry the misspelled pending value, and those must still be approvable
/// and deniable.
fn accepted_spellings(status: DmsStatus) -> Vec<String> {
    match status {
        DmsStatus::PendingApproval => {
            vec!["PENDING_APPROVAL".to_string(), "PENDIG_APPROVAL".to_string()]
        }
        other => vec![other.as_str().to_string()],
    }
}

/// DMS store over a Postgres connection pool.
pub struct PostgresDmsStore {
    pool: PgPool,
}

impl PostgresDmsStore {
    /// Connect with bounded retries, probe the connection, and ensure the
    /// schema exists. Exits with a store error after the attempt budget.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let url = config.connection_url();
        let mut attempt = 0u32;

        let pool = loop {
            attempt += 1;
            match PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
            {
                Ok(pool) => match sqlx::query("SELECT 1").execute(&pool).await {
                    Ok(_) => break pool,
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "database probe failed");
                    }
                },
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "database connection failed");
                }
            }
            if attempt >= CONNECT_ATTEMPTS {
                return Err(EnrollerError::store(format!(
                    "database unreachable after {} attempts",
                    attempt
                )));
            }
            tokio::time::sleep(CONNECT_BACKOFF).await;
        };

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(map_sqlx)?;
        }

        tracing::info!(host = %config.hostname, db = %config.db, "connected to database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by deployments that manage the pool).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn cas_for(&self, dms_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT caname FROM authorized_cas WHERE dmsid = $1 ORDER BY caname")
            .bind(dms_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("caname").map_err(map_sqlx))
            .collect()
    }
}

#[async_trait]
impl DmsStore for PostgresDmsStore {
    async fn insert(&self, dms: &Dms) -> Result<String> {
        sqlx::query(
            r#"INSERT INTO dms_store
               (id, name, "serialNumber", "keyType", "keyBits", "csrBase64", status, creation_ts, modification_ts)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(&dms.id)
        .bind(&dms.name)
        .bind(&dms.serial_number)
        .bind(dms.key_metadata.key_type.as_str())
        .bind(dms.key_metadata.key_bits)
        .bind(&dms.csr_base64)
        .bind(dms.status.as_str())
        .bind(dms.creation_ts)
        .bind(dms.modification_ts)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(dms.id.clone())
    }

    async fn select_all(&self) -> Result<Vec<Dms>> {
        let rows = sqlx::query("SELECT * FROM dms_store ORDER BY creation_ts")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let pairs = self.select_all_authorized_cas().await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut dms = row_to_dms(&row)?;
            dms.authorized_cas = pairs
                .iter()
                .filter(|(id, _)| *id == dms.id)
                .map(|(_, ca)| ca.clone())
                .collect();
            out.push(dms);
        }
        Ok(out)
    }

    async fn select_by_id(&self, id: &str) -> Result<Dms> {
        let row = sqlx::query("SELECT * FROM dms_store WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut dms = row_to_dms(&row)?;
        dms.authorized_cas = self.cas_for(id).await?;
        Ok(dms)
    }

    async fn select_by_serial(&self, serial: &str) -> Result<Dms> {
        let row = sqlx::query(r#"SELECT * FROM dms_store WHERE "serialNumber" = $1"#)
            .bind(serial)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut dms = row_to_dms(&row)?;
        let id = dms.id.clone();
        dms.authorized_cas = self.cas_for(&id).await?;
        Ok(dms)
    }

    async fn update_status(
        &self,
        id: &str,
        expected: DmsStatus,
        new_status: DmsStatus,
        serial: &str,
    ) -> Result<Dms> {
        let result = sqlx::query(
            r#"UPDATE dms_store
               SET status = $1, "serialNumber" = $2, modification_ts = now()
               WHERE id = $3 AND status = ANY($4)"#,
        )
        .bind(new_status.as_str())
        .bind(serial)
        .bind(id)
        .bind(accepted_spellings(expected))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(EnrollerError::invalid_operation(format!(
                "no rows updated: DMS {} is not in status {}",
                id, expected
            )));
        }
        self.select_by_id(id).await
    }

    async fn approve(&self, id: &str, serial: &str, authorized_cas: &[String]) -> Result<Dms> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let result = sqlx::query(
            r#"UPDATE dms_store
               SET status = 'APPROVED', "serialNumber" = $1, modification_ts = now()
               WHERE id = $2 AND status = ANY($3)"#,
        )
        .bind(serial)
        .bind(id)
        .bind(accepted_spellings(DmsStatus::PendingApproval))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            // Rolls back on drop.
            return Err(EnrollerError::invalid_operation(format!(
                "no rows updated: DMS {} is not pending approval",
                id
            )));
        }

        for ca in authorized_cas {
            sqlx::query("INSERT INTO authorized_cas (dmsid, caname) VALUES ($1, $2)")
                .bind(id)
                .bind(ca)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        self.select_by_id(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query("DELETE FROM authorized_cas WHERE dmsid = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let result = sqlx::query("DELETE FROM dms_store WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(EnrollerError::not_found(id));
        }

        tx.commit().await.map_err(map_sqlx)
    }

    async fn insert_authorized_cas(&self, dms_id: &str, ca_names: &[String]) -> Result<()> {
        for ca in ca_names {
            sqlx::query("INSERT INTO authorized_cas (dmsid, caname) VALUES ($1, $2)")
                .bind(dms_id)
                .bind(ca)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn delete_authorized_cas(&self, dms_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM authorized_cas WHERE dmsid = $1")
            .bind(dms_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn select_authorized_cas(&self, dms_id: &str) -> Result<Vec<String>> {
        self.cas_for(dms_id).await
    }

    async fn select_all_authorized_cas(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT dmsid, caname FROM authorized_cas")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| {
                Ok((
                    r.try_get::<String, _>("dmsid").map_err(map_sqlx)?,
                    r.try_get::<String, _>("caname").map_err(map_sqlx)?,
                ))
            })
            .collect()
    }
}

fn row_to_dms(row: &PgRow) -> Result<Dms> {
    let key_type = KeyType::parse(&row.try_get::<String, _>("keyType").map_err(map_sqlx)?)?;
    let key_bits: i32 = row.try_get("keyBits").map_err(map_sqlx)?;
    let key_metadata = match key_type {
        KeyType::Unknown => KeyMetadata::unknown(),
        _ => KeyMetadata::new(key_type, key_bits),
    };

    Ok(Dms {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        status: DmsStatus::parse(&row.try_get::<String, _>("status").map_err(map_sqlx)?)?,
        serial_number: row.try_get("serialNumber").map_err(map_sqlx)?,
        key_metadata,
        subject: DmsSubject::default(),
        csr_base64: row.try_get("csrBase64").map_err(map_sqlx)?,
        certificate_base64: None,
        authorized_cas: Vec::new(),
        creation_ts: row.try_get::<DateTime<Utc>, _>("creation_ts").map_err(map_sqlx)?,
        modification_ts: row
            .try_get::<DateTime<Utc>, _>("modification_ts")
            .map_err(map_sqlx)?,
    })
}

fn map_sqlx(err: sqlx::Error) -> EnrollerError {
    match &err {
        sqlx::Error::RowNotFound => EnrollerError::not_found("no matching row"),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            EnrollerError::duplicate(db.message().to_string())
        }
        _ => EnrollerError::store(err.to_string()),
    }
}
