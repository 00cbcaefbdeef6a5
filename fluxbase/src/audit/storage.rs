//! PostgreSQL audit storage
//!
//! Writes batches into `auth.audit_log`. The table is append-only;
//! UPDATE/DELETE are discarded by rules installed in the migrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::entry::{ActorType, AuditEntry, AuditOutcome};
use super::logger::AuditWriter;
use crate::error::Result;

/// PostgreSQL-backed audit writer
pub struct PgAuditStorage {
    pool: PgPool,
}

impl PgAuditStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recent entries, newest first (admin listing)
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT ts, actor_id, actor_type, ip, action, target, outcome, detail \
             FROM auth.audit_log ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl AuditWriter for PgAuditStorage {
    async fn append_batch(&self, entries: &[AuditEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO auth.audit_log (ts, actor_id, actor_type, ip, action, target, outcome, detail)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.ts)
            .bind(entry.actor_id)
            .bind(entry.actor_type.as_str())
            .bind(&entry.ip)
            .bind(&entry.action)
            .bind(&entry.target)
            .bind(entry.outcome.as_str())
            .bind(&entry.detail)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    ts: DateTime<Utc>,
    actor_id: Option<Uuid>,
    actor_type: String,
    ip: Option<String>,
    action: String,
    target: Option<String>,
    outcome: String,
    detail: serde_json::Value,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        let actor_type = match row.actor_type.as_str() {
            "anonymous" => ActorType::Anonymous,
            "user" => ActorType::User,
            "service" => ActorType::Service,
            _ => ActorType::System,
        };
        let outcome = match row.outcome.as_str() {
            "denied" => AuditOutcome::Denied,
            "error" => AuditOutcome::Error,
            _ => AuditOutcome::Ok,
        };

        AuditEntry {
            ts: row.ts,
            actor_id: row.actor_id,
            actor_type,
            ip: row.ip,
            action: row.action,
            target: row.target,
            outcome,
            detail: row.detail,
        }
    }
}
