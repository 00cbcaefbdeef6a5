//! Realtime registry
//!
//! Records which `(schema, table)` pairs emit change notifications and
//! under what policy. The listener consults a process-wide read-mostly
//! cache with TTL refresh; admin mutations invalidate it immediately on
//! this instance and via the admin NOTIFY channel on the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::Result;

/// Per-table change-capture policy
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TablePolicy {
    pub schema_name: String,
    pub table_name: String,
    pub enabled: bool,
    /// Enabled event types: INSERT, UPDATE, DELETE
    pub events: Vec<String>,
    /// Columns the trigger strips from payloads
    pub excluded_columns: Vec<String>,
}

struct CacheState {
    policies: HashMap<(String, String), TablePolicy>,
    loaded_at: Option<Instant>,
}

/// Cached view over `realtime.registry`
#[derive(Clone)]
pub struct RealtimeRegistry {
    pool: PgPool,
    cache: Arc<RwLock<CacheState>>,
    ttl: Duration,
}

impl RealtimeRegistry {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(CacheState {
                policies: HashMap::new(),
                loaded_at: None,
            })),
            ttl,
        }
    }

    /// Whether `(schema, table)` currently emits `event`
    pub async fn allows(&self, schema: &str, table: &str, event: &str) -> Result<bool> {
        self.refresh_if_stale().await?;

        let cache = self.cache.read().await;
        Ok(cache
            .policies
            .get(&(schema.to_string(), table.to_string()))
            .map(|policy| {
                policy.enabled && policy.events.iter().any(|e| e.eq_ignore_ascii_case(event))
            })
            .unwrap_or(false))
    }

    /// Policy lookup for subscription checks
    pub async fn policy(&self, schema: &str, table: &str) -> Result<Option<TablePolicy>> {
        self.refresh_if_stale().await?;

        let cache = self.cache.read().await;
        Ok(cache
            .policies
            .get(&(schema.to_string(), table.to_string()))
            .cloned())
    }

    /// All registered policies (admin listing)
    pub async fn list(&self) -> Result<Vec<TablePolicy>> {
        let rows = sqlx::query_as::<_, TablePolicy>(
            "SELECT schema_name, table_name, enabled, events, excluded_columns \
             FROM realtime.registry ORDER BY schema_name, table_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Upsert a policy row (admin mutation) and invalidate the cache
    pub async fn upsert(&self, policy: &TablePolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO realtime.registry (schema_name, table_name, enabled, events, excluded_columns, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (schema_name, table_name) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                events = EXCLUDED.events,
                excluded_columns = EXCLUDED.excluded_columns,
                updated_at = now()
            "#,
        )
        .bind(&policy.schema_name)
        .bind(&policy.table_name)
        .bind(policy.enabled)
        .bind(&policy.events)
        .bind(&policy.excluded_columns)
        .execute(&self.pool)
        .await?;

        self.invalidate().await;
        Ok(())
    }

    /// Drop the cache; the next lookup reloads from the table
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        cache.loaded_at = None;
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        {
            let cache = self.cache.read().await;
            if let Some(loaded_at) = cache.loaded_at {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(());
                }
            }
        }

        let rows = self.list().await?;

        let mut cache = self.cache.write().await;
        cache.policies = rows
            .into_iter()
            .map(|policy| {
                (
                    (policy.schema_name.clone(), policy.table_name.clone()),
                    policy,
                )
            })
            .collect();
        cache.loaded_at = Some(Instant::now());
        Ok(())
    }

    /// Seed the cache directly (tests)
    #[cfg(test)]
    pub(crate) async fn seed(&self, policies: Vec<TablePolicy>) {
        let mut cache = self.cache.write().await;
        cache.policies = policies
            .into_iter()
            .map(|policy| {
                (
                    (policy.schema_name.clone(), policy.table_name.clone()),
                    policy,
                )
            })
            .collect();
        cache.loaded_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RealtimeRegistry {
        // The pool is never touched while the cache is fresh
        let pool = sqlx::PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        RealtimeRegistry::new(pool, Duration::from_secs(3600))
    }

    fn policy(enabled: bool, events: &[&str]) -> TablePolicy {
        TablePolicy {
            schema_name: "public".into(),
            table_name: "tasks".into(),
            enabled,
            events: events.iter().map(|e| e.to_string()).collect(),
            excluded_columns: vec!["secret".into()],
        }
    }

    #[tokio::test]
    async fn test_allows_respects_enabled_and_events() {
        let registry = registry();
        registry.seed(vec![policy(true, &["INSERT", "UPDATE"])]).await;

        assert!(registry.allows("public", "tasks", "INSERT").await.unwrap());
        assert!(registry.allows("public", "tasks", "insert").await.unwrap());
        assert!(!registry.allows("public", "tasks", "DELETE").await.unwrap());
        assert!(!registry.allows("public", "other", "INSERT").await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_table_drops_everything() {
        let registry = registry();
        registry.seed(vec![policy(false, &["INSERT"])]).await;
        assert!(!registry.allows("public", "tasks", "INSERT").await.unwrap());
    }

    #[tokio::test]
    async fn test_policy_lookup() {
        let registry = registry();
        registry.seed(vec![policy(true, &["INSERT"])]).await;

        let policy = registry.policy("public", "tasks").await.unwrap().unwrap();
        assert_eq!(policy.excluded_columns, vec!["secret"]);
        assert!(registry.policy("public", "ghost").await.unwrap().is_none());
    }
}
