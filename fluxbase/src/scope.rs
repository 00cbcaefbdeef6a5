//! Authorization binder
//!
//! Maps a verified [`Principal`] onto a transaction-local database scope:
//! `SET LOCAL ROLE` from a closed three-element set plus session-local
//! claim variables that row-level security policies read. The binder is
//! the only legitimate path from request handlers to the runtime pool;
//! tenant data is never queried outside a scope.

use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::error::{is_serialization_failure, Error, Result};
use crate::principal::Principal;

/// The closed set of PostgreSQL roles requests may assume.
///
/// Application roles live in claims only; they are never used as database
/// roles. Anything outside this set is a bug and fails loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbRole {
    Anon,
    Authenticated,
    ServiceRole,
}

impl DbRole {
    /// The SQL identifier. Static by construction, so interpolation into
    /// `SET LOCAL ROLE` cannot inject.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anon => "anon",
            Self::Authenticated => "authenticated",
            Self::ServiceRole => "service_role",
        }
    }

    /// Fixed Principal → role mapping
    pub fn for_principal(principal: &Principal) -> Self {
        match principal {
            Principal::Anonymous { .. } => Self::Anon,
            Principal::Service { .. } => Self::ServiceRole,
            Principal::User { role, .. } if role == "service_role" => Self::ServiceRole,
            Principal::User { .. } => Self::Authenticated,
        }
    }

    /// Validate an externally supplied role name against the closed set
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "anon" => Ok(Self::Anon),
            "authenticated" => Ok(Self::Authenticated),
            "service_role" => Ok(Self::ServiceRole),
            other => Err(Error::Internal(format!(
                "'{}' is not a mapped database role",
                other
            ))),
        }
    }
}

/// An open, principal-bound database scope
///
/// Commits on [`DbScope::commit`]; dropping without commit rolls the
/// transaction back (sqlx transaction drop semantics), which also resets
/// the local role.
pub struct DbScope {
    tx: Transaction<'static, Postgres>,
    role: DbRole,
}

impl DbScope {
    /// The executor handlers issue SQL through
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub fn role(&self) -> DbRole {
        self.role
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Factory for principal-bound scopes over the runtime pool
#[derive(Clone)]
pub struct ScopeBinder {
    pool: PgPool,
}

impl ScopeBinder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a scope: begin a transaction, assume the mapped role and set
    /// the session-local claim variables RLS policies read.
    pub async fn begin(&self, principal: &Principal) -> Result<DbScope> {
        let role = DbRole::for_principal(principal);
        let mut tx = self.pool.begin().await?;

        // SET ROLE does not take bind parameters; `role` comes from the
        // closed enum above.
        sqlx::query(&format!("SET LOCAL ROLE {}", role.as_str()))
            .execute(&mut *tx)
            .await?;

        let user_id = principal
            .actor_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let claims_json = match principal {
            Principal::User { claims, .. } => serde_json::to_string(claims)?,
            Principal::Service { key_id, .. } => serde_json::to_string(&serde_json::json!({
                "sub": key_id,
                "role": "service_role",
            }))?,
            Principal::Anonymous { .. } => serde_json::to_string(&serde_json::json!({
                "role": "anon",
            }))?,
        };

        sqlx::query(
            "SELECT set_config('app.user_id', $1, true), \
                    set_config('app.role', $2, true), \
                    set_config('request.jwt.claims', $3, true)",
        )
        .bind(user_id)
        .bind(principal.role())
        .bind(claims_json)
        .execute(&mut *tx)
        .await?;

        Ok(DbScope { tx, role })
    }

    /// Run a closure inside a scope, committing on success.
    ///
    /// Transient serialization failures (SQLSTATE 40001) are retried once
    /// with a fresh scope; all other errors roll back and propagate.
    pub async fn run<T, F>(&self, principal: &Principal, f: F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut scope = self.begin(principal).await?;

            match f(scope.conn()).await {
                Ok(value) => {
                    scope.commit().await?;
                    return Ok(value);
                }
                Err(Error::Database(message)) if attempts == 1 && message.contains("40001") => {
                    let _ = scope.rollback().await;
                    tracing::debug!("serialization failure, retrying scope once");
                    continue;
                }
                Err(err) => {
                    let _ = scope.rollback().await;
                    return Err(err);
                }
            }
        }
    }

    /// Retry classification for raw sqlx errors surfaced by callers
    pub fn retriable(err: &sqlx::Error) -> bool {
        is_serialization_failure(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user_principal(role: &str) -> Principal {
        Principal::User {
            user_id: Uuid::new_v4(),
            role: role.to_string(),
            session_id: Some(Uuid::new_v4()),
            claims: Box::new(crate::token::Claims {
                sub: Uuid::new_v4().to_string(),
                role: role.to_string(),
                typ: crate::token::TokenType::Access,
                iat: 0,
                exp: i64::MAX,
                iss: "fluxbase".into(),
                session_id: None,
                user_metadata: None,
                app_metadata: None,
            }),
        }
    }

    #[test]
    fn test_role_mapping_is_closed() {
        assert_eq!(
            DbRole::for_principal(&Principal::Anonymous { ip: None }),
            DbRole::Anon
        );
        assert_eq!(
            DbRole::for_principal(&Principal::Service {
                key_id: Uuid::new_v4(),
                scopes: vec![],
            }),
            DbRole::ServiceRole
        );
        assert_eq!(
            DbRole::for_principal(&user_principal("authenticated")),
            DbRole::Authenticated
        );
        // Application roles never leak into the DB role: any custom role
        // still maps to `authenticated`.
        assert_eq!(
            DbRole::for_principal(&user_principal("editor")),
            DbRole::Authenticated
        );
        // Except the service role, which is one of the three.
        assert_eq!(
            DbRole::for_principal(&user_principal("service_role")),
            DbRole::ServiceRole
        );
    }

    #[test]
    fn test_parse_rejects_unmapped_roles() {
        assert!(DbRole::parse("anon").is_ok());
        assert!(DbRole::parse("authenticated").is_ok());
        assert!(DbRole::parse("service_role").is_ok());
        assert!(DbRole::parse("postgres").is_err());
        assert!(DbRole::parse("editor").is_err());
        assert!(DbRole::parse("").is_err());
    }

    #[test]
    fn test_role_sql_identifiers() {
        assert_eq!(DbRole::Anon.as_str(), "anon");
        assert_eq!(DbRole::Authenticated.as_str(), "authenticated");
        assert_eq!(DbRole::ServiceRole.as_str(), "service_role");
    }
}
