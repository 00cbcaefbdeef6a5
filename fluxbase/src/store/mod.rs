//! Persistence layer
//!
//! A repository boundary over the `auth` schema. Each store is a small
//! capability trait with a PostgreSQL implementation; handlers depend on
//! the trait, not the backing. Every mutating operation is transactional
//! and email comparisons are case-insensitive (normalized before lookup).

pub mod identities;
#[cfg(test)]
pub(crate) mod testutil;
pub mod oauth_state;
pub mod otp;
pub mod saml;
pub mod service_keys;
pub mod sessions;
pub mod users;

use std::sync::Arc;

pub use identities::{Identity, IdentityStore, PgIdentityStore};
pub use oauth_state::{MemoryOAuthStateStore, OAuthState, OAuthStateStore, PgOAuthStateStore};
pub use otp::{OtpCode, OtpPurpose, OtpStore, PgOtpStore};
pub use saml::{PgSamlStore, SamlProvider, SamlSession, SamlStore};
pub use service_keys::{PgServiceKeyStore, ServiceKey, ServiceKeyStore};
pub use sessions::{PgSessionStore, Session, SessionStore};
pub use users::{NewUser, PgUserStore, User, UserStore};

/// Normalize an email for storage and lookup
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// All stores bundled for state assembly
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub otp: Arc<dyn OtpStore>,
    pub oauth_state: Arc<dyn OAuthStateStore>,
    pub service_keys: Arc<dyn ServiceKeyStore>,
    pub saml: Arc<dyn SamlStore>,
}

impl Stores {
    /// Construct the PostgreSQL-backed store set over one pool
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            users: Arc::new(PgUserStore::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            identities: Arc::new(PgIdentityStore::new(pool.clone())),
            otp: Arc::new(PgOtpStore::new(pool.clone())),
            oauth_state: Arc::new(PgOAuthStateStore::new(pool.clone())),
            service_keys: Arc::new(PgServiceKeyStore::new(pool.clone())),
            saml: Arc::new(PgSamlStore::new(pool)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  User@Example.COM "), "user@example.com");
        assert_eq!(normalize_email("a@b.co"), "a@b.co");
    }
}
