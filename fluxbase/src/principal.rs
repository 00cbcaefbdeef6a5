//! Caller resolution
//!
//! Runs early in the middleware chain and converts request credentials
//! into a typed [`Principal`]. Credential headers are checked in a fixed
//! order: `X-Service-Key`, `apikey`, `Authorization: Bearer`, then auth
//! cookies. No credential means Anonymous; an invalid credential is fatal
//! for the request and short-circuits with 401.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::crypto::PasswordHasher;
use crate::error::{Error, Result};
use crate::store::{service_keys, ServiceKeyStore};
use crate::token::{Claims, TokenService};

/// The verified identity of a request
///
/// Exactly three cases; every consumer must match exhaustively.
#[derive(Debug, Clone)]
pub enum Principal {
    /// No credential presented
    Anonymous { ip: Option<String> },

    /// An end user authenticated by a session-bound token
    User {
        user_id: Uuid,
        role: String,
        session_id: Option<Uuid>,
        claims: Box<Claims>,
    },

    /// A server-to-server caller holding a service key
    Service { key_id: Uuid, scopes: Vec<String> },
}

impl Principal {
    /// Application role string for claims propagation
    pub fn role(&self) -> &str {
        match self {
            Self::Anonymous { .. } => "anon",
            Self::User { role, .. } => role,
            Self::Service { .. } => "service_role",
        }
    }

    /// True for service keys and users carrying the service role
    pub fn is_service_role(&self) -> bool {
        match self {
            Self::Service { .. } => true,
            Self::User { role, .. } => role == "service_role",
            Self::Anonymous { .. } => false,
        }
    }

    /// Subject id for audit entries
    pub fn actor_id(&self) -> Option<Uuid> {
        match self {
            Self::Anonymous { .. } => None,
            Self::User { user_id, .. } => Some(*user_id),
            Self::Service { key_id, .. } => Some(*key_id),
        }
    }

    /// Audit actor classification
    pub fn actor_type(&self) -> crate::audit::ActorType {
        match self {
            Self::Anonymous { .. } => crate::audit::ActorType::Anonymous,
            Self::User { .. } => crate::audit::ActorType::User,
            Self::Service { .. } => crate::audit::ActorType::Service,
        }
    }

    /// Require a service-key scope; user/service-role principals pass
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        match self {
            Self::Service { scopes, .. } => {
                if scopes.iter().any(|s| s == scope || s == "*") {
                    Ok(())
                } else {
                    Err(Error::ScopeInsufficient(scope.to_string()))
                }
            }
            Self::User { role, .. } if role == "service_role" => Ok(()),
            _ => Err(Error::Forbidden("service credential required".into())),
        }
    }
}

/// How the winning credential arrived; CSRF only applies to cookie auth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    None,
    ServiceKey,
    ApiKeyHeader,
    Bearer,
    Cookie,
}

/// Client IP as resolved by the caller resolver
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

/// Resolver state injected into the middleware
#[derive(Clone)]
pub struct CallerResolver {
    tokens: TokenService,
    service_keys: Arc<dyn ServiceKeyStore>,
    hasher: PasswordHasher,
    trust_proxy: bool,
}

impl CallerResolver {
    pub fn new(
        tokens: TokenService,
        service_keys: Arc<dyn ServiceKeyStore>,
        hasher: PasswordHasher,
        trust_proxy: bool,
    ) -> Self {
        Self {
            tokens,
            service_keys,
            hasher,
            trust_proxy,
        }
    }

    /// Middleware: resolve the caller and stash it in request extensions
    pub async fn middleware(
        State(resolver): State<Self>,
        mut request: Request<Body>,
        next: Next,
    ) -> Result<Response> {
        let ip = resolver.client_ip(&request);

        let (principal, source) = resolver
            .resolve(request.headers(), ip.clone())
            .await?;

        tracing::debug!(role = principal.role(), source = ?source, "caller resolved");

        request.extensions_mut().insert(principal);
        request.extensions_mut().insert(source);
        request.extensions_mut().insert(ClientIp(ip));

        Ok(next.run(request).await)
    }

    /// Resolve headers into a Principal; any invalid credential is fatal
    pub async fn resolve(
        &self,
        headers: &HeaderMap,
        ip: Option<String>,
    ) -> Result<(Principal, CredentialSource)> {
        if let Some(raw_key) = header_str(headers, "x-service-key") {
            let principal = self.resolve_service_key(raw_key).await?;
            return Ok((principal, CredentialSource::ServiceKey));
        }

        if let Some(token) = header_str(headers, "apikey") {
            let principal = self.resolve_token(token, ip.clone()).await?;
            return Ok((principal, CredentialSource::ApiKeyHeader));
        }

        if let Some(auth) = header_str(headers, "authorization") {
            let token = auth
                .strip_prefix("Bearer ")
                .ok_or(Error::TokenInvalid)?;
            let principal = self.resolve_token(token, ip.clone()).await?;
            return Ok((principal, CredentialSource::Bearer));
        }

        if let Some(token) = cookie_value(headers, "access_token") {
            let principal = self.resolve_token(&token, ip.clone()).await?;
            return Ok((principal, CredentialSource::Cookie));
        }

        Ok((Principal::Anonymous { ip }, CredentialSource::None))
    }

    async fn resolve_service_key(&self, raw_key: &str) -> Result<Principal> {
        let prefix = service_keys::key_prefix(raw_key);
        let candidates = self.service_keys.find_by_prefix(prefix).await?;

        let now = chrono::Utc::now();
        for key in candidates {
            if !key.is_usable(now) {
                continue;
            }
            if self.hasher.verify(raw_key, &key.key_hash)? {
                return Ok(Principal::Service {
                    key_id: key.id,
                    scopes: key.scopes,
                });
            }
        }

        Err(Error::TokenInvalid)
    }

    async fn resolve_token(&self, token: &str, ip: Option<String>) -> Result<Principal> {
        let claims = self.tokens.verify(token).await?;

        match claims.role.as_str() {
            // Supabase-parity static keys: anon behaves like no credential
            // beyond the role, service_role is a full service principal.
            "anon" if claims.session_id.is_none() => Ok(Principal::Anonymous { ip }),
            "service_role" if claims.session_id.is_none() => Ok(Principal::Service {
                key_id: claims.user_id().unwrap_or(Uuid::nil()),
                scopes: vec!["*".to_string()],
            }),
            _ => {
                let user_id = claims.user_id().ok_or(Error::TokenInvalid)?;
                Ok(Principal::User {
                    user_id,
                    role: claims.role.clone(),
                    session_id: claims.session_id,
                    claims: Box::new(claims),
                })
            }
        }
    }

    fn client_ip(&self, request: &Request<Body>) -> Option<String> {
        if self.trust_proxy {
            if let Some(forwarded) = header_str(request.headers(), "x-forwarded-for") {
                // Leftmost hop is the original client
                if let Some(first) = forwarded.split(',').next() {
                    let trimmed = first.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Pull a cookie value out of the Cookie header
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = header_str(headers, "cookie")?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next()? == name {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_principal_roles() {
        let anon = Principal::Anonymous { ip: None };
        assert_eq!(anon.role(), "anon");
        assert!(!anon.is_service_role());

        let service = Principal::Service {
            key_id: Uuid::new_v4(),
            scopes: vec!["*".into()],
        };
        assert_eq!(service.role(), "service_role");
        assert!(service.is_service_role());
    }

    #[test]
    fn test_scope_enforcement() {
        let service = Principal::Service {
            key_id: Uuid::new_v4(),
            scopes: vec!["tables:read".into()],
        };
        assert!(service.require_scope("tables:read").is_ok());
        assert!(matches!(
            service.require_scope("admin"),
            Err(Error::ScopeInsufficient(_))
        ));

        let anon = Principal::Anonymous { ip: None };
        assert!(matches!(
            anon.require_scope("tables:read"),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("theme=dark; access_token=abc.def.ghi; lang=en"),
        );
        assert_eq!(
            cookie_value(&headers, "access_token"),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(cookie_value(&headers, "refresh_token"), None);
    }

    #[test]
    fn test_header_lookup_missing() {
        let headers = HeaderMap::new();
        assert!(header_str(&headers, "authorization").is_none());
        assert!(cookie_value(&headers, "access_token").is_none());
    }
}
