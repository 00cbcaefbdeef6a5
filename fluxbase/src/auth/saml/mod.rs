//! SAML bridging
//!
//! Providers are configured with IdP metadata (inline XML, or fetched
//! from a URL at configuration time and stored inline). The ACS validates
//! assertions end to end: signature against the IdP certificate, time
//! conditions, audience and recipient, replay, then the provider's group
//! policy. SP-initiated SLO signs a LogoutRequest with the SP key;
//! IdP-initiated SLO kills the matching local sessions and answers with a
//! LogoutResponse.

pub mod assertion;
pub mod metadata;
pub mod signature;

use std::io::Write;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use flate2::{write::DeflateEncoder, Compression};
use uuid::Uuid;

use crate::audit::{ActorType, AuditEntry, AuditLogger, AuditOutcome};
use crate::config::SamlSpConfig;
use crate::error::{Error, Result};
use crate::store::{NewUser, SamlProvider, SamlStore, User, UserStore};
use crate::token::{TokenPair, TokenService};

pub use assertion::{check_groups, parse_logout_request, parse_response, ParsedAssertion};
pub use metadata::{fetch_idp_metadata, parse_idp_metadata, IdpMetadata};

/// Completed ACS exchange
#[derive(Debug, Clone)]
pub struct AcsResult {
    pub user: User,
    pub session: TokenPair,
    pub relay_state: Option<String>,
}

/// SAML flow service
#[derive(Clone)]
pub struct SamlService {
    store: Arc<dyn SamlStore>,
    users: Arc<dyn UserStore>,
    tokens: TokenService,
    audit: AuditLogger,
    sp: SamlSpConfig,
}

impl SamlService {
    pub fn new(
        store: Arc<dyn SamlStore>,
        users: Arc<dyn UserStore>,
        tokens: TokenService,
        audit: AuditLogger,
        sp: SamlSpConfig,
    ) -> Self {
        Self {
            store,
            users,
            tokens,
            audit,
            sp,
        }
    }

    /// SP metadata document published to IdPs
    pub fn sp_metadata_xml(&self) -> String {
        let certificate = self
            .sp
            .sp_certificate_pem
            .as_deref()
            .map(pem_body)
            .unwrap_or_default();

        let key_descriptor = if certificate.is_empty() {
            String::new()
        } else {
            format!(
                r#"<md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#
            )
        };

        format!(
            r#"<?xml version="1.0"?><md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity_id}"><md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">{key_descriptor}<md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{slo_url}"/><md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{acs_url}" index="0"/></md:SPSSODescriptor></md:EntityDescriptor>"#,
            entity_id = self.sp.entity_id,
            slo_url = self.sp.slo_url,
            acs_url = self.sp.acs_url,
        )
    }

    /// Build the IdP redirect URL starting SP-initiated login
    pub async fn login_url(&self, provider_name: &str, relay_state: Option<&str>) -> Result<String> {
        let provider = self.enabled_provider(provider_name).await?;
        let idp = self.idp_metadata(&provider)?;

        let request_id = format!("_{}", Uuid::new_v4().simple());
        let authn_request = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{sso_url}" AssertionConsumerServiceURL="{acs_url}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"><saml:Issuer>{entity_id}</saml:Issuer></samlp:AuthnRequest>"#,
            id = request_id,
            instant = Utc::now().to_rfc3339(),
            sso_url = idp.sso_url,
            acs_url = self.sp.acs_url,
            entity_id = self.sp.entity_id,
        );

        let encoded = deflate_b64(authn_request.as_bytes())?;
        let mut params = vec![("SAMLRequest", encoded)];
        if let Some(relay) = relay_state {
            params.push(("RelayState", relay.to_string()));
        }

        let url = reqwest::Url::parse_with_params(&idp.sso_url, &params)
            .map_err(|e| Error::Internal(format!("invalid SSO URL: {}", e)))?;
        Ok(url.to_string())
    }

    /// Handle the POST-binding ACS callback.
    ///
    /// The issuing provider is resolved from the assertion's `Issuer`
    /// against the configured providers.
    pub async fn handle_acs(
        &self,
        saml_response_b64: &str,
        relay_state: Option<String>,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<AcsResult> {
        let xml_bytes = STANDARD
            .decode(saml_response_b64.trim())
            .map_err(|_| Error::BadRequest("SAMLResponse is not base64".into()))?;
        let xml = String::from_utf8(xml_bytes)
            .map_err(|_| Error::BadRequest("SAMLResponse is not UTF-8".into()))?;

        let parsed = parse_response(&xml)?;

        let (provider, idp) = self.provider_by_issuer(&parsed.issuer).await?;

        signature::verify_enveloped_signature(&xml, &parsed.id, &idp.certificates)?;
        parsed.validate(&self.sp.entity_id, &self.sp.acs_url, Utc::now())?;

        // Replay protection for the lifetime of NotOnOrAfter
        let retention = parsed
            .not_on_or_after
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
        if !self.store.record_assertion(&parsed.id, retention).await? {
            return Err(Error::Forbidden("assertion replay detected".into()));
        }

        let groups = self.extract_groups(&provider, &parsed);
        if let Err(err) = check_groups(
            &groups,
            &provider.denied_groups,
            &provider.required_groups,
            &provider.required_groups_all,
        ) {
            self.audit.record(
                AuditEntry::new("auth.saml.acs")
                    .ip(ip.unwrap_or_default())
                    .target(parsed.name_id.clone())
                    .outcome(AuditOutcome::Denied)
                    .detail(serde_json::json!({"provider": provider.name, "groups": groups})),
            );
            return Err(err);
        }

        let user = self.resolve_user(&provider, &parsed).await?;

        let session_index = parsed.session_index.clone().unwrap_or_default();
        self.store
            .create_session(&provider.name, &parsed.name_id, &session_index, user.id)
            .await?;

        self.users.record_successful_login(user.id).await?;
        let session = self
            .tokens
            .start_session(&user, user_agent, ip.clone())
            .await?;

        self.audit.record(
            AuditEntry::new("auth.saml.acs")
                .actor(ActorType::User, Some(user.id))
                .ip(ip.unwrap_or_default())
                .target(format!("{}:{}", provider.name, parsed.name_id)),
        );

        Ok(AcsResult {
            user,
            session,
            relay_state,
        })
    }

    /// Handle an IdP-initiated LogoutRequest; returns the LogoutResponse
    /// XML to send back. The provider is resolved from the request issuer.
    pub async fn handle_idp_logout(&self, request_xml: &str) -> Result<String> {
        let request = parse_logout_request(request_xml)?;
        if request.issuer.is_empty() {
            return Err(Error::BadRequest("LogoutRequest has no issuer".into()));
        }
        let (provider, idp) = self.provider_by_issuer(&request.issuer).await?;

        // The request must prove IdP origin before it can kill sessions:
        // the signature over the LogoutRequest is verified against the
        // provider's metadata certificates, and unsigned requests are
        // rejected outright.
        if request.id.is_empty() {
            return Err(Error::BadRequest("LogoutRequest has no ID".into()));
        }
        signature::verify_enveloped_signature(request_xml, &request.id, &idp.certificates)?;

        let session_index = request.session_indexes.first().map(|s| s.as_str());
        let user_ids = self
            .store
            .delete_sessions(&provider.name, &request.name_id, session_index)
            .await?;

        for user_id in &user_ids {
            self.tokens.revoke_all_sessions(*user_id).await?;
            self.audit.record(
                AuditEntry::new("auth.saml.slo")
                    .actor(ActorType::User, Some(*user_id))
                    .target(format!("{}:{}", provider.name, request.name_id)),
            );
        }

        Ok(format!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_{id}" Version="2.0" IssueInstant="{instant}" InResponseTo="{in_response_to}"><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status></samlp:LogoutResponse>"#,
            id = Uuid::new_v4().simple(),
            instant = Utc::now().to_rfc3339(),
            in_response_to = request.id,
            issuer = self.sp.entity_id,
        ))
    }

    /// Build a signed SP-initiated LogoutRequest redirect URL
    pub async fn sp_logout_url(
        &self,
        provider_name: &str,
        name_id: &str,
        session_index: Option<&str>,
    ) -> Result<String> {
        let provider = self.enabled_provider(provider_name).await?;
        let idp = self.idp_metadata(&provider)?;
        let slo_url = idp
            .slo_url
            .ok_or_else(|| Error::BadRequest("IdP metadata has no SLO endpoint".into()))?;
        let sp_key = self
            .sp
            .sp_private_key_pem
            .as_deref()
            .ok_or_else(|| Error::Config("SP-initiated SLO requires an SP signing key".into()))?;

        let session_index_xml = session_index
            .map(|index| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", index))
            .unwrap_or_default();
        let logout_request = format!(
            r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_{id}" Version="2.0" IssueInstant="{instant}" Destination="{slo_url}"><saml:Issuer>{issuer}</saml:Issuer><saml:NameID>{name_id}</saml:NameID>{session_index_xml}</samlp:LogoutRequest>"#,
            id = Uuid::new_v4().simple(),
            instant = Utc::now().to_rfc3339(),
            slo_url = slo_url,
            issuer = self.sp.entity_id,
            name_id = name_id,
        );

        let encoded = deflate_b64(logout_request.as_bytes())?;
        let mut url = reqwest::Url::parse_with_params(
            &slo_url,
            &[
                ("SAMLRequest", encoded.as_str()),
                ("SigAlg", "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"),
            ],
        )
        .map_err(|e| Error::Internal(format!("invalid SLO URL: {}", e)))?;

        // The signature covers the encoded query as it will be sent
        let signed_query = url.query().unwrap_or_default().to_string();
        let signature_b64 = signature::sign_with_sp_key(sp_key, signed_query.as_bytes())?;
        url.query_pairs_mut()
            .append_pair("Signature", &signature_b64);

        Ok(url.to_string())
    }

    /// Match an assertion/request issuer to a configured enabled provider
    async fn provider_by_issuer(&self, issuer: &str) -> Result<(SamlProvider, IdpMetadata)> {
        for provider in self.store.list_providers().await? {
            if !provider.enabled {
                continue;
            }
            match self.idp_metadata(&provider) {
                Ok(idp) if idp.entity_id == issuer => return Ok((provider, idp)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(provider = %provider.name, error = %e, "unparseable provider metadata skipped");
                }
            }
        }
        Err(Error::Forbidden(format!(
            "no enabled provider matches issuer '{}'",
            issuer
        )))
    }

    async fn enabled_provider(&self, name: &str) -> Result<SamlProvider> {
        let provider = self
            .store
            .find_provider(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unknown SAML provider '{}'", name)))?;
        if !provider.enabled {
            return Err(Error::Forbidden(format!(
                "SAML provider '{}' is disabled",
                name
            )));
        }
        Ok(provider)
    }

    fn idp_metadata(&self, provider: &SamlProvider) -> Result<IdpMetadata> {
        let xml = provider.metadata_xml.as_deref().ok_or_else(|| {
            Error::Internal(format!(
                "provider '{}' has no stored metadata",
                provider.name
            ))
        })?;
        parse_idp_metadata(xml)
    }

    /// Apply the provider's attribute map; `groups` defaults to "groups"
    fn extract_groups(&self, provider: &SamlProvider, parsed: &ParsedAssertion) -> Vec<String> {
        let attribute = provider.attribute_map["groups"]
            .as_str()
            .unwrap_or("groups");
        parsed.attribute(attribute).to_vec()
    }

    async fn resolve_user(
        &self,
        provider: &SamlProvider,
        parsed: &ParsedAssertion,
    ) -> Result<User> {
        let email_attribute = provider.attribute_map["email"].as_str().unwrap_or("email");
        let email = parsed
            .attribute(email_attribute)
            .first()
            .cloned()
            .or_else(|| parsed.name_id.contains('@').then(|| parsed.name_id.clone()))
            .ok_or_else(|| Error::BadRequest("assertion carries no email".into()))?;

        if let Some(user) = self.users.find_by_email(&email).await? {
            return Ok(user);
        }

        if !provider.auto_create_users {
            return Err(Error::Forbidden("no account matches this identity".into()));
        }

        let name_attribute = provider.attribute_map["name"].as_str().unwrap_or("displayName");
        self.users
            .create(NewUser {
                email,
                encrypted_password: None,
                email_verified: true,
                role: "authenticated".to_string(),
                user_metadata: serde_json::json!({
                    "name": parsed.attribute(name_attribute).first(),
                }),
                app_metadata: serde_json::json!({ "provider": provider.name }),
            })
            .await
    }
}

/// Raw deflate then base64, as the HTTP-Redirect binding requires
fn deflate_b64(data: &[u8]) -> Result<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map(|compressed| STANDARD.encode(compressed))
        .map_err(|e| Error::Internal(format!("deflate failed: {}", e)))
}

/// Strip PEM armor and whitespace, leaving the base64 body
fn pem_body(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_b64_roundtrip() {
        use flate2::read::DeflateDecoder;
        use std::io::Read;

        let encoded = deflate_b64(b"<samlp:AuthnRequest/>").unwrap();
        let compressed = STANDARD.decode(encoded).unwrap();

        let mut decoder = DeflateDecoder::new(&compressed[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, "<samlp:AuthnRequest/>");
    }

    #[test]
    fn test_pem_body_strips_armor() {
        let pem = "-----BEGIN CERTIFICATE-----\nTUlJQw==\n-----END CERTIFICATE-----\n";
        assert_eq!(pem_body(pem), "TUlJQw==");
    }
}
