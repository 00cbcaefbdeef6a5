//! IdP metadata parsing
//!
//! Accepts metadata as inline XML or by URL. Extracts the entity id, the
//! SSO/SLO endpoints and the signing certificates (DER) embedded in
//! `KeyDescriptor` elements.

use base64::{engine::general_purpose::STANDARD, Engine};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

const REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
const POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

/// Parsed IdP metadata
#[derive(Debug, Clone)]
pub struct IdpMetadata {
    pub entity_id: String,
    /// SSO endpoint; HTTP-Redirect preferred, POST as fallback
    pub sso_url: String,
    pub slo_url: Option<String>,
    /// DER-encoded signing certificates
    pub certificates: Vec<Vec<u8>>,
}

/// Parse an `EntityDescriptor` metadata document
pub fn parse_idp_metadata(xml: &str) -> Result<IdpMetadata> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entity_id = None;
    let mut sso_redirect = None;
    let mut sso_post = None;
    let mut slo_redirect = None;
    let mut slo_post = None;
    let mut certificates = Vec::new();
    let mut in_certificate = false;
    let mut cert_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"EntityDescriptor" => {
                        entity_id = attr_value(&e, b"entityID");
                    }
                    b"SingleSignOnService" => {
                        let binding = attr_value(&e, b"Binding").unwrap_or_default();
                        let location = attr_value(&e, b"Location");
                        if binding == REDIRECT_BINDING {
                            sso_redirect = location;
                        } else if binding == POST_BINDING {
                            sso_post = location;
                        }
                    }
                    b"SingleLogoutService" => {
                        let binding = attr_value(&e, b"Binding").unwrap_or_default();
                        let location = attr_value(&e, b"Location");
                        if binding == REDIRECT_BINDING {
                            slo_redirect = location;
                        } else if binding == POST_BINDING {
                            slo_post = location;
                        }
                    }
                    b"X509Certificate" => {
                        in_certificate = true;
                        cert_text.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) if in_certificate => {
                cert_text.push_str(&t.unescape().map_err(xml_err)?);
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"X509Certificate" => {
                in_certificate = false;
                let compact: String = cert_text.split_whitespace().collect();
                let der = STANDARD
                    .decode(&compact)
                    .map_err(|_| Error::BadRequest("metadata certificate is not base64".into()))?;
                if !der.is_empty() {
                    certificates.push(der);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(e)),
            _ => {}
        }
    }

    let entity_id =
        entity_id.ok_or_else(|| Error::BadRequest("metadata has no entityID".into()))?;
    let sso_url = sso_redirect
        .or(sso_post)
        .ok_or_else(|| Error::BadRequest("metadata has no SSO endpoint".into()))?;

    if certificates.is_empty() {
        return Err(Error::BadRequest(
            "metadata has no signing certificate".into(),
        ));
    }

    Ok(IdpMetadata {
        entity_id,
        sso_url,
        slo_url: slo_redirect.or(slo_post),
        certificates,
    })
}

/// Fetch metadata from a URL (admin-time operation)
pub async fn fetch_idp_metadata(url: &str) -> Result<String> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::External(format!("failed to fetch IdP metadata: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::External(format!(
            "IdP metadata request failed: {}",
            response.status()
        )));
    }

    response
        .text()
        .await
        .map_err(|e| Error::External(format!("failed to read IdP metadata: {}", e)))
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn xml_err(e: quick_xml::Error) -> Error {
    Error::BadRequest(format!("malformed XML: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = r#"<?xml version="1.0"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://idp.example.com/saml">
  <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>
            TUlJQ2R6Q0NBZUNn
          </ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/slo"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://idp.example.com/sso"/>
    <md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/sso-post"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#;

    #[test]
    fn test_parse_metadata() {
        let metadata = parse_idp_metadata(METADATA).unwrap();
        assert_eq!(metadata.entity_id, "https://idp.example.com/saml");
        assert_eq!(metadata.sso_url, "https://idp.example.com/sso");
        assert_eq!(metadata.slo_url.as_deref(), Some("https://idp.example.com/slo"));
        assert_eq!(metadata.certificates.len(), 1);
        // "TUlJQ2R6Q0NBZUNn" decodes to "MIICdzCCAeCg"
        assert_eq!(&metadata.certificates[0][..4], b"MIIC");
    }

    #[test]
    fn test_missing_entity_id_rejected() {
        let xml = METADATA.replace(r#" entityID="https://idp.example.com/saml""#, "");
        assert!(parse_idp_metadata(&xml).is_err());
    }

    #[test]
    fn test_missing_certificate_rejected() {
        let xml = METADATA.replace("TUlJQ2R6Q0NBZUNn", "");
        assert!(parse_idp_metadata(&xml).is_err());
    }

    #[test]
    fn test_malformed_xml_rejected() {
        assert!(parse_idp_metadata("<EntityDescriptor").is_err());
    }
}
