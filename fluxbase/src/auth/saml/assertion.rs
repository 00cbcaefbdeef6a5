//! SAML assertion parsing and validation
//!
//! Parses the assertion out of a `Response` document, validates the time
//! conditions, audience restriction and recipient, and applies the
//! provider's group policy. Replay protection (assertion id tracking) and
//! signature verification live with the callers.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

/// Allowed clock skew when checking NotBefore / NotOnOrAfter
pub const CLOCK_SKEW: Duration = Duration::seconds(90);

/// The subset of an assertion this service acts on
#[derive(Debug, Clone)]
pub struct ParsedAssertion {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
    pub session_index: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub audience: Option<String>,
    pub recipient: Option<String>,
    pub attributes: HashMap<String, Vec<String>>,
}

impl ParsedAssertion {
    /// Validate time window, audience and recipient.
    ///
    /// `NotOnOrAfter` is exclusive: an assertion presented exactly at that
    /// instant is already invalid.
    pub fn validate(&self, sp_entity_id: &str, acs_url: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(not_before) = self.not_before {
            if now + CLOCK_SKEW < not_before {
                return Err(Error::Forbidden("assertion is not yet valid".into()));
            }
        }
        if let Some(not_on_or_after) = self.not_on_or_after {
            if now - CLOCK_SKEW >= not_on_or_after {
                return Err(Error::Forbidden("assertion has expired".into()));
            }
        }

        match &self.audience {
            Some(audience) if audience == sp_entity_id => {}
            Some(audience) => {
                return Err(Error::Forbidden(format!(
                    "assertion audience '{}' is not this service",
                    audience
                )));
            }
            None => return Err(Error::Forbidden("assertion has no audience".into())),
        }

        match &self.recipient {
            Some(recipient) if recipient == acs_url => {}
            Some(_) => {
                return Err(Error::Forbidden(
                    "assertion recipient is not this ACS".into(),
                ));
            }
            None => return Err(Error::Forbidden("assertion has no recipient".into())),
        }

        Ok(())
    }

    /// Attribute values under a SAML attribute name
    pub fn attribute(&self, name: &str) -> &[String] {
        self.attributes.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Apply group-based RBAC.
///
/// A principal carrying any denied group is rejected outright; otherwise
/// it must hold all of `required_all` and, when `required_any` is
/// non-empty, at least one of those.
pub fn check_groups(
    groups: &[String],
    denied: &[String],
    required_any: &[String],
    required_all: &[String],
) -> Result<()> {
    if let Some(denied_group) = groups.iter().find(|g| denied.contains(g)) {
        return Err(Error::Forbidden(format!(
            "membership in group '{}' is denied",
            denied_group
        )));
    }

    if let Some(missing) = required_all.iter().find(|g| !groups.contains(g)) {
        return Err(Error::Forbidden(format!(
            "required group '{}' is missing",
            missing
        )));
    }

    if !required_any.is_empty() && !groups.iter().any(|g| required_any.contains(g)) {
        return Err(Error::Forbidden(
            "none of the required groups are present".into(),
        ));
    }

    Ok(())
}

/// Parse the first assertion out of a `samlp:Response` document
pub fn parse_response(xml: &str) -> Result<ParsedAssertion> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut assertion: Option<ParsedAssertion> = None;
    let mut in_assertion = false;
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut current_attribute: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = e.local_name().as_ref().to_vec();

                if local == b"Assertion" && assertion.is_none() {
                    in_assertion = true;
                    assertion = Some(ParsedAssertion {
                        id: attr(&e, b"ID").unwrap_or_default(),
                        issuer: String::new(),
                        name_id: String::new(),
                        session_index: None,
                        not_before: None,
                        not_on_or_after: None,
                        audience: None,
                        recipient: None,
                        attributes: HashMap::new(),
                    });
                }

                if in_assertion {
                    if let Some(parsed) = assertion.as_mut() {
                        match local.as_slice() {
                            b"Conditions" => {
                                parsed.not_before =
                                    attr(&e, b"NotBefore").and_then(|v| parse_instant(&v));
                                parsed.not_on_or_after =
                                    attr(&e, b"NotOnOrAfter").and_then(|v| parse_instant(&v));
                            }
                            b"SubjectConfirmationData" => {
                                parsed.recipient = attr(&e, b"Recipient");
                                // The subject confirmation window also bounds
                                // validity; keep the tighter value.
                                if let Some(limit) =
                                    attr(&e, b"NotOnOrAfter").and_then(|v| parse_instant(&v))
                                {
                                    parsed.not_on_or_after = Some(
                                        parsed
                                            .not_on_or_after
                                            .map(|existing| existing.min(limit))
                                            .unwrap_or(limit),
                                    );
                                }
                            }
                            b"AuthnStatement" => {
                                parsed.session_index = attr(&e, b"SessionIndex");
                            }
                            b"Attribute" => {
                                current_attribute = attr(&e, b"Name");
                            }
                            _ => {}
                        }
                    }
                }

                path.push(local);
            }
            Ok(Event::Empty(e)) => {
                if in_assertion {
                    if let Some(parsed) = assertion.as_mut() {
                        match e.local_name().as_ref() {
                            b"SubjectConfirmationData" => {
                                parsed.recipient = attr(&e, b"Recipient");
                                if let Some(limit) =
                                    attr(&e, b"NotOnOrAfter").and_then(|v| parse_instant(&v))
                                {
                                    parsed.not_on_or_after = Some(
                                        parsed
                                            .not_on_or_after
                                            .map(|existing| existing.min(limit))
                                            .unwrap_or(limit),
                                    );
                                }
                            }
                            b"AuthnStatement" => {
                                parsed.session_index = attr(&e, b"SessionIndex");
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if in_assertion {
                    let text = t.unescape().map_err(xml_err)?.into_owned();
                    let parent = path.last().map(|p| p.as_slice()).unwrap_or(b"");
                    if let Some(parsed) = assertion.as_mut() {
                        match parent {
                            b"Issuer" if parsed.issuer.is_empty() => parsed.issuer = text,
                            b"NameID" => parsed.name_id = text,
                            b"Audience" => parsed.audience = Some(text),
                            b"AttributeValue" => {
                                if let Some(name) = &current_attribute {
                                    parsed
                                        .attributes
                                        .entry(name.clone())
                                        .or_default()
                                        .push(text);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                path.pop();
                match e.local_name().as_ref() {
                    b"Assertion" => in_assertion = false,
                    b"Attribute" => current_attribute = None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(e)),
            _ => {}
        }
    }

    let parsed =
        assertion.ok_or_else(|| Error::BadRequest("response carries no assertion".into()))?;
    if parsed.id.is_empty() {
        return Err(Error::BadRequest("assertion has no ID".into()));
    }
    if parsed.name_id.is_empty() {
        return Err(Error::BadRequest("assertion has no NameID".into()));
    }

    Ok(parsed)
}

/// A parsed IdP-initiated LogoutRequest
#[derive(Debug, Clone)]
pub struct ParsedLogoutRequest {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
    pub session_indexes: Vec<String>,
}

/// Parse a `samlp:LogoutRequest`
pub fn parse_logout_request(xml: &str) -> Result<ParsedLogoutRequest> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut id = String::new();
    let mut issuer = String::new();
    let mut name_id = String::new();
    let mut session_indexes = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"LogoutRequest" {
                    id = attr(&e, b"ID").unwrap_or_default();
                }
                path.push(e.local_name().as_ref().to_vec());
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(xml_err)?.into_owned();
                match path.last().map(|p| p.as_slice()).unwrap_or(b"") {
                    b"Issuer" if issuer.is_empty() => issuer = text,
                    b"NameID" => name_id = text,
                    b"SessionIndex" => session_indexes.push(text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(e)),
            _ => {}
        }
    }

    if name_id.is_empty() {
        return Err(Error::BadRequest("LogoutRequest has no NameID".into()));
    }

    Ok(ParsedLogoutRequest {
        id,
        issuer,
        name_id,
        session_indexes,
    })
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn xml_err(e: quick_xml::Error) -> Error {
    Error::BadRequest(format!("malformed XML: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_xml(not_before: &str, not_on_or_after: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_resp1">
  <saml:Assertion ID="_abc123" IssueInstant="{not_before}">
    <saml:Issuer>https://idp.example.com/saml</saml:Issuer>
    <saml:Subject>
      <saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">user@corp.example</saml:NameID>
      <saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">
        <saml:SubjectConfirmationData Recipient="https://app.example.com/api/v1/auth/saml/acs" NotOnOrAfter="{not_on_or_after}"/>
      </saml:SubjectConfirmation>
    </saml:Subject>
    <saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}">
      <saml:AudienceRestriction>
        <saml:Audience>https://app.example.com</saml:Audience>
      </saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement SessionIndex="_session9"></saml:AuthnStatement>
    <saml:AttributeStatement>
      <saml:Attribute Name="groups">
        <saml:AttributeValue>Engineers</saml:AttributeValue>
        <saml:AttributeValue>Contractors</saml:AttributeValue>
      </saml:Attribute>
      <saml:Attribute Name="displayName">
        <saml:AttributeValue>Pat Example</saml:AttributeValue>
      </saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#
        )
    }

    fn valid_window() -> (String, String) {
        let now = Utc::now();
        (
            (now - Duration::minutes(5)).to_rfc3339(),
            (now + Duration::minutes(5)).to_rfc3339(),
        )
    }

    #[test]
    fn test_parse_assertion() {
        let (nb, noa) = valid_window();
        let parsed = parse_response(&response_xml(&nb, &noa)).unwrap();

        assert_eq!(parsed.id, "_abc123");
        assert_eq!(parsed.issuer, "https://idp.example.com/saml");
        assert_eq!(parsed.name_id, "user@corp.example");
        assert_eq!(parsed.session_index.as_deref(), Some("_session9"));
        assert_eq!(parsed.audience.as_deref(), Some("https://app.example.com"));
        assert_eq!(
            parsed.recipient.as_deref(),
            Some("https://app.example.com/api/v1/auth/saml/acs")
        );
        assert_eq!(parsed.attribute("groups"), ["Engineers", "Contractors"]);
        assert_eq!(parsed.attribute("displayName"), ["Pat Example"]);
        assert!(parsed.attribute("missing").is_empty());
    }

    #[test]
    fn test_validate_accepts_valid_assertion() {
        let (nb, noa) = valid_window();
        let parsed = parse_response(&response_xml(&nb, &noa)).unwrap();
        assert!(parsed
            .validate(
                "https://app.example.com",
                "https://app.example.com/api/v1/auth/saml/acs",
                Utc::now(),
            )
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_expired() {
        let now = Utc::now();
        let nb = (now - Duration::hours(2)).to_rfc3339();
        let noa = (now - Duration::hours(1)).to_rfc3339();
        let parsed = parse_response(&response_xml(&nb, &noa)).unwrap();

        assert!(parsed
            .validate(
                "https://app.example.com",
                "https://app.example.com/api/v1/auth/saml/acs",
                now,
            )
            .is_err());
    }

    #[test]
    fn test_validate_rejects_exactly_at_not_on_or_after() {
        let now = Utc::now();
        let nb = (now - Duration::hours(1)).to_rfc3339();
        let noa = now.to_rfc3339();
        let parsed = parse_response(&response_xml(&nb, &noa)).unwrap();

        // NotOnOrAfter is exclusive; with skew rolled in, "now" at the
        // boundary plus the skew margin is rejected.
        assert!(parsed
            .validate(
                "https://app.example.com",
                "https://app.example.com/api/v1/auth/saml/acs",
                now + CLOCK_SKEW,
            )
            .is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_audience() {
        let (nb, noa) = valid_window();
        let parsed = parse_response(&response_xml(&nb, &noa)).unwrap();
        assert!(parsed
            .validate(
                "https://other.example.com",
                "https://app.example.com/api/v1/auth/saml/acs",
                Utc::now(),
            )
            .is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_recipient() {
        let (nb, noa) = valid_window();
        let parsed = parse_response(&response_xml(&nb, &noa)).unwrap();
        assert!(parsed
            .validate("https://app.example.com", "https://evil.example.com/acs", Utc::now())
            .is_err());
    }

    #[test]
    fn test_group_denial_wins() {
        let groups = vec!["Engineers".to_string(), "Contractors".to_string()];
        let err = check_groups(&groups, &["Contractors".to_string()], &[], &[]).unwrap_err();
        match err {
            Error::Forbidden(message) => assert!(message.contains("Contractors")),
            other => panic!("expected Forbidden, got {:?}", other),
        }
    }

    #[test]
    fn test_group_requirements() {
        let groups = vec!["Engineers".to_string()];

        // required_all satisfied
        assert!(check_groups(&groups, &[], &[], &["Engineers".to_string()]).is_ok());
        // required_all missing
        assert!(check_groups(&groups, &[], &[], &["Admins".to_string()]).is_err());
        // required_any satisfied
        assert!(
            check_groups(&groups, &[], &["Engineers".to_string(), "Ops".to_string()], &[]).is_ok()
        );
        // required_any unsatisfied
        assert!(check_groups(&groups, &[], &["Ops".to_string()], &[]).is_err());
        // empty requirements allow
        assert!(check_groups(&groups, &[], &[], &[]).is_ok());
    }

    #[test]
    fn test_parse_logout_request() {
        let xml = r#"<?xml version="1.0"?>
<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr1">
  <saml:Issuer>https://idp.example.com/saml</saml:Issuer>
  <saml:NameID>user@corp.example</saml:NameID>
  <samlp:SessionIndex>_session9</samlp:SessionIndex>
</samlp:LogoutRequest>"#;

        let parsed = parse_logout_request(xml).unwrap();
        assert_eq!(parsed.id, "_lr1");
        assert_eq!(parsed.issuer, "https://idp.example.com/saml");
        assert_eq!(parsed.name_id, "user@corp.example");
        assert_eq!(parsed.session_indexes, ["_session9"]);
    }

    #[test]
    fn test_response_without_assertion_rejected() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r"/>"#;
        assert!(parse_response(xml).is_err());
    }
}
