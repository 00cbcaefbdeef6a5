//! Audit entry types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who performed the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Anonymous,
    User,
    Service,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::User => "user",
            Self::Service => "service",
            Self::System => "system",
        }
    }
}

/// How the action ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Denied,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub ip: Option<String>,
    /// Dotted action name, e.g. `auth.signin`, `admin.realtime.enable`
    pub action: String,
    /// What the action touched, e.g. a user id or `realtime:public.tasks`
    pub target: Option<String>,
    pub outcome: AuditOutcome,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    /// Start an entry for an action; defaults to system actor and `ok`
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            actor_id: None,
            actor_type: ActorType::System,
            ip: None,
            action: action.into(),
            target: None,
            outcome: AuditOutcome::Ok,
            detail: serde_json::json!({}),
        }
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: Option<Uuid>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id;
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder() {
        let user = Uuid::new_v4();
        let entry = AuditEntry::new("auth.signin")
            .actor(ActorType::User, Some(user))
            .ip("192.0.2.1")
            .target(user.to_string())
            .outcome(AuditOutcome::Denied)
            .detail(serde_json::json!({"reason": "locked"}));

        assert_eq!(entry.action, "auth.signin");
        assert_eq!(entry.actor_id, Some(user));
        assert_eq!(entry.outcome, AuditOutcome::Denied);
        assert_eq!(entry.detail["reason"], "locked");
    }

    #[test]
    fn test_serde_roundtrip() {
        let entry = AuditEntry::new("admin.keys.rotate").outcome(AuditOutcome::Ok);
        let json = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, "admin.keys.rotate");
        assert_eq!(back.actor_type, ActorType::System);
    }
}
