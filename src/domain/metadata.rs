use crate::domain::identity::UserIdClaim;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `custom_data` key holding the claim type of the bound identity
pub const CLAIM_TYPE_KEY: &str = "tether.claim_type";
/// `custom_data` key holding the issuer of the bound identity
pub const CLAIM_ISSUER_KEY: &str = "tether.claim_issuer";

/// Durable description of a session, usable by any process.
///
/// Timestamps are unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Globally unique, never changes after creation
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Process currently believed responsible for the live session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_instance_id: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<HashMap<String, String>>,
}

impl SessionMetadata {
    /// Create a fresh active record with both timestamps set to `now_ms`
    pub fn new(session_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            owner_instance_id: None,
            created_at: now_ms,
            last_activity: now_ms,
            is_active: true,
            custom_data: None,
        }
    }

    /// Bind the record to a user identity.
    ///
    /// Claim type and issuer are kept in `custom_data` so that another
    /// instance can rebuild the exact claim during recovery.
    pub fn with_identity(mut self, claim: &UserIdClaim) -> Self {
        self.user_id = Some(claim.value.clone());
        let data = self.custom_data.get_or_insert_with(HashMap::new);
        data.insert(CLAIM_TYPE_KEY.to_string(), claim.claim_type.clone());
        data.insert(CLAIM_ISSUER_KEY.to_string(), claim.issuer.clone());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_data
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Rebuild the bound identity, if the record carries a complete one
    pub fn user_claim(&self) -> Option<UserIdClaim> {
        let value = self.user_id.as_ref()?;
        let data = self.custom_data.as_ref()?;
        Some(UserIdClaim::new(
            data.get(CLAIM_TYPE_KEY)?.clone(),
            value.clone(),
            data.get(CLAIM_ISSUER_KEY)?.clone(),
        ))
    }

    /// Milliseconds elapsed since the last recorded activity
    pub fn idle_for_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_activity).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout_is_camel_case() {
        let meta = SessionMetadata::new("s1", 1_000);
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(json.contains("\"lastActivity\":1000"));
        assert!(!json.contains("userId"));
        assert!(!json.contains("customData"));
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let json = r#"{"sessionId":"s1","createdAt":5,"lastActivity":6}"#;
        let meta: SessionMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.session_id, "s1");
        assert!(meta.user_id.is_none());
        assert!(!meta.is_active);
    }

    #[test]
    fn test_identity_survives_persistence() {
        let claim = UserIdClaim::new("sub", "u1", "issA");
        let meta = SessionMetadata::new("s1", 0).with_identity(&claim);
        let json = serde_json::to_string(&meta).unwrap();
        let restored: SessionMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.user_id.as_deref(), Some("u1"));
        assert_eq!(restored.user_claim(), Some(claim));
    }

    #[test]
    fn test_user_claim_requires_type_and_issuer() {
        let mut meta = SessionMetadata::new("s1", 0);
        meta.user_id = Some("u1".to_string());
        assert!(meta.user_claim().is_none());
    }

    #[test]
    fn test_idle_for_never_negative() {
        let meta = SessionMetadata::new("s1", 100);
        assert_eq!(meta.idle_for_ms(50), 0);
        assert_eq!(meta.idle_for_ms(160), 60);
    }
}
