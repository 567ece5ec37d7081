use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller identity extracted from an inbound request's authentication context.
///
/// Two claims identify the same user only when type, value and issuer all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdClaim {
    /// Claim type, e.g. `sub` or a name-identifier URI
    pub claim_type: String,
    /// Claim value; this is what gets persisted as the session's user id
    pub value: String,
    /// Issuer that vouched for the claim
    pub issuer: String,
}

impl UserIdClaim {
    pub fn new(
        claim_type: impl Into<String>,
        value: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
            issuer: issuer.into(),
        }
    }
}

impl fmt::Display for UserIdClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.claim_type, self.value, self.issuer)
    }
}

/// Outcome of checking a request identity against a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// Identity matches the session (or both are anonymous)
    Allow,
    /// This request bound its identity onto a previously anonymous session
    Upgraded,
    /// Identity mismatch, downgrade attempt, or lost upgrade race
    Deny,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        !matches!(self, AccessDecision::Deny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_equality_includes_issuer() {
        let a = UserIdClaim::new("sub", "u1", "issA");
        let b = UserIdClaim::new("sub", "u1", "issB");
        assert_ne!(a, b);
        assert_eq!(a, UserIdClaim::new("sub", "u1", "issA"));
    }

    #[test]
    fn test_claim_display() {
        let claim = UserIdClaim::new("sub", "u1", "issA");
        assert_eq!(claim.to_string(), "sub:u1@issA");
    }

    #[test]
    fn test_decision_is_allowed() {
        assert!(AccessDecision::Allow.is_allowed());
        assert!(AccessDecision::Upgraded.is_allowed());
        assert!(!AccessDecision::Deny.is_allowed());
    }
}
