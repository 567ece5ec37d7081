use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a live session.
///
/// Transitions only move forward: `Uninitialized → Started → Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Constructed, never acquired
    Uninitialized,
    /// Acquired at least once; may currently hold zero references
    Started,
    /// Terminal
    Disposed,
}

/// Bookkeeping guarded by the per-session mutex
#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) state: SessionState,
    pub(crate) references: usize,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            references: 0,
        }
    }

    /// Started with nobody holding a reference
    pub(crate) fn is_idle(&self) -> bool {
        self.state == SessionState::Started && self.references == 0
    }
}

/// Point-in-time view of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub references: usize,
    pub user_id: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
    pub idle: bool,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "Uninitialized"),
            SessionState::Started => write!(f, "Started"),
            SessionState::Disposed => write!(f, "Disposed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lifecycle_is_not_idle() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state, SessionState::Uninitialized);
        assert!(!lifecycle.is_idle());
    }

    #[test]
    fn test_idle_requires_started_and_no_references() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.state = SessionState::Started;
        assert!(lifecycle.is_idle());

        lifecycle.references = 1;
        assert!(!lifecycle.is_idle());

        lifecycle.references = 0;
        lifecycle.state = SessionState::Disposed;
        assert!(!lifecycle.is_idle());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Uninitialized.to_string(), "Uninitialized");
        assert_eq!(SessionState::Started.to_string(), "Started");
        assert_eq!(SessionState::Disposed.to_string(), "Disposed");
    }
}
