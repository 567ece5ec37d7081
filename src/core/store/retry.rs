//! Bounded optimistic-update combinator.
//!
//! Backends with a per-key compare-and-swap primitive express an update as
//! one attempt (read, compute, conditional write) and let [`retry_cas`]
//! repeat it on conflict. Running out of attempts is not an error: the
//! caller decides whether a lost update matters.

use crate::domain::error::TetherResult;
use std::future::Future;
use tracing::trace;

/// Attempts used when no explicit bound is configured
pub const DEFAULT_CAS_ATTEMPTS: usize = 3;

/// Result of a single conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasStep {
    Applied,
    /// Value changed between read and write
    Conflict,
    /// Nothing to update
    Absent,
}

/// Result of the whole retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { attempts: usize },
    Absent,
    Exhausted,
}

pub async fn retry_cas<F, Fut>(max_attempts: usize, mut attempt: F) -> TetherResult<CasOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TetherResult<CasStep>>,
{
    let max_attempts = max_attempts.max(1);
    for n in 1..=max_attempts {
        match attempt().await? {
            CasStep::Applied => return Ok(CasOutcome::Applied { attempts: n }),
            CasStep::Absent => return Ok(CasOutcome::Absent),
            CasStep::Conflict => {
                trace!(attempt = n, max_attempts, "Optimistic update conflicted");
                tokio::task::yield_now().await;
            }
        }
    }
    Ok(CasOutcome::Exhausted)
}
