//! Tether Library
//!
//! Lifecycle management for long-lived, request-multiplexed sessions:
//! reference counting with idle tracking, anonymous-to-authenticated
//! identity upgrades, and metadata persistence over local, transactional
//! or eventually-consistent stores.

pub mod cli;
pub mod core;
pub mod domain;
pub mod infrastructure;

pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::session::{
    PruneReport, PruningLoop, Session, SessionReference, SessionRegistry, SessionState,
};
pub use core::store::{build_store, SessionStore, StoreOptions};
pub use core::transport::{ResourceFactory, SessionResources, SessionServer, SessionTransport};
pub use domain::config::TetherConfig;
pub use domain::error::{TetherError, TetherResult};
pub use domain::identity::{AccessDecision, UserIdClaim};
pub use domain::metadata::SessionMetadata;
