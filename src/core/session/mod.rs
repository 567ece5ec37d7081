// Session module - Live sessions, idle tracking and pruning
pub mod pruning;
pub mod registry;
pub mod session;
pub mod state;

pub use pruning::{PruneReport, PruningHandle, PruningLoop};
pub use registry::SessionRegistry;
pub use session::{Session, SessionObserver, SessionReference};
pub use state::{SessionState, SessionSummary};
