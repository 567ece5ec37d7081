// Core module - Session lifecycle and metadata persistence
pub mod clock;
pub mod session;
pub mod store;
pub mod transport;
