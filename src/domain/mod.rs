// Domain module - Plain data types shared across layers
pub mod config;
pub mod error;
pub mod identity;
pub mod metadata;
