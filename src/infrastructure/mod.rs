// Infrastructure module - Configuration files and logging
pub mod config;
pub mod logging;
