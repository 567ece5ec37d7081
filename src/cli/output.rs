use crate::cli::args::OutputFormat;
use crate::cli::simulate::SimulationReport;
use crate::core::session::SessionSummary;
use crate::domain::config::TetherConfig;
use crate::infrastructure::config::ConfigManager;
use std::io;
use tabled::{Table, Tabled};

/// Output writer trait for different formats
pub trait OutputWriter {
    fn write_config(&self, config: &TetherConfig) -> Result<(), OutputError>;
    fn write_config_paths(&self, manager: &ConfigManager) -> Result<(), OutputError>;
    fn write_simulation(&self, report: &SimulationReport) -> Result<(), OutputError>;
    fn write_message(&self, message: &str) -> Result<(), OutputError>;
    fn write_error(&self, error: &str) -> Result<(), OutputError>;
}

/// Output formatting errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("TOML serialization error: {0}")]
    TomlError(#[from] toml::ser::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<OutputError> for crate::domain::error::TetherError {
    fn from(err: OutputError) -> Self {
        Self::Output(err.to_string())
    }
}

/// Console output writer
pub struct ConsoleWriter {
    format: OutputFormat,
}

impl ConsoleWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

impl OutputWriter for ConsoleWriter {
    fn write_config(&self, config: &TetherConfig) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                print!("{}", toml::to_string_pretty(config)?);
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(config)?);
            }
            OutputFormat::Table => {
                println!("{}", Table::new(config_rows(config)));
            }
        }
        Ok(())
    }

    fn write_config_paths(&self, manager: &ConfigManager) -> Result<(), OutputError> {
        let global = manager.global_config_path().display().to_string();
        let project = manager
            .project_config_path()
            .map(|path| path.display().to_string());

        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "global": global,
                    "project": project,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            _ => {
                println!("Global:  {}", global);
                println!(
                    "Project: {}",
                    project.as_deref().unwrap_or("(none found)")
                );
            }
        }
        Ok(())
    }

    fn write_simulation(&self, report: &SimulationReport) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Text => {
                println!("Simulation on '{}' backend ({})", report.backend, report.instance_id);
                println!("  Sessions created: {}", report.sessions_created);
                println!(
                    "  Requests: {} ({} allowed, {} upgraded, {} denied)",
                    report.requests, report.allowed, report.upgraded, report.denied
                );
                println!("  Idle after workload: {}", report.idle_after_workload);
                for (tick, prune) in report.prune_ticks.iter().enumerate() {
                    println!(
                        "  Tick {}: {} refreshed, {} metadata expired, {} sessions disposed",
                        tick + 1,
                        prune.refreshed,
                        prune.expired_metadata,
                        prune.disposed_sessions
                    );
                }
                println!("  Not found after pruning: {}", report.not_found_after_prune);
                println!(
                    "  Remaining: {} sessions, {} idle",
                    report.sessions_remaining, report.idle_remaining
                );
                println!("  Elapsed: {}ms", report.elapsed_ms);
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(report)?);
            }
            OutputFormat::Table => {
                println!("{}", Table::new(simulation_rows(report)));
                if !report.sessions.is_empty() {
                    let table_data: Vec<SessionTableRow> =
                        report.sessions.iter().map(SessionTableRow::from).collect();
                    println!("{}", Table::new(table_data));
                }
            }
        }
        Ok(())
    }

    fn write_message(&self, message: &str) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "message": message,
                    "level": "info"
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            _ => {
                println!("{}", message);
            }
        }
        Ok(())
    }

    fn write_error(&self, error: &str) -> Result<(), OutputError> {
        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "error": error,
                    "level": "error"
                });
                eprintln!("{}", serde_json::to_string_pretty(&output)?);
            }
            _ => {
                eprintln!("Error: {}", error);
            }
        }
        Ok(())
    }
}

/// Key/value row
#[derive(Tabled, Debug, PartialEq, Eq)]
struct SettingRow {
    setting: String,
    value: String,
}

impl SettingRow {
    fn new(setting: &str, value: impl ToString) -> Self {
        Self {
            setting: setting.to_string(),
            value: value.to_string(),
        }
    }
}

fn config_rows(config: &TetherConfig) -> Vec<SettingRow> {
    vec![
        SettingRow::new("global.log_level", &config.global.log_level),
        SettingRow::new("store.backend", config.store.backend),
        SettingRow::new("store.key_prefix", &config.store.key_prefix),
        SettingRow::new("store.default_ttl_secs", config.store.default_ttl_secs),
        SettingRow::new("store.instance_id", config.store.resolved_instance_id()),
        SettingRow::new("store.touch_attempts", config.store.touch_attempts),
        SettingRow::new("pruning.interval_ms", config.pruning.interval_ms),
        SettingRow::new("pruning.idle_timeout_secs", config.pruning.idle_timeout_secs),
        SettingRow::new("pruning.max_idle_sessions", config.pruning.max_idle_sessions),
    ]
}

fn simulation_rows(report: &SimulationReport) -> Vec<SettingRow> {
    let disposed: usize = report.prune_ticks.iter().map(|t| t.disposed_sessions).sum();
    let expired: usize = report.prune_ticks.iter().map(|t| t.expired_metadata).sum();
    vec![
        SettingRow::new("backend", report.backend),
        SettingRow::new("instance", &report.instance_id),
        SettingRow::new("sessions", report.sessions_created),
        SettingRow::new("requests", report.requests),
        SettingRow::new("allowed", report.allowed),
        SettingRow::new("upgraded", report.upgraded),
        SettingRow::new("denied", report.denied),
        SettingRow::new("metadata expired", expired),
        SettingRow::new("sessions disposed", disposed),
        SettingRow::new("not found after prune", report.not_found_after_prune),
        SettingRow::new("remaining", report.sessions_remaining),
    ]
}

/// Table row for session summary
#[derive(Tabled)]
struct SessionTableRow {
    id: String,
    state: String,
    refs: usize,
    user: String,
    idle: bool,
}

impl From<&SessionSummary> for SessionTableRow {
    fn from(session: &SessionSummary) -> Self {
        Self {
            id: session.session_id.clone(),
            state: session.state.to_string(),
            refs: session.references,
            user: session.user_id.clone().unwrap_or_else(|| "-".to_string()),
            idle: session.idle,
        }
    }
}
