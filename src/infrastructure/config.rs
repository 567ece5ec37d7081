use crate::domain::{
    config::TetherConfig,
    error::{TetherError, TetherResult},
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_DIR: &str = ".tether";
const CONFIG_FILE: &str = "config.toml";

/// Locates, loads and saves configuration files
#[derive(Debug, Clone)]
pub struct ConfigManager {
    global_config_path: PathBuf,
    project_config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create a manager using the home directory and the nearest project config
    pub fn new() -> TetherResult<Self> {
        let global_config_path = Self::default_global_config_path()?;
        let project_config_path = std::env::current_dir()
            .ok()
            .and_then(|dir| Self::find_project_config_path(&dir));

        Ok(Self {
            global_config_path,
            project_config_path,
        })
    }

    /// Create a manager over explicit paths
    pub fn with_paths(global_config_path: PathBuf, project_config_path: Option<PathBuf>) -> Self {
        Self {
            global_config_path,
            project_config_path,
        }
    }

    /// Load the effective configuration.
    ///
    /// Defaults, then the global file, then the project file; later files
    /// override individual keys of earlier ones. Missing files are skipped.
    pub fn load_config(&self) -> TetherResult<TetherConfig> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        if self.global_config_path.exists() {
            merge_toml(&mut merged, read_toml(&self.global_config_path)?);
            debug!(path = %self.global_config_path.display(), "Loaded global config");
        }

        if let Some(project_path) = &self.project_config_path {
            if project_path.exists() {
                merge_toml(&mut merged, read_toml(project_path)?);
                debug!(path = %project_path.display(), "Loaded project config");
            }
        }

        let config: TetherConfig = merged.try_into().map_err(|e| TetherError::Config {
            message: format!("Invalid configuration: {}", e),
        })?;
        validate(config)
    }

    /// Load configuration from a specific path, ignoring discovery
    pub fn load_config_from_path(&self, path: &Path) -> TetherResult<TetherConfig> {
        let content = fs::read_to_string(path).map_err(|e| TetherError::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        let config: TetherConfig = toml::from_str(&content).map_err(|e| TetherError::Config {
            message: format!("Failed to parse config file {}: {}", path.display(), e),
        })?;
        validate(config)
    }

    /// Save configuration to the global path
    pub fn save_config(&self, config: &TetherConfig) -> TetherResult<()> {
        self.save_config_to_path(&self.global_config_path, config)
    }

    /// Save configuration to specific path, creating parent directories
    pub fn save_config_to_path(&self, path: &Path, config: &TetherConfig) -> TetherResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TetherError::Config {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        let content = toml::to_string_pretty(config).map_err(|e| TetherError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| TetherError::Config {
            message: format!("Failed to write config file {}: {}", path.display(), e),
        })
    }

    /// Write a default project configuration under `path/.tether`.
    ///
    /// Refuses to overwrite an existing file. Returns the file written.
    pub fn init_project_config(&self, path: &Path) -> TetherResult<PathBuf> {
        let config_file = path.join(CONFIG_DIR).join(CONFIG_FILE);

        if config_file.exists() {
            return Err(TetherError::Config {
                message: format!(
                    "Project configuration already exists at {}",
                    config_file.display()
                ),
            });
        }

        self.save_config_to_path(&config_file, &TetherConfig::default())?;
        Ok(config_file)
    }

    /// Get the current project config path (if any)
    pub fn project_config_path(&self) -> Option<&PathBuf> {
        self.project_config_path.as_ref()
    }

    /// Get the global config path
    pub fn global_config_path(&self) -> &PathBuf {
        &self.global_config_path
    }

    fn default_global_config_path() -> TetherResult<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| TetherError::Config {
            message: "Could not determine home directory".to_string(),
        })?;

        Ok(home.join(".config").join("tether").join(CONFIG_FILE))
    }

    /// Walk up from `start` looking for `.tether/config.toml`
    fn find_project_config_path(start: &Path) -> Option<PathBuf> {
        let mut path = start;

        loop {
            let config_path = path.join(CONFIG_DIR).join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }

            path = path.parent()?;
        }
    }
}

fn read_toml(path: &Path) -> TetherResult<toml::Value> {
    let content = fs::read_to_string(path).map_err(|e| TetherError::Config {
        message: format!("Failed to read config file {}: {}", path.display(), e),
    })?;

    toml::from_str(&content).map_err(|e| TetherError::Config {
        message: format!("Failed to parse config file {}: {}", path.display(), e),
    })
}

/// Deep-merge `overlay` into `base`; tables merge, everything else replaces
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn validate(config: TetherConfig) -> TetherResult<TetherConfig> {
    config
        .validate()
        .map_err(|message| TetherError::Config { message })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::StoreBackend;
    use tempfile::TempDir;

    fn create_test_manager(dir: &TempDir) -> ConfigManager {
        ConfigManager::with_paths(
            dir.path().join("global").join("config.toml"),
            Some(dir.path().join("project").join(".tether").join("config.toml")),
        )
    }

    #[test]
    fn test_missing_files_give_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = create_test_manager(&temp_dir);
        let config = manager.load_config().unwrap();

        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.store.backend, StoreBackend::Local);
        assert_eq!(config.pruning.interval_ms, 5000);
    }

    #[test]
    fn test_project_overrides_individual_keys() {
        let temp_dir = TempDir::new().unwrap();
        let manager = create_test_manager(&temp_dir);

        let global = manager.global_config_path().clone();
        fs::create_dir_all(global.parent().unwrap()).unwrap();
        fs::write(
            &global,
            "[store]\nbackend = \"cache\"\nkey_prefix = \"g:\"\n[global]\nlog_level = \"debug\"\n",
        )
        .unwrap();

        let project = manager.project_config_path().unwrap().clone();
        fs::create_dir_all(project.parent().unwrap()).unwrap();
        fs::write(&project, "[store]\nkey_prefix = \"p:\"\n").unwrap();

        let config = manager.load_config().unwrap();
        assert_eq!(config.store.backend, StoreBackend::Cache);
        assert_eq!(config.store.key_prefix, "p:");
        assert_eq!(config.global.log_level, "debug");
    }

    #[test]
    fn test_unparsable_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "[store\nbackend = ").unwrap();

        let manager = create_test_manager(&temp_dir);
        let result = manager.load_config_from_path(&path);
        assert!(matches!(result, Err(TetherError::Config { .. })));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("zero.toml");
        fs::write(&path, "[pruning]\ninterval_ms = 0\n").unwrap();

        let manager = create_test_manager(&temp_dir);
        let err = manager.load_config_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("interval_ms"));
    }

    #[test]
    fn test_init_project_config_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let manager = create_test_manager(&temp_dir);

        let written = manager.init_project_config(temp_dir.path()).unwrap();
        assert!(written.exists());
        let config = manager.load_config_from_path(&written).unwrap();
        assert_eq!(config.store.key_prefix, "tether:session:");

        assert!(manager.init_project_config(temp_dir.path()).is_err());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let manager = create_test_manager(&temp_dir);
        let mut config = TetherConfig::default();
        config.store.instance_id = Some("node-a".to_string());
        config.pruning.max_idle_sessions = 5;

        manager.save_config(&config).unwrap();
        let loaded = manager.load_config().unwrap();
        assert_eq!(loaded.store.instance_id.as_deref(), Some("node-a"));
        assert_eq!(loaded.pruning.max_idle_sessions, 5);
    }

    #[test]
    fn test_project_config_discovered_from_subdirectory() {
        let temp_dir = TempDir::new().unwrap();
        let manager = create_test_manager(&temp_dir);
        let written = manager.init_project_config(temp_dir.path()).unwrap();

        let nested = temp_dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(ConfigManager::find_project_config_path(&nested), Some(written));
    }
}
