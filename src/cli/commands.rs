use crate::cli::args::{Args, Command, ConfigCommand, SimulateArgs};
use crate::cli::output::{ConsoleWriter, OutputWriter};
use crate::cli::simulate::run_simulation;
use crate::domain::config::TetherConfig;
use crate::domain::error::{TetherError, TetherResult};
use crate::infrastructure::config::ConfigManager;
use crate::infrastructure::logging::init_logging;

/// Execute CLI command
pub async fn execute_command(args: Args) -> TetherResult<()> {
    let writer = ConsoleWriter::new(args.output);

    let config_manager = ConfigManager::new()?;
    let config = match &args.config {
        Some(config_path) => config_manager.load_config_from_path(config_path)?,
        None => config_manager.load_config()?,
    };

    if !args.quiet {
        let level = if args.verbose {
            "debug"
        } else {
            config.global.log_level.as_str()
        };
        init_logging(level).map_err(|e| TetherError::Config {
            message: format!("Failed to initialize logging: {}", e),
        })?;
    }

    match args.command {
        Command::Config(config_args) => {
            execute_config_command(config_args.command, &writer, &config, &config_manager)
        }
        Command::Simulate(simulate_args) => {
            execute_simulate_command(&simulate_args, &writer, &config).await
        }
        Command::Version => {
            writer.write_message(&format!("tether {}", env!("CARGO_PKG_VERSION")))?;
            Ok(())
        }
    }
}

fn execute_config_command(
    command: ConfigCommand,
    writer: &ConsoleWriter,
    config: &TetherConfig,
    config_manager: &ConfigManager,
) -> TetherResult<()> {
    match command {
        ConfigCommand::Show => {
            writer.write_config(config)?;
        }
        ConfigCommand::Path => {
            writer.write_config_paths(config_manager)?;
        }
        ConfigCommand::Init { dir, global } => {
            if global {
                let global_path = config_manager.global_config_path();
                if global_path.exists() {
                    return Err(TetherError::Config {
                        message: format!(
                            "Global configuration already exists at '{}'",
                            global_path.display()
                        ),
                    });
                }
                config_manager.save_config(&TetherConfig::default())?;
                writer.write_message(&format!(
                    "Global configuration initialized at '{}'",
                    global_path.display()
                ))?;
            } else {
                let target = match dir {
                    Some(dir) => dir,
                    None => std::env::current_dir()?,
                };
                let written = config_manager.init_project_config(&target)?;
                writer.write_message(&format!(
                    "Project configuration initialized at '{}'",
                    written.display()
                ))?;
            }
        }
    }
    Ok(())
}

async fn execute_simulate_command(
    args: &SimulateArgs,
    writer: &ConsoleWriter,
    config: &TetherConfig,
) -> TetherResult<()> {
    let report = run_simulation(config, args).await?;
    writer.write_simulation(&report)?;
    Ok(())
}
