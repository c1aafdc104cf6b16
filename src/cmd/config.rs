//! Configuration view and validation commands: `conduit config`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(config_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use conduit::config::{CONFIG_FILE_NAME, ConduitConfig, ConduitToml};

    let config_path = config_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conduit Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No conduit.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = ConduitConfig::new(config_dir.to_path_buf())?;
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("Effective values (with env overrides):");
            println!();
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conduit.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConduitToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conduit.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ConduitToml::default().save(&config_path)?;

            println!("Created conduit.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] approval_stages, retry and route overrides");
            println!("  - [handlers] retries and decision approval");
            println!("  - [repository] memory or file storage");
            println!();
        }
    }

    Ok(())
}
