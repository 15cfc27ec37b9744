//! Configuration commands.

use anyhow::{Context, Result};
use uasc_core::UascConfig;

pub fn cmd_config() -> Result<()> {
    let path = UascConfig::file_path();
    let config = UascConfig::load().context("failed to load config")?;
    let text = toml::to_string_pretty(&config).context("failed to render config")?;

    println!("# {}{}", path.display(), if path.exists() { "" } else { " (not present, defaults)" });
    print!("{text}");
    Ok(())
}

pub fn cmd_config_init() -> Result<()> {
    let path = UascConfig::write_default_if_missing().context("failed to write default config")?;
    println!("Config at {}", path.display());
    Ok(())
}
