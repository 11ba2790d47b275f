use crate::config::generate::generate_starter_config;
use crate::config::load_config;
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let config_path = default_config_path();
    if config_path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout",
            config_path.display()
        )
        .into());
    }
    write_config(&config_content, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// `~/.config/conveyor/config.yml`, or `/etc/conveyor/config.yml` when the
/// user directory cannot be created.
fn default_config_path() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/conveyor/config.yml");
        if let Some(parent) = user_config.parent() {
            match fs::create_dir_all(parent) {
                Ok(()) => return user_config,
                Err(_) => {
                    eprintln!("Warning: Could not create directory {}", parent.display());
                    eprintln!("Falling back to /etc/conveyor/config.yml");
                }
            }
        }
    }
    PathBuf::from("/etc/conveyor/config.yml")
}

fn write_config(config_content: &str, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)
}

pub fn check(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());
    let config = load_config(&path)?;
    let enabled = config.streams.values().filter(|s| s.enabled).count();
    println!(
        "Config is valid: {} connection(s), {} stream(s), {} enabled",
        config.connections.len(),
        config.streams.len(),
        enabled
    );
    Ok(())
}
