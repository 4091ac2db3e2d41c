use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// Environment overrides (`HEADLESS`, `CHECKPOINT_ENABLED`, `CHROMIUM_PATH`)
/// are applied after parsing and before validation.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use crawl_keeper::config::load_config;
///
/// let config = load_config(Path::new("crawl-keeper.toml")).unwrap();
/// println!("Database: {}", config.checkpoint.database_path);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let mut config: Config = toml::from_str(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    validate(&config)?;

    Ok(config)
}

/// Parses and validates configuration text without touching the environment
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Applies environment overrides to a parsed configuration
///
/// # Arguments
///
/// * `config` - The configuration to modify
/// * `lookup` - Reads a variable by name; `std::env::var` in production
///
/// # Returns
///
/// * `Ok(())` - Overrides applied
/// * `Err(ConfigError)` - A boolean variable held something other than a boolean
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("HEADLESS") {
        config.browser.headless = parse_flag("HEADLESS", &value)?;
    }

    if let Some(value) = lookup("CHECKPOINT_ENABLED") {
        config.checkpoint.enabled = parse_flag("CHECKPOINT_ENABLED", &value)?;
    }

    if let Some(value) = lookup("CHROMIUM_PATH") {
        if !value.trim().is_empty() {
            config.browser.chrome_path = Some(value.trim().to_string());
        }
    }

    Ok(())
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Validation(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Logged at start-up so operators can tell which configuration a run used.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(String)` - Hex-encoded SHA-256 hash of the file content
/// * `Err(ConfigError)` - Failed to read the file
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}
