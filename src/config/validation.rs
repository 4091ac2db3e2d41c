use crate::config::types::{
    BrowserConfig, CheckpointConfig, Config, EngineConfig, FieldEntry, JobDefaults, RetryConfig,
    RuleEntry, RuleKind, ThrottleConfig,
};
use crate::extract::BUILTIN_RULES;
use crate::ConfigError;
use scraper::Selector;
use std::collections::HashSet;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_engine_config(&config.engine)?;
    validate_retry_config(&config.retry)?;
    validate_checkpoint_config(&config.checkpoint)?;
    validate_browser_config(&config.browser)?;
    validate_job_defaults(&config.jobs)?;
    validate_throttle_config(&config.throttle)?;
    validate_rules(&config.rules)?;
    validate_default_rule(&config.jobs.rule, &config.rules)?;
    Ok(())
}

fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.max_sessions < 1 || config.max_sessions > 64 {
        return Err(ConfigError::Validation(format!(
            "max_sessions must be between 1 and 64, got {}",
            config.max_sessions
        )));
    }

    if config.max_workers < 1 || config.max_workers > 256 {
        return Err(ConfigError::Validation(format!(
            "max_workers must be between 1 and 256, got {}",
            config.max_workers
        )));
    }

    for (name, value) in [
        ("acquire_timeout_ms", config.acquire_timeout_ms),
        ("lease_ttl_ms", config.lease_ttl_ms),
        ("reap_interval_ms", config.reap_interval_ms),
        ("halt_probe_interval_ms", config.halt_probe_interval_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{} must be > 0", name)));
        }
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_delay_ms < config.base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry max_delay_ms ({}) must be >= base_delay_ms ({})",
            config.max_delay_ms, config.base_delay_ms
        )));
    }

    if !config.multiplier.is_finite() || config.multiplier < 1.0 {
        return Err(ConfigError::Validation(format!(
            "retry multiplier must be >= 1.0, got {}",
            config.multiplier
        )));
    }

    Ok(())
}

fn validate_checkpoint_config(config: &CheckpointConfig) -> Result<(), ConfigError> {
    if config.enabled && config.database_path.trim().is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty when checkpointing is enabled".to_string(),
        ));
    }

    if config.save_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "save_timeout_ms must be > 0".to_string(),
        ));
    }

    if config.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "sweep_interval_secs must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_browser_config(config: &BrowserConfig) -> Result<(), ConfigError> {
    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    if config.request_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "request_timeout_ms must be > 0".to_string(),
        ));
    }

    if config.window_width == 0 || config.window_height == 0 {
        return Err(ConfigError::Validation(format!(
            "window size must be non-zero, got {}x{}",
            config.window_width, config.window_height
        )));
    }

    Ok(())
}

fn validate_job_defaults(config: &JobDefaults) -> Result<(), ConfigError> {
    if config.max_concurrency < 1 {
        return Err(ConfigError::Validation(
            "jobs max_concurrency must be >= 1".to_string(),
        ));
    }

    if config.unit_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "jobs unit_timeout_ms must be > 0".to_string(),
        ));
    }

    validate_threshold(config.poison_threshold)?;

    if config.max_units == 0 {
        return Err(ConfigError::Validation(
            "jobs max_units must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_default_rule(rule: &str, rules: &[RuleEntry]) -> Result<(), ConfigError> {
    if BUILTIN_RULES.contains(&rule) || rules.iter().any(|r| r.id == rule) {
        return Ok(());
    }
    Err(ConfigError::Validation(format!(
        "jobs rule '{}' is neither built in nor configured",
        rule
    )))
}

/// Validates a poison threshold; shared with job submission checks
pub(crate) fn validate_threshold(threshold: f64) -> Result<(), ConfigError> {
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "poison_threshold must be in (0, 1], got {}",
            threshold
        )));
    }
    Ok(())
}

fn validate_throttle_config(config: &ThrottleConfig) -> Result<(), ConfigError> {
    if config.min_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "throttle min_delay_ms ({}) must be <= max_delay_ms ({})",
            config.min_delay_ms, config.max_delay_ms
        )));
    }

    if config.long_pause_min_ms > config.long_pause_max_ms {
        return Err(ConfigError::Validation(format!(
            "throttle long_pause_min_ms ({}) must be <= long_pause_max_ms ({})",
            config.long_pause_min_ms, config.long_pause_max_ms
        )));
    }

    Ok(())
}

fn validate_rules(rules: &[RuleEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for rule in rules {
        if rule.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "rule id cannot be empty".to_string(),
            ));
        }

        if BUILTIN_RULES.contains(&rule.id.as_str()) {
            return Err(rule_error(rule, "id is reserved for a built-in rule"));
        }

        if !seen.insert(rule.id.as_str()) {
            return Err(rule_error(rule, "duplicate rule id"));
        }

        match rule.kind {
            RuleKind::Selectors if rule.fields.is_empty() => {
                return Err(rule_error(rule, "selectors rules need at least one field"));
            }
            RuleKind::Listing => {
                let item = rule
                    .item
                    .as_deref()
                    .ok_or_else(|| rule_error(rule, "listing rules need an item selector"))?;
                validate_selector(rule, item)?;
                if rule.fields.is_empty() {
                    return Err(rule_error(rule, "listing rules need at least one field"));
                }
            }
            _ => {}
        }

        validate_fields(rule, &rule.fields)?;

        for pattern in &rule.allowed_hosts {
            validate_host_pattern(pattern)?;
        }
    }

    Ok(())
}

fn validate_fields(rule: &RuleEntry, fields: &[FieldEntry]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            return Err(rule_error(rule, "field name cannot be empty"));
        }
        if !names.insert(field.name.as_str()) {
            return Err(rule_error(
                rule,
                &format!("duplicate field '{}'", field.name),
            ));
        }
        validate_selector(rule, &field.selector)?;
        for fallback in &field.fallback {
            validate_selector(rule, fallback)?;
        }
    }
    Ok(())
}

fn validate_selector(rule: &RuleEntry, selector: &str) -> Result<(), ConfigError> {
    Selector::parse(selector)
        .map(|_| ())
        .map_err(|e| rule_error(rule, &format!("invalid selector '{}': {:?}", selector, e)))
}

fn rule_error(rule: &RuleEntry, message: &str) -> ConfigError {
    ConfigError::InvalidRule {
        rule: rule.id.clone(),
        message: message.to_string(),
    }
}

/// Validates a host pattern (supports a leading `*.` wildcard)
fn validate_host_pattern(pattern: &str) -> Result<(), ConfigError> {
    let host = pattern.strip_prefix("*.").unwrap_or(pattern);

    if host.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Host pattern cannot be empty".to_string(),
        ));
    }

    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' contains invalid characters",
            host
        )));
    }

    if host.starts_with('.') || host.ends_with('.') || host.starts_with('-') || host.ends_with('-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' cannot start or end with '.' or '-'",
            host
        )));
    }

    if host.contains("..") {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' cannot contain consecutive dots",
            host
        )));
    }

    Ok(())
}
