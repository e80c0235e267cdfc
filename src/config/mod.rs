mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./transforge.toml",
        "./config.toml",
        "~/.config/transforge/config.toml",
        "/etc/transforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Reject settings the service cannot run with.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.auth.enabled && config.auth.keys.is_empty() {
        anyhow::bail!("Auth is enabled but no API keys are configured");
    }
    for key in &config.auth.keys {
        if key.key.len() < 16 {
            anyhow::bail!("API key '{}' is shorter than 16 characters", key.name);
        }
        if transforge_common::OwnerKey::new(key.owner.as_str()).is_none() {
            anyhow::bail!("API key '{}' has an invalid owner '{}'", key.name, key.owner);
        }
    }

    if config.storage.max_input_bytes == 0 {
        anyhow::bail!("storage.max_input_bytes cannot be 0");
    }
    if config.database.pool_size == 0 {
        anyhow::bail!("database.pool_size cannot be 0");
    }

    let workers = &config.workers;
    if workers.count == 0 {
        anyhow::bail!("workers.count cannot be 0");
    }
    if workers.default_max_duration_secs == 0 {
        anyhow::bail!("workers.default_max_duration_secs cannot be 0");
    }
    if workers.default_max_duration_secs > workers.max_duration_cap_secs {
        anyhow::bail!(
            "workers.default_max_duration_secs ({}) exceeds workers.max_duration_cap_secs ({})",
            workers.default_max_duration_secs,
            workers.max_duration_cap_secs
        );
    }

    if config.quota.max_active_jobs_per_owner == 0 {
        anyhow::bail!("quota.max_active_jobs_per_owner cannot be 0");
    }

    let webhook = &config.webhook;
    if webhook.max_attempts == 0 {
        anyhow::bail!("webhook.max_attempts cannot be 0");
    }
    if !(0.0..=1.0).contains(&webhook.jitter_ratio) {
        anyhow::bail!("webhook.jitter_ratio must be between 0.0 and 1.0");
    }
    if webhook.base_delay_ms > webhook.max_delay_ms {
        anyhow::bail!("webhook.base_delay_ms cannot exceed webhook.max_delay_ms");
    }
    if webhook.allow_http {
        tracing::warn!("webhook.allow_http is enabled; callbacks may be sent unencrypted");
    }

    Ok(())
}
