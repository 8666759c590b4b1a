//! Configuration loading.
//!
//! Configuration comes from a TOML file; see [`schema`] for the full set of
//! recognized options. Target addresses and test variables support
//! `${VAR}` and `${VAR:-default}` environment references so one config file
//! can serve a whole lab.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file and expands environment
/// references in target addresses and test variables.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    load_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    config.target.host = expand_env_value(&config.target.host)
        .map_err(|e| anyhow::anyhow!("Failed to expand target host: {e}"))?;
    for (role, address) in config.target.companion_duts.iter_mut() {
        *address = expand_env_value(address)
            .map_err(|e| anyhow::anyhow!("Failed to expand companion {role:?}: {e}"))?;
    }
    for (name, value) in config.run.test_vars.iter_mut() {
        *value = expand_env_value(value)
            .map_err(|e| anyhow::anyhow!("Failed to expand test var {name:?}: {e}"))?;
    }

    Ok(config)
}

/// Expands environment references in a string value.
///
/// Syntax: `${VAR}` requires the variable, `${VAR:-default}` falls back,
/// and `$$` escapes a literal dollar sign. A lone `$` stays as-is.
fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(stripped) = rest.strip_prefix('$') {
            result.push('$');
            rest = stripped;
        } else if let Some(after_brace) = rest.strip_prefix('{') {
            let Some(close) = after_brace.find('}') else {
                return Err(format!("Unclosed variable reference: ${{{after_brace}"));
            };
            let var_content = &after_brace[..close];
            rest = &after_brace[close + 1..];

            let (var_name, default_value) = match var_content.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_content, None),
            };
            if var_name.is_empty() {
                return Err("Empty variable name in ${}".to_string());
            }
            match std::env::var(var_name) {
                Ok(env_value) => result.push_str(&env_value),
                Err(_) => match default_value {
                    Some(default) => result.push_str(default),
                    None => {
                        return Err(format!(
                            "Required environment variable not set: {var_name}"
                        ));
                    }
                },
            }
        } else {
            result.push('$');
        }
    }
    result.push_str(rest);
    Ok(result)
}
