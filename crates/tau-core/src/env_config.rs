//! Parsing helpers for `TAU_*` environment overrides.
use std::{collections::BTreeMap, str::FromStr};

use thiserror::Error;

/// Errors raised while reading configuration overrides from an env map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvConfigError {
    #[error("{key} must be one of 1,true,yes,on,0,false,no,off (got '{value}')")]
    InvalidBool { key: String, value: String },
    #[error("{key} must be an integer (got '{value}')")]
    InvalidInteger { key: String, value: String },
    #[error("{key} must be greater than 0")]
    NotPositive { key: String },
}

/// Parses a boolean flag value, accepting the usual on/off spellings.
pub fn parse_bool_env(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Returns the trimmed, non-empty value for `key`.
pub fn env_value<'a>(env: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key)
        .map(String::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Reads a boolean override, falling back to `default` when unset.
pub fn bool_from_env(
    env: &BTreeMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, EnvConfigError> {
    let Some(raw) = env_value(env, key) else {
        return Ok(default);
    };
    parse_bool_env(raw).ok_or_else(|| EnvConfigError::InvalidBool {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Reads an integer override, falling back to `default` when unset.
pub fn integer_from_env<T>(
    env: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, EnvConfigError>
where
    T: FromStr,
{
    let Some(raw) = env_value(env, key) else {
        return Ok(default);
    };
    raw.parse::<T>()
        .map_err(|_| EnvConfigError::InvalidInteger {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

/// Reads a strictly positive `usize` override.
pub fn positive_usize_from_env(
    env: &BTreeMap<String, String>,
    key: &str,
    default: usize,
) -> Result<usize, EnvConfigError> {
    let value = integer_from_env(env, key, default)?;
    if value == 0 {
        return Err(EnvConfigError::NotPositive {
            key: key.to_string(),
        });
    }
    Ok(value)
}

/// Splits a comma separated list, dropping blank items.
pub fn list_from_env(env: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    env_value(env, key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
