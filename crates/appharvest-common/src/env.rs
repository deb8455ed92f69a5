//! Typed environment variable lookups
//!
//! Unlike a plain `std::env::var(..).ok().and_then(|s| s.parse().ok())`, a
//! variable that is present but unparsable is an error here, so a typo in a
//! tuning knob fails start-up instead of silently running with the default.

use std::str::FromStr;

use crate::error::{CommonError, Result};

/// Read a variable, treating empty or whitespace-only values as unset.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable into `T`, falling back to `default` when unset.
pub fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| CommonError::InvalidVar {
            name: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Parse a boolean flag. Accepts true/false, 1/0, yes/no, on/off.
pub fn env_bool(name: &str, default: bool) -> Result<bool> {
    let Some(raw) = env_string(name) else {
        return Ok(default);
    };

    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(CommonError::InvalidVar {
            name: name.to_string(),
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}

/// Split a comma-separated variable into trimmed, non-empty items.
pub fn env_list(name: &str) -> Vec<String> {
    env_string(name)
        .map(|raw| split_list(&raw))
        .unwrap_or_default()
}

/// Split a comma-separated string into trimmed, non-empty items.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
