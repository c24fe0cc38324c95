use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::quiz::UserId;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime settings, read from the environment (after `dotenv`).
#[derive(Debug, Clone)]
pub struct Config {
    pub chatgpt_api_key: String,
    pub chatgpt_engine: String,
    pub generation_timeout: Duration,
    pub free_generation_limit: usize,
    pub generation_window: chrono::Duration,
    pub stats_path: Option<PathBuf>,
    /// SQLite file for sessions; in memory when unset.
    pub sessions_path: Option<PathBuf>,
    pub premium_users: Vec<UserId>,
}

impl Config {
    pub const DEFAULT_ENGINE: &'static str = "gpt-4";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
    pub const DEFAULT_FREE_LIMIT: usize = 4;
    pub const DEFAULT_WINDOW_HOURS: i64 = 24;

    /// Fails when `CHATGPT_API_KEY` is missing or a numeric variable cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chatgpt_api_key = lookup("CHATGPT_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("CHATGPT_API_KEY"))?;

        let timeout_secs = parse_or(&lookup, "GENERATION_TIMEOUT_SECS", Self::DEFAULT_TIMEOUT_SECS)?;
        let window_hours = parse_or(&lookup, "GENERATION_WINDOW_HOURS", Self::DEFAULT_WINDOW_HOURS)?;
        if window_hours <= 0 {
            return Err(ConfigError::Invalid {
                name: "GENERATION_WINDOW_HOURS",
                value: window_hours.to_string(),
            });
        }

        let premium_users = match lookup("PREMIUM_USERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| {
                    id.parse::<u64>().map(UserId).map_err(|_| ConfigError::Invalid {
                        name: "PREMIUM_USERS",
                        value: id.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            chatgpt_api_key,
            chatgpt_engine: lookup("CHATGPT_ENGINE").unwrap_or_else(|| Self::DEFAULT_ENGINE.to_string()),
            generation_timeout: Duration::from_secs(timeout_secs),
            free_generation_limit: parse_or(&lookup, "FREE_GENERATION_LIMIT", Self::DEFAULT_FREE_LIMIT)?,
            generation_window: chrono::Duration::hours(window_hours),
            stats_path: path_var(&lookup, "STATS_PATH"),
            sessions_path: path_var(&lookup, "SESSIONS_PATH"),
            premium_users,
        })
    }
}

fn path_var<F>(lookup: &F, name: &str) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).filter(|v| !v.trim().is_empty()).map(PathBuf::from)
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let config = Config::from_lookup(lookup_from(&[("CHATGPT_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.chatgpt_engine, "gpt-4");
        assert_eq!(config.generation_timeout, Duration::from_secs(120));
        assert_eq!(config.free_generation_limit, 4);
        assert_eq!(config.generation_window, chrono::Duration::hours(24));
        assert!(config.stats_path.is_none());
        assert!(config.sessions_path.is_none());
        assert!(config.premium_users.is_empty());
    }

    #[test]
    fn missing_api_key_is_reported() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CHATGPT_API_KEY")));
    }

    #[test]
    fn parses_premium_users_and_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("CHATGPT_API_KEY", "sk-test"),
            ("PREMIUM_USERS", "42, 7,"),
            ("FREE_GENERATION_LIMIT", "2"),
            ("STATS_PATH", "stats.json"),
            ("SESSIONS_PATH", "sessions.sqlite"),
        ]))
        .unwrap();
        assert_eq!(config.premium_users, vec![UserId(42), UserId(7)]);
        assert_eq!(config.free_generation_limit, 2);
        assert_eq!(config.stats_path, Some(PathBuf::from("stats.json")));
        assert_eq!(config.sessions_path, Some(PathBuf::from("sessions.sqlite")));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = Config::from_lookup(lookup_from(&[
            ("CHATGPT_API_KEY", "sk-test"),
            ("GENERATION_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "GENERATION_TIMEOUT_SECS", .. }));
    }
}
