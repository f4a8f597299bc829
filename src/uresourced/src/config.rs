// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Configuration loading.
//!
//! The configuration file keeps the group/key layout of the classic
//! keyfile format, expressed as TOML tables. Every key is read
//! individually: a missing key silently keeps its default, a malformed one
//! is logged and then keeps its default, so a single bad entry never takes
//! the whole file down.

use std::fs;
use std::path::{Path, PathBuf};

use slog::{debug, warn, Logger};
use thiserror::Error;
use toml::Value;

use crate::systemd::Allocation;

/// System-wide configuration file, shared by both daemon modes.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/uresourced.conf";

const WEIGHT_MIN: i64 = 1;
const WEIGHT_MAX: i64 = 10000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryParseError {
    #[error("could not parse memory value {0:?}")]
    NotANumber(String),
    #[error("unknown memory unit {0:?}")]
    UnknownUnit(char),
}

/// A memory amount from the configuration, either absolute or relative to
/// the total system RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySize {
    Bytes(u64),
    Percent(u64),
}

impl MemorySize {
    pub fn parse(value: &str) -> Result<Self, MemoryParseError> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, suffix) = value.split_at(split);

        let number: u64 = digits
            .parse()
            .map_err(|_| MemoryParseError::NotANumber(value.to_string()))?;

        match suffix {
            "" => Ok(MemorySize::Bytes(number)),
            "K" => Ok(MemorySize::Bytes(number << 10)),
            "M" => Ok(MemorySize::Bytes(number << 20)),
            "G" => Ok(MemorySize::Bytes(number << 30)),
            "T" => Ok(MemorySize::Bytes(number << 40)),
            "%" => Ok(MemorySize::Percent(number.min(100))),
            other => Err(MemoryParseError::UnknownUnit(
                other.chars().next().unwrap_or('?'),
            )),
        }
    }

    /// Resolve to bytes against the total amount of system RAM.
    pub fn to_bytes(self, total_ram: u64) -> u64 {
        match self {
            MemorySize::Bytes(bytes) => bytes,
            MemorySize::Percent(percent) => total_ram / 100 * percent,
        }
    }
}

fn group_key<'a>(root: &'a Value, group: &str, key: &str) -> Option<&'a Value> {
    root.get(group)?.get(key)
}

/// Read a memory key, resolved to bytes. `None` when the key is missing or
/// malformed; only malformed values are logged.
fn memory_key(
    root: &Value,
    group: &str,
    key: &str,
    total_ram: u64,
    logger: &Logger,
) -> Option<u64> {
    let value = group_key(root, group, key)?;

    let parsed = match value {
        Value::Integer(number) if *number >= 0 => Ok(MemorySize::Bytes(*number as u64)),
        Value::String(text) => MemorySize::parse(text),
        _ => Err(MemoryParseError::NotANumber(value.to_string())),
    };

    match parsed {
        Ok(size) => Some(size.to_bytes(total_ram)),
        Err(err) => {
            warn!(logger, "could not parse configuration key";
                  "group" => group, "key" => key, "error" => %err);
            None
        }
    }
}

/// Read an integer weight key, clamped to the valid weight range.
fn weight_key(root: &Value, group: &str, key: &str, logger: &Logger) -> Option<u64> {
    match group_key(root, group, key)? {
        Value::Integer(number) => Some((*number).clamp(WEIGHT_MIN, WEIGHT_MAX) as u64),
        value => {
            warn!(logger, "could not parse configuration key";
                  "group" => group, "key" => key, "value" => %value);
            None
        }
    }
}

/// Read a plain integer key, keeping `current` when missing or malformed.
fn integer_key(root: &Value, group: &str, key: &str, current: i64, logger: &Logger) -> i64 {
    match group_key(root, group, key) {
        Some(Value::Integer(number)) => *number,
        Some(value) => {
            debug!(logger, "could not parse configuration key, keeping current value";
                   "group" => group, "key" => key, "value" => %value);
            current
        }
        None => current,
    }
}

fn load_value(path: &Path, logger: &Logger) -> Option<Value> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            debug!(logger, "could not read configuration file";
                   "path" => %path.display(), "error" => %err);
            return None;
        }
    };

    match contents.parse::<Value>() {
        Ok(root) => Some(root),
        Err(err) => {
            warn!(logger, "could not parse configuration file";
                  "path" => %path.display(), "error" => %err);
            None
        }
    }
}

/// Configuration of the system arbiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// Ceiling for the aggregate `user.slice` protection.
    pub max_memory_min: u64,
    pub max_memory_low: u64,

    pub active_user: Allocation,
    pub inactive_user: Allocation,

    /// Fixed allocation passed into the user's session slice drop-in.
    pub session_slice: Allocation,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            max_memory_min: 0,
            max_memory_low: 0,
            active_user: Allocation::default(),
            // Neutral values, no protection.
            inactive_user: Allocation {
                memory_min: 0,
                memory_low: 0,
                cpu_weight: Some(100),
                io_weight: Some(100),
            },
            session_slice: Allocation::default(),
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path, total_ram: u64, logger: &Logger) -> Self {
        let mut config = SystemConfig::default();

        let Some(root) = load_value(path, logger) else {
            warn!(logger, "could not read configuration, using defaults";
                  "path" => %path.display());
            return config;
        };

        config.max_memory_min =
            memory_key(&root, "Global", "MaxMemoryMin", total_ram, logger).unwrap_or(0);
        config.max_memory_low =
            memory_key(&root, "Global", "MaxMemoryLow", total_ram, logger).unwrap_or(0);
        if config.max_memory_min == 0 && config.max_memory_low == 0 {
            warn!(
                logger,
                "no memory allocation set or available for user.slice; \
                 the daemon will not do anything useful"
            );
        }

        config.active_user.memory_min =
            memory_key(&root, "ActiveUser", "MemoryMin", total_ram, logger).unwrap_or(0);
        config.active_user.memory_low =
            memory_key(&root, "ActiveUser", "MemoryLow", total_ram, logger).unwrap_or(0);
        config.active_user.cpu_weight = weight_key(&root, "ActiveUser", "CPUWeight", logger);
        config.active_user.io_weight = weight_key(&root, "ActiveUser", "IOWeight", logger);

        // Every SessionSlice key falls back to its ActiveUser counterpart.
        config.session_slice = Allocation {
            memory_min: memory_key(&root, "SessionSlice", "MemoryMin", total_ram, logger)
                .unwrap_or(config.active_user.memory_min),
            memory_low: memory_key(&root, "SessionSlice", "MemoryLow", total_ram, logger)
                .unwrap_or(config.active_user.memory_low),
            cpu_weight: weight_key(&root, "SessionSlice", "CPUWeight", logger)
                .or(config.active_user.cpu_weight),
            io_weight: weight_key(&root, "SessionSlice", "IOWeight", logger)
                .or(config.active_user.io_weight),
        };

        config
    }
}

/// Configuration of the per-application boost policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBoostConfig {
    pub default_cpu_weight: u64,
    pub default_io_weight: u64,
    pub active_cpu_weight: u64,
    pub active_io_weight: u64,
    pub boost_cpu_weight_inc: u64,
    pub boost_io_weight_inc: u64,
}

impl Default for AppBoostConfig {
    fn default() -> Self {
        AppBoostConfig {
            default_cpu_weight: 100,
            default_io_weight: 100,
            active_cpu_weight: 100,
            active_io_weight: 100,
            boost_cpu_weight_inc: 0,
            boost_io_weight_inc: 0,
        }
    }
}

impl AppBoostConfig {
    /// Per-user configuration path, honoring `$XDG_CONFIG_HOME`.
    fn user_config_path() -> Option<PathBuf> {
        if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
            if !config_home.is_empty() {
                return Some(PathBuf::from(config_home).join("uresourced.conf"));
            }
        }

        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config/uresourced.conf"))
    }

    pub fn load(logger: &Logger) -> Self {
        let mut candidates = Vec::new();
        if let Some(user_path) = Self::user_config_path() {
            candidates.push(user_path);
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG_PATH));

        Self::load_first(&candidates, logger)
    }

    /// Load the first readable candidate file, falling back to defaults.
    pub fn load_first(candidates: &[PathBuf], logger: &Logger) -> Self {
        let root = candidates
            .iter()
            .find_map(|path| load_value(path, logger));

        let config = match root {
            Some(root) => Self::from_value(&root, logger),
            None => {
                warn!(logger, "could not read any configuration file, using defaults");
                AppBoostConfig::default()
            }
        };

        slog::info!(logger, "CPU boost configuration";
              "default_weight" => config.default_cpu_weight,
              "active_weight" => config.active_cpu_weight,
              "boost_increment" => config.boost_cpu_weight_inc);
        slog::info!(logger, "IO boost configuration";
              "default_weight" => config.default_io_weight,
              "active_weight" => config.active_io_weight,
              "boost_increment" => config.boost_io_weight_inc);

        config
    }

    fn from_value(root: &Value, logger: &Logger) -> Self {
        let defaults = AppBoostConfig::default();

        let weight = |key: &str, current: u64| -> u64 {
            integer_key(root, "AppBoost", key, current as i64, logger)
                .clamp(WEIGHT_MIN, WEIGHT_MAX) as u64
        };

        let default_cpu_weight = weight("DefaultCPUWeight", defaults.default_cpu_weight);
        let default_io_weight = weight("DefaultIOWeight", defaults.default_io_weight);
        let active_cpu_weight = weight("ActiveCPUWeight", defaults.active_cpu_weight);
        let active_io_weight = weight("ActiveIOWeight", defaults.active_io_weight);

        // The boost increment may never push an active weight past the
        // valid range.
        let boost = |key: &str, active: u64| -> u64 {
            integer_key(root, "AppBoost", key, 0, logger)
                .clamp(0, WEIGHT_MAX - active as i64) as u64
        };

        AppBoostConfig {
            default_cpu_weight,
            default_io_weight,
            boost_cpu_weight_inc: boost("BoostCPUWeightInc", active_cpu_weight),
            boost_io_weight_inc: boost("BoostIOWeightInc", active_io_weight),
            active_cpu_weight,
            active_io_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    const RAM: u64 = 8 << 30;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[rstest]
    #[case("1024", 1024)]
    #[case("1K", 1024)]
    #[case("1M", 1 << 20)]
    #[case("1G", 1 << 30)]
    #[case("1T", 1 << 40)]
    #[case("50%", RAM / 2)]
    fn memory_suffixes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(MemorySize::parse(input).unwrap().to_bytes(RAM), expected);
    }

    #[test]
    fn memory_percent_clamps_to_whole_ram() {
        assert_eq!(MemorySize::parse("150%").unwrap().to_bytes(RAM), RAM);
    }

    #[test]
    fn memory_rejects_unknown_unit() {
        assert_eq!(
            MemorySize::parse("1X"),
            Err(MemoryParseError::UnknownUnit('X'))
        );
        assert!(matches!(
            MemorySize::parse("bogus"),
            Err(MemoryParseError::NotANumber(_))
        ));
    }

    #[test]
    fn system_config_reads_groups() {
        let file = write_config(
            r#"
            [Global]
            MaxMemoryMin = "2G"
            MaxMemoryLow = "4G"

            [ActiveUser]
            MemoryMin = "25%"
            MemoryLow = "1G"
            CPUWeight = 500
            "#,
        );

        let config = SystemConfig::load(file.path(), RAM, &test_logger());
        assert_eq!(config.max_memory_min, 2 << 30);
        assert_eq!(config.max_memory_low, 4u64 << 30);
        assert_eq!(config.active_user.memory_min, RAM / 4);
        assert_eq!(config.active_user.memory_low, 1 << 30);
        assert_eq!(config.active_user.cpu_weight, Some(500));
        // Not configured, so left for the service manager to decide.
        assert_eq!(config.active_user.io_weight, None);
    }

    #[test]
    fn session_slice_falls_back_per_field() {
        let file = write_config(
            r#"
            [ActiveUser]
            MemoryMin = "1G"
            MemoryLow = "2G"
            CPUWeight = 300

            [SessionSlice]
            MemoryMin = "512M"
            IOWeight = 80
            "#,
        );

        let config = SystemConfig::load(file.path(), RAM, &test_logger());
        assert_eq!(config.session_slice.memory_min, 512 << 20);
        assert_eq!(config.session_slice.memory_low, 2 << 30);
        assert_eq!(config.session_slice.cpu_weight, Some(300));
        assert_eq!(config.session_slice.io_weight, Some(80));
    }

    #[test]
    fn bad_key_keeps_default_without_losing_the_rest() {
        let file = write_config(
            r#"
            [Global]
            MaxMemoryMin = "1Q"
            MaxMemoryLow = "1G"
            "#,
        );

        let config = SystemConfig::load(file.path(), RAM, &test_logger());
        assert_eq!(config.max_memory_min, 0);
        assert_eq!(config.max_memory_low, 1 << 30);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = SystemConfig::load(Path::new("/nonexistent/uresourced.conf"), RAM, &test_logger());
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.inactive_user.cpu_weight, Some(100));
    }

    #[test]
    fn app_boost_weights_are_clamped() {
        let file = write_config(
            r#"
            [AppBoost]
            DefaultCPUWeight = 0
            ActiveCPUWeight = 99999
            ActiveIOWeight = 9000
            BoostIOWeightInc = 10000
            "#,
        );

        let config =
            AppBoostConfig::load_first(&[file.path().to_path_buf()], &test_logger());
        assert_eq!(config.default_cpu_weight, 1);
        assert_eq!(config.active_cpu_weight, 10000);
        assert_eq!(config.boost_cpu_weight_inc, 0);
        assert_eq!(config.active_io_weight, 9000);
        assert_eq!(config.boost_io_weight_inc, 1000);
    }

    #[test]
    fn app_boost_falls_back_to_later_candidate() {
        let file = write_config(
            r#"
            [AppBoost]
            ActiveCPUWeight = 250
            "#,
        );

        let candidates = vec![
            PathBuf::from("/nonexistent/uresourced.conf"),
            file.path().to_path_buf(),
        ];
        let config = AppBoostConfig::load_first(&candidates, &test_logger());
        assert_eq!(config.active_cpu_weight, 250);
        assert_eq!(config.default_cpu_weight, 100);
    }
}
