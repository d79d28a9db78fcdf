use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use regex::Regex;
use thiserror::Error;

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").expect("duration pattern is valid")
});

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown option {0:?}")]
    UnknownKey(String),
    #[error("option {0} is required")]
    Missing(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    /// Errors that should be answered with the usage text.
    pub fn wants_usage(&self) -> bool {
        matches!(self, ConfigError::UnknownKey(_) | ConfigError::Missing(_))
    }
}

/// Parse Go-style durations such as `5s`, `10m`, `1h30m`, `1.5h` or `250ms`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    if text == "0" {
        return Some(Duration::ZERO);
    }
    let mut total = 0f64;
    let mut end = 0;
    for caps in DURATION_PART.captures_iter(text) {
        let whole = caps.get(0)?;
        if whole.start() != end {
            return None;
        }
        end = whole.end();
        let amount: f64 = caps[1].parse().ok()?;
        total += amount
            * match &caps[2] {
                "ms" => 0.001,
                "s" => 1.0,
                "m" => 60.0,
                _ => 3600.0,
            };
    }
    if end == 0 || end != text.len() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

/// A `strftime` pattern chrono can both render and parse.
pub fn is_valid_date_format(format: &str) -> bool {
    !format.is_empty() && !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

#[derive(Clone, Debug)]
pub struct ConfigTable {
    values: BTreeMap<&'static str, String>,
}

impl ConfigTable {
    /// Only keys listed here are accepted by [`Self::load`].
    pub fn new(defaults: &[(&'static str, &str)]) -> Self {
        Self {
            values: defaults
                .iter()
                .map(|(key, value)| (*key, value.to_string()))
                .collect(),
        }
    }

    /// Apply `Key=value` arguments. A bare `Key` sets it to `1`.
    pub fn load<S: AsRef<str>>(&mut self, args: &[S]) -> Result<(), ConfigError> {
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg.split_once('=').unwrap_or((arg, "1"));
            match self.values.get_mut(key) {
                Some(slot) => *slot = value.to_string(),
                None => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or_default()
    }

    /// `None` for an empty value.
    pub fn optional(&self, key: &str) -> Option<&str> {
        Some(self.get(key)).filter(|value| !value.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), "1" | "true")
    }

    pub fn required(&self, key: &str) -> Result<&str, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn invalid(&self, key: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: self.get(key).to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn duration(&self, key: &str) -> Result<Duration, ConfigError> {
        parse_duration(self.get(key))
            .ok_or_else(|| self.invalid(key, "expected a duration like 5s, 10m or 1h30m"))
    }

    pub fn optional_duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        match self.optional(key) {
            Some(_) => self.duration(key).map(Some),
            None => Ok(None),
        }
    }

    pub fn number<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        self.get(key)
            .parse()
            .map_err(|_| self.invalid(key, "expected a number"))
    }

    pub fn date_format(&self, key: &str) -> Result<&str, ConfigError> {
        let format = self.get(key);
        if is_valid_date_format(format) {
            Ok(format)
        } else {
            Err(self.invalid(key, "not a valid strftime pattern"))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.values.iter().map(|(key, value)| (*key, value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ConfigTable {
        ConfigTable::new(&[
            ("LogToStdout", ""),
            ("StatsInterval", "5s"),
            ("DHTConnsPerSec", "5"),
            ("DateFormat", "%y-%m-%d--%H:%M:%S"),
        ])
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("5x"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("5s junk"), None);
        assert_eq!(parse_duration(" 5s"), None);
        // beyond what Duration can hold
        assert_eq!(parse_duration("99999999999999999999h"), None);
    }

    #[test]
    fn test_load_and_lookup() {
        let mut config = table();
        config
            .load(&["LogToStdout", "StatsInterval=250ms", "DHTConnsPerSec=12"])
            .unwrap();

        assert!(config.flag("LogToStdout"));
        assert_eq!(config.duration("StatsInterval").unwrap(), Duration::from_millis(250));
        assert_eq!(config.number::<u32>("DHTConnsPerSec").unwrap(), 12);
        assert_eq!(config.date_format("DateFormat").unwrap(), "%y-%m-%d--%H:%M:%S");
        assert_eq!(config.get("Nope"), "");
    }

    #[test]
    fn test_unknown_and_missing_keys_want_usage() {
        let mut config = table();
        for arg in ["Help", "-h", "--help", "statsinterval=5s"] {
            let err = config.load(&[arg]).unwrap_err();
            assert!(err.wants_usage(), "{arg}");
        }

        let err = config.required("LogToStdout").unwrap_err();
        assert_eq!(err, ConfigError::Missing("LogToStdout".to_string()));
        assert!(err.wants_usage());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = table();
        config
            .load(&["StatsInterval=soon", "DHTConnsPerSec=many", "DateFormat=%Q"])
            .unwrap();
        assert!(!config.duration("StatsInterval").unwrap_err().wants_usage());
        assert!(config.number::<u32>("DHTConnsPerSec").is_err());
        assert!(config.date_format("DateFormat").is_err());
        assert_eq!(config.optional_duration("LogToStdout").unwrap(), None);

        let mut config = table();
        config.load(&["StatsInterval=99999999999999999999h"]).unwrap();
        assert!(matches!(
            config.duration("StatsInterval"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let mut config = table();
        config.load(&["DateFormat=%Y=%m"]).unwrap();
        assert_eq!(config.get("DateFormat"), "%Y=%m");
    }
}
