//! Runtime settings
//!
//! Built once from the command line and handed to every component that needs
//! it. Nothing here is read from process-wide state afterwards.

use crate::engine::EngineOptions;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Refresh interval used when none is given on the command line
pub const DEFAULT_SUBSCRIBE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Live config file name inside the home directory
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Engine home directory (live config, UI, caches)
    pub home_dir: PathBuf,
    /// Controller secret
    pub secret: Option<String>,
    /// Controller listen address
    pub external_controller: Option<String>,
    /// Controller UI path
    pub external_ui: Option<String>,
    /// Subscription URL, empty when subscriptions are disabled
    pub subscribe_url: String,
    /// Subscription refresh interval
    pub subscribe_interval: Duration,
    /// Run the engine next to the updater
    pub run_engine: bool,
    /// Fixed mixed port override
    pub mixed_port: Option<u16>,
}

impl Settings {
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Settings {
            home_dir: home_dir.into(),
            secret: None,
            external_controller: None,
            external_ui: None,
            subscribe_url: String::new(),
            subscribe_interval: DEFAULT_SUBSCRIBE_INTERVAL,
            run_engine: false,
            mixed_port: None,
        }
    }

    /// Reject settings the process cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.subscribe_interval.is_zero() {
            return Err(Error::config("subscription interval must be greater than zero"));
        }

        if !self.subscribe_url.is_empty() {
            let url = url::Url::parse(&self.subscribe_url)
                .map_err(|e| Error::config(format!("invalid subscription url: {}", e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::config(format!(
                    "unsupported subscription url scheme: {}",
                    url.scheme()
                )));
            }
        }

        Ok(())
    }

    /// Path of the live config
    pub fn config_path(&self) -> PathBuf {
        self.home_dir.join(CONFIG_FILE)
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Overrides the engine applies on top of every parsed config
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            secret: self.secret.clone(),
            external_controller: self.external_controller.clone(),
            external_ui: self.external_ui.clone(),
            mixed_port: self.mixed_port,
        }
    }
}

/// Parse a Go-style duration such as `90s`, `30m`, `1h30m` or `1.5h`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::parse("empty duration"));
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| Error::parse(format!("missing unit in duration {}", input)))?;
        if num_len == 0 {
            return Err(Error::parse(format!("invalid duration {}", input)));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| Error::parse(format!("invalid duration {}", input)))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => {
                return Err(Error::parse(format!("unknown unit {} in duration {}", unit, input)))
            }
        };
        rest = &rest[unit_len..];
        total += value * scale;
    }

    Duration::try_from_secs_f64(total)
        .map_err(|_| Error::parse(format!("duration {} out of range", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("99999999999999999999h").is_err());
        assert!(parse_duration(&format!("{}s", "9".repeat(400))).is_err());
    }

    #[test]
    fn test_paths() {
        let settings = Settings::new("/srv/hlash");
        assert_eq!(settings.config_path(), PathBuf::from("/srv/hlash/config.yaml"));
    }

    #[test]
    fn test_validate() {
        let mut settings = Settings::new("/srv/hlash");
        assert!(settings.validate().is_ok());

        settings.subscribe_url = "https://example.com/sub?token=abc".to_string();
        assert!(settings.validate().is_ok());

        settings.subscribe_url = "ftp://example.com/sub".to_string();
        assert!(settings.validate().is_err());

        settings.subscribe_url = "not a url".to_string();
        assert!(settings.validate().is_err());

        settings.subscribe_url.clear();
        settings.subscribe_interval = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_engine_options() {
        let mut settings = Settings::new("/srv/hlash");
        settings.secret = Some("s3cret".to_string());
        settings.mixed_port = Some(7891);
        let options = settings.engine_options();
        assert_eq!(options.secret.as_deref(), Some("s3cret"));
        assert_eq!(options.mixed_port, Some(7891));
        assert!(options.external_controller.is_none());
    }
}
