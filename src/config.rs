//! Startup surface. The process takes exactly four knobs — bootstrap
//! URL, group id, optional log level, optional tick period — from
//! `EDGE__`-prefixed environment variables, overridable by command-line
//! flags. Everything else arrives via bootstrap and the config bus.

use anyhow::{Context, Result};
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BootConfig {
    #[validate(url)]
    pub bootstrap_url: String,

    #[validate(length(min = 1))]
    pub group_id: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_tick_seconds")]
    #[validate(range(min = 0.5, max = 10.0))]
    pub tick_seconds: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_seconds() -> f64 {
    1.0
}

impl BootConfig {
    /// Environment variables (`EDGE__BOOTSTRAP_URL`, `EDGE__GROUP_ID`,
    /// `EDGE__LOG_LEVEL`, `EDGE__TICK_SECONDS`) merged with `--key value`
    /// command-line flags, flags taking precedence.
    pub fn load<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let overrides = parse_args(args)?;
        let config: BootConfig = Figment::new()
            .merge(Env::prefixed("EDGE__"))
            .merge(Serialized::defaults(overrides))
            .extract()
            .context("startup configuration incomplete")?;
        config
            .validate()
            .context("startup configuration invalid")?;
        Ok(config)
    }

    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.tick_seconds)
    }
}

fn parse_args<I: IntoIterator<Item = String>>(
    args: I,
) -> Result<std::collections::BTreeMap<String, String>> {
    let mut overrides = std::collections::BTreeMap::new();
    let mut iter = args.into_iter();
    while let Some(flag) = iter.next() {
        let key = match flag.as_str() {
            "--bootstrap-url" => "bootstrap_url",
            "--group-id" => "group_id",
            "--log-level" => "log_level",
            "--tick-seconds" => "tick_seconds",
            other => anyhow::bail!("unknown flag '{other}'"),
        };
        let value = iter
            .next()
            .with_context(|| format!("flag '{flag}' is missing a value"))?;
        overrides.insert(key.to_string(), value);
    }
    Ok(overrides)
}

/// Process exit codes.
pub const EXIT_OK: u8 = 0;
pub const EXIT_BOOTSTRAP_FAILED: u8 = 1;
pub const EXIT_CONFIG_INVALID: u8 = 2;
pub const EXIT_FIELDBUS_MISCONFIGURED: u8 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_satisfy_the_whole_surface() {
        let config = BootConfig::load(
            [
                "--bootstrap-url",
                "http://backend:8000",
                "--group-id",
                "lanzone-1",
                "--tick-seconds",
                "2",
            ]
            .map(String::from),
        )
        .unwrap();
        assert_eq!(config.bootstrap_url, "http://backend:8000");
        assert_eq!(config.group_id, "lanzone-1");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.tick_period(), std::time::Duration::from_secs(2));
    }

    #[test]
    fn missing_bootstrap_url_is_an_error() {
        assert!(BootConfig::load(["--group-id", "lanzone-1"].map(String::from)).is_err());
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(BootConfig::load(["--frobnicate", "yes"].map(String::from)).is_err());
    }

    #[test]
    fn tick_period_out_of_range_fails_validation() {
        let result = BootConfig::load(
            [
                "--bootstrap-url",
                "http://backend:8000",
                "--group-id",
                "lanzone-1",
                "--tick-seconds",
                "0.01",
            ]
            .map(String::from),
        );
        assert!(result.is_err());
    }
}
