// Page engine options

use crate::{JspError, JspResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for [`JspOptions::from_env`]
pub const ENV_PREFIX: &str = "SLUICE_JSP_";

/// Settings for compilation, reloading and availability.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JspOptions {
    /// Run the compile step on every request so source edits show up immediately
    pub development: bool,
    /// Where generated artifacts are written
    pub scratch_dir: PathBuf,
    /// Seconds between background staleness checks when not in development mode
    pub check_interval_secs: u64,
    /// Unavailability window used when a page does not give a positive one
    pub default_unavailable_secs: u64,
}

impl Default for JspOptions {
    fn default() -> Self {
        Self {
            development: true,
            scratch_dir: std::env::temp_dir().join("sluice-jsp"),
            check_interval_secs: 300,
            default_unavailable_secs: 60,
        }
    }
}

impl JspOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile once, then rely on the background check
    pub fn production() -> Self {
        Self {
            development: false,
            ..Self::default()
        }
    }

    pub fn development(mut self, enabled: bool) -> Self {
        self.development = enabled;
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_secs = interval.as_secs();
        self
    }

    pub fn default_unavailable(mut self, window: Duration) -> Self {
        self.default_unavailable_secs = window.as_secs();
        self
    }

    pub fn check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> JspResult<Self> {
        toml::from_str(content).map_err(|e| {
            JspError::Core(sluice_core::Error::Config(format!(
                "TOML parse error: {}",
                e
            )))
        })
    }

    /// Defaults overridden by `SLUICE_JSP_*` environment variables.
    pub fn from_env() -> JspResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `SLUICE_JSP_*` entries of `vars`.
    pub fn from_vars<I, K, V>(vars: I) -> JspResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "DEVELOPMENT" => {
                    options.development = matches!(
                        value.to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    )
                }
                "SCRATCH_DIR" => options.scratch_dir = PathBuf::from(value),
                "CHECK_INTERVAL_SECS" => options.check_interval_secs = parse(name, value)?,
                "DEFAULT_UNAVAILABLE_SECS" => options.default_unavailable_secs = parse(name, value)?,
                _ => {}
            }
        }
        Ok(options)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> JspResult<T> {
    value.parse().map_err(|_| {
        JspError::Core(sluice_core::Error::Config(format!(
            "invalid value for {}{}: {:?}",
            ENV_PREFIX, name, value
        )))
    })
}
