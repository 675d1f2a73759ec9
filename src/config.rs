//! Runtime configuration.
//!
//! Layered with the `config` crate, later sources winning:
//!
//! 1. built-in defaults,
//! 2. an optional file (`--config`; TOML, YAML or JSON by extension),
//! 3. `MEADOWLARK_*` environment variables (`MEADOWLARK_PORT=8080`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::failsafe::DEFAULT_DELAY;

const ENV_PREFIX: &str = "MEADOWLARK";

/// Deployment environment. Selects the log format.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub env: Environment,
    /// Worker processes to supervise. `0` serves from this process.
    pub workers: usize,
    /// Seconds between the first fault and forced process exit.
    pub failsafe_secs: u64,
}

impl Config {
    /// Loads defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        Self::load_from(path, None)
    }

    /// Like [`load`](Self::load), reading `MEADOWLARK_*` variables from `env`
    /// instead of the process environment when given.
    pub fn load_from(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, Error> {
        let mut builder = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 3000)?
            .set_default("env", "development")?
            .set_default("workers", 0)?
            .set_default("failsafe_secs", DEFAULT_DELAY.as_secs())?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(env),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.failsafe_secs == 0 {
            return Err(Error::Config("failsafe_secs must be at least 1".to_owned()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_owned()));
        }
        Ok(())
    }

    /// `host:port`, bracketing IPv6 hosts.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn failsafe(&self) -> Duration {
        Duration::from_secs(self.failsafe_secs)
    }
}
