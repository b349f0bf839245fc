//! Connection settings.
//!
//! [`Config`] deserializes with defaults for every missing field so it can be
//! embedded in a host application's own configuration file.
//! [`Config::from_env`] reads the same settings from the environment.

use serde::Deserialize;
use std::{env, time::Duration};
use tracing::warn;

pub const ENV_DEFAULT_TIMEOUT_MS: &str = "BUSRPC_DEFAULT_TIMEOUT_MS";
pub const ENV_DISPATCH: &str = "BUSRPC_DISPATCH";

/// Reply timeout used when a call does not give one.
pub const DEFAULT_TIMEOUT_MS: u64 = 25_000;

/// How inbound method calls are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Handlers run to completion inside the dispatch step, one at a time.
    #[default]
    Inline,
    /// Each handler future is spawned onto the tokio runtime.
    Spawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `None` waits forever.
    pub default_timeout_ms: Option<u64>,
    pub dispatch: DispatchMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            dispatch: DispatchMode::Inline,
        }
    }
}

impl Config {
    /// Defaults, overridden by `BUSRPC_DEFAULT_TIMEOUT_MS` (milliseconds, `0`
    /// or `none` to disable) and `BUSRPC_DISPATCH` (`inline` or `spawn`).
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var(ENV_DEFAULT_TIMEOUT_MS) {
            match raw.trim() {
                "0" | "none" => config.default_timeout_ms = None,
                ms => match ms.parse() {
                    Ok(ms) => config.default_timeout_ms = Some(ms),
                    Err(e) => warn!("ignoring {ENV_DEFAULT_TIMEOUT_MS}={raw:?}: {e}"),
                },
            }
        }
        if let Ok(raw) = env::var(ENV_DISPATCH) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "inline" => config.dispatch = DispatchMode::Inline,
                "spawn" => config.dispatch = DispatchMode::Spawn,
                _ => warn!("ignoring {ENV_DISPATCH}={raw:?}: expected inline or spawn"),
            }
        }
        config
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }
}
