//! # Session Configuration
//!
//! [`Config`] is what a [`crate::Session`] runs with. [`ConfigInput`] is the
//! serde-facing shape (every field optional) that resolves into a validated
//! `Config`, so a TOML snippet only needs to mention what it overrides:
//!
//! ```toml
//! initial_window = 65536
//! max_frame_payload = 8192
//! window_update_percent = 50
//! ```

use serde::Deserialize;
use thiserror::Error;

use crate::window::update_threshold;

/// Default per-stream window: 256 KiB.
pub const DEFAULT_INITIAL_WINDOW: u32 = 256 * 1024;

/// Default cap on a single DATA payload: 16 KiB.
pub const DEFAULT_MAX_FRAME_PAYLOAD: u32 = 16 * 1024;

/// Default replenishment threshold, as a percentage of the initial window.
pub const DEFAULT_WINDOW_UPDATE_PERCENT: u8 = 25;

/// Default number of inbound streams waiting for `accept`.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_frame_payload ({payload}) exceeds initial_window ({window})")]
    PayloadExceedsWindow { payload: u32, window: u32 },
    #[error("window_update_percent must be within 1..=100, got {0}")]
    Percent(u8),
}

// ─── Input ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigInput {
    pub initial_window: Option<u32>,
    pub max_frame_payload: Option<u32>,
    pub window_update_percent: Option<u8>,
    pub accept_backlog: Option<usize>,
}

impl ConfigInput {
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let defaults = Config::default();
        let config = Config {
            initial_window: self.initial_window.unwrap_or(defaults.initial_window),
            max_frame_payload: self.max_frame_payload.unwrap_or(defaults.max_frame_payload),
            window_update_percent: self
                .window_update_percent
                .unwrap_or(defaults.window_update_percent),
            accept_backlog: self.accept_backlog.unwrap_or(defaults.accept_backlog),
            span: None,
        };
        config.validate()?;
        Ok(config)
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Settings shared by both ends of a session. Both peers must agree on
/// `initial_window`; it is never negotiated on the wire.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credit, in bytes, granted to every new stream in each direction.
    pub initial_window: u32,
    /// Upper bound on the payload of one DATA frame.
    pub max_frame_payload: u32,
    /// Consumed bytes, as a percentage of `initial_window`, that trigger a
    /// WINDOW_UPDATE.
    pub window_update_percent: u8,
    /// Inbound streams that may wait for `accept` before new SYNs are refused.
    pub accept_backlog: usize,
    /// Parent span for the session's diagnostics. `None` attaches the session
    /// span to whatever span is current at construction.
    pub span: Option<tracing::Span>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_window: DEFAULT_INITIAL_WINDOW,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            window_update_percent: DEFAULT_WINDOW_UPDATE_PERCENT,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            span: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Config::default());
        }
        let parsed: ConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Toml(e.to_string()))?;
        parsed.resolve()
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_window == 0 {
            return Err(ConfigError::Zero("initial_window"));
        }
        if self.max_frame_payload == 0 {
            return Err(ConfigError::Zero("max_frame_payload"));
        }
        if self.accept_backlog == 0 {
            return Err(ConfigError::Zero("accept_backlog"));
        }
        if self.max_frame_payload > self.initial_window {
            return Err(ConfigError::PayloadExceedsWindow {
                payload: self.max_frame_payload,
                window: self.initial_window,
            });
        }
        if !(1..=100).contains(&self.window_update_percent) {
            return Err(ConfigError::Percent(self.window_update_percent));
        }
        Ok(())
    }

    /// Consumed-byte count at which a receiver advertises new credit.
    pub fn update_threshold(&self) -> u32 {
        update_threshold(self.initial_window, self.window_update_percent)
    }
}
