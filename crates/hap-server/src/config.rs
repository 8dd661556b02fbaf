//! Server configuration and its builder.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use hap_core::category::Category;
use hap_core::error::ParseError;
use hap_core::setup::{validate_pincode, validate_setup_id};
use hap_pairing::BackoffConfig;

/// Default port used by HomeKit accessories when none is configured.
pub const DEFAULT_PORT: u16 = 51826;

/// Everything the accessory server needs besides the accessory itself.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// `0` picks an ephemeral port.
    pub port: u16,
    /// Pairing identifier in MAC form.
    pub username: String,
    pub pincode: String,
    /// Reused from the pairing record, or generated, when absent.
    pub setup_id: Option<String>,
    /// Overrides the published accessory's own category.
    pub category: Option<Category>,
    pub firmware_revision: String,
    /// A handler running longer than this raises a slow warning.
    pub slow_threshold: Duration,
    /// A handler running longer than this fails with a timeout status.
    pub timeout: Duration,
    /// `/accessories` requests within this window reuse the last read.
    pub accessories_cache_window: Duration,
    pub event_coalescing: Duration,
    pub config_debounce: Duration,
    pub max_timed_write_ttl: Duration,
    pub max_body_len: usize,
    pub backoff: BackoffConfig,
}

impl ServerConfig {
    pub fn builder(username: impl Into<String>, pincode: impl Into<String>) -> ServerConfigBuilder {
        ServerConfigBuilder::new(username, pincode)
    }
}

/// Builder for [`ServerConfig`].
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create new builder with defaults.
    pub fn new(username: impl Into<String>, pincode: impl Into<String>) -> Self {
        Self {
            config: ServerConfig {
                bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: DEFAULT_PORT,
                username: username.into(),
                pincode: pincode.into(),
                setup_id: None,
                category: None,
                firmware_revision: env!("CARGO_PKG_VERSION").to_string(),
                slow_threshold: Duration::from_secs(3),
                timeout: Duration::from_secs(10),
                accessories_cache_window: Duration::from_secs(1),
                event_coalescing: Duration::from_millis(250),
                config_debounce: Duration::from_secs(1),
                max_timed_write_ttl: Duration::from_secs(10),
                max_body_len: 1 << 20,
                backoff: BackoffConfig::default(),
            },
        }
    }

    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn setup_id(mut self, setup_id: impl Into<String>) -> Self {
        self.config.setup_id = Some(setup_id.into());
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.config.category = Some(category);
        self
    }

    pub fn firmware_revision(mut self, revision: impl Into<String>) -> Self {
        self.config.firmware_revision = revision.into();
        self
    }

    /// Slow-warning and timeout thresholds for characteristic handlers.
    pub fn handler_timeouts(mut self, slow: Duration, timeout: Duration) -> Self {
        self.config.slow_threshold = slow;
        self.config.timeout = timeout;
        self
    }

    pub fn accessories_cache_window(mut self, window: Duration) -> Self {
        self.config.accessories_cache_window = window;
        self
    }

    pub fn event_coalescing(mut self, window: Duration) -> Self {
        self.config.event_coalescing = window;
        self
    }

    pub fn config_debounce(mut self, window: Duration) -> Self {
        self.config.config_debounce = window;
        self
    }

    pub fn max_timed_write_ttl(mut self, ttl: Duration) -> Self {
        self.config.max_timed_write_ttl = ttl;
        self
    }

    pub fn max_body_len(mut self, len: usize) -> Self {
        self.config.max_body_len = len;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ServerConfig, ParseError> {
        let config = self.config;
        validate_username(&config.username)?;
        validate_pincode(&config.pincode)?;
        if let Some(setup_id) = &config.setup_id {
            validate_setup_id(setup_id)?;
        }
        if config.slow_threshold >= config.timeout {
            return Err(ParseError::InvalidValue(format!(
                "slow threshold {:?} must be shorter than timeout {:?}",
                config.slow_threshold, config.timeout
            )));
        }
        Ok(config)
    }
}

/// Usernames look like MAC addresses: six upper-case hex pairs.
fn validate_username(username: &str) -> Result<(), ParseError> {
    let parts: Vec<&str> = username.split(':').collect();
    let valid = parts.len() == 6
        && parts.iter().all(|p| {
            p.len() == 2
                && p.bytes()
                    .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
        });
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidFormat(format!(
            "username must look like XX:XX:XX:XX:XX:XX, got {:?}",
            username
        )))
    }
}
