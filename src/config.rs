//! Provider configuration.
//!
//! The configuration block arrives as JSON through
//! [`ProviderService::configure`](crate::provider::ProviderService::configure):
//!
//! ```
//! use udb_provider::config::ProviderConfig;
//! use serde_json::json;
//!
//! let config: ProviderConfig = serde_json::from_value(json!({
//!     "region": "cn-bj2",
//!     "state_timeout_secs": 900
//! }))
//! .unwrap();
//!
//! let timeouts = config.timeouts();
//! assert_eq!(timeouts.state_timeout.as_secs(), 900);
//! assert_eq!(timeouts.delete_timeout.as_secs(), 300);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientScope;
use crate::error::ProviderError;
use crate::schema::{Attribute, Constraint, Schema};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_STATE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 300;

/// The provider configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Region all resources live in.
    pub region: String,
    /// Project to create resources in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Seconds between two polls of an instance state.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds to wait for an instance to reach a target state.
    #[serde(default = "default_state_timeout")]
    pub state_timeout_secs: u64,
    /// Seconds a delete may keep retrying before it is reported as failed.
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_state_timeout() -> u64 {
    DEFAULT_STATE_TIMEOUT_SECS
}

fn default_delete_timeout() -> u64 {
    DEFAULT_DELETE_TIMEOUT_SECS
}

impl ProviderConfig {
    /// Parse the configuration block.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProviderError> {
        let config: ProviderConfig = serde_json::from_value(value)?;
        if config.region.trim().is_empty() {
            return Err(ProviderError::Configuration(
                "region must not be empty".to_string(),
            ));
        }
        if config.poll_interval_secs == 0 {
            return Err(ProviderError::Configuration(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    /// The schema of the configuration block.
    pub fn schema() -> Schema {
        Schema::v0()
            .with_attribute(
                "region",
                Attribute::required_string().with_description("Region all resources live in"),
            )
            .with_attribute("project_id", Attribute::optional_string())
            .with_attribute(
                "poll_interval_secs",
                Attribute::optional_int64()
                    .with_constraint(Constraint::int_range(1, 60))
                    .with_default(DEFAULT_POLL_INTERVAL_SECS.into()),
            )
            .with_attribute(
                "state_timeout_secs",
                Attribute::optional_int64()
                    .with_constraint(Constraint::int_range(1, 86_400))
                    .with_default(DEFAULT_STATE_TIMEOUT_SECS.into()),
            )
            .with_attribute(
                "delete_timeout_secs",
                Attribute::optional_int64()
                    .with_constraint(Constraint::int_range(1, 86_400))
                    .with_default(DEFAULT_DELETE_TIMEOUT_SECS.into()),
            )
    }

    /// Region and project handed to the API client.
    pub fn scope(&self) -> ClientScope {
        ClientScope {
            region: self.region.clone(),
            project_id: self.project_id.clone(),
        }
    }

    /// Polling and retry durations.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            state_timeout: Duration::from_secs(self.state_timeout_secs),
            delete_timeout: Duration::from_secs(self.delete_timeout_secs),
        }
    }
}

/// Durations governing state polling and delete retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Time between two state polls.
    pub poll_interval: Duration,
    /// Ceiling for a single wait on instance state.
    pub state_timeout: Duration,
    /// Wall-clock bound of a delete retry loop.
    pub delete_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            state_timeout: Duration::from_secs(DEFAULT_STATE_TIMEOUT_SECS),
            delete_timeout: Duration::from_secs(DEFAULT_DELETE_TIMEOUT_SECS),
        }
    }
}
