//! Resource controllers.
//!
//! Each controller exposes `schema`, `validate`, `create`, `read`, `update`
//! and `delete` over JSON state; [`UdbProvider`](crate::UdbProvider)
//! dispatches to them by resource type.

pub mod instance;
pub mod param_group;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::UdbApi;
use crate::config::Timeouts;
use crate::error::ProviderError;
use crate::retry::RetryPolicy;
use crate::wait::StateWaiter;

/// What a controller operation needs: the API client and the configured timings.
#[derive(Clone)]
pub struct Context {
    /// The remote API.
    pub client: Arc<dyn UdbApi>,
    /// Polling and delete timings.
    pub timeouts: Timeouts,
}

impl Context {
    /// Create a context.
    pub fn new(client: Arc<dyn UdbApi>, timeouts: Timeouts) -> Self {
        Self { client, timeouts }
    }

    /// A state waiter using the configured interval and timeout.
    pub fn waiter(&self) -> StateWaiter {
        StateWaiter::new(
            self.client.clone(),
            self.timeouts.poll_interval,
            self.timeouts.state_timeout,
        )
    }

    /// The retry policy bounding delete loops.
    pub fn delete_policy(&self) -> RetryPolicy {
        RetryPolicy::with_deadline(self.timeouts.delete_timeout)
    }
}

/// Decode resource state, treating null attributes as unset.
pub(crate) fn decode<T: DeserializeOwned>(mut value: Value) -> Result<T, ProviderError> {
    if let Value::Object(map) = &mut value {
        map.retain(|_, v| !v.is_null());
    }
    Ok(serde_json::from_value(value)?)
}

/// Render unix seconds as an RFC 3339 UTC timestamp; zero renders empty.
pub(crate) fn format_timestamp(secs: i64) -> String {
    if secs == 0 {
        return String::new();
    }
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// `None` for an empty string.
pub(crate) fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}
