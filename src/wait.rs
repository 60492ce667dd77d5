//! Polling an instance until it reaches a target state.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::client::{ApiError, UdbApi};
use crate::error::ProviderError;

/// Instance state names reported by the API.
pub mod state {
    /// The instance is serving.
    pub const RUNNING: &str = "Running";
    /// The instance is stopped.
    pub const SHUTOFF: &str = "Shutoff";
}

/// Why a wait ended without reaching a target state.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The deadline passed first.
    #[error("timed out (last state: {})", .last_state.as_deref().unwrap_or("unknown"))]
    Timeout {
        /// The state reported by the last successful poll.
        last_state: Option<String>,
    },

    /// The instance disappeared.
    #[error("instance not found")]
    NotFound,

    /// Describing the instance failed.
    #[error(transparent)]
    Api(ApiError),
}

impl WaitError {
    /// Attach the instance id and targets, producing a provider error.
    pub fn into_provider_error(self, id: &str, targets: &[&str]) -> ProviderError {
        match self {
            WaitError::Timeout { last_state } => ProviderError::Timeout {
                id: id.to_string(),
                targets: targets.iter().map(|s| s.to_string()).collect(),
                last_state,
            },
            WaitError::NotFound => ProviderError::NotFound(id.to_string()),
            WaitError::Api(source) => ProviderError::api("DescribeUDBInstance", id, source),
        }
    }
}

/// Polls `DescribeUDBInstance` at a fixed interval under an overall timeout.
#[derive(Clone)]
pub struct StateWaiter {
    client: Arc<dyn UdbApi>,
    interval: Duration,
    timeout: Duration,
}

impl StateWaiter {
    /// Create a waiter polling every `interval` for at most `timeout`.
    pub fn new(client: Arc<dyn UdbApi>, interval: Duration, timeout: Duration) -> Self {
        Self {
            client,
            interval,
            timeout,
        }
    }

    /// Wait until the instance state is one of `targets` and return it.
    ///
    /// Any other state counts as pending. A missing instance ends the wait
    /// with [`WaitError::NotFound`]; callers that expect the instance to go
    /// away treat that as success.
    pub async fn wait(&self, id: &str, targets: &[&str]) -> Result<String, WaitError> {
        let mut last_state: Option<String> = None;
        let poll = async {
            loop {
                match self.client.describe_instance(id).await {
                    Ok(record) => {
                        if targets.contains(&record.state.as_str()) {
                            return Ok(record.state);
                        }
                        debug!(id = %id, state = %record.state, ?targets, "Instance not yet in target state");
                        last_state = Some(record.state);
                    },
                    Err(ApiError::NotFound(_)) => return Err(WaitError::NotFound),
                    Err(e) => return Err(WaitError::Api(e)),
                }
                tokio::time::sleep(self.interval).await;
            }
        };

        let outcome = tokio::time::timeout(self.timeout, poll).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(WaitError::Timeout { last_state }),
        }
    }

    /// Like [`wait`](Self::wait), converting failures into [`ProviderError`]s.
    pub async fn wait_for(&self, id: &str, targets: &[&str]) -> Result<String, ProviderError> {
        self.wait(id, targets)
            .await
            .map_err(|e| e.into_provider_error(id, targets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeUdb;

    fn waiter(fake: &Arc<FakeUdb>) -> StateWaiter {
        StateWaiter::new(
            fake.clone(),
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_once_state_matches() {
        let fake = Arc::new(FakeUdb::new());
        let id = fake.insert_instance(FakeUdb::instance_record("mysql-5.7", "Normal"));
        fake.schedule_state(&id, "Starting", 3, state::RUNNING);

        let reached = waiter(&fake).wait(&id, &[state::RUNNING]).await.unwrap();
        assert_eq!(reached, "Running");
        assert_eq!(fake.count("DescribeUDBInstance"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_accepts_any_target() {
        let fake = Arc::new(FakeUdb::new());
        let id = fake.insert_instance(FakeUdb::instance_record("mysql-5.7", "HA"));
        fake.set_state(&id, state::SHUTOFF);

        let reached = waiter(&fake)
            .wait(&id, &[state::RUNNING, state::SHUTOFF])
            .await
            .unwrap();
        assert_eq!(reached, "Shutoff");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_with_last_state() {
        let fake = Arc::new(FakeUdb::new());
        let id = fake.insert_instance(FakeUdb::instance_record("mysql-5.7", "Normal"));
        fake.set_state(&id, "Upgrading");

        let err = waiter(&fake).wait(&id, &[state::RUNNING]).await.unwrap_err();
        match err {
            WaitError::Timeout { last_state } => {
                assert_eq!(last_state.as_deref(), Some("Upgrading"))
            },
            other => panic!("expected timeout, got {:?}", other),
        }

        let err = waiter(&fake)
            .wait_for(&id, &[state::RUNNING])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_surfaces_not_found() {
        let fake = Arc::new(FakeUdb::new());
        let err = waiter(&fake)
            .wait("udb-missing", &[state::RUNNING])
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_surfaces_api_errors() {
        let fake = Arc::new(FakeUdb::new());
        let id = fake.insert_instance(FakeUdb::instance_record("mysql-5.7", "Normal"));
        fake.fail_next("DescribeUDBInstance");

        let err = waiter(&fake)
            .wait_for(&id, &[state::RUNNING])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Api {
                operation: "DescribeUDBInstance",
                ..
            }
        ));
    }
}
