//! UCloud UDB provider
//!
//! Resource handlers for an infrastructure-as-code host managing UCloud UDB
//! database instances (`ucloud_db_instance`) and parameter groups
//! (`ucloud_db_param_group`).
//!
//! # Overview
//!
//! - **Provider surface**: [`ProviderService`], implemented by [`UdbProvider`]
//! - **Controllers**: create, read, update and delete flows in [`resources`]
//! - **Remote API**: the [`client::UdbApi`] trait, implemented by the cloud SDK
//! - **Schema & validation**: attribute rules checked before any remote call
//! - **Planning**: schema-driven diffs deciding update in place or replacement
//! - **State polling & retries**: [`wait::StateWaiter`] and [`retry::retry_until`]
//! - **Logging**: `tracing` events, with a stderr subscriber in [`logging`]
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use udb_provider::{init_logging, ProviderService, UdbProvider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!     let provider = UdbProvider::new(Arc::new(my_udb_client()));
//!     provider.configure(serde_json::json!({"region": "cn-bj2"})).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Instance types
//!
//! An instance type is written `engine-mode-memory`, for example
//! `mysql-ha-4`. Changing the memory tier or storage resizes the instance in
//! place; a `normal` instance is stopped for the resize and started again if
//! it was running. Changing the mode is rejected.

#![warn(missing_docs)]
#![warn(clippy::all)]

#[allow(missing_docs)]
pub mod client;
pub mod config;
pub mod error;
pub mod instance_type;
pub mod logging;
pub mod plan;
pub mod provider;
#[allow(missing_docs)]
pub mod resources;
pub mod retry;
pub mod schema;
pub mod testing;
pub mod types;
pub mod validation;
pub mod wait;

// Re-export main types at crate root
pub use config::{ProviderConfig, Timeouts};
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::{ProviderService, UdbProvider, DB_INSTANCE, DB_PARAM_GROUP};
pub use schema::ProviderSchema;
pub use types::{AttributeChange, ImportedResource, PlanResult, ProviderMetadata};
pub use validation::{is_valid, validate, validate_result};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tracing;
