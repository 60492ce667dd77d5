//! The provider surface.
//!
//! [`ProviderService`] is the interface the plugin host drives: schema,
//! configuration, validation, planning and the resource lifecycle over JSON
//! state. [`UdbProvider`] implements it for the two UDB resource types by
//! dispatching to the controllers in [`crate::resources`].

use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::client::UdbApi;
use crate::config::{ProviderConfig, Timeouts};
use crate::error::ProviderError;
use crate::instance_type;
use crate::plan::plan_resource;
use crate::resources::{instance, param_group, Context};
use crate::schema::{Diagnostic, ProviderSchema, Schema};
use crate::types::{ImportedResource, PlanResult, ProviderMetadata};
use crate::validation;

/// Resource type of database instances.
pub const DB_INSTANCE: &str = "ucloud_db_instance";

/// Resource type of parameter groups.
pub const DB_PARAM_GROUP: &str = "ucloud_db_param_group";

/// Operations the plugin host calls on a provider.
///
/// # Example
///
/// ```ignore
/// use udb_provider::{ProviderService, ProviderError, PlanResult};
/// use udb_provider::schema::{Attribute, Diagnostic, ProviderSchema, Schema};
///
/// struct MyProvider;
///
/// #[async_trait::async_trait]
/// impl ProviderService for MyProvider {
///     fn schema(&self) -> ProviderSchema {
///         ProviderSchema::new()
///             .with_resource("example_resource", Schema::v0()
///                 .with_attribute("name", Attribute::required_string()))
///     }
///
///     async fn configure(&self, config: serde_json::Value) -> Result<Vec<Diagnostic>, ProviderError> {
///         Ok(vec![])
///     }
///
///     // ... implement other methods
/// }
/// ```
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    // =========================================================================
    // Schema & Metadata
    // =========================================================================

    /// Return the provider's schema including all resources.
    fn schema(&self) -> ProviderSchema;

    /// Return provider metadata, derived from the schema by default.
    fn metadata(&self) -> ProviderMetadata {
        let mut resources: Vec<String> = self.schema().resources.into_keys().collect();
        resources.sort();
        ProviderMetadata { resources }
    }

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Validate the provider configuration before configuring.
    async fn validate_provider_config(
        &self,
        config: serde_json::Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Configure the provider with credentials and settings.
    async fn configure(&self, config: serde_json::Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Stop the provider gracefully.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate a resource's configuration before planning.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: serde_json::Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = (resource_type, config);
        Ok(vec![])
    }

    /// Upgrade resource state from an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Plan changes for a resource.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<serde_json::Value>,
        proposed_state: serde_json::Value,
        config: serde_json::Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a new resource.
    async fn create(
        &self,
        resource_type: &str,
        planned_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Read the current state of a resource; `Value::Null` once it is gone.
    async fn read(
        &self,
        resource_type: &str,
        current_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Update an existing resource.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: serde_json::Value,
        planned_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Delete a resource.
    async fn delete(
        &self,
        resource_type: &str,
        current_state: serde_json::Value,
    ) -> Result<(), ProviderError>;

    /// Import existing infrastructure into management.
    async fn import_resource(
        &self,
        resource_type: &str,
        _id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        Err(ProviderError::Unimplemented(format!(
            "Import not supported for resource type: {}",
            resource_type
        )))
    }
}

/// The UDB provider.
pub struct UdbProvider {
    client: Arc<dyn UdbApi>,
    timeouts: RwLock<Timeouts>,
}

impl UdbProvider {
    /// Create a provider issuing its calls through `client`.
    pub fn new(client: Arc<dyn UdbApi>) -> Self {
        Self {
            client,
            timeouts: RwLock::new(Timeouts::default()),
        }
    }

    /// The timings currently in effect.
    pub fn timeouts(&self) -> Timeouts {
        *self.timeouts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn context(&self) -> Context {
        Context::new(self.client.clone(), self.timeouts())
    }

    fn resource_schema(resource_type: &str) -> Result<Schema, ProviderError> {
        match resource_type {
            DB_INSTANCE => Ok(instance::schema()),
            DB_PARAM_GROUP => Ok(param_group::schema()),
            other => Err(ProviderError::UnknownResource(other.to_string())),
        }
    }
}

/// Diagnostic text for an error; a validation error is shown without prefix.
fn error_summary(err: ProviderError) -> String {
    match err {
        ProviderError::Validation(msg) => msg,
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl ProviderService for UdbProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema::new()
            .with_provider_config(ProviderConfig::schema())
            .with_resource(DB_INSTANCE, instance::schema())
            .with_resource(DB_PARAM_GROUP, param_group::schema())
    }

    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let schema = ProviderConfig::schema();
        let mut diagnostics = validation::validate(&schema, &config);
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(diagnostics);
        }
        let mut config = config;
        schema.apply_defaults(&mut config);
        if let Err(e) = ProviderConfig::from_value(config) {
            diagnostics.push(Diagnostic::error(error_summary(e)));
        }
        Ok(diagnostics)
    }

    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = self.validate_provider_config(config.clone()).await?;
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(diagnostics);
        }

        let mut config = config;
        ProviderConfig::schema().apply_defaults(&mut config);
        let config = ProviderConfig::from_value(config)?;
        instance_type::modes()?;

        self.client
            .configure(&config.scope())
            .await
            .map_err(|e| ProviderError::Configuration(format!("UDB client: {}", e)))?;
        *self.timeouts.write().unwrap_or_else(|e| e.into_inner()) = config.timeouts();

        info!(
            region = %config.region,
            project_id = ?config.project_id,
            "Configured UDB provider"
        );
        Ok(diagnostics)
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        match resource_type {
            DB_INSTANCE => Ok(instance::validate(&config)),
            DB_PARAM_GROUP => Ok(param_group::validate(&config)),
            other => Err(ProviderError::UnknownResource(other.to_string())),
        }
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let schema = Self::resource_schema(resource_type)?;
        let prior = prior_state.as_ref().filter(|p| !p.is_null());
        let plan = plan_resource(&schema, prior, &proposed_state);
        debug!(
            resource_type,
            changes = plan.changes.len(),
            requires_replace = plan.requires_replace,
            "Planned"
        );
        Ok(plan)
    }

    #[instrument(skip_all, fields(resource_type = %resource_type))]
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        let ctx = self.context();
        match resource_type {
            DB_INSTANCE => instance::create(&ctx, planned_state).await,
            DB_PARAM_GROUP => param_group::create(&ctx, planned_state).await,
            other => Err(ProviderError::UnknownResource(other.to_string())),
        }
    }

    #[instrument(skip_all, fields(resource_type = %resource_type))]
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        let ctx = self.context();
        match resource_type {
            DB_INSTANCE => instance::read(&ctx, current_state).await,
            DB_PARAM_GROUP => param_group::read(&ctx, current_state).await,
            other => Err(ProviderError::UnknownResource(other.to_string())),
        }
    }

    #[instrument(skip_all, fields(resource_type = %resource_type))]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let ctx = self.context();
        match resource_type {
            DB_INSTANCE => instance::update(&ctx, prior_state, planned_state).await,
            DB_PARAM_GROUP => param_group::update(&ctx, prior_state, planned_state).await,
            other => Err(ProviderError::UnknownResource(other.to_string())),
        }
    }

    #[instrument(skip_all, fields(resource_type = %resource_type))]
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let ctx = self.context();
        match resource_type {
            DB_INSTANCE => instance::delete(&ctx, current_state).await,
            DB_PARAM_GROUP => param_group::delete(&ctx, current_state).await,
            other => Err(ProviderError::UnknownResource(other.to_string())),
        }
    }

    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let state = self.read(resource_type, json!({ "id": id })).await?;
        if state.is_null() {
            return Err(ProviderError::NotFound(format!("{} {}", resource_type, id)));
        }
        info!(resource_type, id, "Imported");
        Ok(vec![ImportedResource::new(resource_type, state)])
    }
}
