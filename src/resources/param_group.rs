//! `ucloud_db_param_group`: a named set of engine configuration parameters.
//!
//! A group is always cloned from an existing source group of the same engine
//! and version. Without `parameter_input` the source is cloned as is; with it,
//! the overridden member set is rendered as a configuration file and uploaded
//! as a new group. Every attribute forces replacement.

use std::collections::{BTreeMap, HashMap, HashSet};

use base64::prelude::*;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{decode, non_empty, Context};
use crate::client::{
    CreateParamGroupRequest, ParamGroupRecord, ParamMember, UploadParamGroupRequest,
};
use crate::error::ProviderError;
use crate::instance_type::{split_type_id, Engine};
use crate::retry::{retry_until, Retry};
use crate::schema::{
    Attribute, AttributeFlags, AttributeType, Block, Constraint, Diagnostic, NestedBlock, Schema,
};
use crate::validation;

const NAME_PATTERN: &str = r"^[A-Za-z0-9_.\-]{6,63}$";

/// Section header of MySQL-family configuration files.
const MYSQL_SECTION: &str = "[mysqld]";
/// Marker line of PostgreSQL configuration files.
const POSTGRESQL_SECTION: &str = "postgresql";

/// The schema of `ucloud_db_param_group`.
pub fn schema() -> Schema {
    let member = AttributeType::object(HashMap::from([
        ("key".to_string(), AttributeType::String),
        ("value".to_string(), AttributeType::String),
    ]));

    Schema::v0()
        .with_attribute("id", Attribute::computed_string())
        .with_attribute(
            "availability_zone",
            Attribute::required_string().with_force_new(),
        )
        .with_attribute(
            "name",
            Attribute::required_string()
                .with_force_new()
                .with_constraint(Constraint::pattern(
                    NAME_PATTERN,
                    "6 to 63 letters, digits, '-', '_' or '.'",
                )),
        )
        .with_attribute(
            "description",
            Attribute::optional_string().with_force_new(),
        )
        .with_attribute(
            "src_group_id",
            Attribute::required_string()
                .with_force_new()
                .with_description("Group the new group is cloned from"),
        )
        .with_attribute(
            "engine",
            Attribute::required_string()
                .with_force_new()
                .with_constraint(Constraint::one_of(&["mysql", "percona", "postgresql"])),
        )
        .with_attribute(
            "engine_version",
            Attribute::required_string()
                .with_force_new()
                .with_constraint(Constraint::one_of(&[
                    "5.1", "5.5", "5.6", "5.7", "9.4", "9.6", "10.4",
                ])),
        )
        .with_attribute(
            "region_flag",
            Attribute::optional_bool()
                .with_force_new()
                .with_default(false.into())
                .with_description("Make the group available in every zone of the region"),
        )
        .with_attribute(
            "parameter_output",
            Attribute::new(AttributeType::list(member), AttributeFlags::computed())
                .with_description("Effective parameters of the group"),
        )
        .with_block(
            "parameter_input",
            NestedBlock::set(
                Block::new()
                    .with_attribute("key", Attribute::required_string())
                    .with_attribute("value", Attribute::required_string())
                    .with_description("Override of a parameter of the source group"),
            )
            .with_force_new(),
        )
}

/// A `key = value` parameter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

impl From<ParamMember> for Parameter {
    fn from(member: ParamMember) -> Self {
        Self {
            key: member.key,
            value: member.value,
        }
    }
}

/// Typed view of the resource state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamGroup {
    pub id: Option<String>,
    pub availability_zone: String,
    pub name: String,
    pub description: Option<String>,
    pub src_group_id: String,
    pub engine: String,
    pub engine_version: String,
    pub region_flag: bool,
    pub parameter_input: Vec<Parameter>,
    pub parameter_output: Vec<Parameter>,
}

impl ParamGroup {
    fn region_flag(&self) -> Option<bool> {
        self.region_flag.then_some(true)
    }

    fn description(&self) -> Option<String> {
        self.description.clone().filter(|d| !d.is_empty())
    }

    fn refresh(&mut self, group: ParamGroupRecord) -> Result<(), ProviderError> {
        let (engine, version) = split_type_id(&group.db_type_id)?;
        self.engine = engine.to_string();
        self.engine_version = version;
        self.name = group.group_name;
        self.description = non_empty(group.description);
        self.parameter_output = group
            .param_member
            .into_iter()
            .map(Parameter::from)
            .collect();
        Ok(())
    }
}

fn parse_group_id(attribute: &str, value: &str) -> Result<i64, ProviderError> {
    value.parse().map_err(|_| {
        ProviderError::Validation(format!("{} must be numeric, got {:?}", attribute, value))
    })
}

/// Engine versions a parameter group can target.
fn group_versions(engine: Engine) -> &'static [&'static str] {
    if engine.is_mysql_family() {
        &["5.1", "5.5", "5.6", "5.7"]
    } else {
        &["9.4", "9.6", "10.4"]
    }
}

/// The source members with `overrides` applied.
///
/// Every override must name a member of the source group.
pub fn apply_overrides(
    members: &[ParamMember],
    overrides: &[Parameter],
) -> Result<BTreeMap<String, String>, ProviderError> {
    let mut merged: BTreeMap<String, String> = members
        .iter()
        .map(|m| (m.key.clone(), m.value.clone()))
        .collect();
    for Parameter { key, value } in overrides {
        match merged.get_mut(key) {
            Some(current) => *current = value.clone(),
            None => {
                return Err(ProviderError::InvalidKey(format!(
                    "parameter_input key {:?} is not a parameter of the source group",
                    key
                )))
            },
        }
    }
    Ok(merged)
}

/// Render members as the engine's configuration file, one `key = value` per line.
pub fn render_config(engine: Engine, members: &BTreeMap<String, String>) -> String {
    let header = if engine.is_mysql_family() {
        MYSQL_SECTION
    } else {
        POSTGRESQL_SECTION
    };
    std::iter::once(header.to_string())
        .chain(members.iter().map(|(k, v)| format!("{} = {}", k, v)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Schema diagnostics, plus the engine version and duplicate override checks.
pub fn validate(config: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = validation::validate(&schema(), config);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return diagnostics;
    }
    let group: ParamGroup = match decode(config.clone()) {
        Ok(group) => group,
        Err(e) => {
            diagnostics.push(Diagnostic::error(e.to_string()));
            return diagnostics;
        },
    };

    if let Ok(engine) = group.engine.parse::<Engine>() {
        if !group_versions(engine).contains(&group.engine_version.as_str()) {
            diagnostics.push(
                Diagnostic::error(format!(
                    "engine version {} is not available for {} parameter groups",
                    group.engine_version, engine
                ))
                .with_attribute("engine_version"),
            );
        }
    }

    let mut seen = HashSet::new();
    for param in &group.parameter_input {
        if !seen.insert(param.key.as_str()) {
            diagnostics.push(
                Diagnostic::error(format!("parameter {:?} is set more than once", param.key))
                    .with_attribute("parameter_input"),
            );
        }
    }
    diagnostics
}

/// Clone the source group, uploading overrides if any, and read it back.
pub async fn create(ctx: &Context, planned: Value) -> Result<Value, ProviderError> {
    let config: ParamGroup = decode(planned)?;
    let engine: Engine = config.engine.parse()?;
    let type_id = engine.type_id(&config.engine_version);
    let src_group_id = parse_group_id("src_group_id", &config.src_group_id)?;

    let source = ctx
        .client
        .describe_param_group(src_group_id)
        .await
        .map_err(|e| ProviderError::api("DescribeUDBParamGroup", &config.src_group_id, e))?;
    if source.db_type_id != type_id {
        return Err(ProviderError::Validation(format!(
            "src_group_id {} is a {} group, expected {}",
            src_group_id, source.db_type_id, type_id
        )));
    }

    let id = if config.parameter_input.is_empty() {
        let id = ctx
            .client
            .create_param_group(CreateParamGroupRequest {
                group_name: config.name.clone(),
                zone: config.availability_zone.clone(),
                db_type_id: type_id,
                src_group_id,
                description: config.description(),
                region_flag: config.region_flag(),
            })
            .await
            .map_err(|e| ProviderError::api("CreateUDBParamGroup", &config.name, e))?;
        info!(id, src_group_id, name = %config.name, "Cloned db param group");
        id
    } else {
        let members = apply_overrides(&source.param_member, &config.parameter_input)?;
        let content = BASE64_STANDARD.encode(render_config(engine, &members));
        let id = ctx
            .client
            .upload_param_group(UploadParamGroupRequest {
                group_name: config.name.clone(),
                db_type_id: type_id,
                description: config.description(),
                content,
                region_flag: config.region_flag(),
            })
            .await
            .map_err(|e| ProviderError::api("UploadUDBParamGroup", &config.name, e))?;
        info!(
            id,
            src_group_id,
            name = %config.name,
            overrides = config.parameter_input.len(),
            "Uploaded db param group"
        );
        id
    };

    let mut created = config;
    created.id = Some(id.to_string());
    match read_group(ctx, created.clone()).await {
        Ok(Some(group)) => Ok(serde_json::to_value(group)?),
        Ok(None) => Err(created_but_unread(created, ProviderError::NotFound(id.to_string()))),
        Err(e) => Err(created_but_unread(created, e)),
    }
}

/// Keep the id of a group whose read-back after create failed.
fn created_but_unread(created: ParamGroup, source: ProviderError) -> ProviderError {
    let id = created.id.clone().unwrap_or_default();
    warn!(id = %id, error = %source, "Created db param group could not be read back");
    match serde_json::to_value(&created) {
        Ok(state) => ProviderError::Partial {
            id,
            applied: vec!["id".to_string()],
            state: Box::new(state),
            source: Box::new(source),
        },
        Err(_) => source,
    }
}

/// Read the group; `Value::Null` when it no longer exists.
pub async fn read(ctx: &Context, current: Value) -> Result<Value, ProviderError> {
    let current: ParamGroup = decode(current)?;
    match read_group(ctx, current).await? {
        Some(group) => Ok(serde_json::to_value(group)?),
        None => Ok(Value::Null),
    }
}

/// Parameter groups are replaced, never updated.
pub async fn update(_ctx: &Context, _prior: Value, _planned: Value) -> Result<Value, ProviderError> {
    Err(ProviderError::Unimplemented(
        "ucloud_db_param_group cannot be updated in place".to_string(),
    ))
}

/// Delete the group, retrying until it is gone.
pub async fn delete(ctx: &Context, current: Value) -> Result<(), ProviderError> {
    let current: ParamGroup = decode(current)?;
    let Some(id) = current.id.as_deref() else {
        return Ok(());
    };
    let group_id = parse_group_id("id", id)?;
    let region_flag = current.region_flag();

    retry_until(&ctx.delete_policy(), "delete db param group", move || {
        delete_attempt(ctx, group_id, region_flag)
    })
    .await?;
    info!(id = group_id, "Deleted db param group");
    Ok(())
}

async fn read_group(
    ctx: &Context,
    mut group: ParamGroup,
) -> Result<Option<ParamGroup>, ProviderError> {
    let Some(id) = group.id.clone() else {
        return Ok(None);
    };
    let group_id = parse_group_id("id", &id)?;
    match ctx.client.describe_param_group(group_id).await {
        Ok(record) => {
            debug!(id = group_id, members = record.param_member.len(), "Read db param group");
            group.refresh(record)?;
            Ok(Some(group))
        },
        Err(e) if e.is_not_found() => {
            info!(id = group_id, "Db param group no longer exists");
            Ok(None)
        },
        Err(e) => Err(ProviderError::api("DescribeUDBParamGroup", id, e)),
    }
}

async fn delete_attempt(ctx: &Context, group_id: i64, region_flag: Option<bool>) -> Retry<()> {
    let id = group_id.to_string();
    match ctx.client.describe_param_group(group_id).await {
        Ok(_) => {},
        Err(e) if e.is_not_found() => return Retry::Done(()),
        Err(e) => return Retry::Fatal(ProviderError::api("DescribeUDBParamGroup", id, e)),
    }

    match ctx.client.delete_param_group(group_id, region_flag).await {
        Ok(()) => {},
        Err(e) if e.is_not_found() => return Retry::Done(()),
        Err(e) => return Retry::Fatal(ProviderError::api("DeleteUDBParamGroup", id, e)),
    }

    match ctx.client.describe_param_group(group_id).await {
        Err(e) if e.is_not_found() => Retry::Done(()),
        Err(e) => Retry::Fatal(ProviderError::api("DescribeUDBParamGroup", id, e)),
        Ok(_) => Retry::Retryable(ProviderError::StillExists(id)),
    }
}
