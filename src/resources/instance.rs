//! `ucloud_db_instance`: a managed database instance.
//!
//! Create issues `CreateUDBInstance`, waits for `Running` and then runs the
//! update flow as for a new resource, so the backup schedule and blacklist
//! (which the create call cannot carry) are applied in one place.
//!
//! Update applies one attribute at a time. Every completed step is recorded,
//! and a failure part way returns [`ProviderError::Partial`] holding the state
//! with exactly those steps applied.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{decode, format_timestamp, non_empty, Context};
use crate::client::{
    CreateInstanceRequest, InstanceRecord, ResizeInstanceRequest, UpdateBackupStrategyRequest,
};
use crate::error::ProviderError;
use crate::instance_type::{
    check_storage, mode_to_remote, remote_to_mode, split_type_id, DbInstanceType, Engine,
    InstanceMode, MEMORY_TIERS,
};
use crate::retry::{retry_until, Retry};
use crate::schema::{Attribute, AttributeFlags, AttributeType, Constraint, Diagnostic, Schema};
use crate::validation;
use crate::wait::{state, WaitError};

/// Administrator account created with every instance.
pub const ADMIN_USER: &str = "root";

/// Disk technology requested for every instance.
pub const DISK_TYPE: &str = "SATA_SSD";

const BLACKLIST_SEPARATOR: char = ';';

const NAME_PATTERN: &str = r"^[A-Za-z0-9_.\-]{6,63}$";
const TAG_PATTERN: &str = r"^[A-Za-z0-9_.\-]{1,63}$";
const PASSWORD_PATTERN: &str = r"^[A-Za-z0-9~!@#$%^&*()_+\-=]{8,30}$";
const INSTANCE_TYPE_PATTERN: &str =
    r"^(mysql|percona|postgresql)-(basic|normal|ha)-(1|2|4|6|8|12|16|24|32|48|64)$";
const BLACKLIST_PATTERN: &str = r"^[^;.]+\.([^;.]+|%)$";

/// The schema of `ucloud_db_instance`.
pub fn schema() -> Schema {
    Schema::v0()
        .with_attribute("id", Attribute::computed_string())
        .with_attribute(
            "availability_zone",
            Attribute::required_string()
                .with_force_new()
                .with_description("Zone of the primary node"),
        )
        .with_attribute(
            "standby_zone",
            Attribute::optional_string()
                .with_force_new()
                .with_description("Zone of the standby node of a high-availability instance"),
        )
        .with_attribute(
            "password",
            Attribute::required_string()
                .sensitive()
                .with_constraint(Constraint::pattern(
                    PASSWORD_PATTERN,
                    "8 to 30 letters, digits or ~!@#$%^&*()_+-=",
                )),
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
                .with_constraint(Constraint::one_of(&["5.5", "5.6", "5.7", "9.4", "9.6"])),
        )
        .with_attribute(
            "name",
            Attribute::required_string().with_constraint(Constraint::pattern(
                NAME_PATTERN,
                "6 to 63 letters, digits, '-', '_' or '.'",
            )),
        )
        .with_attribute(
            "instance_storage",
            Attribute::required_int64()
                .with_constraint(Constraint::int_range(20, 3000))
                .with_description("Storage in GB"),
        )
        .with_attribute("parameter_group_id", Attribute::required_string())
        .with_attribute(
            "instance_type",
            Attribute::required_string()
                .with_constraint(Constraint::pattern(
                    INSTANCE_TYPE_PATTERN,
                    "engine-mode-memory, e.g. mysql-ha-4",
                ))
                .with_description("Engine, mode and memory tier in GB, e.g. mysql-ha-4"),
        )
        .with_attribute(
            "port",
            Attribute::optional_computed_int64().with_constraint(Constraint::int_range(3306, 65535)),
        )
        .with_attribute(
            "instance_charge_type",
            Attribute::optional_string()
                .with_force_new()
                .with_default("Month".into())
                .with_constraint(Constraint::one_of(&["Year", "Month", "Dynamic"])),
        )
        .with_attribute(
            "instance_duration",
            Attribute::optional_int64().with_default(1.into()),
        )
        .with_attribute("vpc_id", Attribute::optional_string().with_force_new())
        .with_attribute("subnet_id", Attribute::optional_string().with_force_new())
        .with_attribute(
            "backup_count",
            Attribute::optional_int64()
                .with_force_new()
                .with_default(7.into()),
        )
        .with_attribute(
            "backup_begin_time",
            Attribute::optional_int64()
                .with_default(1.into())
                .with_constraint(Constraint::int_range(0, 23))
                .with_description("Hour of the day the daily backup starts"),
        )
        .with_attribute(
            "backup_date",
            Attribute::optional_computed_string()
                .with_description("Seven 0/1 flags, one per weekday starting on Sunday"),
        )
        .with_attribute("backup_id", Attribute::optional_string().with_force_new())
        .with_attribute(
            "backup_black_list",
            Attribute::new(
                AttributeType::set(AttributeType::String),
                AttributeFlags::optional_computed(),
            )
            .with_constraint(Constraint::pattern(
                BLACKLIST_PATTERN,
                "schema.table or schema.%",
            )),
        )
        .with_attribute(
            "tag",
            Attribute::optional_computed_string().with_constraint(Constraint::pattern(
                TAG_PATTERN,
                "1 to 63 letters, digits, '-', '_' or '.'",
            )),
        )
        .with_attribute("status", Attribute::computed_string())
        .with_attribute("create_time", Attribute::computed_string())
        .with_attribute("expire_time", Attribute::computed_string())
        .with_attribute("modify_time", Attribute::computed_string())
}

/// Typed view of the resource state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbInstance {
    pub id: Option<String>,
    pub availability_zone: String,
    pub standby_zone: Option<String>,
    pub password: String,
    pub engine: String,
    pub engine_version: String,
    pub name: String,
    pub instance_storage: i64,
    pub parameter_group_id: String,
    pub instance_type: String,
    pub port: Option<i64>,
    pub instance_charge_type: String,
    pub instance_duration: i64,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub backup_count: i64,
    pub backup_begin_time: i64,
    pub backup_date: Option<String>,
    pub backup_id: Option<String>,
    pub backup_black_list: Vec<String>,
    pub tag: Option<String>,
    pub status: Option<String>,
    pub create_time: Option<String>,
    pub expire_time: Option<String>,
    pub modify_time: Option<String>,
}

impl Default for DbInstance {
    fn default() -> Self {
        Self {
            id: None,
            availability_zone: String::new(),
            standby_zone: None,
            password: String::new(),
            engine: String::new(),
            engine_version: String::new(),
            name: String::new(),
            instance_storage: 0,
            parameter_group_id: String::new(),
            instance_type: String::new(),
            port: None,
            instance_charge_type: "Month".to_string(),
            instance_duration: 1,
            vpc_id: None,
            subnet_id: None,
            backup_count: 7,
            backup_begin_time: 1,
            backup_date: None,
            backup_id: None,
            backup_black_list: Vec::new(),
            tag: None,
            status: None,
            create_time: None,
            expire_time: None,
            modify_time: None,
        }
    }
}

impl DbInstance {
    /// Check the rules spanning several attributes and return the parsed type.
    pub fn check(&self) -> Result<DbInstanceType, ProviderError> {
        let engine: Engine = self.engine.parse()?;
        let db_type: DbInstanceType = self.instance_type.parse()?;
        if db_type.engine != engine {
            return Err(ProviderError::Validation(format!(
                "engine of instance type {} must be same as engine {}",
                db_type.engine, engine
            )));
        }
        db_type.check_mode_supported()?;
        if !engine.instance_versions().contains(&self.engine_version.as_str()) {
            return Err(ProviderError::Validation(format!(
                "engine version {} is not supported by {}, expected one of {:?}",
                self.engine_version,
                engine,
                engine.instance_versions()
            )));
        }
        if !MEMORY_TIERS.contains(&db_type.memory) {
            return Err(ProviderError::Validation(format!(
                "memory {} of instance type {} is not one of {:?}",
                db_type.memory, self.instance_type, MEMORY_TIERS
            )));
        }
        check_storage(db_type.memory, self.instance_storage)?;
        Ok(db_type)
    }

    fn create_request(
        &self,
        db_type: DbInstanceType,
    ) -> Result<CreateInstanceRequest, ProviderError> {
        let engine = db_type.engine;
        let backup_id = self
            .backup_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| parse_id("backup_id", id))
            .transpose()?;

        Ok(CreateInstanceRequest {
            name: self.name.clone(),
            admin_password: self.password.clone(),
            admin_user: ADMIN_USER.to_string(),
            zone: self.availability_zone.clone(),
            disk_space: self.instance_storage,
            charge_type: self.instance_charge_type.clone(),
            quantity: self.instance_duration,
            instance_type: DISK_TYPE.to_string(),
            memory_limit: db_type.memory_limit(),
            instance_mode: mode_to_remote(db_type.mode)?.to_string(),
            db_type_id: engine.type_id(&self.engine_version),
            param_group_id: parse_id("parameter_group_id", &self.parameter_group_id)?,
            port: Some(self.port.unwrap_or_else(|| engine.default_port())),
            tag: self.tag.clone().filter(|t| !t.is_empty()),
            backup_zone: self
                .standby_zone
                .clone()
                .filter(|z| !z.is_empty() && *z != self.availability_zone),
            backup_count: (self.backup_count > 0).then_some(self.backup_count),
            backup_id,
            vpc_id: self.vpc_id.clone().filter(|v| !v.is_empty()),
            subnet_id: self.subnet_id.clone().filter(|s| !s.is_empty()),
        })
    }

    /// Overwrite every remotely observed attribute from `db`.
    fn refresh(&mut self, db: InstanceRecord) -> Result<(), ProviderError> {
        let (engine, version) = split_type_id(&db.db_type_id)?;
        let mode = remote_to_mode(&db.instance_mode)?;
        let memory = u32::try_from(db.memory_limit / 1000).map_err(|_| {
            ProviderError::Validation(format!("invalid memory limit {}", db.memory_limit))
        })?;

        self.instance_type = DbInstanceType::new(engine, mode, memory).to_string();
        self.engine = engine.to_string();
        self.engine_version = version;
        self.name = db.name;
        self.parameter_group_id = db.param_group_id.to_string();
        self.port = Some(db.port);
        self.status = Some(db.state);
        self.instance_charge_type = db.charge_type;
        self.instance_storage = db.disk_space;
        if let Some(zone) = non_empty(db.backup_zone) {
            self.standby_zone = Some(zone);
        }
        self.availability_zone = db.zone;
        self.backup_count = db.backup_count;
        self.backup_begin_time = db.backup_begin_time;
        self.backup_date = non_empty(db.backup_date);
        self.backup_black_list = split_blacklist(&db.backup_blacklist);
        self.tag = non_empty(db.tag);
        self.create_time = Some(format_timestamp(db.create_time));
        self.expire_time = Some(format_timestamp(db.expired_time));
        self.modify_time = Some(format_timestamp(db.modify_time));
        Ok(())
    }
}

fn parse_id(attribute: &str, value: &str) -> Result<i64, ProviderError> {
    value.parse().map_err(|_| {
        ProviderError::Validation(format!("{} must be numeric, got {:?}", attribute, value))
    })
}

/// Join a blacklist into the wire format, sorted and without duplicates.
pub fn join_blacklist(entries: &[String]) -> String {
    let set: BTreeSet<&str> = entries.iter().map(String::as_str).collect();
    let mut joined = String::new();
    for entry in set {
        if !joined.is_empty() {
            joined.push(BLACKLIST_SEPARATOR);
        }
        joined.push_str(entry);
    }
    joined
}

/// Split a wire-format blacklist, dropping empty entries.
pub fn split_blacklist(joined: &str) -> Vec<String> {
    let set: BTreeSet<&str> = joined
        .split(BLACKLIST_SEPARATOR)
        .filter(|e| !e.is_empty())
        .collect();
    set.into_iter().map(str::to_string).collect()
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Schema diagnostics followed by the cross-attribute rules.
pub fn validate(config: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = validation::validate(&schema(), config);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return diagnostics;
    }
    let checked = decode::<DbInstance>(config.clone())
        .and_then(|instance| instance.check());
    if let Err(err) = checked {
        diagnostics.push(Diagnostic::error(match err {
            ProviderError::Validation(msg) => msg,
            other => other.to_string(),
        }));
    }
    diagnostics
}

/// Attribute-level progress of a create or update.
struct Progress {
    state: DbInstance,
    applied: Vec<String>,
}

impl Progress {
    fn new(state: DbInstance) -> Self {
        Self {
            state,
            applied: Vec::new(),
        }
    }

    fn mark(&mut self, attribute: &str) {
        self.applied.push(attribute.to_string());
    }

    fn into_error(self, id: &str, source: ProviderError) -> ProviderError {
        if self.applied.is_empty() {
            return source;
        }
        warn!(id = %id, applied = ?self.applied, error = %source, "Db instance partially updated");
        match serde_json::to_value(&self.state) {
            Ok(state) => ProviderError::Partial {
                id: id.to_string(),
                applied: self.applied,
                state: Box::new(state),
                source: Box::new(source),
            },
            Err(_) => source,
        }
    }
}

/// Create the instance and wait until it is running.
pub async fn create(ctx: &Context, planned: Value) -> Result<Value, ProviderError> {
    let config: DbInstance = decode(planned)?;
    let db_type = config.check()?;
    let req = config.create_request(db_type)?;

    let id = ctx
        .client
        .create_instance(req)
        .await
        .map_err(|e| ProviderError::api("CreateUDBInstance", &config.name, e))?;
    info!(id = %id, name = %config.name, instance_type = %db_type, "Created db instance");

    let mut created = config;
    created.id = Some(id.clone());

    let mut progress = Progress::new(created.clone());
    progress.state.backup_date = None;
    progress.state.backup_black_list.clear();
    progress.mark("id");

    if let Err(e) = ctx.waiter().wait_for(&id, &[state::RUNNING]).await {
        return Err(progress.into_error(&id, e));
    }

    reconcile(ctx, &id, None, &created, progress).await
}

/// Read the instance; `Value::Null` when it no longer exists.
pub async fn read(ctx: &Context, current: Value) -> Result<Value, ProviderError> {
    let current: DbInstance = decode(current)?;
    to_state(read_instance(ctx, current).await?)
}

/// Apply the difference between `prior` and `planned` in place.
pub async fn update(ctx: &Context, prior: Value, planned: Value) -> Result<Value, ProviderError> {
    let prior: DbInstance = decode(prior)?;
    let mut planned: DbInstance = decode(planned)?;
    let id = prior
        .id
        .clone()
        .ok_or_else(|| ProviderError::Validation("db instance state has no id".to_string()))?;
    planned.id = Some(id.clone());

    let progress = Progress::new(prior.clone());
    reconcile(ctx, &id, Some(&prior), &planned, progress).await
}

/// Stop if needed and delete, retrying until the instance is gone.
pub async fn delete(ctx: &Context, current: Value) -> Result<(), ProviderError> {
    let current: DbInstance = decode(current)?;
    let Some(id) = current.id else {
        return Ok(());
    };
    let (id, zone) = (id.as_str(), current.availability_zone.as_str());

    retry_until(&ctx.delete_policy(), "delete db instance", move || {
        delete_attempt(ctx, id, zone)
    })
    .await?;
    info!(id = %id, "Deleted db instance");
    Ok(())
}

async fn reconcile(
    ctx: &Context,
    id: &str,
    prior: Option<&DbInstance>,
    planned: &DbInstance,
    mut progress: Progress,
) -> Result<Value, ProviderError> {
    if let Err(e) = apply_changes(ctx, id, prior, planned, &mut progress).await {
        return Err(progress.into_error(id, e));
    }
    match read_instance(ctx, progress.state.clone()).await {
        Ok(Some(instance)) => Ok(serde_json::to_value(instance)?),
        // Created, then gone before the read-back
        Ok(None) if prior.is_none() => {
            Err(progress.into_error(id, ProviderError::NotFound(id.to_string())))
        },
        Ok(None) => Ok(Value::Null),
        Err(e) => Err(progress.into_error(id, e)),
    }
}

fn to_state(instance: Option<DbInstance>) -> Result<Value, ProviderError> {
    match instance {
        Some(instance) => Ok(serde_json::to_value(instance)?),
        None => Ok(Value::Null),
    }
}

async fn read_instance(
    ctx: &Context,
    mut instance: DbInstance,
) -> Result<Option<DbInstance>, ProviderError> {
    let Some(id) = instance.id.clone() else {
        return Ok(None);
    };
    let db = match ctx.client.describe_instance(&id).await {
        Ok(db) => db,
        Err(e) if e.is_not_found() => {
            info!(id = %id, "Db instance no longer exists");
            return Ok(None);
        },
        Err(e) => return Err(ProviderError::api("DescribeUDBInstance", &id, e)),
    };
    debug!(id = %id, state = %db.state, "Read db instance");
    instance.refresh(db)?;
    Ok(Some(instance))
}

async fn describe(ctx: &Context, id: &str) -> Result<InstanceRecord, ProviderError> {
    ctx.client.describe_instance(id).await.map_err(|e| {
        if e.is_not_found() {
            ProviderError::NotFound(id.to_string())
        } else {
            ProviderError::api("DescribeUDBInstance", id, e)
        }
    })
}

/// The resize call for a changed type or storage; rejects a mode change.
fn resize_request(
    id: &str,
    prior: &DbInstance,
    planned: &DbInstance,
) -> Result<Option<ResizeInstanceRequest>, ProviderError> {
    let type_changed = prior.instance_type != planned.instance_type;
    let storage_changed = prior.instance_storage != planned.instance_storage;
    if !type_changed && !storage_changed {
        return Ok(None);
    }

    let new_type = planned.check()?;
    let mut req = ResizeInstanceRequest {
        db_id: id.to_string(),
        ..Default::default()
    };
    if type_changed {
        let old_type: DbInstanceType = prior.instance_type.parse()?;
        if old_type.mode != new_type.mode {
            return Err(ProviderError::Validation(format!(
                "the mode of instance_type cannot change from {} to {}",
                old_type.mode, new_type.mode
            )));
        }
        req.memory_limit = Some(new_type.memory_limit());
    }
    if storage_changed {
        req.disk_space = Some(planned.instance_storage);
    }
    Ok(Some(req))
}

async fn apply_changes(
    ctx: &Context,
    id: &str,
    prior: Option<&DbInstance>,
    planned: &DbInstance,
    progress: &mut Progress,
) -> Result<(), ProviderError> {
    let resize = match prior {
        Some(prior) => resize_request(id, prior, planned)?,
        None => None,
    };

    if let Some(prior) = prior {
        if prior.name != planned.name {
            ctx.client
                .modify_instance_name(id, &planned.name)
                .await
                .map_err(|e| ProviderError::api("ModifyUDBInstanceName", id, e))?;
            info!(id = %id, name = %planned.name, "Renamed db instance");
            progress.state.name = planned.name.clone();
            progress.mark("name");
        }

        if prior.password != planned.password {
            ctx.client
                .modify_instance_password(id, &planned.password)
                .await
                .map_err(|e| ProviderError::api("ModifyUDBInstancePassword", id, e))?;
            info!(id = %id, "Changed db instance password");
            progress.state.password = planned.password.clone();
            progress.mark("password");
        }
    }

    if let Some(req) = resize {
        let (type_changed, storage_changed) = (req.memory_limit.is_some(), req.disk_space.is_some());
        let start_again = resize_instance(ctx, id, &planned.availability_zone, req).await?;
        if type_changed {
            progress.state.instance_type = planned.instance_type.clone();
            progress.mark("instance_type");
        }
        if storage_changed {
            progress.state.instance_storage = planned.instance_storage;
            progress.mark("instance_storage");
        }
        if start_again {
            ctx.client
                .start_instance(id, &planned.availability_zone)
                .await
                .map_err(|e| ProviderError::api("StartUDBInstance", id, e))?;
            info!(id = %id, "Starting db instance after resize");
            ctx.waiter().wait_for(id, &[state::RUNNING]).await?;
        }
    }

    if let Some(prior) = prior {
        if prior.parameter_group_id != planned.parameter_group_id {
            ctx.client
                .change_param_group(id, &planned.parameter_group_id)
                .await
                .map_err(|e| ProviderError::api("ChangeUDBParamGroup", id, e))?;
            ctx.client
                .restart_instance(id)
                .await
                .map_err(|e| ProviderError::api("RestartUDBInstance", id, e))?;
            info!(id = %id, group = %planned.parameter_group_id, "Changed parameter group, restarting");
            ctx.waiter()
                .wait_for(id, &[state::RUNNING, state::SHUTOFF])
                .await?;
            progress.state.parameter_group_id = planned.parameter_group_id.clone();
            progress.mark("parameter_group_id");
        }
    }

    let (backup_date, backup_time) = match prior {
        None => (planned.backup_date.clone(), Some(planned.backup_begin_time)),
        Some(prior) => (
            planned
                .backup_date
                .clone()
                .filter(|date| prior.backup_date.as_ref() != Some(date)),
            (prior.backup_begin_time != planned.backup_begin_time)
                .then_some(planned.backup_begin_time),
        ),
    };
    if backup_date.is_some() || backup_time.is_some() {
        ctx.client
            .update_backup_strategy(UpdateBackupStrategyRequest {
                db_id: id.to_string(),
                backup_date,
                backup_time,
            })
            .await
            .map_err(|e| ProviderError::api("UpdateUDBInstanceBackupStrategy", id, e))?;
        info!(id = %id, "Updated db instance backup strategy");
        if planned.backup_date.is_some() {
            progress.state.backup_date = planned.backup_date.clone();
        }
        progress.state.backup_begin_time = planned.backup_begin_time;
        progress.mark("backup_date");
        progress.mark("backup_begin_time");
    }

    let blacklist_changed = match prior {
        None => !planned.backup_black_list.is_empty(),
        Some(prior) => !same_set(&prior.backup_black_list, &planned.backup_black_list),
    };
    if blacklist_changed {
        let joined = join_blacklist(&planned.backup_black_list);
        ctx.client
            .edit_backup_blacklist(id, &joined)
            .await
            .map_err(|e| ProviderError::api("EditUDBBackupBlacklist", id, e))?;
        info!(id = %id, blacklist = %joined, "Updated db instance backup blacklist");
        progress.state.backup_black_list = planned.backup_black_list.clone();
        progress.mark("backup_black_list");
    }

    Ok(())
}

/// Resize and wait for it to finish; returns whether the instance must be
/// started again.
///
/// A `Normal` instance only resizes while stopped, so it is stopped first and
/// left stopped. Other modes resize in place.
async fn resize_instance(
    ctx: &Context,
    id: &str,
    zone: &str,
    req: ResizeInstanceRequest,
) -> Result<bool, ProviderError> {
    let db = describe(ctx, id).await?;
    let waiter = ctx.waiter();

    if db.instance_mode != mode_to_remote(InstanceMode::Normal)? {
        ctx.client
            .resize_instance(req)
            .await
            .map_err(|e| ProviderError::api("ResizeUDBInstance", id, e))?;
        info!(id = %id, mode = %db.instance_mode, "Resizing db instance in place");
        waiter
            .wait_for(id, &[state::RUNNING, state::SHUTOFF])
            .await?;
        return Ok(false);
    }

    if db.state != state::SHUTOFF {
        ctx.client
            .stop_instance(id, zone)
            .await
            .map_err(|e| ProviderError::api("StopUDBInstance", id, e))?;
        info!(id = %id, "Stopping db instance for resize");
        waiter.wait_for(id, &[state::SHUTOFF]).await?;
    }

    ctx.client
        .resize_instance(req)
        .await
        .map_err(|e| ProviderError::api("ResizeUDBInstance", id, e))?;
    info!(id = %id, "Resizing stopped db instance");
    waiter.wait_for(id, &[state::SHUTOFF]).await?;

    Ok(db.state == state::RUNNING)
}

async fn delete_attempt(ctx: &Context, id: &str, zone: &str) -> Retry<()> {
    let db = match ctx.client.describe_instance(id).await {
        Ok(db) => db,
        Err(e) if e.is_not_found() => return Retry::Done(()),
        Err(e) => return Retry::Fatal(ProviderError::api("DescribeUDBInstance", id, e)),
    };

    if db.state != state::SHUTOFF {
        if let Err(e) = ctx.client.stop_instance(id, zone).await {
            return Retry::Retryable(ProviderError::api("StopUDBInstance", id, e));
        }
        match ctx.waiter().wait(id, &[state::SHUTOFF]).await {
            Ok(_) => {},
            Err(WaitError::NotFound) => return Retry::Done(()),
            Err(e) => return Retry::Retryable(e.into_provider_error(id, &[state::SHUTOFF])),
        }
    }

    match ctx.client.delete_instance(id).await {
        Ok(()) => debug!(id = %id, "Delete issued"),
        Err(e) if e.is_not_found() => return Retry::Done(()),
        Err(e) => return Retry::Fatal(ProviderError::api("DeleteUDBInstance", id, e)),
    }

    match ctx.client.describe_instance(id).await {
        Err(e) if e.is_not_found() => Retry::Done(()),
        Err(e) => Retry::Fatal(ProviderError::api("DescribeUDBInstance", id, e)),
        Ok(_) => Retry::Retryable(ProviderError::StillExists(id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::testing::FakeUdb;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx(fake: &Arc<FakeUdb>) -> Context {
        Context::new(fake.clone(), Timeouts::default())
    }

    fn config() -> Value {
        json!({
            "availability_zone": "cn-bj2-02",
            "name": "orders-db",
            "password": "Secret-Pass1",
            "engine": "mysql",
            "engine_version": "5.7",
            "instance_type": "mysql-normal-2",
            "instance_storage": 40,
            "parameter_group_id": "18",
            "instance_charge_type": "Month",
            "instance_duration": 1,
            "backup_count": 7,
            "backup_begin_time": 1
        })
    }

    fn instance(value: Value) -> DbInstance {
        serde_json::from_value(value).unwrap()
    }

    /// An instance already in the fake, and its state as read back.
    async fn existing(fake: &Arc<FakeUdb>, mode: &str, status: &str) -> Value {
        let mut record = FakeUdb::instance_record("mysql-5.7", mode);
        record.state = status.to_string();
        record.backup_blacklist = "app.logs;test.%".to_string();
        let id = fake.insert_instance(record);

        let mut state = read(&ctx(fake), json!({"id": id})).await.unwrap();
        state["password"] = json!("Secret-Pass1");
        fake.clear_calls();
        state
    }

    #[test]
    fn test_check_engine_and_mode() {
        for engine in Engine::ALL {
            for mode in InstanceMode::ALL {
                let mut value = config();
                value["engine"] = json!(engine.as_str());
                value["engine_version"] = json!(engine.instance_versions()[0]);
                value["instance_type"] = json!(format!("{}-{}-2", engine, mode));

                let rejected = matches!(
                    (engine, mode),
                    (Engine::Postgresql, InstanceMode::Ha)
                        | (Engine::Mysql | Engine::Percona, InstanceMode::Basic)
                );
                assert_eq!(
                    instance(value).check().is_err(),
                    rejected,
                    "{} {}",
                    engine,
                    mode
                );
            }
        }
    }

    #[test]
    fn test_check_rejects_mismatches() {
        let mut value = config();
        value["instance_type"] = json!("percona-normal-2");
        let err = instance(value).check().unwrap_err();
        assert!(err.to_string().contains("must be same as engine mysql"));

        let mut value = config();
        value["engine_version"] = json!("9.6");
        assert!(instance(value).check().is_err());

        let mut value = config();
        value["instance_type"] = json!("mysql-normal-3");
        assert!(instance(value).check().is_err());
    }

    #[test]
    fn test_check_storage_ceiling() {
        for (memory, ceiling) in [(1, 500), (8, 500), (12, 1000), (24, 1000), (32, 2000), (64, 3000)] {
            let mut value = config();
            value["instance_type"] = json!(format!("mysql-normal-{}", memory));
            value["instance_storage"] = json!(ceiling);
            assert!(instance(value.clone()).check().is_ok(), "{} {}", memory, ceiling);

            if ceiling < 3000 {
                value["instance_storage"] = json!(ceiling + 1);
                assert!(instance(value).check().is_err(), "{} {}", memory, ceiling + 1);
            }
        }
    }

    #[test]
    fn test_blacklist_join_and_split() {
        let entries = vec!["test.%".to_string(), "app.logs".to_string(), "test.%".to_string()];
        let joined = join_blacklist(&entries);
        assert_eq!(joined, "app.logs;test.%");
        assert!(same_set(&split_blacklist(&joined), &entries));
        assert!(split_blacklist("").is_empty());
    }

    #[test]
    fn test_validate_reports_schema_and_cross_field_errors() {
        assert!(validate(&config()).is_empty());

        let mut value = config();
        value["password"] = json!("short");
        let diagnostics = validate(&value);
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("password"));

        let mut value = config();
        value["instance_storage"] = json!(600);
        value["instance_type"] = json!("mysql-normal-8");
        let diagnostics = validate(&value);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("upper limit"));

        let mut value = config();
        value["backup_black_list"] = json!(["app.logs", "bad;entry"]);
        assert!(validate(&value).iter().any(Diagnostic::is_error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_builds_request_and_waits() {
        let fake = Arc::new(FakeUdb::new().with_transition_polls(2));
        let mut value = config();
        value["standby_zone"] = json!("cn-bj2-02");

        let state = create(&ctx(&fake), value).await.unwrap();

        let req = &fake.created_instances()[0];
        assert_eq!(req.admin_user, "root");
        assert_eq!(req.instance_type, "SATA_SSD");
        assert_eq!(req.memory_limit, 2000);
        assert_eq!(req.instance_mode, "Normal");
        assert_eq!(req.db_type_id, "mysql-5.7");
        assert_eq!(req.port, Some(3306));
        assert_eq!(req.param_group_id, 18);
        assert_eq!(req.backup_zone, None);

        assert_eq!(state["status"], "Running");
        assert_eq!(state["instance_type"], "mysql-normal-2");
        assert_eq!(state["password"], "Secret-Pass1");
        assert_eq!(state["create_time"], "2018-10-20T01:46:40Z");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_defaults_postgresql_port() {
        let fake = Arc::new(FakeUdb::new());
        let mut value = config();
        value["engine"] = json!("postgresql");
        value["engine_version"] = json!("9.6");
        value["instance_type"] = json!("postgresql-normal-2");
        value["standby_zone"] = json!("cn-bj2-03");

        create(&ctx(&fake), value).await.unwrap();
        let req = &fake.created_instances()[0];
        assert_eq!(req.port, Some(5432));
        assert_eq!(req.backup_zone.as_deref(), Some("cn-bj2-03"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_applies_backup_settings_only() {
        let fake = Arc::new(FakeUdb::new());
        let mut value = config();
        value["backup_date"] = json!("1010101");
        value["backup_black_list"] = json!(["test.%", "app.logs"]);

        let state = create(&ctx(&fake), value).await.unwrap();

        assert_eq!(
            fake.mutations(),
            vec![
                "CreateUDBInstance",
                "UpdateUDBInstanceBackupStrategy",
                "EditUDBBackupBlacklist"
            ]
        );
        let id = state["id"].as_str().unwrap();
        assert_eq!(fake.instance(id).unwrap().backup_blacklist, "app.logs;test.%");
        assert_eq!(state["backup_date"], "1010101");
        assert_eq!(state["backup_black_list"], json!(["app.logs", "test.%"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_rejects_before_remote_calls() {
        let fake = Arc::new(FakeUdb::new());
        let mut value = config();
        value["instance_type"] = json!("mysql-normal-8");
        value["instance_storage"] = json!(501);

        let err = create(&ctx(&fake), value).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(fake.calls().is_empty());

        let mut value = config();
        value["parameter_group_id"] = json!("default");
        let err = create(&ctx(&fake), value).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_wait_failure_keeps_identity() {
        let fake = Arc::new(FakeUdb::new().with_transition_polls(100_000));

        let err = create(&ctx(&fake), config()).await.unwrap_err();
        match err {
            ProviderError::Partial {
                id,
                applied,
                state,
                source,
            } => {
                assert_eq!(applied, vec!["id"]);
                assert_eq!(state["id"], json!(id));
                assert!(matches!(*source, ProviderError::Timeout { .. }));
            },
            other => panic!("expected partial create, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_read_back_failure_keeps_identity() {
        let fake = Arc::new(FakeUdb::new());
        // The first describe is the wait for Running, the second the read-back
        fake.fail_after("DescribeUDBInstance", 1);

        let err = create(&ctx(&fake), config()).await.unwrap_err();

        assert_eq!(fake.count("CreateUDBInstance"), 1);
        match err {
            ProviderError::Partial {
                id,
                applied,
                state,
                source,
            } => {
                assert_eq!(applied[0], "id");
                assert_eq!(state["id"], json!(id));
                assert!(fake.instance(&id).is_some());
                assert!(matches!(*source, ProviderError::Api { .. }));
            },
            other => panic!("expected partial create, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_normal_running_instance() {
        let fake = Arc::new(FakeUdb::new());
        let prior = existing(&fake, "Normal", state::RUNNING).await;
        let mut planned = prior.clone();
        planned["instance_storage"] = json!(40);
        planned["instance_type"] = json!("mysql-normal-2");

        let state = update(&ctx(&fake), prior, planned).await.unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                "DescribeUDBInstance",
                "StopUDBInstance",
                "DescribeUDBInstance",
                "ResizeUDBInstance",
                "DescribeUDBInstance",
                "StartUDBInstance",
                "DescribeUDBInstance",
                "DescribeUDBInstance",
            ]
        );
        assert_eq!(state["instance_storage"], 40);
        assert_eq!(state["instance_type"], "mysql-normal-2");
        assert_eq!(state["status"], "Running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_normal_stopped_instance_stays_stopped() {
        let fake = Arc::new(FakeUdb::new().with_transition_polls(1));
        let prior = existing(&fake, "Normal", state::SHUTOFF).await;
        let mut planned = prior.clone();
        planned["instance_storage"] = json!(40);

        let state = update(&ctx(&fake), prior, planned).await.unwrap();

        assert_eq!(fake.mutations(), vec!["ResizeUDBInstance"]);
        assert_eq!(state["status"], "Shutoff");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_ha_instance_in_place() {
        let fake = Arc::new(FakeUdb::new().with_transition_polls(2));
        let prior = existing(&fake, "HA", state::RUNNING).await;
        let mut planned = prior.clone();
        planned["instance_type"] = json!("mysql-ha-4");

        let state = update(&ctx(&fake), prior, planned).await.unwrap();

        assert_eq!(fake.mutations(), vec!["ResizeUDBInstance"]);
        assert_eq!(state["instance_type"], "mysql-ha-4");
        assert_eq!(state["status"], "Running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_change_rejected_without_side_effects() {
        let fake = Arc::new(FakeUdb::new());
        let prior = existing(&fake, "Normal", state::RUNNING).await;
        let mut planned = prior.clone();
        planned["instance_type"] = json!("mysql-ha-1");
        planned["name"] = json!("orders-db-v2");

        let err = update(&ctx(&fake), prior, planned).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameter_group_change_restarts() {
        let fake = Arc::new(FakeUdb::new());
        let prior = existing(&fake, "Normal", state::RUNNING).await;
        let mut planned = prior.clone();
        planned["parameter_group_id"] = json!("42");

        let state = update(&ctx(&fake), prior, planned).await.unwrap();

        assert_eq!(
            fake.mutations(),
            vec!["ChangeUDBParamGroup", "RestartUDBInstance"]
        );
        assert_eq!(state["parameter_group_id"], "42");
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_password_and_backup_updates() {
        let fake = Arc::new(FakeUdb::new());
        let prior = existing(&fake, "Normal", state::RUNNING).await;
        let mut planned = prior.clone();
        planned["name"] = json!("orders-db-v2");
        planned["password"] = json!("Other-Pass2");
        planned["backup_begin_time"] = json!(4);

        let state = update(&ctx(&fake), prior, planned).await.unwrap();

        assert_eq!(
            fake.mutations(),
            vec![
                "ModifyUDBInstanceName",
                "ModifyUDBInstancePassword",
                "UpdateUDBInstanceBackupStrategy"
            ]
        );
        assert_eq!(state["name"], "orders-db-v2");
        assert_eq!(state["password"], "Other-Pass2");
        assert_eq!(state["backup_begin_time"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_reports_applied_attributes() {
        let fake = Arc::new(FakeUdb::new());
        let prior = existing(&fake, "Normal", state::RUNNING).await;
        let mut planned = prior.clone();
        planned["name"] = json!("orders-db-v2");
        planned["instance_storage"] = json!(40);
        fake.fail_next("StopUDBInstance");

        let err = update(&ctx(&fake), prior, planned).await.unwrap_err();
        match err {
            ProviderError::Partial {
                applied,
                state,
                source,
                ..
            } => {
                assert_eq!(applied, vec!["name"]);
                assert_eq!(state["name"], "orders-db-v2");
                assert_eq!(state["instance_storage"], 20);
                assert!(matches!(
                    *source,
                    ProviderError::Api {
                        operation: "StopUDBInstance",
                        ..
                    }
                ));
            },
            other => panic!("expected partial update, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_of_vanished_instance_is_not_found() {
        let fake = Arc::new(FakeUdb::new());
        let mut prior = existing(&fake, "Normal", state::RUNNING).await;
        prior["id"] = json!("udb-gone");
        let mut planned = prior.clone();
        planned["instance_storage"] = json!(40);

        let err = update(&ctx(&fake), prior, planned).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklist_round_trip() {
        let fake = Arc::new(FakeUdb::new());
        let prior = existing(&fake, "Normal", state::RUNNING).await;
        let mut planned = prior.clone();
        planned["backup_black_list"] = json!(["orders.%", "app.logs", "audit.events"]);

        let state = update(&ctx(&fake), prior.clone(), planned).await.unwrap();
        assert_eq!(fake.mutations(), vec!["EditUDBBackupBlacklist"]);

        let read_back: Vec<String> = serde_json::from_value(state["backup_black_list"].clone()).unwrap();
        let expected = ["audit.events".to_string(), "orders.%".to_string(), "app.logs".to_string()];
        assert!(same_set(&read_back, &expected));
        let id = prior["id"].as_str().unwrap();
        assert_eq!(
            fake.instance(id).unwrap().backup_blacklist,
            "app.logs;audit.events;orders.%"
        );
    }

    #[tokio::test]
    async fn test_read_maps_remote_fields() {
        let fake = Arc::new(FakeUdb::new());
        let mut record = FakeUdb::instance_record("percona-5.6", "HA");
        record.memory_limit = 4000;
        record.backup_zone = "cn-bj2-03".to_string();
        record.backup_blacklist = "b.%;a.t".to_string();
        let id = fake.insert_instance(record);

        let state = read(&ctx(&fake), json!({"id": id, "password": "Secret-Pass1"}))
            .await
            .unwrap();

        assert_eq!(state["engine"], "percona");
        assert_eq!(state["engine_version"], "5.6");
        assert_eq!(state["instance_type"], "percona-ha-4");
        assert_eq!(state["standby_zone"], "cn-bj2-03");
        assert_eq!(state["backup_black_list"], json!(["a.t", "b.%"]));
        assert_eq!(state["parameter_group_id"], "18");
        assert_eq!(state["password"], "Secret-Pass1");
        assert_eq!(state["modify_time"], "");
    }

    #[tokio::test]
    async fn test_read_missing_instance_is_null() {
        let fake = Arc::new(FakeUdb::new());
        let state = read(&ctx(&fake), json!({"id": "udb-gone"})).await.unwrap();
        assert!(state.is_null());
    }

    #[tokio::test]
    async fn test_read_rejects_unknown_remote_mode() {
        let fake = Arc::new(FakeUdb::new());
        let id = fake.insert_instance(FakeUdb::instance_record("mysql-5.7", "Cluster"));
        let err = read(&ctx(&fake), json!({"id": id})).await.unwrap_err();
        assert!(err.to_string().contains("unknown mapping"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_stops_then_deletes() {
        let fake = Arc::new(FakeUdb::new());
        let state = existing(&fake, "Normal", state::RUNNING).await;

        delete(&ctx(&fake), state).await.unwrap();
        assert_eq!(
            fake.mutations(),
            vec!["StopUDBInstance", "DeleteUDBInstance"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_retries_until_gone() {
        let fake = Arc::new(FakeUdb::new().with_delete_lag(2));
        let state = existing(&fake, "Normal", state::SHUTOFF).await;

        delete(&ctx(&fake), state).await.unwrap();
        assert_eq!(fake.count("DeleteUDBInstance"), 2);
        assert_eq!(fake.count("StopUDBInstance"), 0);
        assert_eq!(fake.count("DescribeUDBInstance"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_gives_up_at_deadline() {
        let fake = Arc::new(FakeUdb::new().with_delete_never_completing());
        let state = existing(&fake, "Normal", state::SHUTOFF).await;

        let started = tokio::time::Instant::now();
        let err = delete(&ctx(&fake), state).await.unwrap_err();
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
        assert!(started.elapsed() >= Timeouts::default().delete_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_deadline_bounds_shutoff_wait() {
        let fake = Arc::new(FakeUdb::new().with_transition_polls(1_000_000));
        let state = existing(&fake, "Normal", state::RUNNING).await;

        let started = tokio::time::Instant::now();
        let err = delete(&ctx(&fake), state).await.unwrap_err();

        let deadline = Timeouts::default().delete_timeout;
        assert!(deadline < Timeouts::default().state_timeout);
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
        assert!(started.elapsed() >= deadline);
        assert!(started.elapsed() < deadline + Duration::from_secs(1));
        assert_eq!(fake.count("DeleteUDBInstance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_retries_failed_stop() {
        let fake = Arc::new(FakeUdb::new());
        let state = existing(&fake, "Normal", state::RUNNING).await;
        fake.fail_next("StopUDBInstance");

        delete(&ctx(&fake), state).await.unwrap();
        assert_eq!(fake.count("StopUDBInstance"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_aborts_on_delete_error() {
        let fake = Arc::new(FakeUdb::new());
        let state = existing(&fake, "Normal", state::SHUTOFF).await;
        fake.fail_next("DeleteUDBInstance");

        let err = delete(&ctx(&fake), state).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Api {
                operation: "DeleteUDBInstance",
                ..
            }
        ));
        assert_eq!(fake.count("DeleteUDBInstance"), 1);
    }

    #[tokio::test]
    async fn test_delete_of_missing_instance_succeeds() {
        let fake = Arc::new(FakeUdb::new());
        delete(&ctx(&fake), json!({"id": "udb-gone"})).await.unwrap();
        assert!(fake.mutations().is_empty());
    }
}
