//! An in-memory [`UdbApi`] for exercising the controllers.
//!
//! Every call is recorded by operation name so tests can assert on the exact
//! sequence of remote calls. State transitions (stop, start, restart, resize)
//! settle after a configurable number of describes, deletes can be made to lag
//! or never take effect, and any operation can be made to fail once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use base64::prelude::*;

use crate::client::{
    ApiError, ClientScope, CreateInstanceRequest, CreateParamGroupRequest, InstanceRecord,
    ParamGroupRecord, ParamMember, ResizeInstanceRequest, UdbApi, UpdateBackupStrategyRequest,
    UploadParamGroupRequest,
};
use crate::wait::state;

const CREATED_AT: i64 = 1_540_000_000;

#[derive(Debug, Clone)]
struct Pending {
    interim: String,
    remaining: usize,
    target: String,
}

#[derive(Debug, Clone)]
struct FakeInstance {
    record: InstanceRecord,
    pending: Option<Pending>,
    /// Describes that still report the instance after it was deleted.
    deleted: Option<usize>,
}

#[derive(Debug, Clone)]
struct FakeGroup {
    record: ParamGroupRecord,
    deleted: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    instances: HashMap<String, FakeInstance>,
    groups: HashMap<i64, FakeGroup>,
    calls: Vec<String>,
    /// Successful calls left per operation before it fails once.
    failures: HashMap<String, usize>,
    transition_polls: usize,
    delete_lag: usize,
    delete_never_completes: bool,
    scope: Option<ClientScope>,
    created: Vec<CreateInstanceRequest>,
    uploads: Vec<UploadParamGroupRequest>,
}

impl Inner {
    fn record_call(&mut self, op: &str) -> Result<(), ApiError> {
        self.calls.push(op.to_string());
        match self.failures.get_mut(op) {
            Some(0) => {
                self.failures.remove(op);
                Err(ApiError::Remote {
                    code: 5000,
                    message: format!("injected failure of {}", op),
                })
            },
            Some(left) => {
                *left -= 1;
                Ok(())
            },
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn instance_mut(&mut self, db_id: &str) -> Result<&mut FakeInstance, ApiError> {
        match self.instances.get_mut(db_id) {
            Some(instance) if instance.deleted.is_none() => Ok(instance),
            _ => Err(ApiError::NotFound(db_id.to_string())),
        }
    }

    fn transition(&mut self, db_id: &str, interim: &str, target: &str) -> Result<(), ApiError> {
        let polls = self.transition_polls;
        let instance = self.instance_mut(db_id)?;
        instance.record.modify_time = CREATED_AT + 60;
        if polls == 0 {
            instance.record.state = target.to_string();
            instance.pending = None;
        } else {
            instance.record.state = interim.to_string();
            instance.pending = Some(Pending {
                interim: interim.to_string(),
                remaining: polls,
                target: target.to_string(),
            });
        }
        Ok(())
    }

    fn deletion_lag(&self) -> Option<usize> {
        if self.delete_never_completes {
            Some(usize::MAX)
        } else if self.delete_lag > 0 {
            Some(self.delete_lag)
        } else {
            None
        }
    }
}

/// In-memory UDB service.
#[derive(Debug, Default)]
pub struct FakeUdb {
    inner: Mutex<Inner>,
}

impl FakeUdb {
    /// An empty service where every transition settles immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Let stop, start, restart, resize and create settle only after `polls`
    /// describes.
    pub fn with_transition_polls(self, polls: usize) -> Self {
        self.lock().transition_polls = polls;
        self
    }

    /// Keep reporting deleted instances and groups for `describes` describes.
    ///
    /// Deleting again while the delete lags is accepted.
    pub fn with_delete_lag(self, describes: usize) -> Self {
        self.lock().delete_lag = describes;
        self
    }

    /// Accept deletes without ever removing anything.
    pub fn with_delete_never_completing(self) -> Self {
        self.lock().delete_never_completes = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A running instance record of the given type id and remote mode.
    pub fn instance_record(db_type_id: &str, instance_mode: &str) -> InstanceRecord {
        let port = if db_type_id.starts_with("postgresql") {
            5432
        } else {
            3306
        };
        InstanceRecord {
            name: "orders".to_string(),
            db_type_id: db_type_id.to_string(),
            instance_mode: instance_mode.to_string(),
            memory_limit: 1000,
            disk_space: 20,
            state: state::RUNNING.to_string(),
            zone: "cn-bj2-02".to_string(),
            port,
            charge_type: "Month".to_string(),
            param_group_id: 18,
            backup_count: 7,
            backup_begin_time: 1,
            backup_date: "0111110".to_string(),
            tag: "Default".to_string(),
            create_time: CREATED_AT,
            expired_time: CREATED_AT + 2_592_000,
            ..Default::default()
        }
    }

    /// Store an instance, assigning it an id unless the record carries one.
    pub fn insert_instance(&self, mut record: InstanceRecord) -> String {
        let mut inner = self.lock();
        if record.db_id.is_empty() {
            record.db_id = format!("udb-{}", inner.next_id());
        }
        let id = record.db_id.clone();
        inner.instances.insert(
            id.clone(),
            FakeInstance {
                record,
                pending: None,
                deleted: None,
            },
        );
        id
    }

    /// The current record of an instance, without counting as a call.
    pub fn instance(&self, db_id: &str) -> Option<InstanceRecord> {
        self.lock()
            .instances
            .get(db_id)
            .filter(|i| i.deleted.is_none())
            .map(|i| i.record.clone())
    }

    /// Force the state of an instance.
    pub fn set_state(&self, db_id: &str, new_state: &str) {
        if let Some(instance) = self.lock().instances.get_mut(db_id) {
            instance.record.state = new_state.to_string();
            instance.pending = None;
        }
    }

    /// Report `interim` for the next `polls` describes, then `target`.
    pub fn schedule_state(&self, db_id: &str, interim: &str, polls: usize, target: &str) {
        if let Some(instance) = self.lock().instances.get_mut(db_id) {
            instance.record.state = interim.to_string();
            instance.pending = Some(Pending {
                interim: interim.to_string(),
                remaining: polls,
                target: target.to_string(),
            });
        }
    }

    /// Store a parameter group; a zero `group_id` is replaced by a fresh id.
    pub fn insert_param_group(&self, mut record: ParamGroupRecord) -> i64 {
        let mut inner = self.lock();
        if record.group_id == 0 {
            record.group_id = 100 + inner.next_id() as i64;
        }
        let id = record.group_id;
        inner.groups.insert(
            id,
            FakeGroup {
                record,
                deleted: None,
            },
        );
        id
    }

    /// The current record of a parameter group, without counting as a call.
    pub fn param_group(&self, group_id: i64) -> Option<ParamGroupRecord> {
        self.lock()
            .groups
            .get(&group_id)
            .filter(|g| g.deleted.is_none())
            .map(|g| g.record.clone())
    }

    /// Make the next call of `op` fail with a remote error.
    pub fn fail_next(&self, op: &str) {
        self.fail_after(op, 0);
    }

    /// Let `succeeding` further calls of `op` through, then fail the next one.
    pub fn fail_after(&self, op: &str, succeeding: usize) {
        self.lock().failures.insert(op.to_string(), succeeding);
    }

    /// Every call so far, by operation name.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Every call so far except describes.
    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| !c.starts_with("Describe"))
            .cloned()
            .collect()
    }

    /// How often `op` was called.
    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == op).count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// The scope received through [`UdbApi::configure`].
    pub fn scope(&self) -> Option<ClientScope> {
        self.lock().scope.clone()
    }

    /// Every `CreateUDBInstance` request received.
    pub fn created_instances(&self) -> Vec<CreateInstanceRequest> {
        self.lock().created.clone()
    }

    /// Every `UploadUDBParamGroup` request received.
    pub fn uploads(&self) -> Vec<UploadParamGroupRequest> {
        self.lock().uploads.clone()
    }
}

/// Members of an uploaded configuration file, skipping the section header.
fn parse_members(content: &str) -> Result<Vec<ParamMember>, ApiError> {
    let decoded = BASE64_STANDARD.decode(content).map_err(|e| ApiError::Remote {
        code: 160,
        message: format!("content is not base64: {}", e),
    })?;
    let text = String::from_utf8_lossy(&decoded);
    let members: BTreeMap<String, String> = text
        .lines()
        .filter_map(|line| line.split_once(" = "))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(members
        .into_iter()
        .map(|(k, v)| ParamMember::new(k, v))
        .collect())
}

#[async_trait]
impl UdbApi for FakeUdb {
    async fn configure(&self, scope: &ClientScope) -> Result<(), ApiError> {
        self.lock().scope = Some(scope.clone());
        Ok(())
    }

    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<String, ApiError> {
        let mut inner = self.lock();
        inner.record_call("CreateUDBInstance")?;
        let id = format!("udb-{}", inner.next_id());
        let record = InstanceRecord {
            db_id: id.clone(),
            name: req.name.clone(),
            db_type_id: req.db_type_id.clone(),
            instance_mode: req.instance_mode.clone(),
            memory_limit: req.memory_limit,
            disk_space: req.disk_space,
            state: "Initing".to_string(),
            zone: req.zone.clone(),
            backup_zone: req.backup_zone.clone().unwrap_or_default(),
            port: req.port.unwrap_or(3306),
            charge_type: req.charge_type.clone(),
            param_group_id: req.param_group_id,
            backup_count: req.backup_count.unwrap_or(7),
            backup_begin_time: 0,
            backup_date: String::new(),
            backup_blacklist: String::new(),
            tag: req.tag.clone().unwrap_or_else(|| "Default".to_string()),
            create_time: CREATED_AT,
            expired_time: CREATED_AT + 2_592_000,
            modify_time: 0,
        };
        inner.instances.insert(
            id.clone(),
            FakeInstance {
                record,
                pending: None,
                deleted: None,
            },
        );
        inner.created.push(req);
        inner.transition(&id, "Initing", state::RUNNING)?;
        Ok(id)
    }

    async fn modify_instance_name(&self, db_id: &str, name: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("ModifyUDBInstanceName")?;
        inner.instance_mut(db_id)?.record.name = name.to_string();
        Ok(())
    }

    async fn modify_instance_password(
        &self,
        db_id: &str,
        _password: &str,
    ) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("ModifyUDBInstancePassword")?;
        inner.instance_mut(db_id)?;
        Ok(())
    }

    async fn resize_instance(&self, req: ResizeInstanceRequest) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("ResizeUDBInstance")?;
        let instance = inner.instance_mut(&req.db_id)?;
        if let Some(memory) = req.memory_limit {
            instance.record.memory_limit = memory;
        }
        if let Some(disk) = req.disk_space {
            instance.record.disk_space = disk;
        }
        let settled = instance.record.state.clone();
        inner.transition(&req.db_id, "Resizing", &settled)
    }

    async fn stop_instance(&self, db_id: &str, _zone: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("StopUDBInstance")?;
        inner.transition(db_id, "Stopping", state::SHUTOFF)
    }

    async fn start_instance(&self, db_id: &str, _zone: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("StartUDBInstance")?;
        inner.transition(db_id, "Starting", state::RUNNING)
    }

    async fn restart_instance(&self, db_id: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("RestartUDBInstance")?;
        inner.transition(db_id, "Restarting", state::RUNNING)
    }

    async fn delete_instance(&self, db_id: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("DeleteUDBInstance")?;
        let lag = inner.deletion_lag();
        let Some(instance) = inner.instances.get_mut(db_id) else {
            return Err(ApiError::NotFound(db_id.to_string()));
        };
        if instance.deleted.is_some() {
            return Ok(());
        }
        match lag {
            Some(lag) => instance.deleted = Some(lag),
            None => {
                inner.instances.remove(db_id);
            },
        }
        Ok(())
    }

    async fn describe_instance(&self, db_id: &str) -> Result<InstanceRecord, ApiError> {
        let mut inner = self.lock();
        inner.record_call("DescribeUDBInstance")?;
        let Some(instance) = inner.instances.get_mut(db_id) else {
            return Err(ApiError::NotFound(db_id.to_string()));
        };

        if let Some(remaining) = instance.deleted {
            if remaining == 0 {
                inner.instances.remove(db_id);
                return Err(ApiError::NotFound(db_id.to_string()));
            }
            if remaining != usize::MAX {
                instance.deleted = Some(remaining - 1);
            }
            return Ok(instance.record.clone());
        }

        if let Some(pending) = instance.pending.as_mut() {
            if pending.remaining == 0 {
                instance.record.state = pending.target.clone();
                instance.pending = None;
            } else {
                pending.remaining -= 1;
                instance.record.state = pending.interim.clone();
            }
        }
        Ok(instance.record.clone())
    }

    async fn update_backup_strategy(
        &self,
        req: UpdateBackupStrategyRequest,
    ) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("UpdateUDBInstanceBackupStrategy")?;
        let instance = inner.instance_mut(&req.db_id)?;
        if let Some(date) = req.backup_date {
            instance.record.backup_date = date;
        }
        if let Some(hour) = req.backup_time {
            instance.record.backup_begin_time = hour;
        }
        Ok(())
    }

    async fn edit_backup_blacklist(&self, db_id: &str, blacklist: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("EditUDBBackupBlacklist")?;
        inner.instance_mut(db_id)?.record.backup_blacklist = blacklist.to_string();
        Ok(())
    }

    async fn create_param_group(&self, req: CreateParamGroupRequest) -> Result<i64, ApiError> {
        let mut inner = self.lock();
        inner.record_call("CreateUDBParamGroup")?;
        let source = match inner.groups.get(&req.src_group_id) {
            Some(group) if group.deleted.is_none() => group.record.clone(),
            _ => return Err(ApiError::NotFound(req.src_group_id.to_string())),
        };
        let id = 100 + inner.next_id() as i64;
        let record = ParamGroupRecord {
            group_id: id,
            group_name: req.group_name,
            db_type_id: req.db_type_id,
            description: req.description.unwrap_or_default(),
            modifiable: true,
            param_member: source.param_member,
        };
        inner.groups.insert(
            id,
            FakeGroup {
                record,
                deleted: None,
            },
        );
        Ok(id)
    }

    async fn upload_param_group(&self, req: UploadParamGroupRequest) -> Result<i64, ApiError> {
        let mut inner = self.lock();
        inner.record_call("UploadUDBParamGroup")?;
        let members = parse_members(&req.content)?;
        let id = 100 + inner.next_id() as i64;
        let record = ParamGroupRecord {
            group_id: id,
            group_name: req.group_name.clone(),
            db_type_id: req.db_type_id.clone(),
            description: req.description.clone().unwrap_or_default(),
            modifiable: true,
            param_member: members,
        };
        inner.groups.insert(
            id,
            FakeGroup {
                record,
                deleted: None,
            },
        );
        inner.uploads.push(req);
        Ok(id)
    }

    async fn describe_param_group(&self, group_id: i64) -> Result<ParamGroupRecord, ApiError> {
        let mut inner = self.lock();
        inner.record_call("DescribeUDBParamGroup")?;
        let Some(group) = inner.groups.get_mut(&group_id) else {
            return Err(ApiError::NotFound(group_id.to_string()));
        };
        if let Some(remaining) = group.deleted {
            if remaining == 0 {
                inner.groups.remove(&group_id);
                return Err(ApiError::NotFound(group_id.to_string()));
            }
            if remaining != usize::MAX {
                group.deleted = Some(remaining - 1);
            }
        }
        Ok(group.record.clone())
    }

    async fn change_param_group(&self, db_id: &str, group_id: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("ChangeUDBParamGroup")?;
        let group_id: i64 = group_id.parse().map_err(|_| ApiError::Remote {
            code: 160,
            message: format!("invalid group id {}", group_id),
        })?;
        inner.instance_mut(db_id)?.record.param_group_id = group_id;
        Ok(())
    }

    async fn delete_param_group(
        &self,
        group_id: i64,
        _region_flag: Option<bool>,
    ) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record_call("DeleteUDBParamGroup")?;
        let lag = inner.deletion_lag();
        let Some(group) = inner.groups.get_mut(&group_id) else {
            return Err(ApiError::NotFound(group_id.to_string()));
        };
        if group.deleted.is_some() {
            return Ok(());
        }
        match lag {
            Some(lag) => group.deleted = Some(lag),
            None => {
                inner.groups.remove(&group_id);
            },
        }
        Ok(())
    }
}
