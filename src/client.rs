//! The remote UDB API consumed by the resource controllers.
//!
//! The transport, signing and HTTP retry policy belong to the cloud SDK that
//! implements [`UdbApi`]. This module only fixes the request and record shapes
//! the controllers rely on, using the field names of the UDB API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a [`UdbApi`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The addressed instance or parameter group does not exist.
    #[error("resource {0} not found")]
    NotFound(String),

    /// The service answered with a non-zero return code.
    #[error("remote error {code}: {message}")]
    Remote {
        /// The service return code.
        code: i64,
        /// The service message.
        message: String,
    },

    /// The request never produced a service answer.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    /// Whether this error means the addressed resource is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Region and project every request is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientScope {
    /// The region, e.g. `cn-bj2`.
    pub region: String,
    /// The project id; the account default project when absent.
    pub project_id: Option<String>,
}

/// A database instance as returned by `DescribeUDBInstance`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceRecord {
    #[serde(rename = "DBId")]
    pub db_id: String,
    pub name: String,
    /// Composite engine-version identifier, e.g. `mysql-5.7`.
    #[serde(rename = "DBTypeId")]
    pub db_type_id: String,
    /// Remote mode enumeration, e.g. `Normal` or `HA`.
    pub instance_mode: String,
    /// Memory in MB.
    pub memory_limit: i64,
    /// Storage in GB.
    pub disk_space: i64,
    pub state: String,
    pub zone: String,
    pub backup_zone: String,
    pub port: i64,
    pub charge_type: String,
    pub param_group_id: i64,
    pub backup_count: i64,
    pub backup_begin_time: i64,
    pub backup_date: String,
    /// Excluded names joined with `;`.
    pub backup_blacklist: String,
    pub tag: String,
    pub create_time: i64,
    pub expired_time: i64,
    pub modify_time: i64,
}

/// A single `key = value` entry of a parameter group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParamMember {
    pub key: String,
    pub value: String,
}

impl ParamMember {
    /// Create a member from a key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A parameter group as returned by `DescribeUDBParamGroup`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParamGroupRecord {
    pub group_id: i64,
    pub group_name: String,
    #[serde(rename = "DBTypeId")]
    pub db_type_id: String,
    pub description: String,
    pub modifiable: bool,
    pub param_member: Vec<ParamMember>,
}

/// Parameters of `CreateUDBInstance`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    pub admin_password: String,
    pub admin_user: String,
    pub zone: String,
    pub disk_space: i64,
    pub charge_type: String,
    pub quantity: i64,
    /// Disk technology marker.
    pub instance_type: String,
    /// Memory in MB.
    pub memory_limit: i64,
    pub instance_mode: String,
    #[serde(rename = "DBTypeId")]
    pub db_type_id: String,
    pub param_group_id: i64,
    pub port: Option<i64>,
    pub tag: Option<String>,
    pub backup_zone: Option<String>,
    pub backup_count: Option<i64>,
    pub backup_id: Option<i64>,
    #[serde(rename = "VPCId")]
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
}

/// Parameters of `ResizeUDBInstance`; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResizeInstanceRequest {
    #[serde(rename = "DBId")]
    pub db_id: String,
    pub memory_limit: Option<i64>,
    pub disk_space: Option<i64>,
}

/// Parameters of `UpdateUDBInstanceBackupStrategy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateBackupStrategyRequest {
    #[serde(rename = "DBId")]
    pub db_id: String,
    pub backup_date: Option<String>,
    pub backup_time: Option<i64>,
}

/// Parameters of `CreateUDBParamGroup`, cloning `src_group_id` as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateParamGroupRequest {
    pub group_name: String,
    pub zone: String,
    #[serde(rename = "DBTypeId")]
    pub db_type_id: String,
    pub src_group_id: i64,
    pub description: Option<String>,
    pub region_flag: Option<bool>,
}

/// Parameters of `UploadUDBParamGroup`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadParamGroupRequest {
    pub group_name: String,
    #[serde(rename = "DBTypeId")]
    pub db_type_id: String,
    pub description: Option<String>,
    /// Base64 encoded configuration file.
    pub content: String,
    pub region_flag: Option<bool>,
}

/// The UDB operations the controllers issue.
///
/// Implementations report a missing instance or group as
/// [`ApiError::NotFound`] from the describe calls.
#[async_trait]
pub trait UdbApi: Send + Sync + 'static {
    /// Receive the region and project selected by provider configuration.
    async fn configure(&self, scope: &ClientScope) -> Result<(), ApiError> {
        let _ = scope;
        Ok(())
    }

    /// `CreateUDBInstance`; returns the new instance id.
    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<String, ApiError>;

    /// `ModifyUDBInstanceName`.
    async fn modify_instance_name(&self, db_id: &str, name: &str) -> Result<(), ApiError>;

    /// `ModifyUDBInstancePassword`.
    async fn modify_instance_password(&self, db_id: &str, password: &str)
        -> Result<(), ApiError>;

    /// `ResizeUDBInstance`.
    async fn resize_instance(&self, req: ResizeInstanceRequest) -> Result<(), ApiError>;

    /// `StopUDBInstance`.
    async fn stop_instance(&self, db_id: &str, zone: &str) -> Result<(), ApiError>;

    /// `StartUDBInstance`.
    async fn start_instance(&self, db_id: &str, zone: &str) -> Result<(), ApiError>;

    /// `RestartUDBInstance`.
    async fn restart_instance(&self, db_id: &str) -> Result<(), ApiError>;

    /// `DeleteUDBInstance`.
    async fn delete_instance(&self, db_id: &str) -> Result<(), ApiError>;

    /// `DescribeUDBInstance` for a single id.
    async fn describe_instance(&self, db_id: &str) -> Result<InstanceRecord, ApiError>;

    /// `UpdateUDBInstanceBackupStrategy`.
    async fn update_backup_strategy(&self, req: UpdateBackupStrategyRequest)
        -> Result<(), ApiError>;

    /// `EditUDBBackupBlacklist`.
    async fn edit_backup_blacklist(&self, db_id: &str, blacklist: &str) -> Result<(), ApiError>;

    /// `CreateUDBParamGroup`; returns the new group id.
    async fn create_param_group(&self, req: CreateParamGroupRequest) -> Result<i64, ApiError>;

    /// `UploadUDBParamGroup`; returns the new group id.
    async fn upload_param_group(&self, req: UploadParamGroupRequest) -> Result<i64, ApiError>;

    /// `DescribeUDBParamGroup` for a single id.
    async fn describe_param_group(&self, group_id: i64) -> Result<ParamGroupRecord, ApiError>;

    /// `ChangeUDBParamGroup`.
    async fn change_param_group(&self, db_id: &str, group_id: &str) -> Result<(), ApiError>;

    /// `DeleteUDBParamGroup`.
    async fn delete_param_group(
        &self,
        group_id: i64,
        region_flag: Option<bool>,
    ) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_record_uses_api_field_names() {
        let record: InstanceRecord = serde_json::from_value(serde_json::json!({
            "DBId": "udbha-abc",
            "Name": "orders",
            "DBTypeId": "mysql-5.7",
            "InstanceMode": "HA",
            "MemoryLimit": 2000,
            "DiskSpace": 40,
            "State": "Running",
            "Zone": "cn-bj2-02",
            "BackupZone": "",
            "Port": 3306,
            "ChargeType": "Month",
            "ParamGroupId": 18,
            "BackupCount": 7,
            "BackupBeginTime": 1,
            "BackupDate": "0111110",
            "BackupBlacklist": "test.%;app.logs",
            "Tag": "Default",
            "CreateTime": 1540000000,
            "ExpiredTime": 1542592000,
            "ModifyTime": 0
        }))
        .unwrap();

        assert_eq!(record.db_id, "udbha-abc");
        assert_eq!(record.db_type_id, "mysql-5.7");
        assert_eq!(record.memory_limit, 2000);
        assert_eq!(record.backup_blacklist, "test.%;app.logs");
    }

    #[test]
    fn test_param_group_record_members() {
        let record: ParamGroupRecord = serde_json::from_value(serde_json::json!({
            "GroupId": 18,
            "GroupName": "mysql5.7默认配置",
            "DBTypeId": "mysql-5.7",
            "Description": "",
            "Modifiable": false,
            "ParamMember": [{"Key": "max_connections", "Value": "2000"}]
        }))
        .unwrap();

        assert_eq!(record.group_id, 18);
        assert_eq!(
            record.param_member,
            vec![ParamMember::new("max_connections", "2000")]
        );
    }

    #[test]
    fn test_api_error_not_found() {
        assert!(ApiError::NotFound("udb-1".to_string()).is_not_found());
        assert!(!ApiError::Transport("reset".to_string()).is_not_found());
        assert_eq!(
            ApiError::Remote {
                code: 5000,
                message: "busy".to_string()
            }
            .to_string(),
            "remote error 5000: busy"
        );
    }
}
