//! Compound instance type strings and the mode vocabulary.
//!
//! An instance type is written `engine-mode-memory`, e.g. `mysql-ha-4`, where
//! `memory` is the memory tier in GB. The remote API spells the mode with its
//! own enumeration (`Normal`, `HA`, ...); [`ModeMap`] translates between the two.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Memory tiers (GB) the service offers.
pub const MEMORY_TIERS: [u32; 11] = [1, 2, 4, 6, 8, 12, 16, 24, 32, 48, 64];

/// Storage bounds (GB) accepted by the service regardless of memory.
pub const MIN_STORAGE_GB: i64 = 20;
/// See [`MIN_STORAGE_GB`].
pub const MAX_STORAGE_GB: i64 = 3000;

/// A database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// MySQL.
    Mysql,
    /// Percona Server, MySQL compatible.
    Percona,
    /// PostgreSQL.
    Postgresql,
}

impl Engine {
    /// All engines.
    pub const ALL: [Engine; 3] = [Engine::Mysql, Engine::Percona, Engine::Postgresql];

    /// The engine name used in configuration and type ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Mysql => "mysql",
            Engine::Percona => "percona",
            Engine::Postgresql => "postgresql",
        }
    }

    /// Whether this engine speaks the MySQL protocol.
    pub fn is_mysql_family(&self) -> bool {
        matches!(self, Engine::Mysql | Engine::Percona)
    }

    /// The listening port used when none is configured.
    pub fn default_port(&self) -> i64 {
        if self.is_mysql_family() {
            3306
        } else {
            5432
        }
    }

    /// Engine versions an instance of this engine can be created with.
    pub fn instance_versions(&self) -> &'static [&'static str] {
        if self.is_mysql_family() {
            &["5.5", "5.6", "5.7"]
        } else {
            &["9.4", "9.6"]
        }
    }

    /// The composite `engine-version` identifier used by the API.
    pub fn type_id(&self, version: &str) -> String {
        format!("{}-{}", self.as_str(), version)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Engine::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ProviderError::Validation(format!("unknown engine {:?}", s)))
    }
}

/// Split a composite type id such as `mysql-5.7` into engine and version.
pub fn split_type_id(type_id: &str) -> Result<(Engine, String), ProviderError> {
    let (engine, version) = type_id
        .split_once('-')
        .ok_or_else(|| ProviderError::Validation(format!("malformed type id {:?}", type_id)))?;
    Ok((engine.parse()?, version.to_string()))
}

/// Deployment topology of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceMode {
    /// Single node, deprecated for MySQL-family engines.
    Basic,
    /// Single node.
    Normal,
    /// High-availability pair.
    Ha,
}

impl InstanceMode {
    /// All modes.
    pub const ALL: [InstanceMode; 3] = [InstanceMode::Basic, InstanceMode::Normal, InstanceMode::Ha];

    /// The mode name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceMode::Basic => "basic",
            InstanceMode::Normal => "normal",
            InstanceMode::Ha => "ha",
        }
    }
}

impl fmt::Display for InstanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceMode {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProviderError::Validation(format!("unknown instance mode {:?}", s)))
    }
}

/// Local mode to remote enumeration pairs.
pub const MODE_TABLE: [(InstanceMode, &str); 3] = [
    (InstanceMode::Basic, "Basic"),
    (InstanceMode::Normal, "Normal"),
    (InstanceMode::Ha, "HA"),
];

/// Two-way lookup between [`InstanceMode`] and the remote mode enumeration.
#[derive(Debug, Clone)]
pub struct ModeMap {
    to_remote: HashMap<InstanceMode, &'static str>,
    to_local: HashMap<&'static str, InstanceMode>,
}

impl ModeMap {
    /// Build a map from pairs, requiring a bijection over [`InstanceMode::ALL`].
    pub fn new(pairs: &[(InstanceMode, &'static str)]) -> Result<Self, String> {
        let mut to_remote = HashMap::new();
        let mut to_local = HashMap::new();
        for &(mode, remote) in pairs {
            if to_remote.insert(mode, remote).is_some() {
                return Err(format!("mode {} is mapped twice", mode));
            }
            if to_local.insert(remote, mode).is_some() {
                return Err(format!("remote mode {} is mapped twice", remote));
            }
        }
        if let Some(missing) = InstanceMode::ALL
            .iter()
            .find(|m| !to_remote.contains_key(*m))
        {
            return Err(format!("mode {} has no remote counterpart", missing));
        }
        Ok(Self {
            to_remote,
            to_local,
        })
    }

    /// The remote enumeration value for `mode`.
    pub fn to_remote(&self, mode: InstanceMode) -> Result<&'static str, ProviderError> {
        self.to_remote.get(&mode).copied().ok_or_else(|| {
            ProviderError::Validation(format!("unknown mapping for mode {}", mode))
        })
    }

    /// The local mode for a remote enumeration value.
    pub fn to_local(&self, remote: &str) -> Result<InstanceMode, ProviderError> {
        self.to_local.get(remote).copied().ok_or_else(|| {
            ProviderError::Validation(format!("unknown mapping for remote mode {:?}", remote))
        })
    }
}

static MODES: LazyLock<Result<ModeMap, String>> = LazyLock::new(|| ModeMap::new(&MODE_TABLE));

/// The mode map built from [`MODE_TABLE`].
pub fn modes() -> Result<&'static ModeMap, ProviderError> {
    MODES
        .as_ref()
        .map_err(|e| ProviderError::Configuration(format!("instance mode table: {}", e)))
}

/// Map a local mode to the remote enumeration.
pub fn mode_to_remote(mode: InstanceMode) -> Result<&'static str, ProviderError> {
    modes()?.to_remote(mode)
}

/// Map a remote mode enumeration value to the local mode.
pub fn remote_to_mode(remote: &str) -> Result<InstanceMode, ProviderError> {
    modes()?.to_local(remote)
}

/// A parsed `engine-mode-memory` instance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbInstanceType {
    /// The engine embedded in the type.
    pub engine: Engine,
    /// The deployment mode.
    pub mode: InstanceMode,
    /// Memory tier in GB.
    pub memory: u32,
}

impl DbInstanceType {
    /// Create an instance type from its parts.
    pub fn new(engine: Engine, mode: InstanceMode, memory: u32) -> Self {
        Self {
            engine,
            mode,
            memory,
        }
    }

    /// Memory in MB, as the API expects it.
    pub fn memory_limit(&self) -> i64 {
        i64::from(self.memory) * 1000
    }

    /// Reject engine and mode combinations the service no longer offers.
    pub fn check_mode_supported(&self) -> Result<(), ProviderError> {
        match (self.engine, self.mode) {
            (Engine::Postgresql, InstanceMode::Ha) => Err(ProviderError::Validation(
                "high availability postgresql is not supported at this time".to_string(),
            )),
            (engine, InstanceMode::Basic) if engine.is_mysql_family() => {
                Err(ProviderError::Validation(format!(
                    "basic {} is no longer supported",
                    engine
                )))
            },
            _ => Ok(()),
        }
    }
}

impl fmt::Display for DbInstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.engine, self.mode, self.memory)
    }
}

impl FromStr for DbInstanceType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let [engine, mode, memory] = parts.as_slice() else {
            return Err(ProviderError::Validation(format!(
                "instance type {:?} must look like engine-mode-memory",
                s
            )));
        };
        let memory: u32 = memory.parse().map_err(|_| {
            ProviderError::Validation(format!("memory of instance type {:?} is not a number", s))
        })?;
        Ok(Self {
            engine: engine.parse()?,
            mode: mode.parse()?,
            memory,
        })
    }
}

/// Largest storage (GB) allowed for a memory tier.
pub fn max_storage_gb(memory: u32) -> i64 {
    if memory <= 8 {
        500
    } else if memory <= 24 {
        1000
    } else if memory == 32 {
        2000
    } else {
        MAX_STORAGE_GB
    }
}

/// Check `storage` against the global bounds and the memory tier ceiling.
pub fn check_storage(memory: u32, storage: i64) -> Result<(), ProviderError> {
    if !(MIN_STORAGE_GB..=MAX_STORAGE_GB).contains(&storage) {
        return Err(ProviderError::Validation(format!(
            "instance storage must be between {} and {}, got {}",
            MIN_STORAGE_GB, MAX_STORAGE_GB, storage
        )));
    }
    let ceiling = max_storage_gb(memory);
    if storage > ceiling {
        return Err(ProviderError::Validation(format!(
            "the upper limit of instance storage is {} when the memory is {}, got {}",
            ceiling, memory, storage
        )));
    }
    Ok(())
}
