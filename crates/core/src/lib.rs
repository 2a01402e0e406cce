use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub const INVENTORY_SCHEMA_VERSION: &str = "1.0.0";

/// Volume label carried by the master disk's model partition.
pub const MASTER_LABEL: &str = "RMinte_Models";
/// Case-insensitive marker that identifies the master disk in labels and mount paths.
pub const MASTER_KEYWORD: &str = "RMinte";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceInventory {
    pub inventory_id: Uuid,
    pub schema_version: String,
    pub host: HostInfo,
    pub devices: Vec<BlockDevice>,
    pub generated_at_utc: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostInfo {
    pub os: String,
    pub os_version: String,
    pub machine: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,              // kernel name, e.g. "sdb"
    pub model: String,
    pub size_bytes: u64,
    pub removable: bool,
    pub is_system_disk: bool,      // best-effort: something is mounted at "/"
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,                // 1-based
    pub node: String,              // e.g. "/dev/sdb2"
    pub label: Option<String>,
    pub mount_point: Option<String>,
    pub fs: Option<String>,
    pub size_bytes: u64,
}

impl BlockDevice {
    pub fn partition(&self, index: u32) -> Option<&Partition> {
        self.partitions.iter().find(|partition| partition.index == index)
    }

    /// True when `identifier` names this device, one of its partition nodes,
    /// or one of its mount points.
    pub fn is_identified_by(&self, identifier: &str) -> bool {
        let identifier = identifier.trim_end_matches('/');
        if identifier.is_empty() {
            return false;
        }
        let dev_path = format!("/dev/{}", self.name);
        if self.name == identifier || dev_path == identifier {
            return true;
        }
        self.partitions.iter().any(|partition| {
            partition.node == identifier
                || partition
                    .mount_point
                    .as_deref()
                    .map(|mount| mount.trim_end_matches('/') == identifier)
                    .unwrap_or(false)
        })
    }
}

impl DeviceInventory {
    pub fn new(host: HostInfo, devices: Vec<BlockDevice>) -> Self {
        Self {
            inventory_id: Uuid::new_v4(),
            schema_version: INVENTORY_SCHEMA_VERSION.to_string(),
            host,
            devices,
            generated_at_utc: now_utc_rfc3339(),
        }
    }

    pub fn device(&self, name: &str) -> Option<&BlockDevice> {
        self.devices.iter().find(|device| device.name == name)
    }
}

/// Anything able to produce a fresh device snapshot.
pub trait InventorySource {
    fn snapshot(&self) -> Result<DeviceInventory>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardRole {
    Rootfs,
    Models,
    App,
}

impl CardRole {
    pub const ALL: [CardRole; 3] = [CardRole::Rootfs, CardRole::Models, CardRole::App];

    pub fn as_str(self) -> &'static str {
        match self {
            CardRole::Rootfs => "rootfs",
            CardRole::Models => "models",
            CardRole::App => "app",
        }
    }
}

impl std::fmt::Display for CardRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub role: CardRole,
    pub index: u32,
    pub keyword: String,
    pub label: String,
}

/// Shape a valid target card must have. The role to index mapping is fixed
/// by convention: rootfs=1, models=2, app=3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCardSpec {
    pub roles: [RoleSpec; 3],
    pub master_keyword: String,
}

impl Default for TargetCardSpec {
    fn default() -> Self {
        let role = |role: CardRole, index: u32| RoleSpec {
            role,
            index,
            keyword: role.as_str().to_string(),
            label: format!("rm01{}", role.as_str()),
        };
        Self {
            roles: [
                role(CardRole::Rootfs, 1),
                role(CardRole::Models, 2),
                role(CardRole::App, 3),
            ],
            master_keyword: MASTER_KEYWORD.to_string(),
        }
    }
}

impl TargetCardSpec {
    pub fn role(&self, role: CardRole) -> &RoleSpec {
        match role {
            CardRole::Rootfs => &self.roles[0],
            CardRole::Models => &self.roles[1],
            CardRole::App => &self.roles[2],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub full_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub path: PathBuf,
}

/// Persisted application state. Owned by the outer flow; core logic only
/// reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub target_card: Option<String>,
}

impl Configuration {
    pub fn is_set_up(&self) -> bool {
        self.disk_path.is_some() && !self.models.is_empty()
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> BlockDevice {
        BlockDevice {
            name: "sdb".to_string(),
            model: "Card Reader".to_string(),
            size_bytes: 0,
            removable: true,
            is_system_disk: false,
            partitions: vec![
                Partition {
                    index: 2,
                    node: "/dev/sdb2".to_string(),
                    label: Some("rm01models".to_string()),
                    mount_point: Some("/media/rm01models".to_string()),
                    fs: None,
                    size_bytes: 0,
                },
                Partition {
                    index: 1,
                    node: "/dev/sdb1".to_string(),
                    label: None,
                    mount_point: None,
                    fs: None,
                    size_bytes: 0,
                },
            ],
        }
    }

    #[test]
    fn partition_lookup_is_by_index() {
        let device = device();
        assert_eq!(device.partition(1).map(|p| p.node.as_str()), Some("/dev/sdb1"));
        assert_eq!(device.partition(2).map(|p| p.node.as_str()), Some("/dev/sdb2"));
        assert!(device.partition(3).is_none());
    }

    #[test]
    fn identifies_by_name_node_or_mount() {
        let device = device();
        assert!(device.is_identified_by("sdb"));
        assert!(device.is_identified_by("/dev/sdb"));
        assert!(device.is_identified_by("/dev/sdb1"));
        assert!(device.is_identified_by("/media/rm01models/"));
        assert!(!device.is_identified_by("/dev/sdc"));
        assert!(!device.is_identified_by(""));
    }

    #[test]
    fn default_spec_uses_fixed_indices() {
        let spec = TargetCardSpec::default();
        assert_eq!(spec.role(CardRole::Rootfs).index, 1);
        assert_eq!(spec.role(CardRole::Models).index, 2);
        assert_eq!(spec.role(CardRole::App).index, 3);
        assert_eq!(spec.role(CardRole::Models).label, "rm01models");
    }

    #[test]
    fn configuration_tolerates_missing_fields() {
        let config: Configuration = serde_json::from_str("{}").unwrap();
        assert!(!config.is_set_up());
    }
}
