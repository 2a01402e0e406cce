//! Disk classification: picks the master disk and the target card out of a
//! device snapshot. Everything here is pure inspection of the snapshot.

use rmcard_core::{BlockDevice, CardRole, Partition, TargetCardSpec, MASTER_LABEL};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no partition labelled {label} was found; attach the master disk and check its volume label")]
    MasterNotFound { label: String },

    #[error("no target card found (expected partitions {expected}): {}", describe_rejections(.rejections))]
    TargetNotFound {
        expected: String,
        rejections: Vec<(String, Rejection)>,
    },

    #[error("more than one device qualifies as target card: {}", .candidates.join(", "))]
    AmbiguousTarget { candidates: Vec<String> },
}

/// Why a device was not accepted as a target card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Rejection {
    Excluded,
    MissingPartition { index: u32 },
    MasterMarker { index: u32 },
    RoleMismatch { role: CardRole, index: u32, keyword: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Excluded => write!(f, "is the master disk"),
            Rejection::MissingPartition { index } => write!(f, "partition {} missing", index),
            Rejection::MasterMarker { index } => {
                write!(f, "partition {} carries the master disk marker", index)
            }
            Rejection::RoleMismatch { role, index, keyword } => write!(
                f,
                "{} partition {} has neither label nor mount path containing \"{}\"",
                role, index, keyword
            ),
        }
    }
}

fn describe_rejections(rejections: &[(String, Rejection)]) -> String {
    if rejections.is_empty() {
        return "no devices present".to_string();
    }
    rejections
        .iter()
        .map(|(device, rejection)| format!("{}: {}", device, rejection))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterDisk {
    pub device: String,
    pub partition_index: u32,
    pub node: String,
    pub mount_point: Option<String>,
}

impl MasterDisk {
    /// Mount point of the labelled partition, or the device identifier when
    /// it is not mounted.
    pub fn location(&self) -> &str {
        self.mount_point.as_deref().unwrap_or(&self.device)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetCard {
    pub device: String,
    pub rootfs: Partition,
    pub models: Partition,
    pub app: Partition,
}

impl TargetCard {
    pub fn partition(&self, role: CardRole) -> &Partition {
        match role {
            CardRole::Rootfs => &self.rootfs,
            CardRole::Models => &self.models,
            CardRole::App => &self.app,
        }
    }

    pub fn mount_point(&self, role: CardRole) -> Option<&str> {
        self.partition(role).mount_point.as_deref()
    }
}

pub fn find_master_disk(devices: &[BlockDevice]) -> Result<MasterDisk, DiscoveryError> {
    let mut matches = devices.iter().flat_map(|device| {
        device
            .partitions
            .iter()
            .filter(|partition| partition.label.as_deref() == Some(MASTER_LABEL))
            .map(move |partition| MasterDisk {
                device: device.name.clone(),
                partition_index: partition.index,
                node: partition.node.clone(),
                mount_point: partition.mount_point.clone(),
            })
    });
    let master = matches.next().ok_or_else(|| DiscoveryError::MasterNotFound {
        label: MASTER_LABEL.to_string(),
    })?;
    for other in matches {
        warn!(
            chosen = %master.node,
            ignored = %other.node,
            "several partitions carry the master label; using the first"
        );
    }
    debug!(device = %master.device, location = %master.location(), "master disk found");
    Ok(master)
}

/// Checks one device against the target card shape.
pub fn evaluate_target(device: &BlockDevice, spec: &TargetCardSpec) -> Result<TargetCard, Rejection> {
    let mut found = Vec::with_capacity(3);
    for role in &spec.roles {
        let partition = device
            .partition(role.index)
            .ok_or(Rejection::MissingPartition { index: role.index })?;
        found.push(partition);
    }

    let models = spec.role(CardRole::Models);
    if let Some(partition) = device.partition(models.index) {
        if mentions(partition, &spec.master_keyword) {
            return Err(Rejection::MasterMarker { index: models.index });
        }
    }

    for (role, partition) in spec.roles.iter().zip(&found) {
        if !mentions(partition, &role.keyword) {
            return Err(Rejection::RoleMismatch {
                role: role.role,
                index: role.index,
                keyword: role.keyword.clone(),
            });
        }
    }

    Ok(TargetCard {
        device: device.name.clone(),
        rootfs: found[0].clone(),
        models: found[1].clone(),
        app: found[2].clone(),
    })
}

/// Every device with its verdict, in enumeration order.
pub fn target_card_candidates<'a>(
    devices: &'a [BlockDevice],
    excluded_master: Option<&str>,
    spec: &TargetCardSpec,
) -> Vec<(&'a BlockDevice, Result<TargetCard, Rejection>)> {
    devices
        .iter()
        .map(|device| {
            let verdict = match excluded_master {
                Some(master) if device.is_identified_by(master) => Err(Rejection::Excluded),
                _ => evaluate_target(device, spec),
            };
            if let Err(rejection) = &verdict {
                debug!(device = %device.name, %rejection, "not a target card");
            }
            (device, verdict)
        })
        .collect()
}

/// First qualifying device in enumeration order. Other qualifying devices
/// are logged.
pub fn find_target_card(
    devices: &[BlockDevice],
    excluded_master: Option<&str>,
    spec: &TargetCardSpec,
) -> Result<TargetCard, DiscoveryError> {
    let mut cards = qualifying(devices, excluded_master, spec)?;
    if cards.len() > 1 {
        let names: Vec<_> = cards.iter().map(|card| card.device.as_str()).collect();
        warn!(candidates = ?names, "several target cards qualify; using the first");
    }
    Ok(cards.swap_remove(0))
}

/// Like [`find_target_card`] but refuses to choose between several cards.
pub fn find_unique_target_card(
    devices: &[BlockDevice],
    excluded_master: Option<&str>,
    spec: &TargetCardSpec,
) -> Result<TargetCard, DiscoveryError> {
    let mut cards = qualifying(devices, excluded_master, spec)?;
    if cards.len() > 1 {
        return Err(DiscoveryError::AmbiguousTarget {
            candidates: cards.into_iter().map(|card| card.device).collect(),
        });
    }
    Ok(cards.remove(0))
}

fn qualifying(
    devices: &[BlockDevice],
    excluded_master: Option<&str>,
    spec: &TargetCardSpec,
) -> Result<Vec<TargetCard>, DiscoveryError> {
    let mut cards = Vec::new();
    let mut rejections = Vec::new();
    for (device, verdict) in target_card_candidates(devices, excluded_master, spec) {
        match verdict {
            Ok(card) => cards.push(card),
            Err(rejection) => rejections.push((device.name.clone(), rejection)),
        }
    }
    if cards.is_empty() {
        let expected = spec
            .roles
            .iter()
            .map(|role| format!("{}={}", role.index, role.label))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(DiscoveryError::TargetNotFound { expected, rejections });
    }
    Ok(cards)
}

fn mentions(partition: &Partition, keyword: &str) -> bool {
    let keyword = keyword.to_lowercase();
    [partition.label.as_deref(), partition.mount_point.as_deref()]
        .into_iter()
        .flatten()
        .any(|value| value.to_lowercase().contains(&keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(index: u32, device: &str, label: Option<&str>, mount: Option<&str>) -> Partition {
        Partition {
            index,
            node: format!("/dev/{}{}", device, index),
            label: label.map(str::to_string),
            mount_point: mount.map(str::to_string),
            fs: None,
            size_bytes: 0,
        }
    }

    fn device(name: &str, partitions: Vec<Partition>) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            model: name.to_string(),
            size_bytes: 0,
            removable: true,
            is_system_disk: false,
            partitions,
        }
    }

    fn card(name: &str) -> BlockDevice {
        device(
            name,
            vec![
                part(1, name, Some("rm01rootfs"), None),
                part(2, name, Some("rm01models"), Some("/media/rm01models")),
                part(3, name, Some("rm01app"), None),
            ],
        )
    }

    fn master(name: &str, mount: Option<&str>) -> BlockDevice {
        device(name, vec![part(1, name, Some(MASTER_LABEL), mount)])
    }

    #[test]
    fn master_not_found_without_sentinel_label() {
        let devices = vec![card("sdb"), device("sdc", vec![part(1, "sdc", Some("DATA"), None)])];
        assert!(matches!(
            find_master_disk(&devices),
            Err(DiscoveryError::MasterNotFound { .. })
        ));
    }

    #[test]
    fn master_prefers_mount_point() {
        let devices = vec![card("sdb"), master("sdc", Some("/media/RMinte_Models"))];
        let found = find_master_disk(&devices).unwrap();
        assert_eq!(found.device, "sdc");
        assert_eq!(found.location(), "/media/RMinte_Models");
    }

    #[test]
    fn unmounted_master_reports_device() {
        let devices = vec![master("sdc", None)];
        assert_eq!(find_master_disk(&devices).unwrap().location(), "sdc");
    }

    #[test]
    fn master_first_match_wins() {
        let devices = vec![master("sdc", Some("/a")), master("sdd", Some("/b"))];
        assert_eq!(find_master_disk(&devices).unwrap().device, "sdc");
    }

    #[test]
    fn target_card_found() {
        let devices = vec![master("sdc", Some("/media/m")), card("sdb")];
        let found = find_target_card(&devices, Some("/media/m"), &TargetCardSpec::default()).unwrap();
        assert_eq!(found.device, "sdb");
        assert_eq!(found.mount_point(CardRole::Models), Some("/media/rm01models"));
        assert_eq!(found.partition(CardRole::App).node, "/dev/sdb3");
    }

    #[test]
    fn missing_partition_rejects_device() {
        let mut partial = card("sdb");
        partial.partitions.retain(|p| p.index != 3);
        let err = find_target_card(&[partial], None, &TargetCardSpec::default()).unwrap_err();
        match err {
            DiscoveryError::TargetNotFound { rejections, .. } => {
                assert_eq!(
                    rejections,
                    vec![("sdb".to_string(), Rejection::MissingPartition { index: 3 })]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn master_marker_on_models_partition_rejects() {
        let disguised = device(
            "sdb",
            vec![
                part(1, "sdb", Some("rootfs"), None),
                part(2, "sdb", Some(MASTER_LABEL), None),
                part(3, "sdb", Some("app"), None),
            ],
        );
        assert_eq!(
            evaluate_target(&disguised, &TargetCardSpec::default()),
            Err(Rejection::MasterMarker { index: 2 })
        );
        assert!(find_target_card(&[disguised], None, &TargetCardSpec::default()).is_err());
    }

    #[test]
    fn master_marker_in_models_mount_path_rejects() {
        let remounted_master = device(
            "sdb",
            vec![
                part(1, "sdb", Some("rm01rootfs"), None),
                part(2, "sdb", Some("rm01models"), Some("/media/rminte_models")),
                part(3, "sdb", Some("rm01app"), None),
            ],
        );
        assert_eq!(
            evaluate_target(&remounted_master, &TargetCardSpec::default()),
            Err(Rejection::MasterMarker { index: 2 })
        );

        let upper_label = device(
            "sdc",
            vec![
                part(1, "sdc", Some("rm01rootfs"), None),
                part(2, "sdc", Some("RMINTE-models"), None),
                part(3, "sdc", Some("rm01app"), None),
            ],
        );
        assert_eq!(
            evaluate_target(&upper_label, &TargetCardSpec::default()),
            Err(Rejection::MasterMarker { index: 2 })
        );
    }

    #[test]
    fn mount_path_substitutes_for_label() {
        let remounted = device(
            "sdb",
            vec![
                part(1, "sdb", None, Some("/mnt/ROOTFS")),
                part(2, "sdb", Some("RM01Models"), None),
                part(3, "sdb", Some("other"), Some("/run/media/rm01app")),
            ],
        );
        assert!(evaluate_target(&remounted, &TargetCardSpec::default()).is_ok());
    }

    #[test]
    fn every_role_must_match() {
        let mut wrong = card("sdb");
        wrong.partitions[2].label = Some("data".to_string());
        assert_eq!(
            evaluate_target(&wrong, &TargetCardSpec::default()),
            Err(Rejection::RoleMismatch {
                role: CardRole::App,
                index: 3,
                keyword: "app".to_string()
            })
        );
    }

    #[test]
    fn excluded_master_is_skipped() {
        let devices = vec![card("sdb")];
        let err = find_target_card(&devices, Some("/dev/sdb"), &TargetCardSpec::default()).unwrap_err();
        assert!(err.to_string().contains("sdb: is the master disk"));
    }

    #[test]
    fn first_of_several_cards_wins() {
        let devices = vec![card("sdb"), card("sdd")];
        let found = find_target_card(&devices, None, &TargetCardSpec::default()).unwrap();
        assert_eq!(found.device, "sdb");
    }

    #[test]
    fn unique_lookup_reports_ambiguity() {
        let devices = vec![card("sdb"), card("sdd")];
        match find_unique_target_card(&devices, None, &TargetCardSpec::default()) {
            Err(DiscoveryError::AmbiguousTarget { candidates }) => {
                assert_eq!(candidates, vec!["sdb".to_string(), "sdd".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(
            find_unique_target_card(&devices[..1], None, &TargetCardSpec::default())
                .unwrap()
                .device,
            "sdb"
        );
    }

    #[test]
    fn not_found_message_names_expected_labels() {
        let err = find_target_card(&[], None, &TargetCardSpec::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("1=rm01rootfs, 2=rm01models, 3=rm01app"));
        assert!(message.contains("no devices present"));
    }
}
