use rmcard_core::BlockDevice;

#[derive(Debug, Clone, Default)]
pub struct SafetyContext {
    /// Card readers behind some bridges report fixed media.
    pub allow_non_removable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

pub fn can_write_to_card(
    ctx: &SafetyContext,
    target: &BlockDevice,
    master_device: Option<&str>,
) -> SafetyDecision {
    if target.is_system_disk {
        return SafetyDecision::Deny(format!("Denied: {} holds the running system", target.name));
    }

    if master_device == Some(target.name.as_str()) {
        return SafetyDecision::Deny(format!("Denied: {} is the master disk", target.name));
    }

    if !target.removable && !ctx.allow_non_removable {
        return SafetyDecision::Deny(format!(
            "Denied: {} is not removable media (pass --allow-fixed to override)",
            target.name
        ));
    }

    SafetyDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(removable: bool, is_system_disk: bool) -> BlockDevice {
        BlockDevice {
            name: "sdb".to_string(),
            model: "reader".to_string(),
            size_bytes: 0,
            removable,
            is_system_disk,
            partitions: Vec::new(),
        }
    }

    #[test]
    fn denies_system_disk() {
        let ctx = SafetyContext {
            allow_non_removable: true,
        };
        assert!(matches!(
            can_write_to_card(&ctx, &target(true, true), None),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn denies_master_disk() {
        assert!(matches!(
            can_write_to_card(&SafetyContext::default(), &target(true, false), Some("sdb")),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn denies_fixed_media_without_override() {
        assert!(matches!(
            can_write_to_card(&SafetyContext::default(), &target(false, false), Some("sdc")),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn allows_fixed_media_with_override() {
        let ctx = SafetyContext {
            allow_non_removable: true,
        };
        assert_eq!(
            can_write_to_card(&ctx, &target(false, false), None),
            SafetyDecision::Allow
        );
    }

    #[test]
    fn allows_removable_card() {
        assert_eq!(
            can_write_to_card(&SafetyContext::default(), &target(true, false), Some("sdc")),
            SafetyDecision::Allow
        );
    }
}
