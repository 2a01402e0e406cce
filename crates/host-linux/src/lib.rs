use anyhow::{Context, Result};
use rmcard_core::{BlockDevice, DeviceInventory, HostInfo, InventorySource, Partition};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Device inventory backed by sysfs, the mount table and udev's label links.
#[derive(Debug, Clone)]
pub struct LinuxInventory {
    pub sysfs_block: PathBuf,
    pub mounts_file: PathBuf,
    pub by_label_dir: PathBuf,
}

impl Default for LinuxInventory {
    fn default() -> Self {
        Self {
            sysfs_block: PathBuf::from("/sys/block"),
            mounts_file: PathBuf::from("/proc/self/mounts"),
            by_label_dir: PathBuf::from("/dev/disk/by-label"),
        }
    }
}

impl InventorySource for LinuxInventory {
    fn snapshot(&self) -> Result<DeviceInventory> {
        let host = HostInfo {
            os: "linux".to_string(),
            os_version: read_os_release(),
            machine: read_machine(),
        };
        let devices = self.enumerate_devices()?;
        debug!(count = devices.len(), "enumerated block devices");
        Ok(DeviceInventory::new(host, devices))
    }
}

pub fn build_device_inventory() -> Result<DeviceInventory> {
    LinuxInventory::default().snapshot()
}

impl LinuxInventory {
    fn enumerate_devices(&self) -> Result<Vec<BlockDevice>> {
        let mounts = read_mounts(&self.mounts_file);
        let labels = read_labels(&self.by_label_dir);
        let mut devices = Vec::new();
        let entries = fs::read_dir(&self.sysfs_block)
            .with_context(|| format!("read {}", self.sysfs_block.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_virtual_disk(&name, &entry.path()) {
                debug!(device = %name, "skipping virtual disk");
                continue;
            }
            let size_bytes = read_u64(entry.path().join("size"))
                .map(|sectors| sectors.saturating_mul(512))
                .unwrap_or(0);
            let removable = read_u64(entry.path().join("removable")).unwrap_or(0) == 1;
            let model = read_string(entry.path().join("device/model"))
                .unwrap_or_else(|| name.clone());
            let partitions = enumerate_partitions(&entry.path(), &mounts, &labels)?;
            let is_system_disk = partitions
                .iter()
                .any(|partition| partition.mount_point.as_deref() == Some("/"));
            devices.push(BlockDevice {
                name,
                model,
                size_bytes,
                removable,
                is_system_disk,
                partitions,
            });
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }
}

fn enumerate_partitions(
    disk_path: &Path,
    mounts: &HashMap<String, Vec<MountInfo>>,
    labels: &HashMap<String, String>,
) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    let entries = fs::read_dir(disk_path)
        .with_context(|| format!("read {}", disk_path.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(index) = read_u64(path.join("partition")) else {
            continue;
        };
        let part_name = entry.file_name().to_string_lossy().to_string();
        let size_bytes = read_u64(path.join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let mount = mounts.get(&part_name).and_then(|infos| infos.first());
        partitions.push(Partition {
            index: index as u32,
            node: format!("/dev/{}", part_name),
            label: labels.get(&part_name).cloned(),
            mount_point: mount.map(|info| info.mount_point.clone()),
            fs: mount.map(|info| info.fs_type.clone()),
            size_bytes,
        });
    }
    partitions.sort_by_key(|partition| partition.index);
    Ok(partitions)
}

#[derive(Debug, Clone)]
struct MountInfo {
    mount_point: String,
    fs_type: String,
}

fn read_mounts(path: &Path) -> HashMap<String, Vec<MountInfo>> {
    let mut mounts: HashMap<String, Vec<MountInfo>> = HashMap::new();
    let data = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "mount table unreadable; partitions will show as unmounted");
            return mounts;
        }
    };
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fs_type)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Some(name) = device.strip_prefix("/dev/") else {
            continue;
        };
        let name = name.rsplit('/').next().unwrap_or("");
        if name.is_empty() {
            continue;
        }
        mounts.entry(name.to_string()).or_default().push(MountInfo {
            mount_point: unescape_mount(mount_point),
            fs_type: fs_type.to_string(),
        });
    }
    mounts
}

fn read_labels(dir: &Path) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                if let Some(name) = target.file_name().and_then(|v| v.to_str()) {
                    let label = decode_udev_label(&entry.file_name().to_string_lossy());
                    labels.insert(name.to_string(), label);
                }
            }
        }
    }
    labels
}

/// udev escapes unsafe label bytes as `\xNN`.
fn decode_udev_label(value: &str) -> String {
    let mut bytes = Vec::with_capacity(value.len());
    let raw = value.as_bytes();
    let mut idx = 0;
    while idx < raw.len() {
        if raw[idx] == b'\\' && idx + 4 <= raw.len() && raw[idx + 1] == b'x' {
            let decoded = std::str::from_utf8(&raw[idx + 2..idx + 4])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                bytes.push(byte);
                idx += 4;
                continue;
            }
        }
        bytes.push(raw[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&bytes).to_string()
}

fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut octal = String::new();
        while octal.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    octal.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&octal, 8) {
            Ok(byte) if octal.len() == 3 => output.push(byte as char),
            _ => {
                output.push('\\');
                output.push_str(&octal);
            }
        }
    }
    output
}

fn read_os_release() -> String {
    let data = fs::read_to_string("/etc/os-release").unwrap_or_default();
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        if let Some(value) = line.strip_prefix("NAME=") {
            name.get_or_insert_with(|| value.trim().trim_matches('"').to_string());
        } else if let Some(value) = line.strip_prefix("VERSION=") {
            version.get_or_insert_with(|| value.trim().trim_matches('"').to_string());
        }
    }
    match (name, version) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => "unknown".to_string(),
    }
}

fn read_machine() -> String {
    let vendor = read_string("/sys/devices/virtual/dmi/id/sys_vendor");
    let product = read_string("/sys/devices/virtual/dmi/id/product_name");
    match (vendor, product) {
        (Some(vendor), Some(product)) => format!("{} {}", vendor, product),
        (Some(vendor), None) => vendor,
        (None, Some(product)) => product,
        _ => read_string("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".to_string()),
    }
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

fn is_virtual_disk(name: &str, path: &Path) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return true;
    }
    if let Ok(target) = fs::canonicalize(path.join("device")) {
        if target.to_string_lossy().contains("/virtual/") {
            return true;
        }
    }
    false
}

const UMOUNT_TIMEOUT: Duration = Duration::from_secs(10);
const UDISKS_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct UnmountOutcome {
    pub node: String,
    pub mount_point: String,
    pub result: Result<(), String>,
}

/// Unmounts every mounted partition of `device`. Failures are collected,
/// not propagated, so the remaining partitions still get a chance.
pub fn unmount_partitions(device: &BlockDevice) -> Vec<UnmountOutcome> {
    let mut outcomes = Vec::new();
    for partition in &device.partitions {
        let Some(mount_point) = &partition.mount_point else {
            continue;
        };
        let result = run_umount(&partition.node);
        match &result {
            Ok(()) => info!(node = %partition.node, "unmounted"),
            Err(reason) => warn!(node = %partition.node, %reason, "unmount failed"),
        }
        outcomes.push(UnmountOutcome {
            node: partition.node.clone(),
            mount_point: mount_point.clone(),
            result,
        });
    }
    outcomes
}

fn run_umount(node: &str) -> Result<(), String> {
    match run_with_timeout("umount", &[node], UMOUNT_TIMEOUT) {
        Ok(()) => Ok(()),
        Err(reason) => {
            debug!(node, %reason, "umount failed, trying udisksctl");
            run_with_timeout("udisksctl", &["unmount", "-b", node], UDISKS_TIMEOUT)
                .map_err(|fallback| format!("{}; udisksctl: {}", reason, fallback))
        }
    }
}

/// Runs `program` and waits at most `timeout`; a child still running after
/// that is killed.
fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<(), String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| format!("failed to run {}: {}", program, err))?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("{} timed out after {}s", program, timeout.as_secs_f32()));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => return Err(format!("failed to wait for {}: {}", program, err)),
        }
    }
    let output = child
        .wait_with_output()
        .map_err(|err| format!("failed to collect {} output: {}", program, err))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            Err(format!("{} exited with {}", program, output.status))
        } else {
            Err(stderr)
        }
    }
}

/// True when the effective user is root. Writing the rootfs partition and
/// unmounting usually need it.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn write(path: PathBuf, data: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn fake_host() -> (TempDir, LinuxInventory) {
        let dir = TempDir::new().unwrap();
        let block = dir.path().join("block");
        write(block.join("sdb/size"), "1000");
        write(block.join("sdb/removable"), "1");
        write(block.join("sdb/device/model"), "CFexpress Reader ");
        for (index, part) in [(3, "sdb3"), (1, "sdb1"), (2, "sdb2")] {
            write(block.join("sdb").join(part).join("partition"), &index.to_string());
            write(block.join("sdb").join(part).join("size"), "10");
        }
        write(block.join("sda/size"), "2000");
        write(block.join("sda/removable"), "0");
        write(block.join("sda/sda1/partition"), "1");
        write(block.join("loop0/size"), "8");

        let mounts = dir.path().join("mounts");
        write(
            mounts.clone(),
            "/dev/sda1 / ext4 rw 0 0\n\
             /dev/sdb2 /media/user/rm01\\040models ext4 rw 0 0\n\
             tmpfs /tmp tmpfs rw 0 0\n",
        );

        let labels = dir.path().join("by-label");
        fs::create_dir_all(&labels).unwrap();
        symlink("../../sdb1", labels.join("rm01rootfs")).unwrap();
        symlink("../../sdb2", labels.join("rm01models")).unwrap();
        symlink("../../sdb3", labels.join("rm01\\x20app")).unwrap();

        let inventory = LinuxInventory {
            sysfs_block: block,
            mounts_file: mounts,
            by_label_dir: labels,
        };
        (dir, inventory)
    }

    #[test]
    fn enumerates_partitions_with_labels_and_mounts() {
        let (_dir, source) = fake_host();
        let inventory = source.snapshot().unwrap();
        let names: Vec<_> = inventory.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["sda", "sdb"]);

        let card = inventory.device("sdb").unwrap();
        assert!(card.removable);
        assert!(!card.is_system_disk);
        assert_eq!(card.model, "CFexpress Reader");
        assert_eq!(card.size_bytes, 512_000);
        let indices: Vec<_> = card.partitions.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);

        let models = card.partition(2).unwrap();
        assert_eq!(models.node, "/dev/sdb2");
        assert_eq!(models.label.as_deref(), Some("rm01models"));
        assert_eq!(models.mount_point.as_deref(), Some("/media/user/rm01 models"));
        assert_eq!(models.fs.as_deref(), Some("ext4"));
        assert_eq!(card.partition(3).unwrap().label.as_deref(), Some("rm01 app"));
        assert!(card.partition(1).unwrap().mount_point.is_none());
    }

    #[test]
    fn marks_system_disk() {
        let (_dir, source) = fake_host();
        let inventory = source.snapshot().unwrap();
        assert!(inventory.device("sda").unwrap().is_system_disk);
    }

    #[test]
    fn unescapes_octal_mount_paths() {
        assert_eq!(unescape_mount("/mnt/a\\040b"), "/mnt/a b");
        assert_eq!(unescape_mount("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape_mount("/mnt/bad\\9"), "/mnt/bad\\9");
    }

    #[test]
    fn decodes_udev_labels() {
        assert_eq!(decode_udev_label("RMinte_Models"), "RMinte_Models");
        assert_eq!(decode_udev_label("my\\x20disk"), "my disk");
        assert_eq!(decode_udev_label("trailing\\x"), "trailing\\x");
    }

    #[test]
    fn mount_table_with_invalid_utf8_keeps_other_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mounts");
        let mut data = b"/dev/sdc1 /media/caf\xe9 vfat rw 0 0\n".to_vec();
        data.extend_from_slice(b"/dev/sdb2 /media/rm01models ext4 rw 0 0\n");
        fs::write(&path, data).unwrap();

        let mounts = read_mounts(&path);
        assert_eq!(mounts["sdb2"][0].mount_point, "/media/rm01models");
        assert!(mounts["sdc1"][0].mount_point.starts_with("/media/caf"));
    }

    #[test]
    fn missing_mount_table_yields_no_mounts() {
        let dir = TempDir::new().unwrap();
        assert!(read_mounts(&dir.path().join("absent")).is_empty());
    }

    #[test]
    fn command_runner_reports_status_and_stderr() {
        assert_eq!(run_with_timeout("true", &[], Duration::from_secs(5)), Ok(()));
        let err = run_with_timeout("sh", &["-c", "echo busy >&2; exit 32"], Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, "busy");
        assert!(run_with_timeout("rmcard-no-such-tool", &[], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn hung_command_is_killed() {
        let started = Instant::now();
        let err = run_with_timeout("sleep", &["30"], Duration::from_millis(200)).unwrap_err();
        assert!(err.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn root_check_matches_effective_uid() {
        let status = fs::read_to_string("/proc/self/status").unwrap();
        let euid = status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|ids| ids.split_whitespace().nth(1))
            .unwrap();
        assert_eq!(running_as_root(), euid == "0");
    }
}
