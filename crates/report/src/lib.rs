use anyhow::{Context, Result};
use rmcard_core::{now_utc_rfc3339, DeviceInventory, INVENTORY_SCHEMA_VERSION};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub inventory_json: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata {
    run_id: String,
    created_at_utc: String,
    inventory_schema_version: String,
    inventory_id: String,
    meta: Option<Value>,
}

/// Writes `reports/<run_id>/` under `base` with the device snapshot, the run
/// metadata and the step log.
pub fn create_report_bundle(
    base: impl AsRef<Path>,
    inventory: &DeviceInventory,
    meta: Option<Value>,
    logs: Option<&str>,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let root = base.as_ref().join("reports").join(&run_id);
    fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let inventory_json = root.join("inventory.json");
    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    fs::write(&inventory_json, serde_json::to_string_pretty(inventory)?)?;

    let run_meta = RunMetadata {
        run_id: run_id.clone(),
        created_at_utc: now_utc_rfc3339(),
        inventory_schema_version: INVENTORY_SCHEMA_VERSION.to_string(),
        inventory_id: inventory.inventory_id.to_string(),
        meta,
    };
    fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)?;
    fs::write(&logs_path, logs.unwrap_or(""))?;

    Ok(ReportPaths {
        run_id,
        root,
        inventory_json,
        run_json,
        logs_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcard_core::HostInfo;
    use tempfile::TempDir;

    #[test]
    fn writes_bundle() {
        let dir = TempDir::new().unwrap();
        let inventory = DeviceInventory::new(
            HostInfo {
                os: "linux".to_string(),
                os_version: "test".to_string(),
                machine: "bench".to_string(),
            },
            Vec::new(),
        );
        let meta = serde_json::json!({ "model": "Qwen_3-8B" });
        let paths = create_report_bundle(dir.path(), &inventory, Some(meta), Some("step=model")).unwrap();

        assert!(paths.root.starts_with(dir.path().join("reports")));
        let run: Value = serde_json::from_str(&fs::read_to_string(&paths.run_json).unwrap()).unwrap();
        assert_eq!(run["meta"]["model"], "Qwen_3-8B");
        assert_eq!(run["inventory_id"], inventory.inventory_id.to_string());
        assert_eq!(fs::read_to_string(&paths.logs_path).unwrap(), "step=model");
        assert!(paths.inventory_json.is_file());
    }
}
