use anyhow::{anyhow, Context, Result};
use rmcard_catalog::{auto_detect_backend, manifest_locations, Backend};
use rmcard_classifier::TargetCard;
use rmcard_copy::{copy_path, replace_path, CopyStats, ProgressObserver};
use rmcard_core::{CardRole, DeviceInventory, ModelEntry};
use rmcard_report::{create_report_bundle, ReportPaths};
use rmcard_safety::{can_write_to_card, SafetyContext, SafetyDecision};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Backend payload location on the rootfs partition.
pub const BACKEND_TARGET: &str = "home/rm01/autoShell";
/// Model folders land here on the models partition.
pub const MODEL_TARGET: &str = "llm";
pub const DEV_YAML_DIR: &str = "Model_dev_yaml";
pub const DEV_TARGET: &str = "dev";
pub const FUSED_MOE_DIR: &str = "fused_moe";
pub const FUSED_MOE_TARGET: &str = "home/rm01/miniconda3/envs/vllm/lib/python3.12/site-packages/vllm/model_executor/layers/fused_moe/configs";

/// Dev-mode launch files and the sub-folder of `dev/` each one goes to.
pub const DEV_CONFIG_FILES: [(&str, &str); 3] = [
    ("embedding_run.yaml", "embedding"),
    ("llm_run.yaml", "llm"),
    ("reranker_run.yaml", "reranker"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vram {
    #[serde(rename = "32G")]
    G32,
    #[serde(rename = "48G")]
    G48,
    #[serde(rename = "64G")]
    G64,
    #[serde(rename = "128G")]
    G128,
}

impl Vram {
    pub const ALL: [Vram; 4] = [Vram::G32, Vram::G48, Vram::G64, Vram::G128];

    pub fn as_str(self) -> &'static str {
        match self {
            Vram::G32 => "32G",
            Vram::G48 => "48G",
            Vram::G64 => "64G",
            Vram::G128 => "128G",
        }
    }

    /// Hardware platform whose fused-MoE tuning applies.
    pub fn platform(self) -> &'static str {
        match self {
            Vram::G128 => "Thor",
            _ => "Orin",
        }
    }
}

impl fmt::Display for Vram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vram {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_uppercase();
        let value = value.strip_suffix('B').unwrap_or(&value);
        Vram::ALL
            .into_iter()
            .find(|vram| vram.as_str() == value || vram.as_str().trim_end_matches('G') == value)
            .ok_or_else(|| anyhow!("unsupported VRAM size: {} (expected 32G, 48G, 64G or 128G)", value))
    }
}

/// Result of a multi-item copy where individual items may be absent or fail.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub copied: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub bytes: u64,
}

impl BatchOutcome {
    pub fn warning_count(&self) -> usize {
        self.missing.len() + self.failed.len()
    }

    fn finish(self, what: &str) -> Result<Self> {
        if self.copied.is_empty() {
            return Err(anyhow!(
                "no {} copied ({} missing, {} failed)",
                what,
                self.missing.len(),
                self.failed.len()
            ));
        }
        if self.warning_count() > 0 {
            warn!(
                copied = self.copied.len(),
                warnings = self.warning_count(),
                "{} partially copied",
                what
            );
        }
        Ok(self)
    }
}

/// Mount point of `role`, which must be mounted before anything is written.
pub fn role_mount(card: &TargetCard, role: CardRole) -> Result<PathBuf> {
    card.mount_point(role).map(PathBuf::from).ok_or_else(|| {
        anyhow!(
            "{} partition {} of {} is not mounted; mount it and retry",
            role,
            card.partition(role).node,
            card.device
        )
    })
}

/// Replaces `<rootfs>/home/rm01/autoShell` with the backend payload.
pub fn copy_backend(
    master_root: &Path,
    backend: Backend,
    rootfs_mount: &Path,
    observer: &mut dyn ProgressObserver,
) -> Result<CopyStats> {
    let source = master_root.join(backend.payload_dir());
    let dest = rootfs_mount.join(BACKEND_TARGET);
    info!(%backend, source = %source.display(), dest = %dest.display(), "copying backend");
    let stats = replace_path(&source, &dest, &format!("backend {}", backend), observer)
        .with_context(|| format!("copy backend {}", backend))?;
    Ok(stats)
}

/// Copies the model folder to `<models>/llm/<full_name>`.
pub fn copy_model(
    model: &ModelEntry,
    models_mount: &Path,
    observer: &mut dyn ProgressObserver,
) -> Result<CopyStats> {
    let dest = models_mount.join(MODEL_TARGET).join(&model.full_name);
    info!(model = %model.full_name, source = %model.path.display(), dest = %dest.display(), "copying model");
    let stats = copy_path(&model.path, &dest, &format!("model {}", model.full_name), observer)
        .with_context(|| format!("copy model {}", model.full_name))?;
    Ok(stats)
}

/// Copies the three dev-mode launch files for `full_name` at `vram`.
/// Some files may be absent; none at all is an error.
pub fn copy_dev_configs(
    master_root: &Path,
    vram: Vram,
    full_name: &str,
    models_mount: &Path,
    observer: &mut dyn ProgressObserver,
) -> Result<BatchOutcome> {
    let source_dir = master_root.join(DEV_YAML_DIR).join(vram.as_str()).join(full_name);
    if !source_dir.is_dir() {
        return Err(anyhow!("dev config folder not found: {}", source_dir.display()));
    }
    info!(%vram, source = %source_dir.display(), "copying dev configs");

    let mut outcome = BatchOutcome::default();
    for (file, target_dir) in DEV_CONFIG_FILES {
        let source = source_dir.join(file);
        if !source.is_file() {
            warn!(file, "dev config missing, skipping");
            outcome.missing.push(file.to_string());
            continue;
        }
        let dest = models_mount.join(DEV_TARGET).join(target_dir).join(file);
        match copy_path(&source, &dest, file, observer) {
            Ok(stats) => {
                outcome.bytes += stats.bytes;
                outcome.copied.push(file.to_string());
            }
            Err(err) => {
                warn!(file, error = %err, "dev config copy failed");
                outcome.failed.push((file.to_string(), err.to_string()));
            }
        }
    }
    outcome.finish("dev configs")
}

/// Copies every entry of `fused_moe/<platform>/<full_name>` into vLLM's
/// fused-MoE config folder on the rootfs partition.
pub fn copy_fused_moe(
    master_root: &Path,
    vram: Vram,
    full_name: &str,
    rootfs_mount: &Path,
    observer: &mut dyn ProgressObserver,
) -> Result<BatchOutcome> {
    let source_dir = master_root
        .join(FUSED_MOE_DIR)
        .join(vram.platform())
        .join(full_name);
    if !source_dir.is_dir() {
        return Err(anyhow!("fused MoE config folder not found: {}", source_dir.display()));
    }
    let dest_dir = rootfs_mount.join(FUSED_MOE_TARGET);
    fs::create_dir_all(&dest_dir).with_context(|| format!("create {}", dest_dir.display()))?;
    info!(platform = vram.platform(), source = %source_dir.display(), "copying fused MoE configs");

    let mut entries = fs::read_dir(&source_dir)
        .with_context(|| format!("read {}", source_dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut outcome = BatchOutcome::default();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let item_label = if entry.path().is_dir() { format!("{}/", name) } else { name.clone() };
        match copy_path(entry.path(), dest_dir.join(&name), &item_label, observer) {
            Ok(stats) => {
                outcome.bytes += stats.bytes;
                outcome.copied.push(item_label);
            }
            Err(err) => {
                warn!(item = %item_label, error = %err, "fused MoE copy failed");
                outcome.failed.push((item_label, err.to_string()));
            }
        }
    }
    outcome.finish("fused MoE configs")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Manual(Backend),
    Auto,
}

#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub master_root: PathBuf,
    pub master_device: Option<String>,
    pub card: TargetCard,
    pub model: ModelEntry,
    pub backend: BackendChoice,
    /// Dev configs are staged when set.
    pub vram: Option<Vram>,
    /// Needs `vram`, which picks the platform.
    pub fused_moe: bool,
    pub safety: SafetyContext,
    pub report_base: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Completed { files: usize, bytes: u64 },
    Partial { copied: usize, warnings: usize, bytes: u64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(flatten)]
    pub status: StepStatus,
}

#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub backend: Backend,
    pub backend_manifest: Option<PathBuf>,
    pub steps: Vec<StepRecord>,
    pub report: Option<ReportPaths>,
}

impl ProvisionOutcome {
    pub fn has_warnings(&self) -> bool {
        self.steps
            .iter()
            .any(|step| !matches!(step.status, StepStatus::Completed { .. }))
    }
}

/// Runs the whole provisioning sequence against a card present in
/// `inventory`. Backend and model failures stop the run; dev and fused-MoE
/// config failures are recorded and the run continues.
pub fn run_provision(
    plan: &ProvisionPlan,
    inventory: &DeviceInventory,
    observer: &mut dyn ProgressObserver,
) -> Result<ProvisionOutcome> {
    if plan.fused_moe && plan.vram.is_none() {
        return Err(anyhow!("fused MoE configs need a VRAM size"));
    }
    let device = inventory
        .device(&plan.card.device)
        .ok_or_else(|| anyhow!("target card {} is no longer present", plan.card.device))?;
    match can_write_to_card(&plan.safety, device, plan.master_device.as_deref()) {
        SafetyDecision::Allow => {}
        SafetyDecision::Deny(reason) => return Err(anyhow!(reason)),
    }

    let rootfs = role_mount(&plan.card, CardRole::Rootfs)?;
    let models = role_mount(&plan.card, CardRole::Models)?;

    let mut logs = vec![
        "workflow=provision-card".to_string(),
        format!("target_card={}", plan.card.device),
        format!("master_root={}", plan.master_root.display()),
        format!("model={}", plan.model.full_name),
    ];

    let (backend, backend_manifest) = match plan.backend {
        BackendChoice::Manual(backend) => (backend, None),
        BackendChoice::Auto => {
            let paths = manifest_locations(&plan.master_root, Some(&models));
            let detected = auto_detect_backend(&plan.model.model_name, &paths);
            let backend = Backend::from_name(&detected.name).ok_or_else(|| {
                anyhow!("backend {} has no payload on the master disk", detected.name)
            })?;
            (backend, detected.manifest)
        }
    };
    logs.push(format!("backend={}", backend));

    let mut steps = Vec::new();

    let stats = copy_backend(&plan.master_root, backend, &rootfs, observer)?;
    steps.push(completed("backend", stats));
    logs.push(format!("copied_backend_bytes={}", stats.bytes));

    let stats = copy_model(&plan.model, &models, observer)?;
    steps.push(completed("model", stats));
    logs.push(format!("copied_model_bytes={}", stats.bytes));

    if let Some(vram) = plan.vram {
        let record = batch_record(
            "dev_configs",
            copy_dev_configs(&plan.master_root, vram, &plan.model.full_name, &models, observer),
        );
        logs.push(format!("dev_configs={:?}", record.status));
        steps.push(record);

        if plan.fused_moe {
            let record = batch_record(
                "fused_moe",
                copy_fused_moe(&plan.master_root, vram, &plan.model.full_name, &rootfs, observer),
            );
            logs.push(format!("fused_moe={:?}", record.status));
            steps.push(record);
        }
    }

    let report = match &plan.report_base {
        Some(base) => {
            let meta = serde_json::json!({
                "workflow": "provision-card",
                "target_card": plan.card.device,
                "model": plan.model.full_name,
                "manufacturer": plan.model.manufacturer,
                "backend": backend.name(),
                "backend_manifest": backend_manifest.as_ref().map(|p| p.display().to_string()),
                "vram": plan.vram.map(Vram::as_str),
                "steps": steps,
            });
            Some(create_report_bundle(base, inventory, Some(meta), Some(&logs.join("\n")))?)
        }
        None => None,
    };

    info!(card = %plan.card.device, model = %plan.model.full_name, %backend, "provisioning finished");
    Ok(ProvisionOutcome {
        backend,
        backend_manifest,
        steps,
        report,
    })
}

fn completed(step: &str, stats: CopyStats) -> StepRecord {
    StepRecord {
        step: step.to_string(),
        status: StepStatus::Completed {
            files: stats.files,
            bytes: stats.bytes,
        },
    }
}

fn batch_record(step: &str, result: Result<BatchOutcome>) -> StepRecord {
    let status = match result {
        Ok(outcome) if outcome.warning_count() == 0 => StepStatus::Completed {
            files: outcome.copied.len(),
            bytes: outcome.bytes,
        },
        Ok(outcome) => StepStatus::Partial {
            copied: outcome.copied.len(),
            warnings: outcome.warning_count(),
            bytes: outcome.bytes,
        },
        Err(err) => {
            warn!(step, error = %format!("{err:#}"), "step failed, continuing");
            StepStatus::Failed {
                reason: format!("{err:#}"),
            }
        }
    };
    StepRecord {
        step: step.to_string(),
        status,
    }
}
