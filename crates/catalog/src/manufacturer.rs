use anyhow::{anyhow, Context, Result};
use rmcard_core::ModelEntry;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Folder on the master disk holding one sub-folder per model.
pub const MODELS_DIR: &str = "Models_download";

/// Prefix buckets, tested in this order.
pub const KNOWN_MANUFACTURERS: [&str; 5] = ["Qwen", "GPT", "Llama", "DeepSeek", "Gemma"];
pub const ZHIPU: &str = "ZhipuAI";
pub const OTHERS: &str = "Others";

const ZHIPU_MARKER: &str = "GLM";

/// Buckets offered when browsing models, in display order.
pub fn manufacturer_choices() -> Vec<&'static str> {
    let mut choices = KNOWN_MANUFACTURERS.to_vec();
    choices.push(ZHIPU);
    choices.push(OTHERS);
    choices
}

/// Splits a model folder name into `(manufacturer, model_name)`.
///
/// Rules, first hit wins:
/// 1. a name containing `GLM` (any case) belongs to ZhipuAI, unstripped;
/// 2. a known manufacturer prefix is stripped along with leading `_`/`-`;
/// 3. the name is split on its first `_`, or failing that its first `-`;
/// 4. everything else lands in `Others`.
pub fn classify_manufacturer(folder_name: &str, known: &[&str]) -> (String, String) {
    if folder_name.to_uppercase().contains(ZHIPU_MARKER) {
        return (ZHIPU.to_string(), folder_name.to_string());
    }

    if let Some((prefix, rest)) = known
        .iter()
        .find_map(|prefix| folder_name.strip_prefix(prefix).map(|rest| (*prefix, rest)))
    {
        let rest = rest.trim_start_matches(['_', '-']);
        let model_name = if rest.is_empty() { folder_name } else { rest };
        return (prefix.to_string(), model_name.to_string());
    }

    let split = folder_name
        .split_once('_')
        .or_else(|| folder_name.split_once('-'));
    if let Some((vendor, model)) = split {
        return (vendor.to_string(), model.to_string());
    }

    (OTHERS.to_string(), folder_name.to_string())
}

/// Lists model folders under `<master_root>/Models_download`, sorted by name.
pub fn scan_models(master_root: impl AsRef<Path>) -> Result<Vec<ModelEntry>> {
    let models_path = master_root.as_ref().join(MODELS_DIR);
    if !models_path.is_dir() {
        return Err(anyhow!("{} folder not found: {}", MODELS_DIR, models_path.display()));
    }
    info!(path = %models_path.display(), "scanning model folders");

    let mut models = Vec::new();
    for entry in fs::read_dir(&models_path)
        .with_context(|| format!("read {}", models_path.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let full_name = entry.file_name().to_string_lossy().to_string();
        let (manufacturer, model_name) = classify_manufacturer(&full_name, &KNOWN_MANUFACTURERS);
        debug!(%full_name, %manufacturer, %model_name, "found model");
        models.push(ModelEntry {
            full_name,
            manufacturer,
            model_name,
            path: entry.path(),
        });
    }
    models.sort_by(|a, b| a.full_name.cmp(&b.full_name));
    Ok(models)
}

/// Models in `manufacturer`'s bucket. `Others` collects everything outside
/// the named buckets.
pub fn filter_by_manufacturer<'a>(models: &'a [ModelEntry], manufacturer: &str) -> Vec<&'a ModelEntry> {
    models
        .iter()
        .filter(|model| {
            if manufacturer == OTHERS {
                model.manufacturer != ZHIPU
                    && !KNOWN_MANUFACTURERS.contains(&model.manufacturer.as_str())
            } else {
                model.manufacturer == manufacturer
            }
        })
        .collect()
}
