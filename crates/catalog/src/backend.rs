use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_BACKEND: &str = "FlashAttention";

/// Folder on the master disk holding backend payloads and the manifest.
pub const AUTOSHELL_DIR: &str = "98autoshell";
pub const MANIFEST_FILE: &str = "backend_list.yaml";

/// Backends with a payload on the master disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    FlashAttention,
    FlashInfer,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::FlashAttention, Backend::FlashInfer];

    pub fn name(self) -> &'static str {
        match self {
            Backend::FlashAttention => "FlashAttention",
            Backend::FlashInfer => "FlashInfer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|backend| backend.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Payload folder relative to the master disk root.
    pub fn payload_dir(self) -> PathBuf {
        let leaf = match self {
            Backend::FlashAttention => "Attention",
            Backend::FlashInfer => "Infer",
        };
        Path::new(AUTOSHELL_DIR).join(leaf)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("backend manifest {path} could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend manifest {path} is not valid YAML: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("backend manifest {path} must map backend names to model patterns")]
    NotAMapping { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendPatterns {
    List(Vec<String>),
    /// Patterns separated by commas (ASCII or full-width) or whitespace.
    Delimited(String),
}

impl BackendPatterns {
    pub fn patterns(&self) -> Vec<&str> {
        match self {
            BackendPatterns::List(items) => items
                .iter()
                .map(String::as_str)
                .filter(|item| !item.is_empty())
                .collect(),
            BackendPatterns::Delimited(value) => value
                .split(|c: char| c == ',' || c == '，' || c.is_whitespace())
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

/// Backend name to model patterns, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendManifest {
    entries: Vec<(String, BackendPatterns)>,
}

impl BackendManifest {
    pub fn new(entries: Vec<(String, BackendPatterns)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(String, BackendPatterns)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_value(value: Value) -> Option<Self> {
        let mapping = match value {
            Value::Null => return Some(Self::default()),
            Value::Mapping(mapping) => mapping,
            _ => return None,
        };
        let mut entries = Vec::new();
        for (key, value) in mapping {
            let Some(name) = scalar_string(&key) else {
                debug!(?key, "skipping non-scalar backend name");
                continue;
            };
            let patterns = match value {
                Value::Sequence(items) => {
                    BackendPatterns::List(items.iter().filter_map(scalar_string).collect())
                }
                Value::String(value) => BackendPatterns::Delimited(value),
                other => {
                    debug!(backend = %name, value = ?other, "skipping backend without patterns");
                    continue;
                }
            };
            entries.push((name, patterns));
        }
        Some(Self { entries })
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Reads a manifest. A missing file is `Ok(None)`; an empty file is an
/// empty manifest.
pub fn load_backend_manifest(path: impl AsRef<Path>) -> Result<Option<BackendManifest>, ManifestError> {
    let path = path.as_ref();
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ManifestError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: Value = serde_yaml::from_str(&data).map_err(|source| ManifestError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    BackendManifest::from_value(value)
        .map(Some)
        .ok_or_else(|| ManifestError::NotAMapping {
            path: path.to_path_buf(),
        })
}

fn pattern_matches(model_name: &str, pattern: &str) -> bool {
    model_name == pattern || pattern.contains(model_name) || model_name.contains(pattern)
}

/// First backend whose patterns match `model_name` in either direction.
pub fn resolve_backend<'a>(model_name: &str, manifest: &'a BackendManifest) -> Option<&'a str> {
    if model_name.is_empty() {
        return None;
    }
    manifest
        .entries()
        .iter()
        .find(|(_, patterns)| {
            patterns
                .patterns()
                .into_iter()
                .any(|pattern| pattern_matches(model_name, pattern))
        })
        .map(|(backend, _)| backend.as_str())
}

pub fn resolve_backend_or_default(model_name: &str, manifest: Option<&BackendManifest>) -> String {
    manifest
        .and_then(|manifest| resolve_backend(model_name, manifest))
        .unwrap_or(DEFAULT_BACKEND)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedBackend {
    pub name: String,
    /// Manifest that produced the match; `None` means the default was used.
    pub manifest: Option<PathBuf>,
}

/// Manifest locations in lookup order: the master disk first, then the
/// target card's models partition when it is mounted.
pub fn manifest_locations(master_root: &Path, card_models_mount: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![master_root.join(AUTOSHELL_DIR).join(MANIFEST_FILE)];
    if let Some(mount) = card_models_mount {
        paths.push(mount.join(AUTOSHELL_DIR).join(MANIFEST_FILE));
    }
    debug!(?paths, "manifest lookup order");
    paths
}

/// Tries each manifest in turn. Unreadable manifests are logged and
/// skipped; no match anywhere yields the default backend.
pub fn auto_detect_backend(model_name: &str, manifest_paths: &[PathBuf]) -> DetectedBackend {
    for path in manifest_paths {
        match load_backend_manifest(path) {
            Ok(Some(manifest)) => {
                if let Some(name) = resolve_backend(model_name, &manifest) {
                    info!(model = %model_name, backend = %name, manifest = %path.display(), "backend detected");
                    return DetectedBackend {
                        name: name.to_string(),
                        manifest: Some(path.clone()),
                    };
                }
                debug!(model = %model_name, manifest = %path.display(), "no manifest entry matches");
            }
            Ok(None) => debug!(manifest = %path.display(), "manifest not present"),
            Err(err) => warn!(error = %err, "ignoring backend manifest"),
        }
    }
    info!(model = %model_name, backend = DEFAULT_BACKEND, "no manifest match, using default backend");
    DetectedBackend {
        name: DEFAULT_BACKEND.to_string(),
        manifest: None,
    }
}
