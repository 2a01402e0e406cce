//! Model catalog on the master disk: manufacturer buckets for model folders
//! and backend selection from the backend manifest.

pub mod backend;
pub mod manufacturer;

pub use backend::{
    auto_detect_backend, load_backend_manifest, manifest_locations, resolve_backend,
    resolve_backend_or_default, Backend, BackendManifest, BackendPatterns, DetectedBackend,
    ManifestError, AUTOSHELL_DIR, DEFAULT_BACKEND, MANIFEST_FILE,
};
pub use manufacturer::{
    classify_manufacturer, filter_by_manufacturer, manufacturer_choices, scan_models,
    KNOWN_MANUFACTURERS, MODELS_DIR, OTHERS, ZHIPU,
};
