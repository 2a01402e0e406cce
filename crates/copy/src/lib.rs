use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("source does not exist: {}", .path.display())]
    SourceMissing { path: PathBuf },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("copy cancelled at {}", .path.display())]
    Cancelled { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyProgress {
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub files_copied: usize,
    pub total_files: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

/// Receives byte-level progress. Returning `false` from `on_progress`
/// cancels the copy.
pub trait ProgressObserver {
    fn on_start(&mut self, _label: &str, _total_bytes: u64) {}
    fn on_progress(&mut self, progress: CopyProgress) -> bool;
    fn on_finish(&mut self, _stats: &CopyStats) {}
}

/// Observer that ignores progress.
#[derive(Debug, Default)]
pub struct Silent;

impl ProgressObserver for Silent {
    fn on_progress(&mut self, _progress: CopyProgress) -> bool {
        true
    }
}

struct PlannedFile {
    source: PathBuf,
    dest: PathBuf,
    size: u64,
}

/// Copies a file, or a directory tree, from `source` to `dest`. Existing
/// files at the destination are overwritten; nothing is removed.
pub fn copy_path(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    label: &str,
    observer: &mut dyn ProgressObserver,
) -> Result<CopyStats, CopyError> {
    let source = source.as_ref();
    let dest = dest.as_ref();
    let metadata = fs::metadata(source).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => CopyError::SourceMissing {
            path: source.to_path_buf(),
        },
        _ => io_error(source, err),
    })?;

    let plan = if metadata.is_dir() {
        plan_tree(source, dest)?
    } else {
        vec![PlannedFile {
            source: source.to_path_buf(),
            dest: dest.to_path_buf(),
            size: metadata.len(),
        }]
    };

    let total_bytes = plan.iter().map(|file| file.size).sum();
    let mut progress = CopyProgress {
        bytes_copied: 0,
        total_bytes,
        files_copied: 0,
        total_files: plan.len(),
    };
    debug!(source = %source.display(), dest = %dest.display(), files = plan.len(), total_bytes, "copy start");
    observer.on_start(label, total_bytes);

    let mut buffer = vec![0u8; CHUNK_SIZE];
    for file in &plan {
        copy_file(file, &mut buffer, &mut progress, observer)?;
        progress.files_copied += 1;
    }

    let stats = CopyStats {
        files: progress.files_copied,
        bytes: progress.bytes_copied,
    };
    observer.on_finish(&stats);
    Ok(stats)
}

/// Like [`copy_path`], but removes whatever is at `dest` first.
pub fn replace_path(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    label: &str,
    observer: &mut dyn ProgressObserver,
) -> Result<CopyStats, CopyError> {
    let source = source.as_ref();
    let dest = dest.as_ref();
    if !source.exists() {
        return Err(CopyError::SourceMissing {
            path: source.to_path_buf(),
        });
    }
    if let Ok(metadata) = fs::symlink_metadata(dest) {
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(dest)
        } else {
            fs::remove_file(dest)
        };
        removed.map_err(|err| io_error(dest, err))?;
        debug!(dest = %dest.display(), "removed previous copy");
    }
    copy_path(source, dest, label, observer)
}

fn plan_tree(source: &Path, dest: &Path) -> Result<Vec<PlannedFile>, CopyError> {
    fs::create_dir_all(dest).map_err(|err| io_error(dest, err))?;
    let mut plan = Vec::new();
    // Linked files are copied as their contents; model downloads often
    // point into a blob store.
    for entry in WalkDir::new(source)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .unwrap_or(entry.path());
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|err| io_error(&target, err))?;
        } else if entry.file_type().is_file() {
            let size = entry.metadata()?.len();
            plan.push(PlannedFile {
                source: entry.path().to_path_buf(),
                dest: target,
                size,
            });
        }
    }
    Ok(plan)
}

fn copy_file(
    file: &PlannedFile,
    buffer: &mut [u8],
    progress: &mut CopyProgress,
    observer: &mut dyn ProgressObserver,
) -> Result<(), CopyError> {
    if let Some(parent) = file.dest.parent() {
        fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
    }
    let mut reader = BufReader::new(File::open(&file.source).map_err(|err| io_error(&file.source, err))?);
    let mut writer = BufWriter::new(File::create(&file.dest).map_err(|err| io_error(&file.dest, err))?);
    loop {
        let read = reader.read(buffer).map_err(|err| io_error(&file.source, err))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|err| io_error(&file.dest, err))?;
        progress.bytes_copied += read as u64;
        if !observer.on_progress(*progress) {
            return Err(CopyError::Cancelled {
                path: file.source.clone(),
            });
        }
    }
    writer.flush().map_err(|err| io_error(&file.dest, err))?;
    Ok(())
}

fn io_error(path: &Path, source: io::Error) -> CopyError {
    CopyError::Io {
        path: path.to_path_buf(),
        source,
    }
}
