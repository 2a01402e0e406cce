use rmcard_copy::{CopyProgress, CopyStats, ProgressObserver};
use std::io::{self, Write};

/// Single-line percentage bar on stderr.
#[derive(Default)]
pub struct TerminalProgress {
    label: String,
    last_percent: Option<u64>,
}

impl ProgressObserver for TerminalProgress {
    fn on_start(&mut self, label: &str, total_bytes: u64) {
        self.label = label.to_string();
        self.last_percent = None;
        eprint!("\r{}: 0% (0 B / {})", self.label, human_bytes(total_bytes));
    }

    fn on_progress(&mut self, progress: CopyProgress) -> bool {
        let percent = if progress.total_bytes == 0 {
            100
        } else {
            progress.bytes_copied * 100 / progress.total_bytes
        };
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            eprint!(
                "\r{}: {}% ({} / {})",
                self.label,
                percent,
                human_bytes(progress.bytes_copied),
                human_bytes(progress.total_bytes)
            );
            let _ = io::stderr().flush();
        }
        true
    }

    fn on_finish(&mut self, stats: &CopyStats) {
        eprintln!(
            "\r{}: done, {} file(s), {}",
            self.label,
            stats.files,
            human_bytes(stats.bytes)
        );
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
