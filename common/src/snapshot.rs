//! Snapshot file naming.
//!
//! Files are named `{prefix}_{YYYYmmdd_HHMMSS}.jpg`, e.g.
//! `snapshot_20240224_161937.jpg`.  Resolution is one second, so two
//! captures with the same prefix in the same second share a name and the
//! later one replaces the earlier.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// File name for a snapshot taken at `at`.
///
/// Path separators in the prefix are replaced so a trigger cannot write
/// outside the save directory.
pub fn file_name(prefix: &str, at: NaiveDateTime) -> String {
    let safe: String = prefix
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let safe = if safe == ".." { "__".to_string() } else { safe };
    format!("{safe}_{}.jpg", at.format(TIMESTAMP_FORMAT))
}

/// Output path under `save_dir` for a snapshot taken now.
pub fn output_path(save_dir: &Path, prefix: &str) -> PathBuf {
    save_dir.join(file_name(prefix, Local::now().naive_local()))
}
