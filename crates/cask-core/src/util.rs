//! Shared helpers: file logging and directory walking.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

pub const LOG_FILE: &str = "cask.log";

fn is_quiet() -> bool {
    if env::var("CASK_QUIET").map(|v| v == "1" || v == "true").unwrap_or(false) {
        return true;
    }
    env::var("CASK_LOG")
        .map(|v| v.to_lowercase() == "quiet" || v.to_lowercase() == "error")
        .unwrap_or(false)
}

fn append_log_line(dir: &Path, line: &str) {
    let path = dir.join(LOG_FILE);
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(f, "{}", line);
    }
}

/// Log a message to stdout (unless quiet) and to the log file in `dir`.
pub fn log(dir: &Path, message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!("[{}] {}", timestamp, message);
    if !is_quiet() {
        println!("{}", line);
    }
    append_log_line(dir, &line);
}

/// Log an error to stderr (always) and to the log file in `dir`.
pub fn log_error(dir: &Path, message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!("[{}] ERROR: {}", timestamp, message);
    eprintln!("{}", line);
    append_log_line(dir, &line);
}

/// Recursively collect regular files under `root` as
/// (relative path with `/` separators, absolute path) pairs.
pub fn walk_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    walk_into(root, root, &mut out)?;
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn walk_into(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_into(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, path));
        }
        // Symlinks are skipped: package contents are materialized files.
    }
    Ok(())
}
