//! The `--status` command: report the outcome of the most recent run.
//!
//! Reads the last line of the newest `autorep-*` log file, which is the
//! summary the driver writes on every exit path.

use crate::logging::log_files_newest_first;
use std::path::{Path, PathBuf};
use xync_core::RawConfig;

/// Print the last status line. Returns the process exit code.
pub fn print_status(config_file: Option<&Path>, json: bool) -> i32 {
    let raw = match RawConfig::load(config_file) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("xync: {err}");
            return 1;
        }
    };
    let Some(base) = raw.get("LOG_BASE") else {
        eprintln!("xync: LOG_BASE is not configured; no status available");
        return 1;
    };

    match last_status_line(Path::new(base)) {
        Ok(Some((path, line))) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "log": path.display().to_string(), "status": line })
                );
            } else {
                println!("{line}");
            }
            0
        }
        Ok(None) => {
            eprintln!("xync: no log files found in {base}");
            1
        }
        Err(err) => {
            eprintln!("xync: {err}");
            1
        }
    }
}

/// The newest log file and its final non-empty line.
fn last_status_line(base: &Path) -> anyhow::Result<Option<(PathBuf, String)>> {
    let logs = log_files_newest_first(base)?;
    let Some((path, _)) = logs.into_iter().next() else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(&path)?;
    let line = contents
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string();
    Ok(Some((path, line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_last_line_of_newest_log() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("autorep-run.log"),
            "starting\nSUCCESS: total sets=1 skipped=0 total datasets=1 skipped=0\n",
        )
        .unwrap();

        let (_, line) = last_status_line(dir.path()).unwrap().unwrap();
        assert_eq!(
            line,
            "SUCCESS: total sets=1 skipped=0 total datasets=1 skipped=0"
        );
    }

    #[test]
    fn empty_log_directory_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(last_status_line(dir.path()).unwrap().is_none());
    }
}
