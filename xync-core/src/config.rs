//! Configuration loading and the macro-expanded run tag.
//!
//! Values come from an optional `KEY=value` config file overlaid by the
//! process environment (environment wins), then defaults. Problems are
//! collected and reported together so the operator fixes the file once.

use crate::error::ConfigError;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name prefix of every snapshot this engine creates.
pub const SNAP_NAME_PREFIX: &str = "autorep-";

/// Configuration keys recognized in the file and the environment.
const KNOWN_KEYS: &[&str] = &[
    "REPLICATE_SETS",
    "ALLOW_ROOT_DATASETS",
    "ALLOW_RECONCILIATION",
    "RECURSE_CHILDREN",
    "SNAP_PATTERN",
    "SNAP_KEEP",
    "SYSLOG",
    "SYSLOG_FACILITY",
    "TAG",
    "LOG_FILE",
    "LOG_BASE",
    "LOG_KEEP",
    "HOST_CHECK",
    "ZFS_INCR_OPT",
    "ZFS_SEND_OPTS",
    "ZFS_RECV_OPTS",
];

/// Raw key/value view of the configuration sources, before validation.
///
/// The `--status` path only needs `LOG_BASE`, so it reads this stage
/// without requiring a fully valid configuration.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    values: BTreeMap<String, String>,
}

impl RawConfig {
    /// Read the optional config file, then overlay recognized environment
    /// variables on top.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut raw = Self::default();
        if let Some(path) = file {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            raw.merge_file(&contents);
        }
        for key in KNOWN_KEYS {
            if let Ok(value) = std::env::var(key) {
                raw.values.insert(key.to_string(), value);
            }
        }
        Ok(raw)
    }

    /// Parse `KEY=value` assignments from shell-style config contents.
    /// Comments, blank lines and non-assignment lines are ignored; a
    /// leading `export ` and surrounding quotes are stripped.
    fn merge_file(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let Some((key, value)) = line.split_once('=') else {
                debug!(line, "ignoring non-assignment config line");
                continue;
            };
            let key = key.trim();
            if !KNOWN_KEYS.contains(&key) {
                continue;
            }
            self.values
                .insert(key.to_string(), unquote(value.trim()).to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[cfg(test)]
    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Fully validated run configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Pair specs, one `src[@host]:dst[@host]` each.
    pub replicate_sets: Vec<String>,
    pub allow_root_datasets: bool,
    pub allow_reconciliation: bool,
    pub recurse_children: bool,
    /// Substring identifying managed snapshots in inventory listings.
    pub snap_pattern: String,
    /// Managed snapshots retained per side, the new one included.
    pub snap_keep: usize,
    pub syslog: bool,
    pub syslog_facility: String,
    /// Macro-expanded label, stable for the whole run.
    pub tag: String,
    pub log_file: String,
    pub log_base: Option<PathBuf>,
    pub log_keep: usize,
    /// Liveness probe template; `%HOST%` is substituted per host.
    pub host_check: String,
    pub zfs_incr_opt: String,
    pub zfs_send_opts: Vec<String>,
    pub zfs_recv_opts: Vec<String>,
    /// Directory holding the `snapshot` and `send` lock files.
    pub lock_dir: PathBuf,
}

impl Config {
    /// Load and validate, using the current time for macro expansion.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = RawConfig::load(file)?;
        Self::from_raw(&raw, Local::now())
    }

    /// Validate raw values into a runnable configuration.
    pub fn from_raw(raw: &RawConfig, now: DateTime<Local>) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        let replicate_sets: Vec<String> = raw
            .get("REPLICATE_SETS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if replicate_sets.is_empty() {
            problems.push("REPLICATE_SETS is required".to_string());
        }

        let mut bool_of = |key: &str, default: bool| match raw.get(key) {
            None => default,
            Some(v) => match parse_bool(v) {
                Some(b) => b,
                None => {
                    problems.push(format!("{key} must be a boolean, got {v:?}"));
                    default
                }
            },
        };
        let allow_root_datasets = bool_of("ALLOW_ROOT_DATASETS", false);
        let allow_reconciliation = bool_of("ALLOW_RECONCILIATION", false);
        let recurse_children = bool_of("RECURSE_CHILDREN", false);
        let syslog = bool_of("SYSLOG", true);

        let snap_keep = match raw.get("SNAP_KEEP") {
            None => 2,
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n >= 2 => n,
                _ => {
                    problems.push(format!("SNAP_KEEP must be an integer >= 2, got {v:?}"));
                    2
                }
            },
        };
        let log_keep = match raw.get("LOG_KEEP") {
            None => 5,
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    problems.push(format!("LOG_KEEP must be an integer >= 1, got {v:?}"));
                    5
                }
            },
        };

        let raw_tag = raw.get("TAG").unwrap_or("%MOY%%DOM%%CYR%_%NOW%");
        let tag = expand_twice(raw_tag, &now, None);
        if tag.is_empty() {
            problems.push("TAG must not expand to an empty string".to_string());
        }

        let raw_log_file = raw.get("LOG_FILE").unwrap_or("autorep-%TAG%.log");
        let log_file = expand_twice(raw_log_file, &now, Some(&tag));

        let host_check = raw
            .get("HOST_CHECK")
            .unwrap_or("ping -c1 -q -W2 %HOST%")
            .to_string();
        if host_check.split_whitespace().next().is_none() {
            problems.push("HOST_CHECK must not be empty".to_string());
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        Ok(Self {
            replicate_sets,
            allow_root_datasets,
            allow_reconciliation,
            recurse_children,
            snap_pattern: raw
                .get("SNAP_PATTERN")
                .unwrap_or(&format!("@{SNAP_NAME_PREFIX}"))
                .to_string(),
            snap_keep,
            syslog,
            syslog_facility: raw.get("SYSLOG_FACILITY").unwrap_or("user").to_string(),
            tag,
            log_file,
            log_base: raw.get("LOG_BASE").map(PathBuf::from),
            log_keep,
            host_check,
            zfs_incr_opt: raw.get("ZFS_INCR_OPT").unwrap_or("-I").to_string(),
            zfs_send_opts: split_opts(raw.get("ZFS_SEND_OPTS").unwrap_or("-p")),
            zfs_recv_opts: split_opts(raw.get("ZFS_RECV_OPTS").unwrap_or("-vF")),
            lock_dir: std::env::temp_dir(),
        })
    }

    /// The snapshot name created on every source dataset this run.
    pub fn snapshot_name(&self) -> String {
        format!("{SNAP_NAME_PREFIX}{}", self.tag)
    }

    /// The liveness probe argv for a host, run locally.
    pub fn host_check_argv(&self, host: &str) -> Vec<String> {
        self.host_check
            .split_whitespace()
            .map(|tok| tok.replace("%HOST%", host))
            .collect()
    }

    /// Minimal configuration for tests: the given pair specs and a fixed
    /// literal tag, logging sinks disabled.
    pub fn for_testing(replicate_sets: &[&str], tag: &str) -> Self {
        Self {
            replicate_sets: replicate_sets.iter().map(|s| s.to_string()).collect(),
            allow_root_datasets: false,
            allow_reconciliation: false,
            recurse_children: false,
            snap_pattern: format!("@{SNAP_NAME_PREFIX}"),
            snap_keep: 2,
            syslog: false,
            syslog_facility: "user".to_string(),
            tag: tag.to_string(),
            log_file: String::new(),
            log_base: None,
            log_keep: 5,
            host_check: "true %HOST%".to_string(),
            zfs_incr_opt: "-I".to_string(),
            zfs_send_opts: vec!["-p".to_string()],
            zfs_recv_opts: vec!["-vF".to_string()],
            lock_dir: std::env::temp_dir(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn split_opts(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Replace the `%DOW% %DOM% %MOY% %CYR% %NOW% %TAG%` tokens.
pub fn expand_macros(input: &str, now: &DateTime<Local>, tag: &str) -> String {
    input
        .replace("%DOW%", &now.format("%a").to_string().to_lowercase())
        .replace("%DOM%", &now.format("%d").to_string())
        .replace("%MOY%", &now.format("%m").to_string())
        .replace("%CYR%", &now.format("%Y").to_string())
        .replace("%NOW%", &now.timestamp().to_string())
        .replace("%TAG%", tag)
}

/// Expansion runs twice so `%TAG%` can reference already-expanded tokens.
fn expand_twice(input: &str, now: &DateTime<Local>, tag: Option<&str>) -> String {
    let mut out = input.to_string();
    for _ in 0..2 {
        let current = tag.map(str::to_string).unwrap_or_else(|| out.clone());
        out = expand_macros(&out, now, &current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 8, 2, 3, 4, 5).unwrap()
    }

    fn raw_with_sets() -> RawConfig {
        let mut raw = RawConfig::default();
        raw.set("REPLICATE_SETS", "p1/a:p2");
        raw
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_raw(&raw_with_sets(), fixed_now()).unwrap();
        assert_eq!(cfg.snap_keep, 2);
        assert_eq!(cfg.snap_pattern, "@autorep-");
        assert!(cfg.syslog);
        assert_eq!(cfg.syslog_facility, "user");
        assert_eq!(cfg.zfs_incr_opt, "-I");
        assert_eq!(cfg.zfs_send_opts, vec!["-p"]);
        assert_eq!(cfg.zfs_recv_opts, vec!["-vF"]);
        assert!(!cfg.allow_root_datasets);
        assert!(!cfg.allow_reconciliation);
        assert!(!cfg.recurse_children);
    }

    #[test]
    fn missing_sets_is_fatal() {
        let raw = RawConfig::default();
        match Config::from_raw(&raw, fixed_now()) {
            Err(ConfigError::Invalid(problems)) => {
                assert!(problems.iter().any(|p| p.contains("REPLICATE_SETS")));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn snap_keep_below_two_is_rejected() {
        let mut raw = raw_with_sets();
        raw.set("SNAP_KEEP", "1");
        assert!(matches!(
            Config::from_raw(&raw, fixed_now()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn problems_are_collected_not_first_wins() {
        let mut raw = RawConfig::default();
        raw.set("SNAP_KEEP", "zero");
        raw.set("SYSLOG", "maybe");
        match Config::from_raw(&raw, fixed_now()) {
            Err(ConfigError::Invalid(problems)) => assert_eq!(problems.len(), 3),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn default_tag_expands_date_tokens() {
        let cfg = Config::from_raw(&raw_with_sets(), fixed_now()).unwrap();
        let epoch = fixed_now().timestamp();
        assert_eq!(cfg.tag, format!("08022026_{epoch}"));
        assert_eq!(cfg.snapshot_name(), format!("autorep-08022026_{epoch}"));
    }

    #[test]
    fn log_file_references_expanded_tag() {
        let mut raw = raw_with_sets();
        raw.set("TAG", "nightly");
        let cfg = Config::from_raw(&raw, fixed_now()).unwrap();
        assert_eq!(cfg.log_file, "autorep-nightly.log");
    }

    #[test]
    fn macro_tokens_cover_all_documented_forms() {
        let now = fixed_now();
        let out = expand_macros("%DOW%|%DOM%|%MOY%|%CYR%|%NOW%|%TAG%", &now, "t");
        assert_eq!(out, format!("sun|02|08|2026|{}|t", now.timestamp()));
    }

    #[test]
    fn host_check_substitutes_host_token() {
        let cfg = Config::from_raw(&raw_with_sets(), fixed_now()).unwrap();
        assert_eq!(
            cfg.host_check_argv("backup01"),
            vec!["ping", "-c1", "-q", "-W2", "backup01"]
        );
    }

    #[test]
    fn file_assignments_parse_with_quotes() {
        let mut raw = RawConfig::default();
        raw.merge_file("REPLICATE_SETS=\"p1/a:p2\"\nSNAP_KEEP=4\n");
        assert_eq!(raw.get("REPLICATE_SETS"), Some("p1/a:p2"));
        assert_eq!(raw.get("SNAP_KEEP"), Some("4"));
    }

    #[test]
    fn file_parser_ignores_noise() {
        let mut raw = RawConfig::default();
        raw.merge_file(
            "# comment\n\nexport TAG='weekly'\nif [ -z \"$x\" ]; then\nUNKNOWN_KEY=1\n",
        );
        assert_eq!(raw.get("TAG"), Some("weekly"));
        assert_eq!(raw.get("UNKNOWN_KEY"), None);
    }
}
