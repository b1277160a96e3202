//! Logging sinks: stderr, the per-run log file, and syslog.
//!
//! Progress lines flow through `tracing`; this module wires the layers up
//! from the loaded configuration. The syslog backend calls
//! `openlog`/`syslog`/`closelog` directly rather than pulling in a
//! dedicated crate; only info-and-above is forwarded there regardless of
//! the stderr verbosity.

use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};
use xync_core::Config;

/// Syslog tag: the program name.
const SYSLOG_TAG: &str = "xync";

/// Keeps the syslog connection open for the process lifetime. Dropping it
/// closes the connection.
pub struct LogGuard {
    _syslog: Option<SyslogGuard>,
}

/// Install the tracing subscriber according to the configuration.
///
/// Called once at startup, after the configuration is loaded and before
/// any engine work. Returns a guard the caller holds until exit.
pub fn init(cfg: &Config, verbose: bool) -> Result<LogGuard> {
    let filter = EnvFilter::new(if verbose { "debug" } else { "info" });
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = match &cfg.log_base {
        Some(base) if !cfg.log_file.is_empty() => {
            fs::create_dir_all(base)
                .with_context(|| format!("cannot create log directory {}", base.display()))?;
            let path = base.join(&cfg.log_file);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            rotate_logs(base, cfg.log_keep)?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        _ => None,
    };

    let (syslog_layer, syslog_guard) = if cfg.syslog {
        let facility = SyslogFacility::from_name(&cfg.syslog_facility).unwrap_or_else(|| {
            eprintln!(
                "xync: unknown SYSLOG_FACILITY {:?}, using \"user\"",
                cfg.syslog_facility
            );
            SyslogFacility::User
        });
        let guard = open_syslog(facility, SYSLOG_TAG);
        (
            Some(SyslogLayer.with_filter(LevelFilter::INFO)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(syslog_layer)
        .init();

    Ok(LogGuard {
        _syslog: syslog_guard,
    })
}

/// Delete all but the `keep` newest `autorep-*` files in the log
/// directory, ordered by change time.
pub fn rotate_logs(base: &Path, keep: usize) -> Result<()> {
    let mut logs = log_files_newest_first(base)?;
    for (path, _) in logs.split_off(keep.min(logs.len())) {
        if let Err(err) = fs::remove_file(&path) {
            eprintln!("xync: cannot remove old log {}: {err}", path.display());
        }
    }
    Ok(())
}

/// All `autorep-*` files under `base`, newest change time first.
pub fn log_files_newest_first(base: &Path) -> Result<Vec<(std::path::PathBuf, i64)>> {
    use std::os::unix::fs::MetadataExt;

    let mut logs = Vec::new();
    let entries = fs::read_dir(base)
        .with_context(|| format!("cannot read log directory {}", base.display()))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("autorep-") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        logs.push((entry.path(), meta.ctime()));
    }
    logs.sort_by_key(|(_, ctime)| std::cmp::Reverse(*ctime));
    Ok(logs)
}

// ---------------------------------------------------------------------------
// syslog(3) backend
// ---------------------------------------------------------------------------

/// Syslog facilities accepted by `SYSLOG_FACILITY`, mapped to the POSIX
/// `LOG_*` constants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum SyslogFacility {
    Kern = libc::LOG_KERN,
    User = libc::LOG_USER,
    Mail = libc::LOG_MAIL,
    Daemon = libc::LOG_DAEMON,
    Auth = libc::LOG_AUTH,
    Syslog = libc::LOG_SYSLOG,
    Lpr = libc::LOG_LPR,
    News = libc::LOG_NEWS,
    Uucp = libc::LOG_UUCP,
    Cron = libc::LOG_CRON,
    Local0 = libc::LOG_LOCAL0,
    Local1 = libc::LOG_LOCAL1,
    Local2 = libc::LOG_LOCAL2,
    Local3 = libc::LOG_LOCAL3,
    Local4 = libc::LOG_LOCAL4,
    Local5 = libc::LOG_LOCAL5,
    Local6 = libc::LOG_LOCAL6,
    Local7 = libc::LOG_LOCAL7,
}

impl SyslogFacility {
    /// Parse a facility name, case-insensitively. Returns `None` for
    /// unrecognised names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "kern" => Some(Self::Kern),
            "user" => Some(Self::User),
            "mail" => Some(Self::Mail),
            "daemon" => Some(Self::Daemon),
            "auth" => Some(Self::Auth),
            "syslog" => Some(Self::Syslog),
            "lpr" => Some(Self::Lpr),
            "news" => Some(Self::News),
            "uucp" => Some(Self::Uucp),
            "cron" => Some(Self::Cron),
            "local0" => Some(Self::Local0),
            "local1" => Some(Self::Local1),
            "local2" => Some(Self::Local2),
            "local3" => Some(Self::Local3),
            "local4" => Some(Self::Local4),
            "local5" => Some(Self::Local5),
            "local6" => Some(Self::Local6),
            "local7" => Some(Self::Local7),

            _ => None,
        }
    }
}

/// RAII guard that closes the syslog connection when dropped.
pub struct SyslogGuard {
    _private: (),
}

impl Drop for SyslogGuard {
    fn drop(&mut self) {
        // SAFETY: closelog has no preconditions beyond a prior openlog,
        // guaranteed by construction in open_syslog.
        unsafe {
            libc::closelog();
        }
    }
}

/// Open the syslog connection. The ident string must stay valid for the
/// process lifetime because syslog(3) keeps the pointer, so it lives in a
/// static.
fn open_syslog(facility: SyslogFacility, tag: &str) -> SyslogGuard {
    static IDENT: OnceLock<CString> = OnceLock::new();
    let ident = IDENT.get_or_init(|| {
        CString::new(tag).unwrap_or_else(|_| CString::new(SYSLOG_TAG).expect("tag has no NUL"))
    });

    // SAFETY: called once at startup before any engine work; the ident
    // pointer is valid for the process lifetime.
    unsafe {
        libc::openlog(ident.as_ptr(), libc::LOG_PID, facility as libc::c_int);
    }
    SyslogGuard { _private: () }
}

fn syslog_message(priority: libc::c_int, message: &str) {
    let Ok(message) = CString::new(message) else {
        return;
    };
    // "%s" with the message as argument avoids format-string injection.
    // SAFETY: syslog is thread-safe after openlog; both strings are valid.
    unsafe {
        libc::syslog(priority, c"%s".as_ptr(), message.as_ptr());
    }
}

/// Tracing layer forwarding formatted events to syslog(3).
struct SyslogLayer;

impl<S: Subscriber> Layer<S> for SyslogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let priority = match *event.metadata().level() {
            Level::ERROR => libc::LOG_ERR,
            Level::WARN => libc::LOG_WARNING,
            Level::INFO => libc::LOG_INFO,
            Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
        };
        syslog_message(priority, &visitor.rendered());
    }
}

/// Collects an event's `message` field plus any structured fields into a
/// single line.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn rendered(&self) -> String {
        let mut line = self.message.clone();
        for (name, value) in &self.fields {
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(name);
            line.push('=');
            line.push_str(value);
        }
        line
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn facility_names_parse_case_insensitively() {
        assert_eq!(SyslogFacility::from_name("user"), Some(SyslogFacility::User));
        assert_eq!(
            SyslogFacility::from_name("DAEMON"),
            Some(SyslogFacility::Daemon)
        );
        assert_eq!(
            SyslogFacility::from_name("Local3"),
            Some(SyslogFacility::Local3)
        );
        assert_eq!(SyslogFacility::from_name("local8"), None);
        assert_eq!(SyslogFacility::from_name(""), None);
    }

    #[test]
    fn facility_values_match_libc() {
        assert_eq!(SyslogFacility::User as i32, libc::LOG_USER);
        assert_eq!(SyslogFacility::Local7 as i32, libc::LOG_LOCAL7);
    }

    #[test]
    fn rotation_keeps_newest_logs() {
        let dir = TempDir::new().unwrap();
        for name in ["autorep-a.log", "autorep-b.log", "autorep-c.log"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        // Files unrelated to the engine are never touched.
        fs::write(dir.path().join("other.log"), "x").unwrap();

        rotate_logs(dir.path(), 2).unwrap();
        let remaining = log_files_newest_first(dir.path()).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(dir.path().join("other.log").exists());
    }

    #[test]
    fn rotation_with_generous_keep_removes_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("autorep-a.log"), "x").unwrap();
        rotate_logs(dir.path(), 10).unwrap();
        assert!(dir.path().join("autorep-a.log").exists());
    }

    #[test]
    fn message_visitor_renders_fields() {
        let mut visitor = MessageVisitor::default();
        visitor.message = "replicating dataset".to_string();
        visitor
            .fields
            .push(("source".to_string(), "p1/a".to_string()));
        assert_eq!(visitor.rendered(), "replicating dataset source=p1/a");
    }
}
