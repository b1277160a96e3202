//! Error types shared across the core.
//!
//! One enum per subsystem. Command failures carry the argv and captured
//! stderr so a skipped dataset can be diagnosed from the log alone.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the command executor.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be started at all.
    #[error("failed to spawn {argv:?}: {source}")]
    Spawn {
        argv: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    /// The command ran and exited non-zero.
    #[error("command {argv:?} exited with status {status}: {stderr}")]
    CommandFailed {
        argv: Vec<String>,
        status: i32,
        stderr: String,
    },

    /// The sending side of a pipeline exited non-zero.
    #[error("send command exited with status {status}: {stderr}")]
    SenderFailed { status: i32, stderr: String },

    /// The receiving side of a pipeline exited non-zero.
    #[error("receive command exited with status {status}: {stderr}")]
    ReceiverFailed { status: i32, stderr: String },

    /// The stdout→stdin bridge between the two sides broke.
    #[error("pipeline transfer failed: {0}")]
    Bridge(#[source] std::io::Error),

    /// A command produced output the caller could not interpret.
    #[error("unexpected output from {argv:?}: {line:?}")]
    UnexpectedOutput { argv: Vec<String>, line: String },
}

/// Failures acquiring one of the run locks.
///
/// Both variants are fatal to the whole run; the driver maps them to
/// exit code 128.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process holds the lock.
    #[error("{name} lock is held by running pid {pid} ({path})")]
    Held {
        name: String,
        pid: u32,
        path: PathBuf,
    },

    /// A lock file exists but its owner is gone. Never stolen automatically;
    /// the operator must remove the file.
    #[error("stale {name} lock from dead pid {pid}; remove {path} to continue")]
    Stale {
        name: String,
        pid: u32,
        path: PathBuf,
    },

    /// The lock file could not be created or written.
    #[error("failed to create {name} lock at {path}: {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration loading and validation failures. Fatal, exit code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One or more values failed validation. All problems are collected
    /// before reporting so the operator fixes the file once.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A malformed replication pair spec. Pairs with these problems are
/// skipped, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairError {
    #[error("pair spec {spec:?} has no ':' separator")]
    MissingSeparator { spec: String },

    #[error("pair spec {spec:?} has an empty {side} dataset")]
    EmptyDataset { spec: String, side: &'static str },

    #[error("pair spec {spec:?} has an empty host after '@'")]
    EmptyHost { spec: String },

    #[error("destination {dataset:?} is a root dataset; set ALLOW_ROOT_DATASETS=1 to permit")]
    RootDataset { dataset: String },
}
