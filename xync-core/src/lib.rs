//! Core library for xync, a scheduled ZFS replication tool.
//!
//! Everything the replication run needs lives here, free of any terminal or
//! process-global concerns: the command executor (local argv or a composed
//! SSH invocation), the thin zfs command layer built on top of it, pair-spec
//! planning, PID-based run locks, configuration loading, and the per-dataset
//! replication state machine itself. The `xync` binary wires these together
//! with CLI parsing, logging sinks and signal handling.

pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod exec;
pub mod lock;
pub mod pair;
pub mod zfs;

pub use config::{Config, RawConfig};
pub use engine::{Engine, RunReport, RunStatus};
pub use error::{ConfigError, ExecError, LockError, PairError};
pub use exec::{CommandOutput, CommandSpec, Executor, SystemExecutor};
pub use lock::LockFile;
pub use pair::Pair;
