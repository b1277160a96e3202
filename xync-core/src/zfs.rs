//! Thin zfs command layer over the executor.
//!
//! Builds argv for the external `zfs` tool and parses its tab-separated
//! output. Nothing here decides replication policy; the engine does.

use crate::config::Config;
use crate::dataset::{Dataset, SnapshotInfo};
use crate::error::ExecError;
use crate::exec::{CommandSpec, Executor};
use tracing::{debug, info, warn};

/// Dataset inspection and snapshot operations, host-aware.
///
/// With `dry_run` set, mutating operations log what they would do and
/// succeed without touching anything; inspection still runs for real.
pub struct ZfsClient<'a, E: Executor> {
    exec: &'a E,
    cfg: &'a Config,
    dry_run: bool,
}

impl<'a, E: Executor> ZfsClient<'a, E> {
    pub fn new(exec: &'a E, cfg: &'a Config) -> Self {
        Self {
            exec,
            cfg,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn run_checked(&self, host: Option<&str>, argv: Vec<String>) -> Result<String, ExecError> {
        let out = self.exec.run(host, &argv).await?;
        if !out.success() {
            return Err(ExecError::CommandFailed {
                argv,
                status: out.status,
                stderr: out.stderr.trim_end().to_string(),
            });
        }
        Ok(out.stdout)
    }

    /// True iff the dataset is known to the pool on that host. A spawn or
    /// transport failure is an error; "not listed" is just `false`.
    pub async fn dataset_exists(&self, host: Option<&str>, ds: &Dataset) -> Result<bool, ExecError> {
        let argv = argv(&["zfs", "list", "-H", "-o", "name", ds.as_str()]);
        let out = self.exec.run(host, &argv).await?;
        Ok(out.success())
    }

    /// The dataset itself followed by all strict descendants, in `zfs list`
    /// order.
    pub async fn list_descendants(
        &self,
        host: Option<&str>,
        ds: &Dataset,
    ) -> Result<Vec<Dataset>, ExecError> {
        let argv = argv(&["zfs", "list", "-H", "-r", "-o", "name", ds.as_str()]);
        let out = self.run_checked(host, argv).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(Dataset::new)
            .collect())
    }

    /// Create the dataset's parent with intermediate-parents semantics, so
    /// a subsequent `zfs receive` has somewhere to land.
    pub async fn create_parents(&self, host: Option<&str>, ds: &Dataset) -> Result<(), ExecError> {
        let Some(parent) = ds.parent() else {
            // A root dataset has no parent to create; the pool either
            // exists or the receive will fail on its own.
            return Ok(());
        };
        if self.dry_run {
            info!(dataset = %parent, "dry-run: would create parent dataset");
            return Ok(());
        }
        info!(dataset = %parent, "creating parent dataset");
        self.run_checked(host, argv(&["zfs", "create", "-p", parent.as_str()]))
            .await?;
        Ok(())
    }

    /// Snapshots of `ds` only (depth 1), sorted ascending by creation time.
    /// With a filter, only entries whose full `dataset@name` contains the
    /// substring are returned.
    pub async fn list_snapshots(
        &self,
        host: Option<&str>,
        ds: &Dataset,
        filter: Option<&str>,
    ) -> Result<Vec<SnapshotInfo>, ExecError> {
        let argv = argv(&[
            "zfs",
            "list",
            "-Hp",
            "-t",
            "snapshot",
            "-o",
            "name,creation",
            "-s",
            "creation",
            "-d",
            "1",
            ds.as_str(),
        ]);
        let out = self.run_checked(host, argv.clone()).await?;
        let mut snaps = Vec::new();
        for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (name, created) = line
                .split_once('\t')
                .ok_or_else(|| ExecError::UnexpectedOutput {
                    argv: argv.clone(),
                    line: line.to_string(),
                })?;
            let created = created
                .trim()
                .parse::<i64>()
                .map_err(|_| ExecError::UnexpectedOutput {
                    argv: argv.clone(),
                    line: line.to_string(),
                })?;
            if let Some(pat) = filter {
                if !name.contains(pat) {
                    continue;
                }
            }
            snaps.push(SnapshotInfo {
                name: name.to_string(),
                created,
            });
        }
        Ok(snaps)
    }

    /// Create `ds@name`. On failure the partial snapshot, if any, is
    /// destroyed best-effort before the error is returned.
    pub async fn create_snapshot(
        &self,
        host: Option<&str>,
        ds: &Dataset,
        name: &str,
    ) -> Result<(), ExecError> {
        let snap = ds.snapshot(name);
        if self.dry_run {
            info!(snapshot = %snap, "dry-run: would create snapshot");
            return Ok(());
        }
        info!(snapshot = %snap, "creating snapshot");
        match self
            .run_checked(host, argv(&["zfs", "snapshot", &snap]))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                self.destroy_best_effort(host, &snap).await;
                Err(err)
            }
        }
    }

    /// Destroy a snapshot, propagating failure.
    pub async fn destroy(&self, host: Option<&str>, snap: &str) -> Result<(), ExecError> {
        if self.dry_run {
            info!(snapshot = %snap, "dry-run: would destroy snapshot");
            return Ok(());
        }
        info!(snapshot = %snap, "destroying snapshot");
        self.run_checked(host, argv(&["zfs", "destroy", snap]))
            .await?;
        Ok(())
    }

    /// Destroy a snapshot, logging failure instead of propagating it.
    /// Pruning and rollback use this: a leftover snapshot is never worth
    /// aborting a run over.
    pub async fn destroy_best_effort(&self, host: Option<&str>, snap: &str) {
        if let Err(err) = self.destroy(host, snap).await {
            warn!(snapshot = %snap, error = %err, "failed to destroy snapshot");
        }
    }

    /// Stream `new_snap` (incrementally from `base` when present) into
    /// `dst` on the destination host.
    pub async fn send(
        &self,
        src_host: Option<&str>,
        base: Option<&str>,
        new_snap: &str,
        dst_host: Option<&str>,
        dst: &Dataset,
    ) -> Result<(), ExecError> {
        let mut send_argv: Vec<String> = vec!["zfs".into(), "send".into()];
        send_argv.extend(self.cfg.zfs_send_opts.iter().cloned());
        if let Some(base) = base {
            send_argv.push(self.cfg.zfs_incr_opt.clone());
            send_argv.push(base.to_string());
        }
        send_argv.push(new_snap.to_string());

        let mut recv_argv: Vec<String> = vec!["zfs".into(), "receive".into()];
        recv_argv.extend(self.cfg.zfs_recv_opts.iter().cloned());
        recv_argv.push(dst.as_str().to_string());

        if self.dry_run {
            info!(
                send = %send_argv.join(" "),
                receive = %recv_argv.join(" "),
                "dry-run: would run send pipeline"
            );
            return Ok(());
        }
        debug!(snapshot = %new_snap, base = base.unwrap_or("none"), "sending snapshot");
        self.exec
            .pipe(
                &CommandSpec::new(src_host, send_argv),
                &CommandSpec::new(dst_host, recv_argv),
            )
            .await
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
