//! The per-dataset replication state machine.
//!
//! For each configured pair the engine expands the source into the datasets
//! to replicate, then walks each one through a fixed sequence: materialize
//! the destination, collect both snapshot inventories, pick an incremental
//! base, gate on divergence, prune both sides, snapshot, send. Failures are
//! skips: one bad dataset never stops the run. Only lock acquisition is
//! fatal.

use crate::config::Config;
use crate::dataset::{Dataset, SnapshotInfo};
use crate::error::LockError;
use crate::exec::Executor;
use crate::lock::LockFile;
use crate::pair::Pair;
use crate::zfs::ZfsClient;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{info, warn};

/// Counters aggregated across a run and printed in the exit summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// User-supplied pairs seen.
    pub pairs: u32,
    /// Pairs rejected before dataset enumeration.
    pub pairs_skipped: u32,
    /// Expanded datasets attempted.
    pub datasets: u32,
    /// Datasets skipped during their state machine.
    pub datasets_skipped: u32,
}

impl RunReport {
    pub fn has_skips(&self) -> bool {
        self.pairs_skipped > 0 || self.datasets_skipped > 0
    }

    /// SUCCESS or WARNING; the driver substitutes ERROR on abnormal exit.
    pub fn status(&self) -> RunStatus {
        if self.has_skips() {
            RunStatus::Warning
        } else {
            RunStatus::Success
        }
    }

    /// The summary line written as the last line of the log.
    pub fn summary(&self, status: RunStatus) -> String {
        format!(
            "{status}: total sets={} skipped={} total datasets={} skipped={}",
            self.pairs, self.pairs_skipped, self.datasets, self.datasets_skipped
        )
    }
}

/// Final disposition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Why a dataset or pair fell out of the run. `Fatal` aborts everything.
enum StepError {
    Skip(String),
    Fatal(LockError),
}

fn skip(err: impl std::fmt::Display) -> StepError {
    StepError::Skip(err.to_string())
}

/// Drives replication for every configured pair.
pub struct Engine<'a, E: Executor> {
    cfg: &'a Config,
    exec: &'a E,
    zfs: ZfsClient<'a, E>,
}

impl<'a, E: Executor> Engine<'a, E> {
    pub fn new(cfg: &'a Config, exec: &'a E) -> Self {
        Self {
            cfg,
            exec,
            zfs: ZfsClient::new(exec, cfg),
        }
    }

    /// Walk the plan without mutating anything; reads still run for real.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.zfs = ZfsClient::new(self.exec, self.cfg).with_dry_run(dry_run);
        self
    }

    /// Process every configured pair in order, updating `report` as work
    /// completes so an interrupted run still has accurate counters.
    ///
    /// The caller holds the `snapshot` lock for the duration; the `send`
    /// lock is taken here around each transfer.
    pub async fn run(&self, report: &Mutex<RunReport>) -> Result<(), LockError> {
        for spec in &self.cfg.replicate_sets {
            bump(report, |r| r.pairs += 1);

            let pair = match Pair::parse(spec) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(spec = %spec, error = %err, "skipping malformed pair");
                    bump(report, |r| r.pairs_skipped += 1);
                    continue;
                }
            };
            if let Err(err) = pair.check_destination(self.cfg) {
                warn!(pair = %pair, error = %err, "skipping pair");
                bump(report, |r| r.pairs_skipped += 1);
                continue;
            }

            let datasets = match self.plan_datasets(&pair).await {
                Ok(datasets) => datasets,
                Err(reason) => {
                    warn!(pair = %pair, %reason, "skipping pair");
                    bump(report, |r| r.pairs_skipped += 1);
                    continue;
                }
            };

            for src_ds in datasets {
                bump(report, |r| r.datasets += 1);
                match self.replicate_dataset(&pair, &src_ds).await {
                    Ok(()) => {}
                    Err(StepError::Skip(reason)) => {
                        warn!(dataset = %src_ds, %reason, "skipping dataset");
                        bump(report, |r| r.datasets_skipped += 1);
                    }
                    Err(StepError::Fatal(err)) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Pair-level probes and source expansion: host liveness, source
    /// existence, destination reachability, then the recursive child
    /// expansion when configured.
    async fn plan_datasets(&self, pair: &Pair) -> Result<Vec<Dataset>, String> {
        for host in pair.hosts() {
            let argv = self.cfg.host_check_argv(host);
            match self.exec.run(None, &argv).await {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    return Err(format!(
                        "host {host} failed liveness check (status {})",
                        out.status
                    ));
                }
                Err(err) => return Err(format!("host {host} liveness check failed: {err}")),
            }
        }

        match self
            .zfs
            .dataset_exists(pair.src_host.as_deref(), &pair.src)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(format!("source dataset {} does not exist", pair.src)),
            Err(err) => return Err(format!("cannot check source dataset {}: {err}", pair.src)),
        }
        if let Err(err) = self
            .zfs
            .dataset_exists(pair.dst_host.as_deref(), &pair.dst)
            .await
        {
            return Err(format!("cannot check destination dataset {}: {err}", pair.dst));
        }

        if self.cfg.recurse_children {
            self.zfs
                .list_descendants(pair.src_host.as_deref(), &pair.src)
                .await
                .map_err(|err| format!("cannot expand children of {}: {err}", pair.src))
        } else {
            Ok(vec![pair.src.clone()])
        }
    }

    /// The ten-step state machine for one dataset.
    async fn replicate_dataset(&self, pair: &Pair, src_ds: &Dataset) -> Result<(), StepError> {
        let src_host = pair.src_host.as_deref();
        let dst_host = pair.dst_host.as_deref();
        let dst_ds = pair.dst.join_source(src_ds);
        info!(source = %src_ds, destination = %dst_ds, "replicating dataset");

        // Destination materialization: receive needs a parent to land in.
        let dst_exists = self
            .zfs
            .dataset_exists(dst_host, &dst_ds)
            .await
            .map_err(skip)?;
        if !dst_exists {
            self.zfs
                .create_parents(dst_host, &dst_ds)
                .await
                .map_err(|err| StepError::Skip(format!("cannot create destination parents: {err}")))?;
        }

        // Inventory collection, both sides sorted ascending by creation.
        // The destination is listed unfiltered: divergence gating must see
        // snapshots outside the managed prefix too.
        let mut src_snaps = self
            .zfs
            .list_snapshots(src_host, src_ds, Some(&self.cfg.snap_pattern))
            .await
            .map_err(skip)?;
        let dst_all = if dst_exists {
            self.zfs
                .list_snapshots(dst_host, &dst_ds, None)
                .await
                .map_err(skip)?
        } else {
            Vec::new()
        };
        let mut dst_snaps: Vec<SnapshotInfo> = dst_all
            .iter()
            .filter(|s| s.name.contains(&self.cfg.snap_pattern))
            .cloned()
            .collect();

        // Duplicate-name defense: a same-TAG leftover from an earlier try
        // is destroyed so the retry is idempotent.
        let new_name = self.cfg.snapshot_name();
        let new_snap = src_ds.snapshot(&new_name);
        if let Some(idx) = src_snaps.iter().position(|s| s.short_name() == new_name) {
            warn!(snapshot = %new_snap, "planned snapshot already exists; destroying");
            self.zfs.destroy(src_host, &new_snap).await.map_err(skip)?;
            src_snaps.remove(idx);
        }

        // Base selection: newest source snapshot that also exists on the
        // destination anchors the incremental send.
        let base = select_base(&src_snaps, &dst_snaps);

        // Divergence gating. A destination with snapshots but no common
        // base is only cleared when the operator opted in; this is the one
        // path that destroys unmanaged snapshots.
        if base.is_none() && !dst_all.is_empty() {
            if !self.cfg.allow_reconciliation {
                return Err(StepError::Skip(format!(
                    "destination {dst_ds} has snapshots but no common base; \
                     set ALLOW_RECONCILIATION=1 to destroy them and resync"
                )));
            }
            info!(dataset = %dst_ds, count = dst_all.len(), "reconciliation: clearing destination snapshots");
            for snap in &dst_all {
                self.zfs.destroy(dst_host, &snap.name).await.map_err(skip)?;
            }
            dst_snaps.clear();
        }

        // Retention, both sides, before the new snapshot exists: keep the
        // SNAP_KEEP-1 newest so the one about to be created lands at the
        // configured count.
        self.prune(src_host, &mut src_snaps).await;
        self.prune(dst_host, &mut dst_snaps).await;

        // The new snapshot. The driver holds the snapshot lock for the
        // whole run.
        self.zfs
            .create_snapshot(src_host, src_ds, &new_name)
            .await
            .map_err(|err| StepError::Skip(format!("snapshot creation failed: {err}")))?;

        // The transfer, exclusive across the host.
        let _send_lock =
            LockFile::acquire(&self.cfg.lock_dir, "send").map_err(StepError::Fatal)?;
        let base_name = base.as_ref().map(|b| b.name.as_str());
        match self
            .zfs
            .send(src_host, base_name, &new_snap, dst_host, &dst_ds)
            .await
        {
            Ok(()) => {
                info!(snapshot = %new_snap, destination = %dst_ds, "replication complete");
                Ok(())
            }
            Err(err) => {
                // Roll the new snapshot back so the base invariant holds
                // for the next run.
                self.zfs.destroy_best_effort(src_host, &new_snap).await;
                Err(StepError::Skip(format!("send failed: {err}")))
            }
        }
    }

    /// Destroy the oldest managed snapshots down to `SNAP_KEEP - 1`.
    /// Destroy failures during pruning are logged, never fatal.
    async fn prune(&self, host: Option<&str>, snaps: &mut Vec<SnapshotInfo>) {
        if snaps.len() < self.cfg.snap_keep {
            return;
        }
        let excess = snaps.len() - (self.cfg.snap_keep - 1);
        for snap in snaps.drain(..excess) {
            self.zfs.destroy_best_effort(host, &snap.name).await;
        }
    }
}

/// Scan source snapshots newest-first for one whose name also appears in
/// the destination inventory.
fn select_base(src: &[SnapshotInfo], dst: &[SnapshotInfo]) -> Option<SnapshotInfo> {
    for snap in src.iter().rev() {
        let suffix = format!("@{}", snap.short_name());
        if dst.iter().any(|d| d.name.ends_with(&suffix)) {
            return Some(snap.clone());
        }
    }
    None
}

fn bump<F: FnOnce(&mut RunReport)>(report: &Mutex<RunReport>, f: F) {
    if let Ok(mut guard) = report.lock() {
        f(&mut guard);
    }
}
