//! The on-disk claim index: one directory per stable name, one empty
//! marker file per device currently claiming it.

use std::fs::{DirBuilder, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::errno::Errno;
use tracing::debug;

use crate::config::relative_stable_name;
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::escape::escape_name;

/// A snapshot of a claim directory's identity, used by the link updater to
/// detect whether the claim set changed between two points in its
/// convergence loop. Two snapshots describe "the same state" when both the
/// directory existed and its modification time is unchanged — the exact
/// inode doesn't need to survive a `rmdir`+`mkdir` recreation in between,
/// since the caller only cares about "did anything change".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDirState {
    Missing,
    Present { modified: SystemTime },
}

/// Path of the claim directory for `stable_name` under `root`.
///
/// Escapes the *relative* stable name (the portion after `devfs_root`,
/// leading separator included) per §3/§6 of the design doc — not the
/// full absolute path, which would put a spurious escaped `devfs_root`
/// segment into every claim dir name.
pub fn claim_dir_path(root: &Path, devfs_root: &Path, stable_name: &Path) -> PathBuf {
    let relative = relative_stable_name(devfs_root, stable_name).unwrap_or(stable_name);
    let escaped = escape_name(&relative.to_string_lossy());
    root.join(escaped)
}

/// Path of this device's marker file for `stable_name` under `root`.
pub fn marker_path(
    root: &Path,
    devfs_root: &Path,
    dev: &dyn DeviceHandle,
    stable_name: &Path,
) -> PathBuf {
    claim_dir_path(root, devfs_root, stable_name).join(dev.device_id())
}

/// Snapshot a claim directory's identity for the convergence check.
pub fn stat_claim_dir(dir: &Path) -> ClaimDirState {
    match std::fs::metadata(dir) {
        Ok(meta) => ClaimDirState::Present {
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        },
        Err(_) => ClaimDirState::Missing,
    }
}

/// Record `dev`'s claim on `stable_name`.
///
/// Creates the claim directory (mode 0755) if needed, then open-creates an
/// empty, read-only (0444) marker file named after the device id. Retries
/// once if the directory vanished out from under us between the `mkdir`
/// and the `open`.
pub fn add_claim(
    root: &Path,
    devfs_root: &Path,
    dev: &dyn DeviceHandle,
    stable_name: &Path,
) -> Result<()> {
    let dir = claim_dir_path(root, devfs_root, stable_name);
    let marker = dir.join(dev.device_id());

    for _ in 0..2 {
        ensure_claim_dir(&dir)?;

        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o444)
            .open(&marker)
        {
            Ok(_) => {
                debug!(?marker, "recorded claim");
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // The claim dir vanished between ensure_claim_dir and open
                // (another device's remove_claim raced us). Recreate and retry.
                continue;
            }
            Err(e) => {
                return Err(Error::fatal(
                    "open claim marker",
                    marker,
                    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
                ));
            }
        }
    }

    Err(Error::fatal(
        "open claim marker after retry",
        marker,
        Errno::ENOENT,
    ))
}

fn ensure_claim_dir(dir: &Path) -> Result<()> {
    match DirBuilder::new().recursive(true).mode(0o755).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::fatal(
            "create claim dir",
            dir,
            Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
        )),
    }
}

/// Remove `dev`'s claim on `stable_name`. Best-effort: a missing marker or
/// a non-empty claim dir are not errors (§3 invariant 2 — an empty claim
/// dir is equivalent to no claimants, and prompt removal is an
/// optimisation, not a correctness requirement).
pub fn remove_claim(root: &Path, devfs_root: &Path, dev: &dyn DeviceHandle, stable_name: &Path) {
    let dir = claim_dir_path(root, devfs_root, stable_name);
    let marker = dir.join(dev.device_id());

    if let Err(e) = std::fs::remove_file(&marker) {
        if e.kind() != ErrorKind::NotFound {
            debug!(?marker, error = %e, "failed to remove claim marker");
        }
    }

    match std::fs::remove_dir(&dir) {
        Ok(()) => debug!(?dir, "removed empty claim dir"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {}
        Err(e) => debug!(?dir, error = %e, "failed to remove claim dir"),
    }
}
