//! Converge a single stable name's symlink onto whatever the arbiter
//! currently says it should point at.

use std::path::Path;

use tracing::debug;

use crate::arbiter::find_prioritized;
use crate::claim::{add_claim, claim_dir_path, remove_claim, stat_claim_dir, ClaimDirState};
use crate::device::{DeviceHandle, DeviceResolver};
use crate::error::{Error, Result};
use crate::writer::{node_symlink, LinkOutcome};

const INITIALIZED_RETRY_BUDGET: u32 = 128;
const UNINITIALIZED_RETRY_BUDGET: u32 = 1;

/// Record or retract `dev`'s claim on `stable_name`, then converge the
/// symlink at `stable_name` onto the current arbitration winner.
///
/// `add` selects whether this call is adding or removing a claim; the
/// retry budget is generous when the device's property database entry is
/// already committed (`is_initialized()`), and minimal otherwise, since an
/// uninitialized device is expected to be re-driven once it is.
pub fn link_update(
    dev: &dyn DeviceHandle,
    stable_name: &Path,
    add: bool,
    root: &Path,
    devfs_root: &Path,
    resolver: &dyn DeviceResolver,
) -> Result<()> {
    if !stable_name.starts_with(devfs_root) {
        return Err(Error::InvalidArgument {
            path: stable_name.to_path_buf(),
            root: devfs_root.to_path_buf(),
        });
    }

    if !add {
        remove_claim(root, devfs_root, dev, stable_name);
    } else {
        add_claim(root, devfs_root, dev, stable_name)?;
    }

    let claim_dir = claim_dir_path(root, devfs_root, stable_name);
    let budget = if dev.is_initialized() {
        INITIALIZED_RETRY_BUDGET
    } else {
        UNINITIALIZED_RETRY_BUDGET
    };

    for attempt in 0..budget {
        let st1 = stat_claim_dir(&claim_dir);

        let winner = find_prioritized(dev, add, &claim_dir, resolver)?;

        let Some(winner) = winner else {
            let _ = std::fs::remove_file(stable_name);
            rmdir_parents_to(stable_name.parent(), devfs_root);
            debug!(?stable_name, "no claimant left, link removed");
            return Ok(());
        };

        match node_symlink(dev, &winner.node, stable_name) {
            Ok(LinkOutcome::Replaced) => {
                debug!(?stable_name, attempt, "link replaced, re-checking convergence");
                continue;
            }
            Ok(LinkOutcome::Created) | Ok(LinkOutcome::Preserved) => {
                let st2 = stat_claim_dir(&claim_dir);
                if claim_set_stable(st1, st2) {
                    return Ok(());
                }
                debug!(?stable_name, attempt, "claim set changed mid-update, re-checking");
            }
            Err(e) => {
                if add {
                    remove_claim(root, devfs_root, dev, stable_name);
                }
                return Err(e);
            }
        }
    }

    Err(Error::ConvergenceExhausted {
        path: stable_name.to_path_buf(),
        attempts: budget,
    })
}

/// Two snapshots describe a stable claim set when the directory existed
/// both times with an unchanged mtime; a directory that was absent before
/// and is still being looked at is, by definition, not going to grow a
/// competing claimant between the two stats we just took, so treat that
/// as stable too.
fn claim_set_stable(before: ClaimDirState, after: ClaimDirState) -> bool {
    match (before, after) {
        (ClaimDirState::Missing, _) => true,
        (
            ClaimDirState::Present { modified: m1 },
            ClaimDirState::Present { modified: m2 },
        ) => m1 == m2,
        (ClaimDirState::Present { .. }, ClaimDirState::Missing) => false,
    }
}

/// Remove empty directories from `dir` upward, stopping at (not
/// crossing) `stop_at`. Best-effort: any non-empty or missing directory
/// simply ends the walk.
fn rmdir_parents_to(dir: Option<&Path>, stop_at: &Path) {
    let mut current = dir;
    while let Some(d) = current {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        match std::fs::remove_dir(d) {
            Ok(()) => current = d.parent(),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{StubDevice, StubResolver};
    use tempfile::tempdir;

    fn devfs() -> (tempfile::TempDir, tempfile::TempDir) {
        (tempdir().unwrap(), tempdir().unwrap())
    }

    #[test]
    fn rejects_stable_name_outside_devfs_root() {
        let (root, devfs) = devfs();
        let dev = StubDevice::new("d1", devfs.path().join("sda"), 0);
        let resolver = StubResolver::new().with(dev.clone());
        let outside = Path::new("/not/under/devfs/link");

        let err = link_update(&dev, outside, true, root.path(), devfs.path(), &resolver)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn single_claimant_add_creates_link() {
        let (root, devfs) = devfs();
        std::fs::write(devfs.path().join("sda"), b"").unwrap();
        let dev = StubDevice::new("d1", devfs.path().join("sda"), 0);
        let resolver = StubResolver::new().with(dev.clone());
        let link = devfs.path().join("disk/by-id/X");

        link_update(&dev, &link, true, root.path(), devfs.path(), &resolver).unwrap();
        assert!(link.symlink_metadata().is_ok());
    }

    #[test]
    fn removing_last_claimant_deletes_link() {
        let (root, devfs) = devfs();
        std::fs::write(devfs.path().join("sda"), b"").unwrap();
        let dev = StubDevice::new("d1", devfs.path().join("sda"), 0);
        let resolver = StubResolver::new().with(dev.clone());
        let link = devfs.path().join("disk/by-id/X");

        link_update(&dev, &link, true, root.path(), devfs.path(), &resolver).unwrap();
        link_update(&dev, &link, false, root.path(), devfs.path(), &resolver).unwrap();
        assert!(link.symlink_metadata().is_err());
    }
}
