//! Decide which device currently wins the right to own a stable name.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::claim::claim_dir_path;
use crate::device::{DeviceHandle, DeviceResolver};
use crate::error::Result;

/// The current winner of a stable name: its device node and the priority
/// it won with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Winner {
    pub node: PathBuf,
    pub priority: i32,
}

/// Find the device that should currently own `stable_name`, seeding the
/// contest with `dev` itself when `add` is true.
///
/// Stale claim markers (pointing at a device id the resolver can no
/// longer resolve, or whose node/priority cannot be read) are skipped
/// rather than treated as errors — a crashed process leaving its marker
/// behind must not jam arbitration for everyone else.
pub fn find_prioritized(
    dev: &dyn DeviceHandle,
    add: bool,
    claim_dir: &Path,
    resolver: &dyn DeviceResolver,
) -> Result<Option<Winner>> {
    let mut best: Option<Winner> = if add {
        Some(Winner {
            node: dev.devname().to_path_buf(),
            priority: dev.devlink_priority(),
        })
    } else {
        None
    };

    let entries = match std::fs::read_dir(claim_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(best),
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) if !n.is_empty() && !n.starts_with('.') => n,
            _ => continue,
        };
        if name == dev.device_id() {
            continue;
        }

        let candidate = match resolver.resolve(name) {
            Ok(c) => c,
            Err(_) => {
                debug!(id = name, "skipping unresolvable claim marker");
                continue;
            }
        };

        let priority = candidate.devlink_priority();
        let replace = match &best {
            // Strictly greater only: ties favor whichever candidate was
            // adopted first, which is the self-seed when `add` is set.
            Some(current) => priority > current.priority,
            None => true,
        };
        if replace {
            best = Some(Winner {
                node: candidate.devname().to_path_buf(),
                priority,
            });
        }
    }

    Ok(best)
}

/// Convenience wrapper computing `claim_dir` from the claim root,
/// device filesystem root, and stable name, for callers that don't
/// already have it handy.
pub fn find_prioritized_for(
    dev: &dyn DeviceHandle,
    add: bool,
    root: &Path,
    devfs_root: &Path,
    stable_name: &Path,
    resolver: &dyn DeviceResolver,
) -> Result<Option<Winner>> {
    find_prioritized(dev, add, &claim_dir_path(root, devfs_root, stable_name), resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::add_claim;
    use crate::device::{StubDevice, StubResolver};
    use tempfile::tempdir;

    const DEVFS_ROOT: &str = "/dev";

    #[test]
    fn self_seed_wins_with_no_other_claimants() {
        let root = tempdir().unwrap();
        let dev = StubDevice::new("d1", "/dev/sda", 5);
        let resolver = StubResolver::new();
        let name = Path::new("/dev/disk/by-id/X");

        let winner = find_prioritized_for(&dev, true, root.path(), Path::new(DEVFS_ROOT), name, &resolver)
            .unwrap()
            .unwrap();
        assert_eq!(winner.node, Path::new("/dev/sda"));
        assert_eq!(winner.priority, 5);
    }

    #[test]
    fn higher_priority_claimant_wins() {
        let root = tempdir().unwrap();
        let name = Path::new("/dev/disk/by-id/X");
        let d1 = StubDevice::new("d1", "/dev/sda", 0);
        let d2 = StubDevice::new("d2", "/dev/sdb", 10);

        add_claim(root.path(), Path::new(DEVFS_ROOT), &d1, name).unwrap();
        add_claim(root.path(), Path::new(DEVFS_ROOT), &d2, name).unwrap();

        let resolver = StubResolver::new().with(d1.clone()).with(d2.clone());
        let winner = find_prioritized_for(&d1, true, root.path(), Path::new(DEVFS_ROOT), name, &resolver)
            .unwrap()
            .unwrap();
        assert_eq!(winner.node, Path::new("/dev/sdb"));
        assert_eq!(winner.priority, 10);
    }

    #[test]
    fn tie_favors_self_seed() {
        let root = tempdir().unwrap();
        let name = Path::new("/dev/disk/by-id/X");
        let d1 = StubDevice::new("d1", "/dev/sda", 5);
        let d2 = StubDevice::new("d2", "/dev/sdb", 5);

        add_claim(root.path(), Path::new(DEVFS_ROOT), &d2, name).unwrap();

        let resolver = StubResolver::new().with(d1.clone()).with(d2.clone());
        let winner = find_prioritized_for(&d1, true, root.path(), Path::new(DEVFS_ROOT), name, &resolver)
            .unwrap()
            .unwrap();
        assert_eq!(winner.node, Path::new("/dev/sda"));
    }

    #[test]
    fn unresolvable_marker_is_skipped() {
        let root = tempdir().unwrap();
        let name = Path::new("/dev/disk/by-id/X");
        let d1 = StubDevice::new("d1", "/dev/sda", 0);
        let ghost = StubDevice::new("ghost", "/dev/sdz", 99);

        add_claim(root.path(), Path::new(DEVFS_ROOT), &ghost, name).unwrap();

        let resolver = StubResolver::new().with(d1.clone());
        let winner = find_prioritized_for(&d1, true, root.path(), Path::new(DEVFS_ROOT), name, &resolver)
            .unwrap()
            .unwrap();
        assert_eq!(winner.node, Path::new("/dev/sda"));
    }

    #[test]
    fn no_claimants_and_no_seed_returns_none() {
        let root = tempdir().unwrap();
        let name = Path::new("/dev/disk/by-id/X");
        let d1 = StubDevice::new("d1", "/dev/sda", 0);
        let resolver = StubResolver::new();

        let winner =
            find_prioritized_for(&d1, false, root.path(), Path::new(DEVFS_ROOT), name, &resolver)
                .unwrap();
        assert!(winner.is_none());
    }
}
