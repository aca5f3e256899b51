//! The entry points the rest of Phantom calls when a device appears,
//! disappears, or has its property database replaced.

use std::path::Path;

use tracing::{debug, warn};

use crate::config::LinksConfig;
use crate::device::{DeviceHandle, DeviceResolver};
use crate::error::Result;
use crate::permissions::node_permissions_apply;
use crate::updater::link_update;
use crate::writer::node_symlink;

/// Bring `dev`'s node permissions, fixed-topology link, and every stable
/// name it claims into sync.
///
/// Per-name link failures are logged and skipped rather than aborting the
/// whole call — one broken stable name (for example, one that collides
/// with a real device node someone else owns) must not block every other
/// name this device also claims.
#[allow(clippy::too_many_arguments)]
pub fn add(
    dev: &dyn DeviceHandle,
    apply_mac: bool,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    seclabels: &[(String, String)],
    config: &LinksConfig,
    resolver: &dyn DeviceResolver,
) -> Result<()> {
    node_permissions_apply(dev, apply_mac, mode, uid, gid, seclabels)?;

    let (major, minor) = dev.devnum();
    let topology_link = config.topology_link(dev.is_block(), major, minor);
    if let Err(e) = node_symlink(dev, dev.devname(), &topology_link) {
        warn!(?topology_link, error = %e, "failed to install fixed-topology link");
    }

    for stable_name in dev.devlinks() {
        if let Err(e) = link_update(
            dev,
            &stable_name,
            true,
            &config.claim_root,
            &config.devfs_root,
            resolver,
        ) {
            warn!(?stable_name, error = %e, "failed to update stable name link");
        }
    }

    Ok(())
}

/// Retract every claim `dev` holds and remove its fixed-topology link.
pub fn remove(
    dev: &dyn DeviceHandle,
    config: &LinksConfig,
    resolver: &dyn DeviceResolver,
) -> Result<()> {
    for stable_name in dev.devlinks() {
        if let Err(e) = link_update(
            dev,
            &stable_name,
            false,
            &config.claim_root,
            &config.devfs_root,
            resolver,
        ) {
            warn!(?stable_name, error = %e, "failed to retract stable name link");
        }
    }

    let (major, minor) = dev.devnum();
    let topology_link = config.topology_link(dev.is_block(), major, minor);
    match std::fs::remove_file(&topology_link) {
        Ok(()) => debug!(?topology_link, "removed fixed-topology link"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(?topology_link, error = %e, "failed to remove fixed-topology link"),
    }

    Ok(())
}

/// Retract every claim `dev_old` held that `dev` (the replacement
/// property database entry for the same device) no longer claims.
///
/// Called when Phantom replaces a device's in-memory record wholesale
/// (a re-read of its properties) rather than removing and re-adding it,
/// so stable names the new record dropped still get cleaned up.
pub fn update_old_links(
    dev: &dyn DeviceHandle,
    dev_old: &dyn DeviceHandle,
    config: &LinksConfig,
    resolver: &dyn DeviceResolver,
) -> Result<()> {
    let current: std::collections::HashSet<_> = dev.devlinks().into_iter().collect();

    for stable_name in dev_old.devlinks() {
        if current.contains(&stable_name) {
            continue;
        }
        if let Err(e) = link_update(
            dev_old,
            &stable_name,
            false,
            &config.claim_root,
            &config.devfs_root,
            resolver,
        ) {
            warn!(?stable_name, error = %e, "failed to retract stale stable name link");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{StubDevice, StubResolver};
    use tempfile::tempdir;

    fn config(root: &Path, devfs: &Path) -> LinksConfig {
        LinksConfig::new(root.to_path_buf(), devfs.to_path_buf())
    }

    #[test]
    fn add_installs_topology_link_and_stable_names() {
        let root = tempdir().unwrap();
        let devfs = tempdir().unwrap();
        std::fs::write(devfs.path().join("sda"), b"").unwrap();

        let dev = StubDevice::new("d1", devfs.path().join("sda"), 0)
            .with_devlink(devfs.path().join("disk/by-id/X"));
        let resolver = StubResolver::new().with(dev.clone());
        let cfg = config(root.path(), devfs.path());

        add(&dev, false, None, None, None, &[], &cfg, &resolver).unwrap();

        let topology = cfg.topology_link(true, 8, 0);
        assert!(topology.symlink_metadata().is_ok());
        assert!(devfs.path().join("disk/by-id/X").symlink_metadata().is_ok());
    }

    #[test]
    fn remove_retracts_links_and_topology_entry() {
        let root = tempdir().unwrap();
        let devfs = tempdir().unwrap();
        std::fs::write(devfs.path().join("sda"), b"").unwrap();

        let dev = StubDevice::new("d1", devfs.path().join("sda"), 0)
            .with_devlink(devfs.path().join("disk/by-id/X"));
        let resolver = StubResolver::new().with(dev.clone());
        let cfg = config(root.path(), devfs.path());

        add(&dev, false, None, None, None, &[], &cfg, &resolver).unwrap();
        remove(&dev, &cfg, &resolver).unwrap();

        let topology = cfg.topology_link(true, 8, 0);
        assert!(topology.symlink_metadata().is_err());
        assert!(devfs.path().join("disk/by-id/X").symlink_metadata().is_err());
    }

    #[test]
    fn update_old_links_drops_names_no_longer_claimed() {
        let root = tempdir().unwrap();
        let devfs = tempdir().unwrap();
        std::fs::write(devfs.path().join("sda"), b"").unwrap();

        let dev_old = StubDevice::new("d1", devfs.path().join("sda"), 0)
            .with_devlink(devfs.path().join("disk/by-id/X"))
            .with_devlink(devfs.path().join("disk/by-id/Y"));
        let dev_new = StubDevice::new("d1", devfs.path().join("sda"), 0)
            .with_devlink(devfs.path().join("disk/by-id/Y"));
        let resolver = StubResolver::new().with(dev_old.clone());
        let cfg = config(root.path(), devfs.path());

        add(&dev_old, false, None, None, None, &[], &cfg, &resolver).unwrap();
        assert!(devfs.path().join("disk/by-id/X").symlink_metadata().is_ok());

        update_old_links(&dev_new, &dev_old, &cfg, &resolver).unwrap();
        assert!(devfs.path().join("disk/by-id/X").symlink_metadata().is_err());
        assert!(devfs.path().join("disk/by-id/Y").symlink_metadata().is_ok());
    }
}
