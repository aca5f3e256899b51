//! Create or replace a symlink such that a reader never observes an absent
//! or half-written link, and never clobbers a real device node.

use std::ffi::CString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use nix::errno::Errno;
use tracing::debug;

use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::permissions::apply_default_label;

/// Outcome of [`node_symlink`]. A three-valued tag, not a side channel —
/// the link updater's convergence loop branches on exactly this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    Preserved,
    Replaced,
}

/// Create or atomically replace the symlink at `link_path` so that it
/// points at `node_path`.
pub fn node_symlink(
    dev: &dyn DeviceHandle,
    node_path: &Path,
    link_path: &Path,
) -> Result<LinkOutcome> {
    let target = relative_target(link_path, node_path)?;

    match fs::symlink_metadata(link_path) {
        Ok(meta) => {
            let file_type = meta.file_type();
            if file_type.is_block_device() || file_type.is_char_device() {
                return Err(Error::ConflictingNode {
                    path: link_path.to_path_buf(),
                });
            }

            if file_type.is_symlink() {
                if let Ok(current) = fs::read_link(link_path) {
                    if current == target {
                        apply_default_label(link_path);
                        touch_symlink(link_path)?;
                        debug!(?link_path, "symlink already correct");
                        return Ok(LinkOutcome::Preserved);
                    }
                }
            }

            replace(dev, &target, link_path)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            match create_direct(&target, link_path) {
                Ok(()) => Ok(LinkOutcome::Created),
                // Any failure other than a vanished parent directory falls
                // through to the replace path (§4.2 step 5-6 precedence).
                Err(_) => replace(dev, &target, link_path),
            }
        }
        Err(e) => Err(Error::fatal(
            "lstat link path",
            link_path,
            Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
        )),
    }
}

/// Direct creation for the common case where nothing exists at
/// `link_path` yet. Retries once if an intermediate directory vanished
/// underneath us.
fn create_direct(target: &Path, link_path: &Path) -> std::io::Result<()> {
    for _ in 0..2 {
        mkdir_parents(link_path)?;
        match std::os::unix::fs::symlink(target, link_path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
    std::os::unix::fs::symlink(target, link_path)
}

/// Atomic replace: create at a device-id-keyed temp path, then rename into
/// place. The temp suffix is keyed on device id so two devices racing to
/// install links for the same stable name never collide on the temp path.
fn replace(dev: &dyn DeviceHandle, target: &Path, link_path: &Path) -> Result<LinkOutcome> {
    let mut tmp_name = link_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(format!(".tmp-{}", dev.device_id()));
    let tmp_path = link_path.with_file_name(tmp_name);

    let _ = fs::remove_file(&tmp_path);

    let mut created = false;
    for _ in 0..2 {
        if let Err(e) = mkdir_parents(&tmp_path) {
            return Err(Error::fatal(
                "mkdir parents for temp link",
                &tmp_path,
                Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
            ));
        }
        match std::os::unix::fs::symlink(target, &tmp_path) {
            Ok(()) => {
                created = true;
                break;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(Error::fatal(
                    "symlink temp link",
                    &tmp_path,
                    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
                ));
            }
        }
    }
    if !created {
        return Err(Error::fatal("symlink temp link after retry", &tmp_path, Errno::ENOENT));
    }

    // Refuse-clobber applies to the final rename step too: re-check what's
    // at link_path right before committing, since the initial lstat guard
    // can be stale by now (another process may have mknod'd a real device
    // there in the meantime).
    if let Ok(meta) = fs::symlink_metadata(link_path) {
        let ft = meta.file_type();
        if ft.is_block_device() || ft.is_char_device() {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::ConflictingNode {
                path: link_path.to_path_buf(),
            });
        }
    }

    match fs::rename(&tmp_path, link_path) {
        Ok(()) => {
            debug!(?link_path, target = ?target, "replaced symlink");
            Ok(LinkOutcome::Replaced)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(Error::fatal(
                "rename temp link into place",
                link_path,
                Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
            ))
        }
    }
}

/// Ensure every ancestor directory of `path` exists (mode 0755), applying
/// the default MAC label to any directory this call creates.
fn mkdir_parents(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return Ok(()),
    };

    let mut built = PathBuf::new();
    for component in parent.components() {
        built.push(component);
        if matches!(component, Component::RootDir | Component::Prefix(_)) {
            continue;
        }
        match fs::create_dir(&built) {
            Ok(()) => {
                let _ = fs::set_permissions(&built, fs::Permissions::from_mode(0o755));
                apply_default_label(&built);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Refresh a symlink's own mtime (without following it) to now.
fn touch_symlink(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidPath {
            path: path.to_path_buf(),
            reason: "interior NUL".to_string(),
        })?;

    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            std::ptr::null(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        let errno = Errno::last();
        // Another device already removed the link out from under us; the
        // updater will re-evaluate on its next iteration.
        if errno == Errno::ENOENT {
            return Ok(());
        }
        return Err(Error::fatal("utimensat symlink", path, errno));
    }
    Ok(())
}

/// Shortest relative path from `link_path`'s parent directory to
/// `node_path`. Both paths are expected to be absolute.
fn relative_target(link_path: &Path, node_path: &Path) -> Result<PathBuf> {
    let base = link_path.parent().unwrap_or_else(|| Path::new("/"));
    diff_paths(node_path, base).ok_or_else(|| Error::NoRelativePath {
        from: base.to_path_buf(),
        to: node_path.to_path_buf(),
    })
}

/// Minimal `pathdiff`-equivalent: compute `target` relative to `base`,
/// assuming both are absolute and lexically normalised (device filesystem
/// paths never contain `.`/`..`, so no canonicalisation is needed).
fn diff_paths(target: &Path, base: &Path) -> Option<PathBuf> {
    let target_comps: Vec<Component> = target.components().collect();
    let base_comps: Vec<Component> = base.components().collect();

    let common = target_comps
        .iter()
        .zip(base_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in &base_comps[common..] {
        result.push("..");
    }
    for comp in &target_comps[common..] {
        result.push(comp.as_os_str());
    }

    if result.as_os_str().is_empty() {
        result.push(".");
    }

    Some(result)
}
