//! Reconcile a live device node's mode, ownership, and MAC labels against
//! what the rest of Phantom has decided they should be.
//!
//! Everything here operates through an `O_PATH` file descriptor opened
//! with `O_NOFOLLOW`, pinning the exact inode we fstat'd so a racing
//! `rm`/`mknod` can't swap in a different file underneath us. Ownership
//! and timestamps are mutated directly against that fd via `fchownat`/
//! `utimensat` with `AT_EMPTY_PATH`; mode is not, since glibc's
//! `fchmodat` wrapper rejects any flags but `AT_SYMLINK_NOFOLLOW` (the
//! kernel `fchmodat(2)` has no flags argument at all — `AT_EMPTY_PATH`
//! needs `fchmodat2`, a much newer syscall) and so instead goes through
//! `chmod` on the fd's `/proc/self/fd/<n>` path, same as the xattr calls
//! below.

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::SFlag;
use tracing::{debug, error};

use crate::device::DeviceHandle;
use crate::error::Result;

const SELINUX_XATTR: &str = "security.selinux";
const SMACK_XATTR: &str = "security.SMACK64";

/// Reconcile `dev`'s node permissions, ownership, and (if `apply_mac`)
/// MAC labels, then refresh its timestamps.
///
/// Silently does nothing if the node is missing or no longer belongs to
/// this device (another device has since taken the inode) — both are
/// races this crate is designed to tolerate, not errors.
pub fn node_permissions_apply(
    dev: &dyn DeviceHandle,
    apply_mac: bool,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    seclabels: &[(String, String)],
) -> Result<()> {
    let path = dev.devname();
    let c_path = match to_cstring(path) {
        Some(c) => c,
        None => return Ok(()),
    };

    let fd = match open_path_nofollow(&c_path) {
        Some(fd) => fd,
        None => return Ok(()),
    };

    let st = match raw_fstat(fd.as_raw_fd()) {
        Some(st) => st,
        None => return Ok(()),
    };

    let want_block = dev.is_block();
    let actual_type = SFlag::from_bits_truncate(st.st_mode as u32) & SFlag::S_IFMT;
    let expected_type = if want_block { SFlag::S_IFBLK } else { SFlag::S_IFCHR };
    if actual_type != expected_type {
        // Another device has taken this inode since; leave it alone.
        return Ok(());
    }

    let (major, minor) = dev.devnum();
    let want_rdev = nix::sys::stat::makedev(major as u64, minor as u64) as libc::dev_t;
    if st.st_rdev != want_rdev {
        return Ok(());
    }

    let want_mode = mode.map(|m| apply_type_bits(m, want_block));
    let uid_changed = uid.map(|u| u != st.st_uid).unwrap_or(false);
    let gid_changed = gid.map(|g| g != st.st_gid).unwrap_or(false);
    let mode_changed = want_mode
        .map(|m| (m & 0o7777) != (st.st_mode as u32 & 0o7777))
        .unwrap_or(false);

    if mode_changed {
        if let Err(e) = chmod_via_proc_fd(fd.as_raw_fd(), want_mode.unwrap()) {
            error!(?path, error = %e, "failed to apply device node mode");
        }
    }

    if uid_changed || gid_changed {
        let new_uid = uid.unwrap_or(st.st_uid);
        let new_gid = gid.unwrap_or(st.st_gid);
        if let Err(e) = fchownat_empty(fd.as_raw_fd(), new_uid, new_gid) {
            error!(?path, error = %e, "failed to apply device node ownership");
        }
    }

    if apply_mac {
        apply_label(fd.as_raw_fd(), SELINUX_XATTR, find_label(seclabels, "selinux"));
        apply_label(fd.as_raw_fd(), SMACK_XATTR, find_label(seclabels, "smack"));
    }

    touch_empty(fd.as_raw_fd());

    Ok(())
}

/// Best-effort: clear any MAC labels on a freshly created path so it
/// falls back to the policy default (inherit from parent directory).
/// Used by the writer when it creates a symlink or an intermediate
/// directory outright, where there is no device-specific label to apply.
pub fn apply_default_label(path: &Path) {
    let _ = xattr::remove(path, SELINUX_XATTR);
    let _ = xattr::remove(path, SMACK_XATTR);
}

fn find_label<'a>(seclabels: &'a [(String, String)], module: &str) -> Option<&'a str> {
    seclabels
        .iter()
        .find(|(m, _)| m == module)
        .map(|(_, v)| v.as_str())
}

fn apply_label(fd: i32, attr: &str, value: Option<&str>) {
    let path = proc_fd_path(fd);
    let result = match value {
        Some(v) => xattr::set(&path, attr, v.as_bytes()),
        None => xattr::remove(&path, attr),
    };
    if let Err(e) = result {
        if e.kind() == std::io::ErrorKind::NotFound {
            debug!(attr, "MAC label target vanished before it could be labelled");
        } else {
            error!(attr, error = %e, "failed to apply MAC label");
        }
    }
}

/// `xattr` operates on paths, not file descriptors; resolve the open
/// `O_PATH` fd back through `/proc/self/fd` so label writes still hit the
/// exact inode we opened rather than a fresh, possibly racy, lookup.
fn proc_fd_path(fd: i32) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("/proc/self/fd/{fd}"))
}

fn to_cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

fn raw_fstat(fd: i32) -> Option<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    let ret = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    Some(unsafe { st.assume_init() })
}

fn open_path_nofollow(path: &CString) -> Option<OwnedFd> {
    let raw = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if raw < 0 {
        return None;
    }
    Some(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn type_bits(is_block: bool) -> u32 {
    if is_block {
        libc::S_IFBLK
    } else {
        libc::S_IFCHR
    }
}

fn apply_type_bits(mode: u32, is_block: bool) -> u32 {
    (mode & 0o7777) | type_bits(is_block)
}

/// `chmod` through the fd's `/proc/self/fd/<n>` path, since there is no
/// flags-accepting `fchmodat` syscall on the kernels this crate targets
/// (see the module doc comment).
fn chmod_via_proc_fd(fd: i32, mode: u32) -> std::io::Result<()> {
    let path = proc_fd_path(fd);
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "interior NUL in /proc fd path")
    })?;
    let ret = unsafe { libc::chmod(c_path.as_ptr(), (mode & 0o7777) as libc::mode_t) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn fchownat_empty(fd: i32, uid: u32, gid: u32) -> std::io::Result<()> {
    let empty = CString::new("").unwrap();
    let ret = unsafe {
        libc::fchownat(
            fd,
            empty.as_ptr(),
            uid as libc::uid_t,
            gid as libc::gid_t,
            libc::AT_EMPTY_PATH,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn touch_empty(fd: i32) {
    let empty = CString::new("").unwrap();
    let ret = unsafe {
        libc::utimensat(
            fd,
            empty.as_ptr(),
            std::ptr::null(),
            libc::AT_EMPTY_PATH,
        )
    };
    if ret != 0 {
        let errno = Errno::last();
        if errno != Errno::ENOENT {
            debug!(error = %errno, "failed to refresh device node timestamps");
        }
    }
}
