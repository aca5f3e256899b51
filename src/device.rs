//! The device abstraction this crate consumes from the rest of Phantom.
//!
//! Production wiring (a real sysfs/hwdb-backed implementation) lives
//! outside this crate; what's here is the trait contract plus a small
//! in-memory stub used by this crate's own tests and, optionally, by
//! integration tests elsewhere in the Phantom workspace.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// A device as seen by the link manager. Implemented by the rest of
/// Phantom; every getter here corresponds to one of the eight operations
/// Phantom's device database already exposes (`get_devname`,
/// `get_devnum`, `get_subsystem`, `get_devpath`, `get_device_id`,
/// `get_devlink_priority`, `get_is_initialized`, `for_each_devlink`).
pub trait DeviceHandle {
    /// Stable, unique, filesystem-safe device id. Used as a marker
    /// filename in the claim index.
    fn device_id(&self) -> &str;

    /// Absolute device node path, e.g. `/dev/sda`.
    fn devname(&self) -> &Path;

    /// `(major, minor)`.
    fn devnum(&self) -> (u32, u32);

    /// `"block"`, `"net"`, `"input"`, ... Mapped to `"char"` for the
    /// fixed-topology link whenever it isn't exactly `"block"`.
    fn subsystem(&self) -> &str;

    /// Device path relative to `/sys`, used only for diagnostics here.
    fn devpath(&self) -> &str;

    /// Signed priority hint from the rule engine. Higher wins arbitration.
    fn devlink_priority(&self) -> i32;

    /// True once the rest of Phantom has committed this device's property
    /// database entry. Gates the link updater's retry budget (§4.5).
    fn is_initialized(&self) -> bool;

    /// Ordered stable-name paths this device currently claims.
    fn devlinks(&self) -> Vec<PathBuf>;

    /// `true` if `subsystem()` is exactly `"block"`.
    fn is_block(&self) -> bool {
        self.subsystem() == "block"
    }
}

/// Rehydrates a peer device handle from the device id recorded as a claim
/// marker filename. The arbiter uses this to resolve other claimants
/// without keeping its own in-memory device table — the claim index
/// itself is the only durable record of "who else is claiming this name".
pub trait DeviceResolver {
    fn resolve(&self, device_id: &str) -> Result<Box<dyn DeviceHandle>>;
}

/// A minimal in-memory [`DeviceHandle`] for tests.
#[derive(Debug, Clone)]
pub struct StubDevice {
    pub id: String,
    pub node: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub subsystem: String,
    pub priority: i32,
    pub initialized: bool,
    pub devlinks: Vec<PathBuf>,
}

impl StubDevice {
    pub fn new(id: &str, node: impl Into<PathBuf>, priority: i32) -> Self {
        StubDevice {
            id: id.to_string(),
            node: node.into(),
            major: 8,
            minor: 0,
            subsystem: "block".to_string(),
            priority,
            initialized: true,
            devlinks: Vec::new(),
        }
    }

    pub fn with_devlink(mut self, path: impl Into<PathBuf>) -> Self {
        self.devlinks.push(path.into());
        self
    }

    pub fn with_initialized(mut self, initialized: bool) -> Self {
        self.initialized = initialized;
        self
    }

    pub fn with_devnum(mut self, major: u32, minor: u32) -> Self {
        self.major = major;
        self.minor = minor;
        self
    }

    pub fn with_subsystem(mut self, subsystem: &str) -> Self {
        self.subsystem = subsystem.to_string();
        self
    }
}

impl DeviceHandle for StubDevice {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn devname(&self) -> &Path {
        &self.node
    }

    fn devnum(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    fn subsystem(&self) -> &str {
        &self.subsystem
    }

    fn devpath(&self) -> &str {
        "/devices/stub"
    }

    fn devlink_priority(&self) -> i32 {
        self.priority
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn devlinks(&self) -> Vec<PathBuf> {
        self.devlinks.clone()
    }
}

/// A [`DeviceResolver`] backed by a fixed table of [`StubDevice`]s, keyed
/// by device id. Tests populate it directly; production code never uses
/// it.
#[derive(Debug, Clone, Default)]
pub struct StubResolver {
    devices: Vec<StubDevice>,
}

impl StubResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, device: StubDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn insert(&mut self, device: StubDevice) {
        self.devices.push(device);
    }
}

impl DeviceResolver for StubResolver {
    fn resolve(&self, device_id: &str) -> Result<Box<dyn DeviceHandle>> {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .map(|d| Box::new(d) as Box<dyn DeviceHandle>)
            .ok_or_else(|| {
                crate::error::Error::fatal_no_path(
                    "resolve unknown device id",
                    nix::errno::Errno::ENODEV,
                )
            })
    }
}
