//! Device-node symlink manager: the part of Phantom that decides which
//! device currently owns a stable name (`/dev/disk/by-id/...`, `/dev/net/
//! ...`) and keeps that name's symlink and fixed-topology counterpart
//! converged as devices come and go.
//!
//! This crate does not talk to the kernel's uevent socket, does not parse
//! rule files, and does not maintain a device property database — all of
//! that lives elsewhere in Phantom and is handed to this crate through the
//! [`device::DeviceHandle`] and [`device::DeviceResolver`] traits. What's
//! here is the arbitration and filesystem-coordination core: given a
//! device and the stable names it claims, make the right symlinks exist.

pub mod arbiter;
pub mod claim;
pub mod config;
pub mod device;
pub mod error;
pub mod escape;
pub mod facade;
pub mod permissions;
pub mod updater;
pub mod writer;

pub use arbiter::Winner;
pub use config::LinksConfig;
pub use device::{DeviceHandle, DeviceResolver};
pub use error::{Error, Result};
pub use writer::LinkOutcome;
