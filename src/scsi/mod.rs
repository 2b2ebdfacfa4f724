//! SCSI disk behavior
//!
//! [`device::ScsiHandler`] owns the logical-unit table and the sense record
//! and services the commands the [subclass] layer parses off the wire. The
//! actual storage sits behind the [`lun::StorageTarget`] capability hooks;
//! [`lun::CachedUnit`] binds them to the external-memory page cache.
//!
//! [subclass]: crate::subclass

pub mod device;
pub mod lun;
#[cfg(feature = "rw-buffer")]
pub mod rw_buffer;
pub mod sense;

pub use device::ScsiHandler;
pub use lun::{CachedUnit, LogicalUnit, Permissions, StorageTarget, TargetError};
#[cfg(feature = "rw-buffer")]
pub use rw_buffer::DiagnosticMemory;
pub use sense::{SenseCode, SenseData, SenseKey};
