//! Firmware core for the cowstick USB mass-storage dongle
//!
//! The cowstick presents itself to a host as a removable disk backed by one
//! or more SPI-attached NOR flash chips. This crate contains everything
//! between the USB packet-memory controller and the flash dies:
//!
//! * [`bus`] - a [usb-device] bus driver for packet-buffer USB controllers
//! * [`transport`] - the Mass Storage Bulk Only Transport (CBW/Data/CSW)
//! * [`subclass`] - SCSI subclass plumbing and CDB parsing
//! * [`scsi`] - the SCSI command handlers, logical units and sense record
//! * [`mem`] - the external-memory abstraction with its 4 KiB page cache
//! * [`flash`] - a series-25 SPI-NOR driver
//! * [`registry`] - interface registry with enable/periodic hooks
//! * [`time`] - the millisecond time service
//!
//! The hardware specific pieces (clock tree, pin muxing, the UART console
//! and the custom-app loader) live in the board firmware, not here. They
//! talk to this crate through [`usb_device::bus::UsbBus`], the blocking
//! [`embedded_hal`] SPI traits and the small collaborator traits in
//! [`scsi`].
//!
//! # Features
//! | Feature | Description                                                      |
//! | ------- |------------------------------------------------------------------|
//! | `rw-buffer` | READ BUFFER / WRITE BUFFER diagnostic channel (default)      |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device

#![cfg_attr(not(test), no_std)]

pub(crate) mod buffer;
pub(crate) mod fmt;

pub mod bus;
pub mod device;
pub mod flash;
pub mod mem;
pub mod registry;
pub mod scsi;
pub mod subclass;
pub mod time;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;

/// Logical block size presented to the host, in bytes
pub const BLOCK_SIZE: usize = 512;
