//! USB SCSI subclass
//!
//! Parses Command Descriptor Blocks out of the transport and hands them to
//! the application as [`ScsiCommand`] values. Only the 6- and 10-byte CDB
//! groups are decoded; 12- and 16-byte groups surface as [`Unknown`] and
//! the vendor groups (6 and 7) as [`Vendor`].
//!
//! [`Unknown`]: ScsiCommand::Unknown
//! [`Vendor`]: ScsiCommand::Vendor

use crate::fmt::debug;
use crate::subclass::Command;
use crate::transport::bbb::{BulkOnly, BulkOnlyError};
use crate::transport::{Transport, TransportError};
use crate::CLASS_MASS_STORAGE;
use core::borrow::BorrowMut;
use num_enum::TryFromPrimitive;
use usb_device::bus::InterfaceNumber;
use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::class::{ControlIn, ControlOut, UsbClass};
use usb_device::descriptor::DescriptorWriter;
use usb_device::UsbError;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/* SCSI codes */

/* SPC */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
#[cfg(feature = "rw-buffer")]
const WRITE_BUFFER: u8 = 0x3B;
#[cfg(feature = "rw-buffer")]
const READ_BUFFER: u8 = 0x3C;

/* SBC */
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;

/* MMC */
const READ_FORMAT_CAPACITIES: u8 = 0x23;

/// SCSI command
///
/// Refer to specifications (SPC,SAM,SBC,MMC,etc.)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    /// Opcode not implemented by this device
    Unknown,
    /// Recognized opcode carrying a reserved or malformed field
    Invalid,

    /* SPC */
    TestUnitReady,
    RequestSense {
        alloc_len: u8,
    },
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    ModeSense6 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u8,
    },
    StartStopUnit {
        start: bool,
        load_eject: bool,
    },
    PreventAllowMediumRemoval {
        prevent: bool,
    },
    #[cfg(feature = "rw-buffer")]
    ReadBuffer {
        mode: u8,
        buffer_id: u8,
        offset: u32,
        alloc_len: u32,
    },
    #[cfg(feature = "rw-buffer")]
    WriteBuffer {
        mode: u8,
        buffer_id: u8,
        offset: u32,
        param_len: u32,
    },

    /* SBC */
    ReadCapacity10,
    Read {
        lba: u32,
        len: u16,
    },
    Write {
        lba: u32,
        len: u16,
    },

    /* MMC */
    ReadFormatCapacities {
        alloc_len: u16,
    },

    /// Vendor-specific CDB (groups 6 and 7); routed to the LUN vendor hook
    Vendor {
        opcode: u8,
    },
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

/// 24-bit big-endian field, used by READ/WRITE BUFFER offsets and lengths
#[cfg(feature = "rw-buffer")]
fn be24(bytes: &[u8]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

fn parse_cb(cb: &[u8]) -> ScsiCommand {
    if cb.is_empty() {
        return ScsiCommand::Unknown;
    }
    // the top three opcode bits select the CDB group and length
    match cb[0] >> 5 {
        0 => parse_cb6(cb),
        1 | 2 => parse_cb10(cb),
        6 | 7 => ScsiCommand::Vendor { opcode: cb[0] },
        // 12- and 16-byte CDB groups are not implemented
        _ => ScsiCommand::Unknown,
    }
}

fn parse_cb6(cb: &[u8]) -> ScsiCommand {
    if cb.len() < 6 {
        return ScsiCommand::Unknown;
    }
    match cb[0] {
        TEST_UNIT_READY => ScsiCommand::TestUnitReady,
        REQUEST_SENSE => ScsiCommand::RequestSense { alloc_len: cb[4] },
        INQUIRY => {
            // bits 7..1 of byte 1 are reserved (EVPD only)
            if cb[1] & 0xFE != 0 {
                return ScsiCommand::Invalid;
            }
            ScsiCommand::Inquiry {
                evpd: (cb[1] & 0b00000001) != 0,
                page_code: cb[2],
                alloc_len: u16::from_be_bytes([cb[3], cb[4]]),
            }
        }
        MODE_SENSE_6 => ScsiCommand::ModeSense6 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: PageControl::try_from_primitive(cb[2] >> 6).unwrap(),
            page_code: cb[2] & 0b00111111,
            subpage_code: cb[3],
            alloc_len: cb[4],
        },
        START_STOP_UNIT => ScsiCommand::StartStopUnit {
            start: (cb[4] & 0b00000001) != 0,
            load_eject: (cb[4] & 0b00000010) != 0,
        },
        PREVENT_ALLOW_MEDIUM_REMOVAL => ScsiCommand::PreventAllowMediumRemoval {
            prevent: (cb[4] & 0b00000011) != 0,
        },
        _ => ScsiCommand::Unknown,
    }
}

fn parse_cb10(cb: &[u8]) -> ScsiCommand {
    if cb.len() < 10 {
        return ScsiCommand::Unknown;
    }
    match cb[0] {
        READ_CAPACITY_10 => ScsiCommand::ReadCapacity10,
        READ_10 => ScsiCommand::Read {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        WRITE_10 => ScsiCommand::Write {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        READ_FORMAT_CAPACITIES => ScsiCommand::ReadFormatCapacities {
            alloc_len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        #[cfg(feature = "rw-buffer")]
        READ_BUFFER => ScsiCommand::ReadBuffer {
            mode: cb[1],
            buffer_id: cb[2],
            offset: be24(&cb[3..6]),
            alloc_len: be24(&cb[6..9]),
        },
        #[cfg(feature = "rw-buffer")]
        WRITE_BUFFER => ScsiCommand::WriteBuffer {
            mode: cb[1],
            buffer_id: cb[2],
            offset: be24(&cb[3..6]),
            param_len: be24(&cb[6..9]),
        },
        _ => ScsiCommand::Unknown,
    }
}

/// SCSI USB Mass Storage subclass
pub struct Scsi<T: Transport> {
    interface: InterfaceNumber,
    pub(crate) transport: T,
}

/// SCSI subclass implementation with [Bulk Only Transport]
///
/// [Bulk Only Transport]: crate::transport::bbb::BulkOnly
impl<'alloc, Bus: UsbBus + 'alloc, Buf: BorrowMut<[u8]>> Scsi<BulkOnly<'alloc, Bus, Buf>> {
    /// Creates an SCSI over Bulk Only Transport instance
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `packet_size` - Maximum USB packet size. Allowed values: 8,16,32,64
    /// * `max_lun` - The max index of the Logical Unit
    /// * `buf` - The underlying IO buffer. It is **required** to fit at
    ///   least a `CBW` and/or a single packet. It is **recommended** that
    ///   the buffer fits at least one logical block
    ///
    /// # Errors
    /// * [InvalidMaxLun]
    /// * [BufferTooSmall]
    ///
    /// # Panics
    /// Panics if endpoint allocation fails.
    ///
    /// [InvalidMaxLun]: crate::transport::bbb::BulkOnlyError::InvalidMaxLun
    /// [BufferTooSmall]: crate::transport::bbb::BulkOnlyError::BufferTooSmall
    /// [UsbBusAllocator]: usb_device::bus::UsbBusAllocator
    pub fn new(
        alloc: &'alloc UsbBusAllocator<Bus>,
        packet_size: u16,
        max_lun: u8,
        buf: Buf,
    ) -> Result<Self, BulkOnlyError> {
        BulkOnly::new(alloc, packet_size, max_lun, buf).map(|transport| Self {
            interface: alloc.interface(),
            transport,
        })
    }

    /// Drive subclass in both directions
    ///
    /// The passed closure may or may not be called after each time this
    /// function is called. Moreover, it may be called multiple times, if
    /// subclass is unable to proceed further.
    ///
    /// # Arguments
    /// * `callback` - closure, in which the SCSI command is processed
    pub fn poll<F>(&mut self, mut callback: F) -> Result<(), UsbError>
    where
        F: FnMut(Command<ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>),
    {
        fn map_ignore<T>(res: Result<T, TransportError<BulkOnlyError>>) -> Result<(), UsbError> {
            match res {
                Ok(_)
                | Err(TransportError::Usb(UsbError::WouldBlock))
                | Err(TransportError::Error(_)) => Ok(()),
                Err(TransportError::Usb(err)) => Err(err),
            }
        }
        // drive transport in both directions before user action
        map_ignore(self.transport.read())?;
        map_ignore(self.transport.write())?;

        if let Some(raw_cb) = self.transport.get_command() {
            // exec callback only if user action required
            if !self.transport.has_status() {
                let lun = raw_cb.lun;
                let kind = parse_cb(raw_cb.bytes);

                debug!("usb: scsi: Command: {}", kind);

                loop {
                    callback(Command {
                        class: self,
                        kind,
                        lun,
                    });

                    // drive transport in both directions after user action.
                    // exec callback if not enough data
                    match self.transport.write() {
                        Err(TransportError::Error(BulkOnlyError::FullPacketExpected)) => {
                            continue;
                        }
                        Ok(_)
                        | Err(TransportError::Error(_))
                        | Err(TransportError::Usb(UsbError::WouldBlock)) => { /* ignore */ }
                        Err(TransportError::Usb(err)) => {
                            return Err(err);
                        }
                    };
                    map_ignore(self.transport.read())?;

                    break;
                }
            }
        }

        Ok(())
    }
}

impl<Bus, T> UsbClass<Bus> for Scsi<T>
where
    Bus: UsbBus,
    T: Transport<Bus = Bus>,
{
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.iad(
            self.interface,
            1,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            T::PROTO,
            None,
        )?;
        writer.interface(self.interface, CLASS_MASS_STORAGE, SUBCLASS_SCSI, T::PROTO)?;

        self.transport.get_endpoint_descriptors(writer)?;

        Ok(())
    }

    fn reset(&mut self) {
        self.transport.reset()
    }

    fn control_in(&mut self, xfer: ControlIn<Bus>) {
        self.transport.control_in(xfer)
    }

    fn control_out(&mut self, xfer: ControlOut<Bus>) {
        self.transport.control_out(xfer)
    }
}
