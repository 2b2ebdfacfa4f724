//! USB Mass Storage subclasses

use crate::subclass::scsi::{Scsi, ScsiCommand};
use crate::transport::bbb::{BulkOnly, BulkOnlyError, DataDirection};
use crate::transport::{CommandStatus, TransportError};
use core::borrow::BorrowMut;
use usb_device::bus::UsbBus;

pub mod scsi;

/// The subclass' command and the LUN it is addressed to
pub struct Command<'a, Kind, Class> {
    class: &'a mut Class,
    pub kind: Kind,
    pub lun: u8,
}

/// [SCSI] over [Bulk Only Transport] command
///
/// [SCSI]: crate::subclass::scsi::Scsi
/// [Bulk Only Transport]: crate::transport::bbb::BulkOnly
impl<'a, 'alloc, Bus: UsbBus + 'alloc, Buf: BorrowMut<[u8]>>
    Command<'a, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>
{
    /// Tag of the CBW that carried this command. Echoed in the CSW.
    pub fn tag(&self) -> u32 {
        self.class.transport.tag()
    }

    /// `dCBWDataTransferLength`: how many data bytes the host expects to
    /// move for this command
    pub fn host_data_len(&self) -> u32 {
        self.class.transport.declared_data_len()
    }

    /// The host's data-phase direction
    pub fn host_direction(&self) -> DataDirection {
        self.class.transport.data_direction()
    }

    /// True on the first delivery of a freshly received command; lets the
    /// handler reset its per-command iteration state
    pub fn first_poll(&mut self) -> bool {
        self.class.transport.first_poll()
    }

    /// The raw command block, for vendor hooks that decode it themselves
    pub fn raw_cb(&self) -> &[u8] {
        self.class
            .transport
            .get_command()
            .map(|block| block.bytes)
            .unwrap_or(&[])
    }

    /// [crate::transport::bbb::BulkOnly::read_data]
    pub fn read_data(&mut self, dst: &mut [u8]) -> Result<usize, TransportError<BulkOnlyError>> {
        self.class.transport.read_data(dst)
    }

    /// [crate::transport::bbb::BulkOnly::write_data]
    pub fn write_data(&mut self, src: &[u8]) -> Result<usize, TransportError<BulkOnlyError>> {
        self.class.transport.write_data(src)
    }

    /// [crate::transport::bbb::BulkOnly::try_write_data_all]
    pub fn try_write_data_all(&mut self, src: &[u8]) -> Result<(), TransportError<BulkOnlyError>> {
        self.class.transport.try_write_data_all(src)
    }

    /// Command succeeded; the CSW will report `Passed`
    pub fn pass(self) {
        self.class.transport.set_status(CommandStatus::Passed);
    }

    /// Command failed; sense data should describe why
    pub fn fail(self) {
        self.class.transport.set_status(CommandStatus::Failed);
    }

    /// The host's and device's idea of the data phase disagree
    pub fn fail_phase(self) {
        self.class.transport.set_status(CommandStatus::PhaseError);
    }
}
