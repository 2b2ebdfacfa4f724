//! CDB dispatch and command handlers
//!
//! [`ScsiHandler`] is invoked from the subclass poll callback, once or more
//! per CBW. A handler decides a [`Reply`]; `handle` maps it exhaustively
//! onto the transport status calls. Per-command iteration state lives in
//! [`Progress`] and is reset when a fresh CBW is delivered.

use crate::fmt::debug;
use crate::scsi::lun::LogicalUnit;
use crate::scsi::sense::{SenseCode, SenseData, SENSE_LEN};
use crate::subclass::scsi::{Scsi, ScsiCommand};
use crate::subclass::Command;
use crate::transport::bbb::{BulkOnly, BulkOnlyError, DataDirection};
use crate::transport::TransportError;
use crate::BLOCK_SIZE;
use core::borrow::BorrowMut;
use usb_device::bus::UsbBus;

const BLOCK: u32 = BLOCK_SIZE as u32;

/// Standard INQUIRY response: direct-access, removable, vendor/product/rev
const STANDARD_INQUIRY: [u8; 36] = [
    0x00, 0x80, 0x02, 0x02, 0x20, 0x00, 0x00, 0x00, // removable, SPC-like
    b'A', b'G', b'I', b'L', b'A', b'C', b'K', b' ', // T10 vendor id
    b'C', b'o', b'w', b's', b't', b'i', b'c', b'k', // product id
    b'-', b'U', b'M', b'S', b' ', b' ', b' ', b' ', //
    b'd', b'e', b'v', b'0', // revision
];

/// T10 vendor identifier reported in the device-identification VPD page
const T10_VENDOR_ID: [u8; 8] = *b"AGILACK\0";
/// EUI-64 of the device, Agilack OUI block
const EUI64: [u8; 8] = [0x70, 0xB3, 0xD5, 0x4C, 0xE8, 0x01, 0x00, 0x00];

/// Outcome of one handler invocation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reply {
    /// Command complete; CSW reports `Passed`
    Done,
    /// Data phase still moving; the handler runs again on the next poll
    Pending,
    /// Command failed; the sense record says why (CSW `Failed`)
    Check,
    /// Host and device disagree about the data phase (CSW `PhaseError`)
    Phase,
}

/// Per-CBW iteration state
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct Progress {
    /// Bytes handed to the transport so far (IN phases)
    pub sent: u32,
    /// Bytes consumed from the transport so far (OUT phases)
    pub received: u32,
    /// The write path ran its preload step
    pub preloaded: bool,
}

/// The SCSI disk: logical-unit table, sense record and command handlers
pub struct ScsiHandler<'d, const LUNS: usize> {
    pub(crate) luns: [LogicalUnit<'d>; LUNS],
    pub(crate) sense: SenseData,
    pub(crate) block: [u8; BLOCK_SIZE],
    pub(crate) progress: Progress,
    #[cfg(feature = "rw-buffer")]
    pub(crate) echo: [u8; crate::scsi::rw_buffer::ECHO_SIZE],
    #[cfg(feature = "rw-buffer")]
    pub(crate) diag: Option<&'d mut dyn crate::scsi::rw_buffer::DiagnosticMemory>,
}

impl<'d, const LUNS: usize> ScsiHandler<'d, LUNS> {
    pub fn new(luns: [LogicalUnit<'d>; LUNS]) -> Self {
        assert!(LUNS >= 1 && LUNS <= 16);
        ScsiHandler {
            luns,
            sense: SenseData::new(),
            block: [0u8; BLOCK_SIZE],
            progress: Progress::default(),
            #[cfg(feature = "rw-buffer")]
            echo: [0u8; crate::scsi::rw_buffer::ECHO_SIZE],
            #[cfg(feature = "rw-buffer")]
            diag: None,
        }
    }

    /// Attaches the diagnostic-memory collaborator used by READ/WRITE
    /// BUFFER data and microcode modes.
    #[cfg(feature = "rw-buffer")]
    pub fn with_diagnostics(
        mut self,
        diag: &'d mut dyn crate::scsi::rw_buffer::DiagnosticMemory,
    ) -> Self {
        self.diag = Some(diag);
        self
    }

    /// Max LUN index, as reported by Get Max LUN
    pub const fn max_lun() -> u8 {
        LUNS as u8 - 1
    }

    /// The device sense record
    pub fn sense(&self) -> &SenseData {
        &self.sense
    }

    /// Services one delivery of the current command.
    pub fn handle<'alloc, Bus, Buf>(
        &mut self,
        mut cmd: Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
    ) -> Result<(), TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        if cmd.first_poll() {
            self.progress = Progress::default();
            debug!("scsi: command {} for lun {}", cmd.kind, cmd.lun);
        }

        let lun = cmd.lun as usize;
        if lun >= LUNS {
            self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
            cmd.fail();
            return Ok(());
        }

        let reply = match cmd.kind {
            ScsiCommand::TestUnitReady => self.acknowledge(lun),
            ScsiCommand::RequestSense { alloc_len } => self.request_sense(&mut cmd, alloc_len)?,
            ScsiCommand::Inquiry {
                evpd,
                page_code,
                alloc_len,
            } => self.inquiry(&mut cmd, evpd, page_code, alloc_len)?,
            ScsiCommand::ModeSense6 {
                page_code,
                alloc_len,
                ..
            } => self.mode_sense6(&mut cmd, lun, page_code, alloc_len)?,
            ScsiCommand::StartStopUnit { .. } | ScsiCommand::PreventAllowMediumRemoval { .. } => {
                self.acknowledge(lun)
            }
            ScsiCommand::ReadCapacity10 => self.read_capacity(&mut cmd, lun)?,
            ScsiCommand::ReadFormatCapacities { alloc_len } => {
                self.read_format_capacities(&mut cmd, lun, alloc_len)?
            }
            ScsiCommand::Read { lba, len } => self.read10(&mut cmd, lun, lba, len)?,
            ScsiCommand::Write { lba, len } => self.write10(&mut cmd, lun, lba, len)?,
            #[cfg(feature = "rw-buffer")]
            ScsiCommand::ReadBuffer {
                mode,
                buffer_id,
                offset,
                alloc_len,
            } => self.read_buffer(&mut cmd, lun, mode, buffer_id, offset, alloc_len)?,
            #[cfg(feature = "rw-buffer")]
            ScsiCommand::WriteBuffer {
                mode,
                buffer_id,
                offset,
                param_len,
            } => self.write_buffer(&mut cmd, lun, mode, buffer_id, offset, param_len)?,
            ScsiCommand::Vendor { .. } => self.vendor(&mut cmd, lun),
            ScsiCommand::Invalid => {
                self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                Reply::Check
            }
            ScsiCommand::Unknown => {
                self.sense.set(SenseCode::INVALID_COMMAND_OPERATION_CODE);
                Reply::Check
            }
        };

        match reply {
            Reply::Done => cmd.pass(),
            Reply::Pending => {}
            Reply::Check => cmd.fail(),
            Reply::Phase => cmd.fail_phase(),
        }
        Ok(())
    }

    /// Medium-presence gate: TEST UNIT READY and the commands that only
    /// acknowledge succeed iff the medium is there
    fn acknowledge(&mut self, lun: usize) -> Reply {
        if self.luns[lun].is_present() {
            Reply::Done
        } else {
            self.sense.set(SenseCode::MEDIUM_NOT_PRESENT);
            Reply::Check
        }
    }

    fn request_sense<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        alloc_len: u8,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let data = self.sense.to_bytes();
        let n = (alloc_len as usize).min(SENSE_LEN);
        let reply = reply_in(cmd, &data[..n])?;
        if matches!(reply, Reply::Done) {
            // the host has seen the error; stop reporting it
            self.sense.clear();
        }
        Ok(reply)
    }

    fn inquiry<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let mut data = [0u8; 64];
        let len;

        if !evpd {
            if page_code != 0 {
                self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                return Ok(Reply::Check);
            }
            data[..36].copy_from_slice(&STANDARD_INQUIRY);
            len = 36;
        } else {
            match page_code {
                // supported VPD pages
                0x00 => {
                    data[..7].copy_from_slice(&[0x00, 0x00, 0x00, 3, 0x00, 0x80, 0x83]);
                    len = 7;
                }
                // unit serial number
                0x80 => {
                    let serial = crate::device::SERIAL.as_bytes();
                    data[1] = 0x80;
                    data[3] = serial.len() as u8;
                    data[4..4 + serial.len()].copy_from_slice(serial);
                    len = 4 + serial.len();
                }
                // device identification: T10 vendor id + EUI-64
                0x83 => {
                    data[1] = 0x83;
                    data[3] = 24;
                    data[4..8].copy_from_slice(&[0x02, 0x01, 0x00, 0x08]);
                    data[8..16].copy_from_slice(&T10_VENDOR_ID);
                    data[16..20].copy_from_slice(&[0x01, 0x02, 0x00, 0x08]);
                    data[20..28].copy_from_slice(&EUI64);
                    len = 28;
                }
                _ => {
                    self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                    return Ok(Reply::Check);
                }
            }
        }

        let n = len.min(alloc_len as usize);
        reply_in(cmd, &data[..n])
    }

    fn mode_sense6<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
        page_code: u8,
        alloc_len: u8,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        if !self.luns[lun].is_present() {
            self.sense.set(SenseCode::MEDIUM_NOT_PRESENT);
            return Ok(Reply::Check);
        }

        let mut data = [0u8; 40];
        // mode parameter header: medium type 0, WP bit, no block descriptors
        if !self.luns[lun].is_writable() {
            data[2] = 0x80;
        }
        let mut len = 4;

        // pages are only reported because the block cache is compiled in
        if page_code == 0x08 || page_code == 0x3F {
            data[len] = 0x08; // caching page
            data[len + 1] = 0x12;
            len += 20;
        }
        if page_code == 0x0A || page_code == 0x3F {
            data[len] = 0x0A; // control page
            data[len + 1] = 0x0A;
            len += 12;
        }
        data[0] = (len - 1) as u8;

        let n = len.min(alloc_len as usize);
        reply_in(cmd, &data[..n])
    }

    fn read_capacity<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        if !self.luns[lun].is_present() {
            self.sense.set(SenseCode::MEDIUM_NOT_PRESENT);
            return Ok(Reply::Check);
        }

        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&(self.luns[lun].capacity() - 1).to_be_bytes());
        data[4..].copy_from_slice(&BLOCK.to_be_bytes());
        reply_in(cmd, &data)
    }

    fn read_format_capacities<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
        alloc_len: u16,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        if !self.luns[lun].is_present() {
            self.sense.set(SenseCode::MEDIUM_NOT_PRESENT);
            return Ok(Reply::Check);
        }

        let mut data = [0u8; 12];
        data[3] = 8; // one descriptor follows
        data[4..8].copy_from_slice(&self.luns[lun].capacity().to_be_bytes());
        data[8] = 0x02; // formatted media
        data[9..12].copy_from_slice(&BLOCK.to_be_bytes()[1..]);

        let n = data.len().min(alloc_len as usize);
        reply_in(cmd, &data[..n])
    }

    fn read10<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
        lba: u32,
        blocks: u16,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let Self {
            luns,
            sense,
            block,
            progress,
            ..
        } = self;
        let unit = &mut luns[lun];

        if !unit.is_present() {
            sense.set(SenseCode::MEDIUM_NOT_PRESENT);
            return Ok(Reply::Check);
        }
        if u64::from(lba) + u64::from(blocks) > u64::from(unit.capacity()) {
            sense.set(SenseCode::LBA_OUT_OF_RANGE);
            sense.set_info(lba);
            return Ok(Reply::Check);
        }

        let device_total = u32::from(blocks) * BLOCK;
        match cmd.host_direction() {
            // the host expects no data; whatever we would have produced is
            // simply not generated (bulk-only 6.7.2)
            DataDirection::NotExpected => Ok(Reply::Done),
            DataDirection::Out => Ok(Reply::Phase),
            DataDirection::In => {
                let host_total = cmd.host_data_len();
                let goal = device_total.min(host_total);
                let target = match unit.target() {
                    Some(t) => t,
                    None => {
                        sense.set(SenseCode::HARDWARE_ERROR);
                        return Ok(Reply::Check);
                    }
                };

                while progress.sent < goal {
                    let offset = (progress.sent % BLOCK) as usize;
                    if offset == 0 {
                        let addr = (lba + progress.sent / BLOCK) * BLOCK;
                        if target.read(addr, block).is_err() {
                            sense.set(SenseCode::UNRECOVERED_READ_ERROR);
                            return Ok(Reply::Check);
                        }
                    }
                    let want = (BLOCK_SIZE - offset).min((goal - progress.sent) as usize);
                    let n = cmd.write_data(&block[offset..offset + want])?;
                    progress.sent += n as u32;
                    if n < want {
                        // transport buffer is full; resume on the next poll
                        return Ok(Reply::Pending);
                    }
                }

                if host_total < device_total {
                    Ok(Reply::Phase)
                } else {
                    Ok(Reply::Done)
                }
            }
        }
    }

    fn write10<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
        lba: u32,
        blocks: u16,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let Self {
            luns,
            sense,
            block,
            progress,
            ..
        } = self;
        let unit = &mut luns[lun];

        if !unit.is_present() {
            sense.set(SenseCode::MEDIUM_NOT_PRESENT);
            return Ok(Reply::Check);
        }
        if !unit.is_writable() {
            sense.set(SenseCode::WRITE_PROTECTED);
            return Ok(Reply::Check);
        }
        if u64::from(lba) + u64::from(blocks) > u64::from(unit.capacity()) {
            sense.set(SenseCode::LBA_OUT_OF_RANGE);
            sense.set_info(lba);
            return Ok(Reply::Check);
        }

        let device_total = u32::from(blocks) * BLOCK;
        match cmd.host_direction() {
            DataDirection::NotExpected => Ok(Reply::Done),
            DataDirection::In => Ok(Reply::Phase),
            DataDirection::Out => {
                let host_total = cmd.host_data_len();
                let goal = device_total.min(host_total);
                let target = match unit.target() {
                    Some(t) => t,
                    None => {
                        sense.set(SenseCode::HARDWARE_ERROR);
                        return Ok(Reply::Check);
                    }
                };

                if device_total > 0 && !progress.preloaded {
                    progress.preloaded = true;
                    if target.write_preload(lba * BLOCK).is_err() {
                        sense.set(SenseCode::WRITE_ERROR);
                        return Ok(Reply::Check);
                    }
                }

                while progress.received < goal {
                    let offset = (progress.received % BLOCK) as usize;
                    let want = (BLOCK_SIZE - offset).min((goal - progress.received) as usize);
                    let n = cmd.read_data(&mut block[offset..offset + want])?;
                    if n == 0 {
                        return Ok(Reply::Pending);
                    }
                    progress.received += n as u32;
                    if offset + n == BLOCK_SIZE {
                        let index = progress.received / BLOCK - 1;
                        if target.write((lba + index) * BLOCK, block).is_err() {
                            sense.set(SenseCode::WRITE_ERROR);
                            return Ok(Reply::Check);
                        }
                    }
                }

                if host_total < device_total {
                    // a trailing partial block is dropped, not programmed
                    Ok(Reply::Phase)
                } else {
                    if target.write_complete().is_err() {
                        sense.set(SenseCode::WRITE_ERROR);
                        return Ok(Reply::Check);
                    }
                    Ok(Reply::Done)
                }
            }
        }
    }

    fn vendor<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
    ) -> Reply
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let mut raw = [0u8; 16];
        let cb = cmd.raw_cb();
        let n = cb.len().min(raw.len());
        raw[..n].copy_from_slice(&cb[..n]);

        match self.luns[lun].target().and_then(|t| t.vendor(&raw[..n])) {
            Some(Ok(())) => Reply::Done,
            Some(Err(())) => Reply::Check,
            None => {
                self.sense.set(SenseCode::INVALID_COMMAND_OPERATION_CODE);
                Reply::Check
            }
        }
    }
}

/// Answers an IN data phase with one fixed response, honoring the host's
/// declared length against the size of the data actually produced.
pub(crate) fn reply_in<'a, 'alloc, Bus, Buf>(
    cmd: &mut Command<'a, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
    data: &[u8],
) -> Result<Reply, TransportError<BulkOnlyError>>
where
    Bus: UsbBus + 'alloc,
    Buf: BorrowMut<[u8]>,
{
    match cmd.host_direction() {
        DataDirection::NotExpected => Ok(Reply::Done),
        DataDirection::Out => Ok(Reply::Phase),
        DataDirection::In => {
            let host = cmd.host_data_len() as usize;
            let n = host.min(data.len());
            cmd.try_write_data_all(&data[..n])?;
            if host < data.len() {
                Ok(Reply::Phase)
            } else {
                Ok(Reply::Done)
            }
        }
    }
}
