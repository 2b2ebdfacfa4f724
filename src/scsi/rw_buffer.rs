//! READ BUFFER / WRITE BUFFER diagnostic channel
//!
//! Three services multiplexed on the CDB mode byte: raw memory-window
//! reads (mode 2, with a descriptor header in mode 3), a 1 KiB echo
//! buffer (mode 0x0A), and the microcode download path (modes 0x04/0x05)
//! that replaces the custom application stored in internal flash.
//!
//! Misuse deliberately reports INVALID FIELD IN CDB, not an unsupported
//! operation: that is what the shipped devices answer, and hosts probe for
//! it.

use crate::fmt::{debug, warning};
use crate::scsi::device::{reply_in, Progress, Reply, ScsiHandler};
use crate::scsi::lun::Permissions;
use crate::scsi::sense::SenseCode;
use crate::subclass::scsi::{Scsi, ScsiCommand};
use crate::subclass::Command;
use crate::transport::bbb::{BulkOnly, BulkOnlyError, DataDirection};
use crate::transport::TransportError;
use crate::BLOCK_SIZE;
use core::borrow::BorrowMut;
use usb_device::bus::UsbBus;

/// Size of the echo scratch buffer
pub const ECHO_SIZE: usize = 1024;

/// Largest accepted microcode download
pub const DOWNLOAD_LIMIT: u32 = 65536;

/// Buffer-id to offset-alignment reported by descriptor mode: four bytes
/// (2^2)
const OFFSET_BOUNDARY: u8 = 2;

/// The memory regions behind the diagnostic channel
///
/// Implemented by the board firmware; the window ids and the application
/// region (including how much of it an erase wipes) are its business.
pub trait DiagnosticMemory {
    /// Read-only window behind a data-mode buffer id
    fn window(&self, id: u8) -> Option<&[u8]>;

    /// Capacity reported by descriptor mode for a buffer id
    fn capacity(&self, id: u8) -> Option<u32>;

    /// Halts the custom app and erases the application region. Called once
    /// before the first downloaded byte is programmed.
    fn begin_download(&mut self) -> Result<(), ()>;

    /// Programs one downloaded chunk at `offset` into the application
    /// region.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), ()>;

    /// Largest accepted download
    fn download_limit(&self) -> u32 {
        DOWNLOAD_LIMIT
    }
}

impl<'d, const LUNS: usize> ScsiHandler<'d, LUNS> {
    pub(crate) fn read_buffer<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
        mode: u8,
        buffer_id: u8,
        offset: u32,
        alloc_len: u32,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        if !self.luns[lun].permits(Permissions::READ_BUFFER) {
            self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
            return Ok(Reply::Check);
        }

        match mode {
            // Data: raw window read
            0x02 => self.window_read(cmd, buffer_id, offset, alloc_len),
            // Descriptor: boundary and capacity of a window
            0x03 => self.window_descriptor(cmd, buffer_id),
            // Echo
            0x0A => self.echo_read(cmd, offset, alloc_len),
            _ => {
                warning!("scsi: READ BUFFER unknown mode {}", mode);
                self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                Ok(Reply::Check)
            }
        }
    }

    pub(crate) fn write_buffer<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        lun: usize,
        mode: u8,
        _buffer_id: u8,
        offset: u32,
        param_len: u32,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        if !self.luns[lun].permits(Permissions::WRITE_BUFFER) {
            self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
            return Ok(Reply::Check);
        }

        match mode {
            // Echo
            0x0A => self.echo_write(cmd, offset, param_len),
            // Microcode download, with or without save
            0x04 | 0x05 => self.microcode_write(cmd, param_len),
            _ => {
                warning!("scsi: WRITE BUFFER unknown mode {}", mode);
                self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                Ok(Reply::Check)
            }
        }
    }

    fn window_read<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        buffer_id: u8,
        offset: u32,
        alloc_len: u32,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let Self {
            sense,
            progress,
            diag,
            ..
        } = self;

        let window = diag.as_ref().and_then(|d| d.window(buffer_id));
        let window = match window {
            Some(w) => w,
            None => {
                sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                return Ok(Reply::Check);
            }
        };

        let offset = offset as usize;
        let len = alloc_len as usize;
        if offset + len > window.len() {
            sense.set(SenseCode::INVALID_FIELD_IN_CDB);
            return Ok(Reply::Check);
        }

        debug!(
            "scsi: READ BUFFER (data) id={} offset={} len={}",
            buffer_id, offset, len
        );
        stream_in(cmd, progress, &window[offset..offset + len])
    }

    fn window_descriptor<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        buffer_id: u8,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let capacity = self.diag.as_ref().and_then(|d| d.capacity(buffer_id));
        let capacity = match capacity {
            Some(c) => c,
            None => {
                self.sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                return Ok(Reply::Check);
            }
        };

        let data = [
            OFFSET_BOUNDARY,
            (capacity >> 16) as u8,
            (capacity >> 8) as u8,
            capacity as u8,
        ];
        reply_in(cmd, &data)
    }

    fn echo_read<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        offset: u32,
        alloc_len: u32,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let Self {
            sense,
            progress,
            echo,
            ..
        } = self;

        let offset = offset as usize;
        let len = alloc_len as usize;
        if offset + len > ECHO_SIZE {
            sense.set(SenseCode::INVALID_FIELD_IN_CDB);
            return Ok(Reply::Check);
        }

        stream_in(cmd, progress, &echo[offset..offset + len])
    }

    fn echo_write<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        offset: u32,
        param_len: u32,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let Self {
            sense,
            progress,
            echo,
            ..
        } = self;

        let offset = offset as usize;
        let total = param_len as usize;
        if offset + total > ECHO_SIZE {
            sense.set(SenseCode::INVALID_FIELD_IN_CDB);
            return Ok(Reply::Check);
        }

        match cmd.host_direction() {
            DataDirection::NotExpected => Ok(Reply::Done),
            DataDirection::In => Ok(Reply::Phase),
            DataDirection::Out => {
                let host = cmd.host_data_len();
                let goal = (total as u32).min(host) as usize;
                while (progress.received as usize) < goal {
                    let pos = offset + progress.received as usize;
                    let n = cmd.read_data(&mut echo[pos..offset + goal])?;
                    if n == 0 {
                        return Ok(Reply::Pending);
                    }
                    progress.received += n as u32;
                }
                if host < param_len {
                    Ok(Reply::Phase)
                } else {
                    Ok(Reply::Done)
                }
            }
        }
    }

    fn microcode_write<'alloc, Bus, Buf>(
        &mut self,
        cmd: &mut Command<'_, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
        param_len: u32,
    ) -> Result<Reply, TransportError<BulkOnlyError>>
    where
        Bus: UsbBus + 'alloc,
        Buf: BorrowMut<[u8]>,
    {
        let Self {
            sense,
            progress,
            block,
            diag,
            ..
        } = self;

        let diag = match diag.as_mut() {
            Some(d) => &mut **d,
            None => {
                sense.set(SenseCode::INVALID_FIELD_IN_CDB);
                return Ok(Reply::Check);
            }
        };

        if param_len > diag.download_limit() {
            sense.set(SenseCode::INVALID_FIELD_IN_CDB);
            return Ok(Reply::Check);
        }

        match cmd.host_direction() {
            DataDirection::NotExpected => Ok(Reply::Done),
            DataDirection::In => Ok(Reply::Phase),
            DataDirection::Out => {
                let host = cmd.host_data_len();
                let goal = param_len.min(host);

                if !progress.preloaded {
                    progress.preloaded = true;
                    debug!("scsi: microcode download, {} bytes", param_len);
                    // the running app must be gone before its flash is
                    if diag.begin_download().is_err() {
                        sense.set(SenseCode::HARDWARE_ERROR);
                        return Ok(Reply::Check);
                    }
                }

                while progress.received < goal {
                    let want = ((goal - progress.received) as usize).min(BLOCK_SIZE);
                    let n = cmd.read_data(&mut block[..want])?;
                    if n == 0 {
                        return Ok(Reply::Pending);
                    }
                    if diag.program(progress.received, &block[..n]).is_err() {
                        sense.set(SenseCode::WRITE_ERROR);
                        return Ok(Reply::Check);
                    }
                    progress.received += n as u32;
                }

                if host < param_len {
                    Ok(Reply::Phase)
                } else {
                    Ok(Reply::Done)
                }
            }
        }
    }
}

/// Streams a long IN response through the staging path across polls.
fn stream_in<'a, 'alloc, Bus, Buf>(
    cmd: &mut Command<'a, ScsiCommand, Scsi<BulkOnly<'alloc, Bus, Buf>>>,
    progress: &mut Progress,
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
            let goal = host.min(data.len());
            while (progress.sent as usize) < goal {
                let n = cmd.write_data(&data[progress.sent as usize..goal])?;
                if n == 0 {
                    return Ok(Reply::Pending);
                }
                progress.sent += n as u32;
            }
            if host < data.len() {
                Ok(Reply::Phase)
            } else {
                Ok(Reply::Done)
            }
        }
    }
}
