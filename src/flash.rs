//! Series-25 SPI-NOR flash driver
//!
//! Implements the small command set the cowstick media needs: JEDEC
//! identification, 4 KiB sector erase, 256-byte page program and streaming
//! reads. Every transaction is framed by an explicit chip-select
//! assert/deassert and runs synchronously on the caller; erase and program
//! completion is a bounded status-register poll, never an unbounded wait.

use crate::fmt::{debug, error};
use bitflags::bitflags;
use core::fmt;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// 4 KiB erase granule
pub const SECTOR_SIZE: u32 = 4096;
/// Program page size
pub const PAGE_SIZE: usize = 256;

/// Iterations of the status poll before an erase/program is declared stuck
const STATUS_POLL_LIMIT: u32 = 100_000;

#[allow(unused)]
#[repr(u8)]
enum Opcode {
    /// Program up to one page
    PageProgram = 0x02,
    /// Sequential read, no dummy cycles
    Read = 0x03,
    /// Read the 8-bit status register
    ReadStatus = 0x05,
    /// Set the write enable latch
    WriteEnable = 0x06,
    /// Read 1-byte manufacturer + 2-byte device id
    ReadJedecId = 0x9F,
    /// Erase one 4 KiB sector
    SectorErase = 0x20,
}

bitflags! {
    /// Status register bits
    pub struct Status: u8 {
        /// Erase or program in progress
        const BUSY = 1 << 0;
        /// Write enable latch
        const WEL = 1 << 1;
        /// Erase/program failed (vendor "E_FAIL"/"P_FAIL" flag)
        const FAIL = 1 << 5;
    }
}

/// One supported flash die
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashChip {
    pub vendor_id: u8,
    pub device_id: u16,
    /// Capacity in 4 KiB sectors
    pub sectors: u32,
    /// Maximum SPI clock, in MHz
    pub speed: u8,
    pub name: &'static str,
}

impl FlashChip {
    /// Capacity in bytes
    pub fn capacity(&self) -> u32 {
        self.sectors * SECTOR_SIZE
    }
}

/// Dies known to the probe
pub const FLASH_CHIPS: [FlashChip; 2] = [
    // Macronix 512Mbit NOR
    FlashChip {
        vendor_id: 0xC2,
        device_id: 0x201A,
        sectors: 16384,
        speed: 166,
        name: "MX25L51245G",
    },
    // ISSI 128Mbit NOR
    FlashChip {
        vendor_id: 0x9D,
        device_id: 0x6018,
        sectors: 4096,
        speed: 133,
        name: "IS25LP128F",
    },
];

/// Driver error
pub enum Error<SPI: Transfer<u8>, CS: OutputPin> {
    /// An SPI transfer failed
    Spi(SPI::Error),
    /// The chip-select line could not be driven
    Gpio(CS::Error),
    /// The status poll ran out before BUSY cleared
    Busy,
    /// The chip flagged an erase failure
    Erase,
    /// The chip flagged a program failure
    Program,
}

impl<SPI: Transfer<u8>, CS: OutputPin> fmt::Debug for Error<SPI, CS>
where
    SPI::Error: fmt::Debug,
    CS::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(spi) => write!(f, "Error::Spi({:?})", spi),
            Error::Gpio(gpio) => write!(f, "Error::Gpio({:?})", gpio),
            Error::Busy => f.write_str("Error::Busy"),
            Error::Erase => f.write_str("Error::Erase"),
            Error::Program => f.write_str("Error::Program"),
        }
    }
}

/// Driver for one series-25 flash chip behind an SPI master and a dedicated
/// chip-select pin.
pub struct Flash<SPI: Transfer<u8>, CS: OutputPin> {
    spi: SPI,
    cs: CS,
}

impl<SPI: Transfer<u8>, CS: OutputPin> Flash<SPI, CS> {
    pub fn new(spi: SPI, cs: CS) -> Self {
        Flash { spi, cs }
    }

    /// Releases the SPI master and chip-select pin.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// One command framed by chip select. `bytes` is sent and overwritten
    /// with the chip's response.
    fn command(&mut self, bytes: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        // Drop CS again even if the transfer fails mid-way
        self.cs.set_low().map_err(Error::Gpio)?;
        let res = self.spi.transfer(bytes).map(|_| ()).map_err(Error::Spi);
        self.cs.set_high().map_err(Error::Gpio)?;
        res
    }

    /// Reads the JEDEC identification and looks it up in [`FLASH_CHIPS`].
    ///
    /// Returns `None` when nothing answers (manufacturer reads as 0x00 or
    /// 0xFF) or the id is not in the table.
    pub fn probe(&mut self) -> Result<Option<&'static FlashChip>, Error<SPI, CS>> {
        let mut buf = [Opcode::ReadJedecId as u8, 0, 0, 0];
        self.command(&mut buf)?;

        let vendor_id = buf[1];
        let device_id = u16::from_be_bytes([buf[2], buf[3]]);

        if vendor_id == 0x00 || vendor_id == 0xFF {
            return Ok(None);
        }

        let chip = FLASH_CHIPS
            .iter()
            .find(|c| c.vendor_id == vendor_id && c.device_id == device_id);
        if chip.is_none() {
            debug!(
                "flash: unknown chip vid={:02x} device={:04x}",
                vendor_id, device_id
            );
        }
        Ok(chip)
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<Status, Error<SPI, CS>> {
        let mut buf = [Opcode::ReadStatus as u8, 0];
        self.command(&mut buf)?;
        Ok(Status::from_bits_truncate(buf[1]))
    }

    fn write_enable(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut buf = [Opcode::WriteEnable as u8];
        self.command(&mut buf)
    }

    /// Polls the status register until BUSY clears. Bounded: gives up with
    /// [`Error::Busy`] after a fixed iteration count, and reports the
    /// chip's own failure flag as `fail_err`.
    fn wait_ready(&mut self, fail_err: Error<SPI, CS>) -> Result<(), Error<SPI, CS>> {
        for _ in 0..STATUS_POLL_LIMIT {
            let status = self.read_status()?;
            if status.contains(Status::FAIL) {
                error!("flash: erase/program failed, status={}", status.bits());
                return Err(fail_err);
            }
            if !status.contains(Status::BUSY) {
                return Ok(());
            }
        }
        Err(Error::Busy)
    }

    /// Erases the 4 KiB sector at `addr`. `addr` must be sector aligned.
    pub fn erase_sector(&mut self, addr: u32) -> Result<(), Error<SPI, CS>> {
        debug_assert_eq!(0, addr % SECTOR_SIZE);

        self.write_enable()?;
        let mut buf = [
            Opcode::SectorErase as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];
        self.command(&mut buf)?;
        self.wait_ready(Error::Erase)
    }

    /// Reads `buf.len()` bytes starting at `addr`.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        let mut cmd = [
            Opcode::Read as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];

        self.cs.set_low().map_err(Error::Gpio)?;
        let mut res = self.spi.transfer(&mut cmd).map(|_| ());
        if res.is_ok() {
            res = self.spi.transfer(buf).map(|_| ());
        }
        self.cs.set_high().map_err(Error::Gpio)?;
        res.map_err(Error::Spi)
    }

    /// Programs `data` starting at `addr`, split into page-aligned slices
    /// of at most 256 bytes. The target area must have been erased.
    pub fn write(&mut self, mut addr: u32, mut data: &[u8]) -> Result<(), Error<SPI, CS>> {
        while !data.is_empty() {
            // never cross a page boundary within one program command
            let page_room = PAGE_SIZE - (addr as usize % PAGE_SIZE);
            let len = data.len().min(page_room);

            self.write_enable()?;

            let mut cmd = [
                Opcode::PageProgram as u8,
                (addr >> 16) as u8,
                (addr >> 8) as u8,
                addr as u8,
            ];
            let mut page = [0u8; PAGE_SIZE];
            page[..len].copy_from_slice(&data[..len]);

            self.cs.set_low().map_err(Error::Gpio)?;
            let mut res = self.spi.transfer(&mut cmd).map(|_| ());
            if res.is_ok() {
                res = self.spi.transfer(&mut page[..len]).map(|_| ());
            }
            self.cs.set_high().map_err(Error::Gpio)?;
            res.map_err(Error::Spi)?;

            self.wait_ready(Error::Program)?;

            addr += len as u32;
            data = &data[len..];
        }
        Ok(())
    }
}
