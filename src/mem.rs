//! External-memory abstraction
//!
//! Presents up to `N` SPI channels as uniform erase/read/write nodes. Each
//! node carries one 4 KiB page cache matching the flash erase granule; the
//! cache is the staging area for sub-sector writes (NOR flash can only
//! clear bits, so a sector must be erased before it is reprogrammed).

use crate::flash::{Error as FlashError, Flash, FlashChip, SECTOR_SIZE};
use crate::fmt::{debug, info, warning};
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// Size of the per-node page cache, one erase sector
pub const CACHE_SIZE: usize = SECTOR_SIZE as usize;

/// `cache_addr` value meaning "nothing cached"
pub const CACHE_INVALID: u32 = 0xFFFF_FFFF;

const SECTOR_MASK: u32 = SECTOR_SIZE - 1;

/// Type-erased media failure, reported upstream as a medium error
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceError {
    /// Bus or chip-select failure
    Io,
    /// Status poll gave up while the chip stayed busy
    Busy,
    /// Chip reported an erase failure
    Erase,
    /// Chip reported a program failure
    Program,
}

/// A chip that erases in sectors and programs in pages
pub trait SectorDevice {
    /// Identifies the chip, if one answers.
    fn probe(&mut self) -> Option<&'static FlashChip>;
    /// Erases the sector at `addr` (sector aligned).
    fn erase_sector(&mut self, addr: u32) -> Result<(), DeviceError>;
    /// Reads `buf.len()` bytes from `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), DeviceError>;
    /// Programs `data` at `addr`. The area must be erased.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), DeviceError>;
}

impl<SPI: Transfer<u8>, CS: OutputPin> SectorDevice for Flash<SPI, CS> {
    fn probe(&mut self) -> Option<&'static FlashChip> {
        Flash::probe(self).ok().flatten()
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), DeviceError> {
        Flash::erase_sector(self, addr).map_err(erased)
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        Flash::read(self, addr, buf).map_err(erased)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), DeviceError> {
        Flash::write(self, addr, data).map_err(erased)
    }
}

fn erased<SPI: Transfer<u8>, CS: OutputPin>(err: FlashError<SPI, CS>) -> DeviceError {
    match err {
        FlashError::Spi(_) | FlashError::Gpio(_) => DeviceError::Io,
        FlashError::Busy => DeviceError::Busy,
        FlashError::Erase => DeviceError::Erase,
        FlashError::Program => DeviceError::Program,
    }
}

/// What sits on a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeKind {
    Empty,
    Flash,
    Sram,
}

/// One memory channel: detected chip plus its page cache
pub struct Node {
    kind: NodeKind,
    chip: Option<&'static FlashChip>,
    cache_addr: u32,
    cache: [u8; CACHE_SIZE],
    speed: u8,
}

impl Node {
    const EMPTY: Node = Node {
        kind: NodeKind::Empty,
        chip: None,
        cache_addr: CACHE_INVALID,
        cache: [0u8; CACHE_SIZE],
        speed: 0,
    };

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn chip(&self) -> Option<&'static FlashChip> {
        self.chip
    }

    /// Base address of the cached sector, or [`CACHE_INVALID`]
    pub fn cache_addr(&self) -> u32 {
        self.cache_addr
    }

    /// SPI clock hint for this chip, in MHz
    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// Capacity in bytes, zero when nothing was detected
    pub fn capacity(&self) -> u32 {
        self.chip.map(|c| c.capacity()).unwrap_or(0)
    }
}

/// Uniform access to `N` channels of external memory
pub struct Memory<D, const N: usize> {
    devices: [D; N],
    nodes: [Node; N],
}

impl<D: SectorDevice, const N: usize> Memory<D, N> {
    pub fn new(devices: [D; N]) -> Self {
        Memory {
            devices,
            nodes: [Node::EMPTY; N],
        }
    }

    /// Probes every channel and fills the node table. Returns the number of
    /// chips found.
    pub fn detect(&mut self) -> usize {
        let mut found = 0;
        for (nid, (dev, node)) in self.devices.iter_mut().zip(self.nodes.iter_mut()).enumerate() {
            match dev.probe() {
                Some(chip) => {
                    info!("mem: node {} is {} ({} sectors)", nid, chip.name, chip.sectors);
                    node.kind = NodeKind::Flash;
                    node.chip = Some(chip);
                    node.speed = chip.speed;
                    node.cache_addr = CACHE_INVALID;
                    found += 1;
                }
                None => {
                    debug!("mem: node {} empty", nid);
                    node.kind = NodeKind::Empty;
                    node.chip = None;
                }
            }
        }
        found
    }

    pub fn node(&self, nid: usize) -> Option<&Node> {
        self.nodes.get(nid)
    }

    /// Capacity of a node in bytes
    pub fn capacity(&self, nid: usize) -> u32 {
        self.node(nid).map(|n| n.capacity()).unwrap_or(0)
    }

    /// Reads directly into `buf`, clamped to the device size. Returns the
    /// number of bytes read.
    pub fn read(&mut self, nid: usize, addr: u32, buf: &mut [u8]) -> usize {
        if nid >= N || self.nodes[nid].kind != NodeKind::Flash {
            return 0;
        }
        let capacity = self.nodes[nid].capacity();
        if addr >= capacity {
            return 0;
        }
        let len = buf.len().min((capacity - addr) as usize);
        match self.devices[nid].read(addr, &mut buf[..len]) {
            Ok(()) => len,
            Err(err) => {
                warning!("mem: read failed on node {}: {}", nid, err);
                0
            }
        }
    }

    /// Loads the sector containing `addr` into the node cache. Returns how
    /// many of the `len` requested bytes fall inside the cached window,
    /// counting from `addr`.
    pub fn read_cached(&mut self, nid: usize, addr: u32, len: usize) -> usize {
        if nid >= N || self.nodes[nid].kind != NodeKind::Flash {
            return 0;
        }
        let sector = addr & !SECTOR_MASK;
        if sector >= self.nodes[nid].capacity() {
            return 0;
        }
        let node = &mut self.nodes[nid];
        node.cache_addr = sector;
        if let Err(err) = self.devices[nid].read(sector, &mut node.cache) {
            warning!("mem: cache load failed on node {}: {}", nid, err);
            node.cache_addr = CACHE_INVALID;
            return 0;
        }
        len.min((sector + SECTOR_SIZE - addr) as usize)
    }

    /// The cached window of a node
    pub fn cache(&self, nid: usize) -> Option<&[u8; CACHE_SIZE]> {
        self.nodes.get(nid).map(|n| &n.cache)
    }

    /// Mutable access to the cached window, for staging writes before
    /// [`flush`](Self::flush)
    pub fn cache_mut(&mut self, nid: usize) -> Option<&mut [u8; CACHE_SIZE]> {
        self.nodes.get_mut(nid).map(|n| &mut n.cache)
    }

    /// Writes `data` at `addr`. A sector-aligned `addr` erases the sector
    /// first; otherwise the caller is responsible for a prior erase.
    /// Returns the number of bytes written.
    pub fn write(&mut self, nid: usize, addr: u32, data: &[u8]) -> usize {
        if nid >= N || self.nodes[nid].kind != NodeKind::Flash {
            return 0;
        }
        if addr & SECTOR_MASK == 0 {
            if let Err(err) = self.devices[nid].erase_sector(addr) {
                warning!("mem: erase before write failed on node {}: {}", nid, err);
                return 0;
            }
        }
        match self.devices[nid].write(addr, data) {
            Ok(()) => data.len(),
            Err(err) => {
                warning!("mem: write failed on node {}: {}", nid, err);
                0
            }
        }
    }

    /// Writes the cache back to the sector it was loaded from: erase, then
    /// program the full 4 KiB. Returns the number of bytes written back.
    pub fn flush(&mut self, nid: usize) -> usize {
        if nid >= N || self.nodes[nid].kind != NodeKind::Flash {
            return 0;
        }
        let sector = self.nodes[nid].cache_addr;
        if sector == CACHE_INVALID {
            return 0;
        }
        if let Err(err) = self.devices[nid].erase_sector(sector) {
            warning!("mem: cache erase failed on node {}: {}", nid, err);
            return 0;
        }
        match self.devices[nid].write(sector, &self.nodes[nid].cache) {
            Ok(()) => CACHE_SIZE,
            Err(err) => {
                warning!("mem: cache write-back failed on node {}: {}", nid, err);
                0
            }
        }
    }

    /// Erases one sector. `addr` must be sector aligned; unaligned requests
    /// are rejected with 0 and nothing is touched.
    pub fn erase(&mut self, nid: usize, addr: u32, _len: usize) -> usize {
        if nid >= N || self.nodes[nid].kind != NodeKind::Flash {
            return 0;
        }
        if addr & SECTOR_MASK != 0 {
            warning!("mem: refusing unaligned erase at {:08x}", addr);
            return 0;
        }
        match self.devices[nid].erase_sector(addr) {
            Ok(()) => CACHE_SIZE,
            Err(err) => {
                warning!("mem: erase failed on node {}: {}", nid, err);
                0
            }
        }
    }
}
