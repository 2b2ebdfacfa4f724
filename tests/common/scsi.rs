//! CDB builders and RAM-backed storage doubles

use cowstick_ums::scsi::{StorageTarget, TargetError};

/* opcode bytes as they go on the wire */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const READ_FORMAT_CAPACITIES: u8 = 0x23;
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;
const WRITE_BUFFER: u8 = 0x3B;
const READ_BUFFER: u8 = 0x3C;

pub fn test_unit_ready() -> Vec<u8> {
    vec![TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

pub fn request_sense(alloc_len: u8) -> Vec<u8> {
    vec![REQUEST_SENSE, 0, 0, 0, alloc_len, 0]
}

pub fn inquiry(alloc_len: u16) -> Vec<u8> {
    let len = alloc_len.to_be_bytes();
    vec![INQUIRY, 0x00, 0x00, len[0], len[1], 0]
}

pub fn inquiry_vpd(page_code: u8, alloc_len: u16) -> Vec<u8> {
    let len = alloc_len.to_be_bytes();
    vec![INQUIRY, 0x01, page_code, len[0], len[1], 0]
}

pub fn mode_sense6(page_code: u8, alloc_len: u8) -> Vec<u8> {
    vec![MODE_SENSE_6, 0, page_code, 0, alloc_len, 0]
}

pub fn read_capacity10() -> Vec<u8> {
    vec![READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

pub fn read_format_capacities(alloc_len: u16) -> Vec<u8> {
    let len = alloc_len.to_be_bytes();
    vec![READ_FORMAT_CAPACITIES, 0, 0, 0, 0, 0, 0, len[0], len[1], 0]
}

pub fn read10(lba: u32, blocks: u16) -> Vec<u8> {
    let lba = lba.to_be_bytes();
    let blocks = blocks.to_be_bytes();
    vec![
        READ_10, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0,
    ]
}

pub fn write10(lba: u32, blocks: u16) -> Vec<u8> {
    let lba = lba.to_be_bytes();
    let blocks = blocks.to_be_bytes();
    vec![
        WRITE_10, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0,
    ]
}

pub fn read_buffer(mode: u8, buffer_id: u8, offset: u32, alloc_len: u32) -> Vec<u8> {
    let off = offset.to_be_bytes();
    let len = alloc_len.to_be_bytes();
    vec![
        READ_BUFFER,
        mode,
        buffer_id,
        off[1],
        off[2],
        off[3],
        len[1],
        len[2],
        len[3],
        0,
    ]
}

pub fn write_buffer(mode: u8, buffer_id: u8, offset: u32, param_len: u32) -> Vec<u8> {
    let off = offset.to_be_bytes();
    let len = param_len.to_be_bytes();
    vec![
        WRITE_BUFFER,
        mode,
        buffer_id,
        off[1],
        off[2],
        off[3],
        len[1],
        len[2],
        len[3],
        0,
    ]
}

pub fn unknown_opcode() -> Vec<u8> {
    vec![0x1F, 0, 0, 0, 0, 0]
}

/// RAM-backed storage target. Clones share the medium, so a test can keep
/// a handle for assertions while the handler owns the other.
#[derive(Clone)]
pub struct RamDisk {
    inner: std::sync::Arc<std::sync::Mutex<DiskState>>,
}

struct DiskState {
    data: Vec<u8>,
    preloads: usize,
    completes: usize,
}

impl RamDisk {
    pub fn new(blocks: usize) -> Self {
        RamDisk {
            inner: std::sync::Arc::new(std::sync::Mutex::new(DiskState {
                data: vec![0u8; blocks * 512],
                preloads: 0,
                completes: 0,
            })),
        }
    }

    pub fn contents(&self, addr: usize, len: usize) -> Vec<u8> {
        self.inner.lock().unwrap().data[addr..addr + len].to_vec()
    }

    pub fn fill(&self, addr: usize, bytes: &[u8]) {
        self.inner.lock().unwrap().data[addr..addr + bytes.len()].copy_from_slice(bytes);
    }

    pub fn preloads(&self) -> usize {
        self.inner.lock().unwrap().preloads
    }

    pub fn completes(&self) -> usize {
        self.inner.lock().unwrap().completes
    }
}

impl StorageTarget for RamDisk {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        let state = self.inner.lock().unwrap();
        let addr = addr as usize;
        if addr + buf.len() > state.data.len() {
            return Err(TargetError::OutOfRange);
        }
        buf.copy_from_slice(&state.data[addr..addr + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), TargetError> {
        let mut state = self.inner.lock().unwrap();
        let addr = addr as usize;
        if addr + data.len() > state.data.len() {
            return Err(TargetError::OutOfRange);
        }
        state.data[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn write_preload(&mut self, _addr: u32) -> Result<(), TargetError> {
        self.inner.lock().unwrap().preloads += 1;
        Ok(())
    }

    fn write_complete(&mut self) -> Result<(), TargetError> {
        self.inner.lock().unwrap().completes += 1;
        Ok(())
    }
}
