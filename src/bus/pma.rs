//! Packet-memory layout and word-wise access
//!
//! The controller shares a 2 KiB dual-ported RAM with the CPU, addressable
//! only in 32-bit words. The buffer-descriptor table sits at offset zero,
//! eight bytes per endpoint: a TX entry (buffer offset + fill count) and an
//! RX entry (buffer offset + allocated size + received count). Buffer
//! offsets are fixed at build time.

use super::UsbController;

/// Size of the packet memory, in bytes
pub const PMA_SIZE: u16 = 2048;

/// Fixed EP0 buffers, 64 bytes each
pub const EP0_TX_OFFSET: u16 = 0x80;
pub const EP0_RX_OFFSET: u16 = 0x40;

/// Static `(tx, rx)` buffer offsets per endpoint. A zero entry means the
/// endpoint is not provisioned and cannot be allocated.
pub const EP_LAYOUT: [(u16, u16); 8] = [
    (EP0_TX_OFFSET, EP0_RX_OFFSET), // EP0: control
    (0x180, 0x140),                 // EP1: bulk IN
    (0x100, 0x0C0),                 // EP2: bulk OUT
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
];

/// Count field of a descriptor entry
const COUNT_MASK: u32 = 0x03FF;

fn tx_entry(ep: u8) -> u16 {
    u16::from(ep) * 8
}

fn rx_entry(ep: u8) -> u16 {
    u16::from(ep) * 8 + 4
}

/// RX allocation field: BLSIZE/NUM_BLOCK encoding of the buffer size
///
/// Buffers up to 62 bytes are described in 2-byte units, larger ones in
/// 32-byte units.
pub fn rx_alloc_bits(size: u16) -> u32 {
    if size <= 62 {
        u32::from(size / 2) << 26
    } else {
        (1 << 31) | (u32::from(size / 32 - 1) << 26)
    }
}

/// Stages a TX descriptor: buffer offset plus the number of bytes to send.
pub fn set_tx_descriptor<C: UsbController>(ctl: &C, ep: u8, offset: u16, count: u16) {
    ctl.pma_write(
        tx_entry(ep),
        (u32::from(count) << 16) | u32::from(offset),
    );
}

/// Bytes the descriptor says were queued for transmission.
pub fn tx_count<C: UsbController>(ctl: &C, ep: u8) -> u16 {
    ((ctl.pma_read(tx_entry(ep)) >> 16) & COUNT_MASK) as u16
}

/// Configured TX buffer offset.
pub fn tx_offset<C: UsbController>(ctl: &C, ep: u8) -> u16 {
    (ctl.pma_read(tx_entry(ep)) & 0xFFFF) as u16
}

/// Arms an RX descriptor: buffer offset and allocated size, count cleared.
pub fn set_rx_descriptor<C: UsbController>(ctl: &C, ep: u8, offset: u16, size: u16) {
    ctl.pma_write(rx_entry(ep), rx_alloc_bits(size) | u32::from(offset));
}

/// Bytes the controller reports received on an OUT endpoint.
pub fn rx_count<C: UsbController>(ctl: &C, ep: u8) -> u16 {
    ((ctl.pma_read(rx_entry(ep)) >> 16) & COUNT_MASK) as u16
}

/// Configured RX buffer offset.
pub fn rx_offset<C: UsbController>(ctl: &C, ep: u8) -> u16 {
    (ctl.pma_read(rx_entry(ep)) & 0xFFFF) as u16
}

/// Clears the received-count field after a packet was consumed.
pub fn clear_rx_count<C: UsbController>(ctl: &C, ep: u8) {
    let entry = ctl.pma_read(rx_entry(ep));
    ctl.pma_write(rx_entry(ep), entry & !(COUNT_MASK << 16));
}

/// Copies bytes into packet memory. Writes whole 32-bit words; the bytes
/// of the last word beyond `data` are zeroed.
pub fn write_buf<C: UsbController>(ctl: &C, offset: u16, data: &[u8]) {
    let mut offset = offset;
    let mut chunks = data.chunks_exact(4);
    for chunk in chunks.by_ref() {
        ctl.pma_write(offset, u32::from_le_bytes(chunk.try_into().unwrap()));
        offset += 4;
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = [0u8; 4];
        word[..tail.len()].copy_from_slice(tail);
        ctl.pma_write(offset, u32::from_le_bytes(word));
    }
}

/// Copies bytes out of packet memory, word-wise.
pub fn read_buf<C: UsbController>(ctl: &C, offset: u16, buf: &mut [u8]) {
    let mut offset = offset;
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in chunks.by_ref() {
        chunk.copy_from_slice(&ctl.pma_read(offset).to_le_bytes());
        offset += 4;
    }
    let tail = chunks.into_remainder();
    if !tail.is_empty() {
        let word = ctl.pma_read(offset).to_le_bytes();
        tail.copy_from_slice(&word[..tail.len()]);
    }
}
