//! Host-side view of the device: a scriptable USB bus
//!
//! Bulk traffic is driven directly (the class polls the endpoints), the
//! control pipe is driven through `UsbDevice::poll` like on real hardware:
//! queued SETUP packets surface as poll events and whatever the device
//! answers lands in the EP0 IN queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use usb_device::bus::{PollResult, UsbBus};
use usb_device::class_prelude::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

const MAX_CB_LEN: u8 = 16;
const CSW_LEN: u8 = 13;

#[derive(Debug, Eq, PartialEq)]
pub enum CommandStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

#[allow(dead_code)]
pub enum DataDirection {
    Out,
    In,
    NotExpected,
}

/// A Command Block Wrapper, as the host would build it
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block: Vec<u8>,
}

impl Cbw {
    pub fn new(tag: u32, data_transfer_len: u32, direction: DataDirection, block: Vec<u8>) -> Self {
        Cbw {
            tag,
            data_transfer_len,
            direction,
            lun: 0,
            block,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();

        assert!((1..=MAX_CB_LEN as usize).contains(&self.block.len()));

        let mut bytes = vec![];
        bytes.extend_from_slice(CBW_SIGNATURE_LE.as_slice());
        bytes.extend_from_slice(self.tag.to_le_bytes().as_slice());
        bytes.extend_from_slice(self.data_transfer_len.to_le_bytes().as_slice());

        let direction = match self.direction {
            DataDirection::In => 1_u8 << 7,
            DataDirection::Out | DataDirection::NotExpected => 0u8,
        };
        bytes.push(direction);
        bytes.push(self.lun);
        bytes.push(self.block.len() as u8);

        let mut block = vec![0u8; MAX_CB_LEN as usize];
        block.as_mut_slice()[..self.block.len()].copy_from_slice(self.block.as_slice());
        bytes.extend_from_slice(block.as_slice());

        bytes
    }
}

/// A Command Status Wrapper, as read back by the host
#[derive(Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(CSW_LEN as usize, bytes.len());
        assert_eq!(0x53425355u32.to_le_bytes(), bytes[..4]);

        let tag = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let residue = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let status = match bytes[12] {
            0x00 => CommandStatus::Passed,
            0x01 => CommandStatus::Failed,
            0x02 => CommandStatus::PhaseError,
            _ => panic!("invalid status code"),
        };

        Self {
            tag,
            residue,
            status,
        }
    }
}

pub struct DummyEp {
    addr: EndpointAddress,
    max_packet_size: u16,
    stalled: bool,
    bytes_written: usize,
    bytes_read: usize,
    packets: VecDeque<Vec<u8>>,
}

impl DummyEp {
    pub fn new(addr: EndpointAddress, max_packet_size: u16) -> Self {
        Self {
            addr,
            max_packet_size,
            stalled: false,
            bytes_written: 0,
            bytes_read: 0,
            packets: VecDeque::new(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(self.max_packet_size as usize) {
            self.packets.push_back(chunk.to_vec());
        }
        self.bytes_written += bytes.len();
    }

    pub fn read_packet(&mut self) -> Option<Vec<u8>> {
        let packet = self.packets.pop_front();
        if let Some(len) = packet.as_ref().map(|p| p.len()) {
            self.bytes_read += len;
        }
        packet
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct BytesProcessed {
    /// (written, read)
    ep_in: (usize, usize),
    /// (written, read)
    ep_out: (usize, usize),
}

#[derive(Clone)]
pub struct DummyUsbBus {
    inner: Arc<Mutex<Inner>>,
}

impl DummyUsbBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Write a Command Block Wrapper as if it was written by a USB host
    pub fn write_cbw(&self, cbw: Cbw) {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_out.as_mut().unwrap();
        ep.write_bytes(cbw.into_bytes().as_slice());
    }

    /// Read a Command Status Wrapper as if it was read by a USB host
    pub fn read_cs(&self) -> Option<Csw> {
        let mut bytes = vec![];
        while bytes.len() < CSW_LEN as usize {
            let mut packet = self.read_packet()?;
            bytes.append(&mut packet);
        }
        Some(Csw::from_bytes(bytes.as_slice()))
    }

    /// Write data as if written by a USB host during an OUT data transfer
    pub fn write_data(&self, data: &[u8]) {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_out.as_mut().unwrap();
        ep.write_bytes(data);
    }

    /// Read a single packet as if read by a USB host during an IN transfer
    pub fn read_packet(&self) -> Option<Vec<u8>> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_in.as_mut().unwrap();
        ep.read_packet()
    }

    pub fn read_n_bytes(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![];
        while bytes.len() < n {
            match self.read_packet() {
                None => break,
                Some(mut packet) => bytes.append(&mut packet),
            }
        }
        bytes
    }

    pub fn bytes_processed(&self) -> BytesProcessed {
        let lock = self.inner.lock().unwrap();
        BytesProcessed {
            ep_in: lock
                .ep_in
                .as_ref()
                .map(|ep| (ep.bytes_written, ep.bytes_read))
                .unwrap(),
            ep_out: lock
                .ep_out
                .as_ref()
                .map(|ep| (ep.bytes_written, ep.bytes_read))
                .unwrap(),
        }
    }

    pub fn in_stalled(&self) -> bool {
        self.inner.lock().unwrap().ep_in.as_ref().unwrap().stalled
    }

    pub fn out_stalled(&self) -> bool {
        self.inner.lock().unwrap().ep_out.as_ref().unwrap().stalled
    }

    /// Queues a SETUP packet on the control pipe
    pub fn setup(&self, bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) {
        let mut packet = vec![bm_request_type, b_request];
        packet.extend_from_slice(&w_value.to_le_bytes());
        packet.extend_from_slice(&w_index.to_le_bytes());
        packet.extend_from_slice(&w_length.to_le_bytes());

        let mut lock = self.inner.lock().unwrap();
        lock.ep0_setup = Some(packet);
    }

    /// Queues the zero-length OUT status packet of a control IN transfer
    pub fn ep0_status_out(&self) {
        self.inner.lock().unwrap().ep0_out.push_back(vec![]);
    }

    /// Pops one packet the device wrote on the control IN pipe
    pub fn read_ep0(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().ep0_in.pop_front()
    }

    /// Addresses the device accepted, in order
    pub fn address_log(&self) -> Vec<u8> {
        self.inner.lock().unwrap().address_log.clone()
    }
}

struct Inner {
    enabled: bool,
    ep_in: Option<DummyEp>,
    ep_out: Option<DummyEp>,
    ep0_setup: Option<Vec<u8>>,
    ep0_out: VecDeque<Vec<u8>>,
    ep0_in: VecDeque<Vec<u8>>,
    /// IN packets written but not yet acknowledged as transmitted
    ep0_in_pending: usize,
    address_log: Vec<u8>,
}

impl Inner {
    fn new() -> Self {
        Self {
            enabled: false,
            ep_in: None,
            ep_out: None,
            ep0_setup: None,
            ep0_out: VecDeque::new(),
            ep0_in: VecDeque::new(),
            ep0_in_pending: 0,
            address_log: Vec::new(),
        }
    }
}

impl UsbBus for DummyUsbBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        _ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        assert!(!self.inner.lock().unwrap().enabled);

        const EP_OUT_ADDR: u8 = 0x02;
        const EP_IN_ADDR: u8 = 0x81;

        if matches!(ep_type, EndpointType::Control) {
            return Ok(EndpointAddress::from_parts(0, ep_dir));
        }

        let mut lock = self.inner.lock().unwrap();
        let addr = match ep_dir {
            UsbDirection::Out => {
                let addr = EndpointAddress::from(EP_OUT_ADDR);
                lock.ep_out.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
            UsbDirection::In => {
                let addr = EndpointAddress::from(EP_IN_ADDR);
                lock.ep_in.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
        };

        Ok(addr)
    }

    fn enable(&mut self) {
        self.inner.lock().unwrap().enabled = true;
    }

    fn reset(&self) {}

    fn set_device_address(&self, addr: u8) {
        self.inner.lock().unwrap().address_log.push(addr);
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();

        if ep_addr.index() == 0 {
            lock.ep0_in.push_back(buf.to_vec());
            lock.ep0_in_pending += 1;
            return Ok(buf.len());
        }

        let ep = lock.ep_in.as_mut().unwrap();
        if ep.addr != ep_addr {
            return Err(UsbError::InvalidEndpoint);
        }
        if buf.len() > ep.max_packet_size as usize {
            return Err(UsbError::BufferOverflow);
        }

        ep.write_bytes(buf);
        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();

        if ep_addr.index() == 0 {
            let packet = match lock.ep0_setup.take() {
                Some(setup) => setup,
                None => match lock.ep0_out.pop_front() {
                    Some(p) => p,
                    None => return Err(UsbError::WouldBlock),
                },
            };
            if packet.len() > buf.len() {
                return Err(UsbError::BufferOverflow);
            }
            buf[..packet.len()].copy_from_slice(&packet);
            return Ok(packet.len());
        }

        let ep = lock.ep_out.as_mut().unwrap();
        if ep.addr != ep_addr {
            return Err(UsbError::InvalidEndpoint);
        }

        if let Some(n) = ep.packets.front().map(|p| p.len()) {
            if n > buf.len() {
                return Err(UsbError::BufferOverflow);
            }
        }

        match ep.read_packet() {
            Some(packet) => {
                let n = packet.len();
                buf[..n].copy_from_slice(packet.as_slice());
                Ok(n)
            }
            None => Err(UsbError::WouldBlock),
        }
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        let mut lock = self.inner.lock().unwrap();

        if let Some(ep) = lock.ep_in.as_mut() {
            if ep.addr == ep_addr {
                ep.stalled = stalled;
                return;
            }
        }

        if let Some(ep) = lock.ep_out.as_mut() {
            if ep.addr == ep_addr {
                ep.stalled = stalled;
            }
        }
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let lock = self.inner.lock().unwrap();

        if let Some(ep) = lock.ep_in.as_ref() {
            if ep.addr == ep_addr {
                return ep.stalled;
            }
        }

        if let Some(ep) = lock.ep_out.as_ref() {
            if ep.addr == ep_addr {
                return ep.stalled;
            }
        }

        false
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        let mut lock = self.inner.lock().unwrap();

        let mut ep_out = 0u16;
        let mut ep_in_complete = 0u16;
        let mut ep_setup = 0u16;

        if lock.ep0_setup.is_some() {
            ep_setup |= 1;
            ep_out |= 1;
        } else if !lock.ep0_out.is_empty() {
            ep_out |= 1;
        }
        if lock.ep0_in_pending > 0 {
            lock.ep0_in_pending -= 1;
            ep_in_complete |= 1;
        }

        if ep_out | ep_in_complete | ep_setup != 0 {
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            }
        } else {
            PollResult::None
        }
    }
}
