//! In-memory controller model
//!
//! Implements the full register semantics of a packet-buffer controller
//! (toggle-written STAT/DTOG fields, write-zero-to-clear event flags) plus
//! a handful of host-side helpers, so the bus driver can be exercised on
//! the development machine.

use super::*;
use std::sync::Mutex;
use std::vec::Vec;

struct Inner {
    chep: [u32; 8],
    istr: u32,
    daddr: u8,
    connected: bool,
    pma: [u32; (pma::PMA_SIZE / 4) as usize],
}

pub struct SimController {
    inner: Mutex<Inner>,
}

impl SimController {
    pub fn new() -> Self {
        SimController {
            inner: Mutex::new(Inner {
                chep: [0; 8],
                istr: 0,
                daddr: 0,
                connected: false,
                pma: [0; (pma::PMA_SIZE / 4) as usize],
            }),
        }
    }

    /// One register write, with the hardware's field semantics
    fn apply(current: u32, written: u32) -> u32 {
        let mut value = current;
        // plain fields are copied through
        value = (value & !CHEP_PLAIN) | (written & CHEP_PLAIN);
        // STAT and DTOG flip where a 1 is written
        value ^= written & (CHEP_STAT_RX | CHEP_STAT_TX | CHEP_DTOG_RX | CHEP_DTOG_TX);
        // VTRX/VTTX clear where a 0 is written
        value &= !((CHEP_VTRX | CHEP_VTTX) & !written);
        value
    }

    pub fn raw_chep(&self, ep: u8) -> u32 {
        self.inner.lock().unwrap().chep[ep as usize]
    }

    /// Test access bypassing the write semantics
    pub fn force_chep(&self, ep: u8, value: u32) {
        self.inner.lock().unwrap().chep[ep as usize] = value;
    }

    pub fn address(&self) -> u8 {
        self.inner.lock().unwrap().daddr
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    /// Signals a bus reset
    pub fn raise_reset(&self) {
        self.inner.lock().unwrap().istr |= ISTR_RESET;
    }

    /// A packet arrives from the host on an OUT endpoint
    pub fn deliver(&self, ep: u8, bytes: &[u8], setup: bool) {
        let rx_offset = pma::rx_offset(self, ep);
        pma::write_buf(self, rx_offset, bytes);

        let mut inner = self.inner.lock().unwrap();
        let entry_addr = ((ep as usize) * 8 + 4) / 4;
        let entry = inner.pma[entry_addr] & !(0x03FF << 16);
        inner.pma[entry_addr] = entry | ((bytes.len() as u32) << 16);

        let mut chep = inner.chep[ep as usize];
        chep |= CHEP_VTRX;
        if setup {
            chep |= CHEP_SETUP;
        } else {
            chep &= !CHEP_SETUP;
        }
        // reception NAKs the endpoint until software re-arms it
        chep = (chep & !CHEP_STAT_RX) | ((EpStatus::Nak as u32) << 12);
        inner.chep[ep as usize] = chep;
        inner.istr |= ISTR_CTR;
    }

    /// The controller transmits a pending IN packet to the host
    pub fn take_tx(&self, ep: u8) -> Option<Vec<u8>> {
        {
            let inner = self.inner.lock().unwrap();
            let stat = (inner.chep[ep as usize] >> 4) & 0b11;
            if stat != EpStatus::Valid as u32 {
                return None;
            }
        }
        let count = pma::tx_count(self, ep) as usize;
        let offset = pma::tx_offset(self, ep);
        let mut bytes = vec![0u8; count];
        pma::read_buf(self, offset, &mut bytes);

        let mut inner = self.inner.lock().unwrap();
        let mut chep = inner.chep[ep as usize];
        chep = (chep & !CHEP_STAT_TX) | ((EpStatus::Nak as u32) << 4);
        chep |= CHEP_VTTX;
        inner.chep[ep as usize] = chep;
        inner.istr |= ISTR_CTR;
        Some(bytes)
    }
}

impl UsbController for SimController {
    fn chep(&self, ep: u8) -> u32 {
        self.inner.lock().unwrap().chep[ep as usize]
    }

    fn set_chep(&self, ep: u8, value: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.chep[ep as usize] = Self::apply(inner.chep[ep as usize], value);
    }

    fn istr(&self) -> u32 {
        self.inner.lock().unwrap().istr
    }

    fn ack(&self, bits: u32) {
        self.inner.lock().unwrap().istr &= !bits;
    }

    fn set_address(&self, addr: u8) {
        self.inner.lock().unwrap().daddr = addr;
    }

    fn connect(&self) {
        self.inner.lock().unwrap().connected = true;
    }

    fn disconnect(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    fn pma_read(&self, offset: u16) -> u32 {
        self.inner.lock().unwrap().pma[(offset / 4) as usize]
    }

    fn pma_write(&self, offset: u16, value: u32) {
        self.inner.lock().unwrap().pma[(offset / 4) as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb_device::bus::UsbBus;

    fn bulk_bus() -> PacketBus<SimController> {
        let mut bus = PacketBus::new(SimController::new());
        // EP0 control, then the two bulk endpoints of the layout
        bus.alloc_ep(UsbDirection::Out, None, EndpointType::Control, 64, 0)
            .unwrap();
        bus.alloc_ep(UsbDirection::In, None, EndpointType::Control, 64, 0)
            .unwrap();
        let in_ep = bus
            .alloc_ep(UsbDirection::In, None, EndpointType::Bulk, 64, 0)
            .unwrap();
        let out_ep = bus
            .alloc_ep(UsbDirection::Out, None, EndpointType::Bulk, 64, 0)
            .unwrap();
        assert_eq!(1, in_ep.index());
        assert_eq!(2, out_ep.index());
        bus.reset();
        bus
    }

    #[test]
    fn pma_tail_is_masked() {
        let ctl = SimController::new();
        ctl.pma_write(0x100, 0xFFFF_FFFF);
        ctl.pma_write(0x104, 0xFFFF_FFFF);
        pma::write_buf(&ctl, 0x100, &[0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(0x4433_2211, ctl.pma_read(0x100));
        // bytes beyond the data are zeroed, not left stale
        assert_eq!(0x0000_0055, ctl.pma_read(0x104));
    }

    #[test]
    fn alloc_follows_the_layout() {
        let mut bus = PacketBus::new(SimController::new());
        let first = bus
            .alloc_ep(UsbDirection::In, None, EndpointType::Bulk, 64, 0)
            .unwrap();
        assert_eq!(1, first.index());
        let second = bus
            .alloc_ep(UsbDirection::In, None, EndpointType::Bulk, 64, 0)
            .unwrap();
        assert_eq!(2, second.index());
        // only two bulk slots are provisioned
        assert!(matches!(
            bus.alloc_ep(UsbDirection::In, None, EndpointType::Bulk, 64, 0),
            Err(UsbError::EndpointOverflow)
        ));
    }

    #[test]
    fn reset_arms_rx_and_naks_tx() {
        let bus = bulk_bus();
        let ctl = bus.controller();

        let ep1 = ctl.raw_chep(1);
        assert_eq!((EpStatus::Nak as u32) << 4, ep1 & CHEP_STAT_TX);
        let ep2 = ctl.raw_chep(2);
        assert_eq!((EpStatus::Valid as u32) << 12, ep2 & CHEP_STAT_RX);
        assert_eq!(2, ep2 & CHEP_ADDR);
        assert_eq!(0, ctl.address());
    }

    #[test]
    fn write_hands_buffer_to_controller() {
        let bus = bulk_bus();
        let addr = EndpointAddress::from_parts(1, UsbDirection::In);

        bus.write(addr, &[0xA1, 0xA2, 0xA3]).unwrap();
        let ctl = bus.controller();
        assert_eq!(
            (EpStatus::Valid as u32) << 4,
            ctl.raw_chep(1) & CHEP_STAT_TX
        );
        // a second write before the controller sent the first must block
        assert!(matches!(
            bus.write(addr, &[0x00]),
            Err(UsbError::WouldBlock)
        ));

        assert_eq!(Some(vec![0xA1, 0xA2, 0xA3]), ctl.take_tx(1));
        bus.write(addr, &[0xB1]).unwrap();
        assert_eq!(Some(vec![0xB1]), ctl.take_tx(1));
    }

    #[test]
    fn read_consumes_and_rearms() {
        let bus = bulk_bus();
        let addr = EndpointAddress::from_parts(2, UsbDirection::Out);
        let mut buf = [0u8; 64];

        assert!(matches!(bus.read(addr, &mut buf), Err(UsbError::WouldBlock)));

        bus.controller().deliver(2, &[1, 2, 3, 4, 5, 6, 7], false);
        assert_eq!(7, bus.read(addr, &mut buf).unwrap());
        assert_eq!([1, 2, 3, 4, 5, 6, 7], buf[..7]);

        let chep = bus.controller().raw_chep(2);
        assert_eq!(0, chep & CHEP_VTRX);
        assert_eq!((EpStatus::Valid as u32) << 12, chep & CHEP_STAT_RX);
    }

    #[test]
    fn stall_and_unstall_in_endpoint() {
        let bus = bulk_bus();
        let addr = EndpointAddress::from_parts(1, UsbDirection::In);

        bus.set_stalled(addr, true);
        assert!(bus.is_stalled(addr));

        // put the data toggle on DATA1, then clear the halt
        bus.controller()
            .force_chep(1, bus.controller().raw_chep(1) | CHEP_DTOG_TX);
        bus.set_stalled(addr, false);
        assert!(!bus.is_stalled(addr));
        let chep = bus.controller().raw_chep(1);
        assert_eq!((EpStatus::Nak as u32) << 4, chep & CHEP_STAT_TX);
        assert_eq!(0, chep & CHEP_DTOG_TX);
    }

    #[test]
    fn poll_decodes_reset_and_data() {
        let bus = bulk_bus();
        assert!(matches!(bus.poll(), PollResult::None));

        bus.controller().raise_reset();
        assert!(matches!(bus.poll(), PollResult::Reset));
        assert!(matches!(bus.poll(), PollResult::None));

        bus.controller().deliver(2, &[0xAA; 31], false);
        match bus.poll() {
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            } => {
                assert_eq!(1 << 2, ep_out);
                assert_eq!(0, ep_in_complete);
                assert_eq!(0, ep_setup);
            }
            _ => panic!("expected a data poll result"),
        }
    }

    #[test]
    fn setup_packets_are_flagged() {
        let bus = bulk_bus();
        bus.controller()
            .deliver(0, &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00], true);
        match bus.poll() {
            PollResult::Data { ep_out, ep_setup, .. } => {
                assert_eq!(1, ep_out & 1);
                assert_eq!(1, ep_setup & 1);
            }
            _ => panic!("expected a data poll result"),
        }
    }
}
