//! Bus driver for packet-buffer USB device controllers
//!
//! [`PacketBus`] implements [`usb_device::bus::UsbBus`] on top of the
//! [`UsbController`] register model: per-endpoint channel registers with
//! toggle-written STAT/DTOG fields, an interrupt status register, and a
//! 2 KiB packet memory holding the buffer-descriptor table. The control
//! pipe itself (enumeration, descriptors, the staged SET_ADDRESS) is run
//! by `usb-device` on top of this driver.
//!
//! Ownership of a packet buffer transfers with the STAT toggle: descriptor
//! writes must be visible before the endpoint is handed to the controller,
//! which is what [`UsbController::barrier`] enforces.

pub mod pma;
#[cfg(test)]
pub(crate) mod sim;

use crate::fmt::{trace, warning};
use num_enum::TryFromPrimitive;
use usb_device::bus::PollResult;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

/* Channel/endpoint register bits */
pub const CHEP_ADDR: u32 = 0x000F;
pub const CHEP_STAT_TX: u32 = 0x0030;
pub const CHEP_DTOG_TX: u32 = 1 << 6;
pub const CHEP_VTTX: u32 = 1 << 7;
pub const CHEP_KIND: u32 = 1 << 8;
pub const CHEP_UTYPE: u32 = 3 << 9;
pub const CHEP_SETUP: u32 = 1 << 11;
pub const CHEP_STAT_RX: u32 = 3 << 12;
pub const CHEP_DTOG_RX: u32 = 1 << 14;
pub const CHEP_VTRX: u32 = 1 << 15;

const STAT_TX_SHIFT: u32 = 4;
const STAT_RX_SHIFT: u32 = 12;

/// Register bits the hardware writes through unchanged
const CHEP_PLAIN: u32 = CHEP_ADDR | CHEP_KIND | CHEP_UTYPE;

/* Endpoint types, UTYPE field */
const UTYPE_BULK: u32 = 0 << 9;
const UTYPE_CONTROL: u32 = 1 << 9;
const UTYPE_ISO: u32 = 2 << 9;
const UTYPE_INTERRUPT: u32 = 3 << 9;

/* Interrupt status bits */
pub const ISTR_EP_ID: u32 = 0x000F;
pub const ISTR_DIR: u32 = 1 << 4;
pub const ISTR_RESET: u32 = 1 << 10;
pub const ISTR_ERR: u32 = 1 << 13;
pub const ISTR_PMAOVR: u32 = 1 << 14;
pub const ISTR_CTR: u32 = 1 << 15;

/// Hand-off state of one endpoint direction
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpStatus {
    /// Endpoint ignores traffic
    Disabled = 0b00,
    /// Endpoint answers STALL
    Stall = 0b01,
    /// Endpoint answers NAK
    Nak = 0b10,
    /// Buffer belongs to the controller
    Valid = 0b11,
}

/// Register-level access to a packet-buffer USB device controller
///
/// The channel registers follow the usual packet-buffer convention: the
/// STAT and DTOG fields flip where a 1 is written, the VTRX/VTTX event
/// flags clear where a 0 is written, everything else is written as-is.
/// [`PacketBus`] computes the XOR patterns; implementations only move the
/// values to the hardware.
pub trait UsbController: Sync {
    /// Reads the channel register of endpoint `ep`.
    fn chep(&self, ep: u8) -> u32;

    /// Writes the channel register of endpoint `ep` (toggle semantics
    /// apply).
    fn set_chep(&self, ep: u8, value: u32);

    /// Reads the interrupt status register.
    fn istr(&self) -> u32;

    /// Clears the given interrupt status bits.
    fn ack(&self, bits: u32);

    /// Programs the device address and enables the function.
    fn set_address(&self, addr: u8);

    /// Connects the bus pull-up.
    fn connect(&self);

    /// Disconnects the bus pull-up.
    fn disconnect(&self);

    /// Reads the 32-bit packet-memory word at byte offset `offset`.
    fn pma_read(&self, offset: u16) -> u32;

    /// Writes the 32-bit packet-memory word at byte offset `offset`.
    fn pma_write(&self, offset: u16, value: u32);

    /// Orders descriptor writes before the STAT toggle that hands a buffer
    /// to the controller.
    fn barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct EpConfig {
    in_used: bool,
    out_used: bool,
    in_max: u16,
    out_max: u16,
    utype: u32,
}

/// [`usb_device::bus::UsbBus`] implementation over a [`UsbController`]
pub struct PacketBus<C: UsbController> {
    ctl: C,
    endpoints: [EpConfig; 8],
}

impl<C: UsbController> PacketBus<C> {
    pub fn new(ctl: C) -> Self {
        PacketBus {
            ctl,
            endpoints: [EpConfig::default(); 8],
        }
    }

    /// Access to the underlying controller
    pub fn controller(&self) -> &C {
        &self.ctl
    }

    fn stat_of(value: u32, shift: u32) -> EpStatus {
        EpStatus::try_from_primitive(((value >> shift) & 0b11) as u8).unwrap()
    }

    /// Writes one STAT field to `target`, optionally clearing the matching
    /// data toggle, while leaving every other field alone.
    fn write_stat(&self, ep: u8, dir: UsbDirection, target: EpStatus, reset_toggle: bool) {
        let current = self.ctl.chep(ep);
        let (shift, mask, dtog) = match dir {
            UsbDirection::In => (STAT_TX_SHIFT, CHEP_STAT_TX, CHEP_DTOG_TX),
            UsbDirection::Out => (STAT_RX_SHIFT, CHEP_STAT_RX, CHEP_DTOG_RX),
        };

        let mut value = current & CHEP_PLAIN;
        // leave both event flags untouched
        value |= CHEP_VTRX | CHEP_VTTX;
        value |= (current ^ ((target as u32) << shift)) & mask;
        if reset_toggle {
            // toggle bits flip where a 1 is written; writing the current
            // value back drives them to zero
            value |= current & dtog;
        }
        self.ctl.set_chep(ep, value);
    }

    fn ep_config(&self, addr: EndpointAddress) -> Result<&EpConfig, UsbError> {
        let config = self
            .endpoints
            .get(addr.index())
            .ok_or(UsbError::InvalidEndpoint)?;
        let used = match addr.direction() {
            UsbDirection::In => config.in_used,
            UsbDirection::Out => config.out_used,
        };
        if !used {
            return Err(UsbError::InvalidEndpoint);
        }
        Ok(config)
    }
}

impl<C: UsbController> usb_device::bus::UsbBus for PacketBus<C> {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        let index = match (ep_addr, ep_type) {
            // the control pipe always lives on EP0
            (_, EndpointType::Control) => 0,
            (Some(addr), _) => addr.index(),
            (None, _) => (1..self.endpoints.len())
                .find(|&i| {
                    let (tx, rx) = pma::EP_LAYOUT[i];
                    match ep_dir {
                        UsbDirection::In => tx != 0 && !self.endpoints[i].in_used,
                        UsbDirection::Out => rx != 0 && !self.endpoints[i].out_used,
                    }
                })
                .ok_or(UsbError::EndpointOverflow)?,
        };

        if index >= self.endpoints.len() {
            return Err(UsbError::InvalidEndpoint);
        }
        let (tx_off, rx_off) = pma::EP_LAYOUT[index];
        let provisioned = match ep_dir {
            UsbDirection::In => tx_off != 0 || index == 0,
            UsbDirection::Out => rx_off != 0 || index == 0,
        };
        if !provisioned {
            return Err(UsbError::EndpointOverflow);
        }
        if max_packet_size > 64 {
            return Err(UsbError::EndpointMemoryOverflow);
        }

        let config = &mut self.endpoints[index];
        config.utype = match ep_type {
            EndpointType::Control => UTYPE_CONTROL,
            EndpointType::Bulk => UTYPE_BULK,
            EndpointType::Isochronous { .. } => UTYPE_ISO,
            EndpointType::Interrupt => UTYPE_INTERRUPT,
        };
        match ep_dir {
            UsbDirection::In => {
                if config.in_used {
                    return Err(UsbError::InvalidEndpoint);
                }
                config.in_used = true;
                config.in_max = max_packet_size;
            }
            UsbDirection::Out => {
                if config.out_used {
                    return Err(UsbError::InvalidEndpoint);
                }
                config.out_used = true;
                config.out_max = max_packet_size;
            }
        }

        Ok(EndpointAddress::from_parts(index, ep_dir))
    }

    fn enable(&mut self) {
        self.ctl.connect();
    }

    fn reset(&self) {
        self.ctl.set_address(0);

        for (i, config) in self.endpoints.iter().enumerate() {
            if !(config.in_used || config.out_used) {
                continue;
            }
            let ep = i as u8;
            let (tx_off, rx_off) = pma::EP_LAYOUT[i];

            if config.in_used {
                pma::set_tx_descriptor(&self.ctl, ep, tx_off, 0);
            }
            if config.out_used {
                pma::set_rx_descriptor(&self.ctl, ep, rx_off, config.out_max);
            }
            self.ctl.barrier();

            let current = self.ctl.chep(ep);
            let mut value = (i as u32) | config.utype;
            // drive both data toggles back to DATA0
            value |= current & (CHEP_DTOG_RX | CHEP_DTOG_TX);
            let rx_target = if config.out_used {
                EpStatus::Valid
            } else {
                EpStatus::Disabled
            };
            let tx_target = if config.in_used {
                EpStatus::Nak
            } else {
                EpStatus::Disabled
            };
            value |= (current ^ ((rx_target as u32) << STAT_RX_SHIFT)) & CHEP_STAT_RX;
            value |= (current ^ ((tx_target as u32) << STAT_TX_SHIFT)) & CHEP_STAT_TX;
            // VTRX/VTTX written as zero: pending events are dropped
            self.ctl.set_chep(ep, value);
        }
    }

    fn set_device_address(&self, addr: u8) {
        // usb-device calls this after the SET_ADDRESS status phase went
        // out, so the next transaction already sees the new address
        self.ctl.set_address(addr);
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        if ep_addr.direction() != UsbDirection::In {
            return Err(UsbError::InvalidEndpoint);
        }
        let config = self.ep_config(ep_addr)?;
        if buf.len() > config.in_max as usize {
            return Err(UsbError::BufferOverflow);
        }
        let ep = ep_addr.index() as u8;

        let current = self.ctl.chep(ep);
        if Self::stat_of(current, STAT_TX_SHIFT) == EpStatus::Valid {
            // previous packet still belongs to the controller
            return Err(UsbError::WouldBlock);
        }

        let offset = pma::EP_LAYOUT[ep_addr.index()].0;
        pma::write_buf(&self.ctl, offset, buf);
        pma::set_tx_descriptor(&self.ctl, ep, offset, buf.len() as u16);
        // the descriptor must be in memory before the controller owns it
        self.ctl.barrier();
        self.write_stat(ep, UsbDirection::In, EpStatus::Valid, false);

        trace!("usb: bus: ep{} tx {} bytes", ep, buf.len());
        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        if ep_addr.direction() != UsbDirection::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        self.ep_config(ep_addr)?;
        let ep = ep_addr.index() as u8;

        let current = self.ctl.chep(ep);
        if current & CHEP_VTRX == 0 {
            return Err(UsbError::WouldBlock);
        }

        let count = pma::rx_count(&self.ctl, ep) as usize;
        if count > buf.len() {
            return Err(UsbError::BufferOverflow);
        }
        let offset = pma::rx_offset(&self.ctl, ep);
        pma::read_buf(&self.ctl, offset, &mut buf[..count]);
        pma::clear_rx_count(&self.ctl, ep);

        // clear the event and hand the buffer back in one write
        let mut value = current & CHEP_PLAIN;
        value |= CHEP_VTTX; // keep a pending TX event
        value |= (current ^ ((EpStatus::Valid as u32) << STAT_RX_SHIFT)) & CHEP_STAT_RX;
        self.ctl.set_chep(ep, value);

        trace!("usb: bus: ep{} rx {} bytes", ep, count);
        Ok(count)
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        let ep = ep_addr.index() as u8;
        if self.ep_config(ep_addr).is_err() {
            return;
        }

        match (ep_addr.direction(), stalled) {
            (UsbDirection::In, true) => self.write_stat(ep, UsbDirection::In, EpStatus::Stall, false),
            // a cleared halt restarts with DATA0
            (UsbDirection::In, false) => self.write_stat(ep, UsbDirection::In, EpStatus::Nak, true),
            (UsbDirection::Out, true) => {
                self.write_stat(ep, UsbDirection::Out, EpStatus::Stall, false)
            }
            (UsbDirection::Out, false) => {
                self.write_stat(ep, UsbDirection::Out, EpStatus::Valid, true)
            }
        }
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let value = self.ctl.chep(ep_addr.index() as u8);
        let stat = match ep_addr.direction() {
            UsbDirection::In => Self::stat_of(value, STAT_TX_SHIFT),
            UsbDirection::Out => Self::stat_of(value, STAT_RX_SHIFT),
        };
        stat == EpStatus::Stall
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        let istr = self.ctl.istr();

        if istr & ISTR_RESET != 0 {
            self.ctl.ack(ISTR_RESET);
            return PollResult::Reset;
        }
        if istr & ISTR_PMAOVR != 0 {
            warning!("usb: bus: packet memory overrun");
            self.ctl.ack(ISTR_PMAOVR);
        }
        if istr & ISTR_ERR != 0 {
            warning!("usb: bus: bus error");
            self.ctl.ack(ISTR_ERR);
        }

        let mut ep_out = 0u16;
        let mut ep_in_complete = 0u16;
        let mut ep_setup = 0u16;

        for i in 0..self.endpoints.len() {
            let config = &self.endpoints[i];
            if !(config.in_used || config.out_used) {
                continue;
            }
            let ep = i as u8;
            let value = self.ctl.chep(ep);

            if value & CHEP_VTRX != 0 {
                ep_out |= 1 << i;
                if value & CHEP_SETUP != 0 {
                    ep_setup |= 1 << i;
                }
            }
            if value & CHEP_VTTX != 0 {
                ep_in_complete |= 1 << i;
                // acknowledge the TX event now; RX events are cleared by read()
                let mut ack = value & CHEP_PLAIN;
                ack |= CHEP_VTRX; // keep a pending RX event
                self.ctl.set_chep(ep, ack);
            }
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
