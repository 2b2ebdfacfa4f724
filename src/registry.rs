//! Interface registry
//!
//! `usb-device` routes control traffic and resets to its classes, but it
//! has no notion of "the host picked a configuration" or of foreground
//! housekeeping. The registry adds both: it watches the device state for
//! the transition into `Configured` to fire every interface's `enable`
//! hook, and runs the `periodic` hooks from the main loop on every poll.

use crate::fmt::info;
use crate::subclass::scsi::Scsi;
use crate::transport::Transport;
use usb_device::bus::UsbBus;
use usb_device::class::UsbClass;
use usb_device::device::{UsbDevice, UsbDeviceState};

/// The single configuration this device exposes
pub const CONFIGURATION_VALUE: u8 = 1;

/// One registered USB interface: a class plus firmware-level hooks
pub trait UsbInterface<B: UsbBus>: UsbClass<B> {
    /// Called when the host selects a configuration
    fn enable(&mut self, _config: u8) {}

    /// Called from the foreground loop after every poll
    fn periodic(&mut self) {}
}

/// The mass-storage subclass registers as-is; it has no extra hooks
impl<Bus, T> UsbInterface<Bus> for Scsi<T>
where
    Bus: UsbBus,
    T: Transport<Bus = Bus>,
{
}

/// Tracks enumeration state across polls and drives the interface hooks
pub struct Registry {
    state: UsbDeviceState,
}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            state: UsbDeviceState::Default,
        }
    }

    /// Polls the device with all registered interfaces and runs the hooks.
    ///
    /// The interface count is bounded at build time; up to four are
    /// supported, the cowstick itself registers one.
    pub fn poll<B: UsbBus>(
        &mut self,
        dev: &mut UsbDevice<'_, B>,
        interfaces: &mut [&mut dyn UsbInterface<B>],
    ) -> bool {
        // upcast each interface to its class view for usb-device
        let events = match interfaces {
            [] => return false,
            [a] => {
                let mut classes: [&mut dyn UsbClass<B>; 1] = [&mut **a];
                dev.poll(&mut classes)
            }
            [a, b] => {
                let mut classes: [&mut dyn UsbClass<B>; 2] = [&mut **a, &mut **b];
                dev.poll(&mut classes)
            }
            [a, b, c] => {
                let mut classes: [&mut dyn UsbClass<B>; 3] = [&mut **a, &mut **b, &mut **c];
                dev.poll(&mut classes)
            }
            [a, b, c, d] => {
                let mut classes: [&mut dyn UsbClass<B>; 4] =
                    [&mut **a, &mut **b, &mut **c, &mut **d];
                dev.poll(&mut classes)
            }
            _ => panic!("too many interfaces registered"),
        };

        let state = dev.state();
        if state == UsbDeviceState::Configured && self.state != UsbDeviceState::Configured {
            info!("usb: configured, enabling interfaces");
            for iface in interfaces.iter_mut() {
                iface.enable(CONFIGURATION_VALUE);
            }
        }
        self.state = state;

        for iface in interfaces.iter_mut() {
            iface.periodic();
        }

        events
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
