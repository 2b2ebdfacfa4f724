//! USB identity of the cowstick
//!
//! The class and endpoint descriptors come from the subclass; this module
//! holds the device-level identity and builds the [`UsbDevice`].

use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::prelude::*;

pub const VID: u16 = 0xC720;
pub const PID: u16 = 0x3608;

pub const MANUFACTURER: &str = "Agilack";
pub const PRODUCT: &str = "Cowstick-UMS";
/// Also reported as the unit-serial-number VPD page, so exactly 16 ASCII
/// characters
pub const SERIAL: &str = "CWSTICK-UMS-0001";

/// Builds the USB 2.0 full-speed device: one configuration, 64-byte
/// control packets, bus powered.
pub fn device<'a, B: UsbBus>(
    alloc: &'a UsbBusAllocator<B>,
) -> usb_device::Result<UsbDevice<'a, B>> {
    Ok(UsbDeviceBuilder::new(alloc, UsbVidPid(VID, PID))
        .strings(&[StringDescriptors::new(LangID::EN_US)
            .manufacturer(MANUFACTURER)
            .product(PRODUCT)
            .serial_number(SERIAL)])
        .map_err(|_| UsbError::Unsupported)?
        .max_packet_size_0(64)
        .map_err(|_| UsbError::Unsupported)?
        .build())
}
