#![allow(dead_code)]

pub mod bbb;
pub mod scsi;

use self::bbb::DummyUsbBus;
use cowstick_ums::scsi::ScsiHandler;
use cowstick_ums::subclass::scsi::Scsi;
use cowstick_ums::transport::bbb::BulkOnly;

pub type TestScsi<'a> = Scsi<BulkOnly<'a, DummyUsbBus, &'a mut [u8]>>;

/// Packet sizes the transport must cope with
pub const PACKET_SIZE: [u16; 4] = [8, 16, 32, 64];

/// Capacity of the test disk, in 512-byte blocks
pub const DISK_BLOCKS: usize = 64;

/// Builds a full device rig: dummy bus, subclass, usb-device and a
/// RAM-backed single-LUN handler. The disk handle stays usable for
/// assertions while the handler drives its clone.
#[macro_export]
macro_rules! rig {
    ($packet:expr, $bus:ident, $dev:ident, $scsi:ident, $handler:ident, $disk:ident) => {
        let $bus = $crate::common::bbb::DummyUsbBus::new();
        let alloc = ::usb_device::bus::UsbBusAllocator::new($bus.clone());
        let mut io_buf = [0u8; 2048];
        let mut $scsi = ::cowstick_ums::subclass::scsi::Scsi::new(
            &alloc,
            $packet,
            ::cowstick_ums::scsi::ScsiHandler::<1>::max_lun(),
            io_buf.as_mut_slice(),
        )
        .unwrap();
        #[allow(unused_mut, unused_variables)]
        let mut $dev = ::cowstick_ums::device::device(&alloc).unwrap();
        #[allow(unused_variables)]
        let $disk = $crate::common::scsi::RamDisk::new($crate::common::DISK_BLOCKS);
        let mut target = $disk.clone();
        let mut $handler = ::cowstick_ums::scsi::ScsiHandler::new([
            ::cowstick_ums::scsi::LogicalUnit::new(
                $crate::common::DISK_BLOCKS as u32,
                true,
                ::cowstick_ums::scsi::Permissions::all(),
                &mut target,
            ),
        ]);
    };
}

/// Drives the subclass against the handler until the bus goes quiet.
pub fn pump<const LUNS: usize>(
    scsi: &mut TestScsi<'_>,
    handler: &mut ScsiHandler<'_, LUNS>,
    bus: &DummyUsbBus,
) {
    let mut prev = bus.bytes_processed();
    let mut quiet = 0;
    for _ in 0..4096 {
        scsi.poll(|cmd| {
            let _ = handler.handle(cmd);
        })
        .unwrap();

        let now = bus.bytes_processed();
        if now == prev {
            quiet += 1;
            if quiet >= 4 {
                break;
            }
        } else {
            quiet = 0;
            prev = now;
        }
    }
}
