//! Bulk Only Transport (BBB/BOT)
//!
//! The transport owns the two bulk endpoints and the CBW/Data/CSW state
//! machine. It promises exactly one CSW per accepted CBW, echoes the CBW
//! tag, and keeps the data residue; the subclass layer decides command
//! status, the transport turns that into stalls and a CSW.

use crate::buffer::Buffer;
use crate::fmt::{info, trace, warning};
use crate::transport::{CommandStatus, Transport, TransportError};
use core::borrow::BorrowMut;
use core::cmp::min;
use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::class::{ControlIn, ControlOut};
use usb_device::class_prelude::DescriptorWriter;
use usb_device::control::{Recipient, RequestType};
use usb_device::endpoint::{Endpoint, In, Out};
use usb_device::UsbError;

/// Bulk Only Transport interface protocol
pub(crate) const TRANSPORT_BBB: u8 = 0x50;

/// Bulk-Only Mass Storage Reset, spec. section 3.1
const CLASS_BULK_ONLY_RESET: u8 = 0xFF;
/// Get Max LUN, spec. section 3.2
const CLASS_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

struct InvalidCbwError; // Inner transport-specific error

/// Bulk Only Transport error
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BulkOnlyError {
    /// Not enough space to fit additional data
    IoBufferOverflow,
    /// Invalid MAX_LUN value. Refer to USB BBB doc
    InvalidMaxLun,
    /// Transport is not in Data Transfer state
    InvalidState,
    /// Data Transfer expects a full packet to be sent next but not enough data available
    FullPacketExpected,
    /// The IO buffer cannot fit a CBW or a single full packet
    BufferTooSmall,
}

/// Raw Command Block bytes
///
/// The `bytes` field is a truncated slice
pub struct CommandBlock<'a> {
    pub bytes: &'a [u8],
    pub lun: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    /// Waiting for a CBW
    Cbw,
    /// CBW bytes received so far do not make 31 yet (small packet sizes)
    CbwPartial,
    /// Moving bytes to the host
    DataIn,
    /// Moving bytes from the host
    DataOut,
    /// The host announced no data phase
    DataNone,
    /// Sending the CSW
    Csw,
    /// A malformed CBW was received; both endpoints stay stalled until a
    /// Bulk-Only Reset (spec. 6.6.1)
    Error,
}

/// Host data-phase intent, from `dCBWDataTransferLength` and the direction
/// bit
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    Out,
    In,
    #[default]
    NotExpected,
}

type BulkOnlyTransportResult<T> = Result<T, TransportError<BulkOnlyError>>;

#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Cbw {
    tag: u32,
    /// Length the host declared for the data phase; never changes
    declared: u32,
    /// Bytes of the data phase not yet accounted for. Counts down as
    /// packets go out (IN) or as the subclass consumes bytes (OUT) and
    /// lands in `dCSWDataResidue`.
    residue: u32,
    direction: DataDirection,
    lun: u8,
    block_len: usize,
    block: [u8; 16],
}

/// Bulk Only Transport
///
/// Driven from the class poll via [read] and [write]; all bulk data goes
/// through an underlying IO buffer in both directions. During a data
/// transfer the subclass moves bytes with [read_data], [write_data] and
/// [try_write_data_all].
///
/// [write]: crate::transport::bbb::BulkOnly::write
/// [read]: crate::transport::bbb::BulkOnly::read
/// [read_data]: crate::transport::bbb::BulkOnly::read_data
/// [write_data]: crate::transport::bbb::BulkOnly::write_data
/// [try_write_data_all]: crate::transport::bbb::BulkOnly::try_write_data_all
pub struct BulkOnly<'alloc, Bus: UsbBus, Buf: BorrowMut<[u8]>> {
    in_ep: Endpoint<'alloc, Bus, In>,
    out_ep: Endpoint<'alloc, Bus, Out>,
    buf: Buffer<Buf>,
    state: State,
    cbw: Cbw,
    status: Option<CommandStatus>,
    /// A CBW was accepted and the subclass has not seen it yet
    fresh: bool,
    /// A class reset arrived on the control pipe; applied on the next drive
    /// cycle, not in the control handler
    reset_pending: bool,
    max_lun: u8,
}

impl<'alloc, Bus, Buf> BulkOnly<'alloc, Bus, Buf>
where
    Bus: UsbBus,
    Buf: BorrowMut<[u8]>,
{
    /// Creates a Bulk Only Transport instance
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `packet_size` - Maximum USB packet size. Allowed values: 8,16,32,64
    /// * `max_lun` - The max index of the Logical Unit
    /// * `buf` - The underlying IO buffer. It is **required** to fit at
    ///   least a `CBW` and/or a single packet. It is **recommended** that
    ///   the buffer fits at least one logical block
    ///
    /// # Errors
    /// * [InvalidMaxLun]
    /// * [BufferTooSmall]
    ///
    /// # Panics
    /// Panics if endpoint allocation fails.
    ///
    /// [InvalidMaxLun]: crate::transport::bbb::BulkOnlyError::InvalidMaxLun
    /// [BufferTooSmall]: crate::transport::bbb::BulkOnlyError::BufferTooSmall
    /// [UsbBusAllocator]: usb_device::bus::UsbBusAllocator
    pub fn new(
        alloc: &'alloc UsbBusAllocator<Bus>,
        packet_size: u16,
        max_lun: u8,
        buf: Buf,
    ) -> Result<BulkOnly<'alloc, Bus, Buf>, BulkOnlyError> {
        if max_lun > 0x0F {
            return Err(BulkOnlyError::InvalidMaxLun);
        }

        let buf_len = buf.borrow().len();
        if buf_len < CBW_LEN || buf_len < packet_size as usize {
            return Err(BulkOnlyError::BufferTooSmall);
        }

        Ok(BulkOnly {
            in_ep: alloc.bulk(packet_size),
            out_ep: alloc.bulk(packet_size),
            buf: Buffer::new(buf),
            state: State::Cbw,
            cbw: Default::default(),
            status: None,
            fresh: false,
            reset_pending: false,
            max_lun,
        })
    }

    /// Drives the transport by reading a single packet
    pub fn read(&mut self) -> BulkOnlyTransportResult<()> {
        if self.take_pending_reset() {
            return Ok(());
        }
        match self.state {
            State::Cbw | State::CbwPartial => self.handle_read_cbw(),
            State::DataOut => self.handle_read_from_host(),
            State::Error => {
                self.keep_stalled();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drives the transport by writing a single packet
    pub fn write(&mut self) -> BulkOnlyTransportResult<()> {
        if self.take_pending_reset() {
            return Ok(());
        }
        match self.state {
            State::Csw => self.handle_write_csw(),
            State::DataIn => self.handle_write_to_host(),
            State::DataNone => self.check_end_data_transfer(),
            State::Error => {
                self.keep_stalled();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Sets the `status` of the current command
    ///
    /// Nothing is sent immediately: the transport first drains (IN) or
    /// discards (OUT) whatever sits in the IO buffer, stalls the data
    /// endpoint if a residue remains, and then queues the CSW.
    pub fn set_status(&mut self, status: CommandStatus) {
        info!("usb: bbb: Set status: {}", status);
        self.status = Some(status);
    }

    /// Returns the current Command Block if a command is being serviced
    pub fn get_command(&self) -> Option<CommandBlock<'_>> {
        match self.state {
            State::DataIn | State::DataOut | State::DataNone => Some(CommandBlock {
                bytes: &self.cbw.block[..self.cbw.block_len],
                lun: self.cbw.lun,
            }),
            _ => None,
        }
    }

    /// Tag of the CBW currently being serviced
    pub fn tag(&self) -> u32 {
        self.cbw.tag
    }

    /// `dCBWDataTransferLength` as the host declared it
    pub fn declared_data_len(&self) -> u32 {
        self.cbw.declared
    }

    /// Host data-phase direction
    pub fn data_direction(&self) -> DataDirection {
        self.cbw.direction
    }

    /// True exactly once per accepted CBW: on the first call after the CBW
    /// was taken from the wire. Lets the subclass reset per-command state.
    pub fn first_poll(&mut self) -> bool {
        core::mem::take(&mut self.fresh)
    }

    /// Reads data from the IO buffer returning the number of bytes actually
    /// read. Consumed bytes count against the data residue.
    ///
    /// # Errors
    /// Returns [BulkOnlyError::InvalidState] if called during any but an
    /// OUT data transfer.
    ///
    /// [BulkOnlyError::InvalidState]: crate::transport::bbb::BulkOnlyError::InvalidState
    pub fn read_data(&mut self, dst: &mut [u8]) -> BulkOnlyTransportResult<usize> {
        if !matches!(self.state, State::DataOut) {
            return Err(TransportError::Error(BulkOnlyError::InvalidState));
        }
        let count = self
            .buf
            .pop_with(|queued| {
                let size = min(dst.len(), queued.len());
                dst[..size].copy_from_slice(&queued[..size]);
                Ok::<usize, ()>(size)
            })
            .unwrap();
        self.cbw.residue = self.cbw.residue.saturating_sub(count as u32);
        trace!("usb: bbb: Data residue: {}", self.cbw.residue);
        Ok(count)
    }

    /// Writes data into the IO buffer returning the number of bytes
    /// actually written. Clamped to the length the host asked for.
    ///
    /// # Errors
    /// Returns [BulkOnlyError::InvalidState] if called during any but an
    /// IN data transfer, or after a status has been set.
    ///
    /// [BulkOnlyError::InvalidState]: crate::transport::bbb::BulkOnlyError::InvalidState
    pub fn write_data(&mut self, src: &[u8]) -> BulkOnlyTransportResult<usize> {
        if !matches!(self.state, State::DataIn) || self.status_present() {
            return Err(TransportError::Error(BulkOnlyError::InvalidState));
        }
        let allowed = min(src.len(), self.cbw.residue as usize);
        Ok(self.buf.push(&src[..allowed]))
    }

    /// Tries to write all of `src` into the IO buffer
    ///
    /// # Errors
    /// * [BulkOnlyError::IoBufferOverflow] - if not enough space is available
    /// * [BulkOnlyError::InvalidState] - if called during any but an IN data transfer
    ///
    /// [BulkOnlyError::IoBufferOverflow]: crate::transport::bbb::BulkOnlyError::IoBufferOverflow
    /// [BulkOnlyError::InvalidState]: crate::transport::bbb::BulkOnlyError::InvalidState
    pub fn try_write_data_all(&mut self, src: &[u8]) -> BulkOnlyTransportResult<()> {
        if !matches!(self.state, State::DataIn) || self.status_present() {
            return Err(TransportError::Error(BulkOnlyError::InvalidState));
        }
        self.buf
            .fill_with(
                src.len(),
                TransportError::Error(BulkOnlyError::IoBufferOverflow),
                |free| {
                    free[..src.len()].copy_from_slice(src);
                    Ok(src.len())
                },
            )
            .map(|_| ())
    }

    /// Whether a command status has been set
    pub fn has_status(&self) -> bool {
        self.status_present()
    }

    fn handle_read_cbw(&mut self) -> BulkOnlyTransportResult<()> {
        self.read_packet()?; // propagate if error or WouldBlock

        if self.buf.queued() > CBW_LEN {
            // the command transport must be exactly 31 bytes long
            warning!("usb: bbb: Oversized CBW ({} bytes)", self.buf.queued());
            self.halt_until_reset();
        } else if self.buf.queued() == CBW_LEN {
            match self.try_parse_cbw() {
                Ok(cbw) => {
                    info!("usb: bbb: Recv CBW: {}", cbw);
                    self.start_data_transfer(cbw);
                }
                Err(_) => {
                    // Spec. 6.6.1
                    self.halt_until_reset();
                }
            }
        } else {
            // we've read something but it's not a full CBW yet
            self.enter_state(State::CbwPartial)
        }
        Ok(())
    }

    fn handle_read_from_host(&mut self) -> BulkOnlyTransportResult<()> {
        if !self.status_present() {
            self.read_packet()?; // propagate if error or WouldBlock
        }
        self.check_end_data_transfer()
    }

    fn handle_write_to_host(&mut self) -> BulkOnlyTransportResult<()> {
        // Do not send a short packet if there is not enough data in the
        // buffer. Some drivers consider this as an error.
        // If the next packet is expected to be full (according to data
        // residue) but it isn't, return an error.

        let max_packet_size = self.packet_size() as u32;
        let full_packet_expected = self.cbw.residue >= max_packet_size && !self.status_present();
        let full_packet = self.buf.queued() >= max_packet_size as usize;
        let full_packet_or_zero = full_packet || !full_packet_expected;

        if full_packet_or_zero {
            if self.buf.queued() > 0 {
                let count = self.write_packet()?; // propagate if error
                self.cbw.residue = self.cbw.residue.saturating_sub(count as u32);
                trace!("usb: bbb: Data residue: {}", self.cbw.residue);
            }
            self.check_end_data_transfer()
        } else {
            Err(TransportError::Error(BulkOnlyError::FullPacketExpected))
        }
    }

    fn handle_write_csw(&mut self) -> BulkOnlyTransportResult<()> {
        self.write_packet()?; // propagate if error
        if self.buf.queued() == 0 {
            self.enter_state(State::Cbw) // done with status transfer
        }
        Ok(())
    }

    fn check_end_data_transfer(&mut self) -> BulkOnlyTransportResult<()> {
        if !self.status_present() {
            return Ok(());
        }

        match self.state {
            State::DataNone => self.end_data_transfer(),
            State::DataIn if self.buf.queued() == 0 => self.end_data_transfer(),
            State::DataOut => {
                // whatever the subclass did not consume is dropped; it was
                // never consumed, so it stays in the residue
                if self.buf.queued() > 0 {
                    trace!("usb: bbb: Dropping {} unconsumed bytes", self.buf.queued());
                    self.buf.reset();
                }
                self.end_data_transfer()
            }
            _ => Ok(()),
        }
    }

    fn end_data_transfer(&mut self) -> BulkOnlyTransportResult<()> {
        // spec. 6.7.2 and 6.7.3
        if self.cbw.residue > 0 {
            match self.state {
                State::DataIn => self.stall_in_ep(),
                State::DataOut => self.stall_out_ep(),
                _ => {}
            }
        }

        // queue the CSW
        let csw = self.build_csw().unwrap();
        self.buf.reset();
        self.buf.push(csw.as_slice());

        self.enter_state(State::Csw);
        self.write() // flush
    }

    #[inline]
    fn status_present(&self) -> bool {
        self.status.is_some()
    }

    fn build_csw(&mut self) -> Option<[u8; CSW_LEN]> {
        self.status.map(|status| {
            let mut csw = [0u8; CSW_LEN];
            csw[..4].copy_from_slice(CSW_SIGNATURE_LE.as_slice());
            csw[4..8].copy_from_slice(self.cbw.tag.to_le_bytes().as_slice());
            csw[8..12].copy_from_slice(self.cbw.residue.to_le_bytes().as_slice());
            csw[12..].copy_from_slice(&[status as u8]);
            csw
        })
    }

    /// The caller must ensure that a full CBW is available
    fn try_parse_cbw(&mut self) -> Result<Cbw, InvalidCbwError> {
        debug_assert!(matches!(self.state, State::Cbw | State::CbwPartial));
        debug_assert!(self.buf.queued() == CBW_LEN);

        let mut raw = [0u8; CBW_LEN];
        self.buf
            .pop_with::<()>(|queued| {
                raw.copy_from_slice(&queued[..CBW_LEN]);
                Ok(CBW_LEN)
            })
            .unwrap();

        // Spec. 6.2.1: meaningful means valid signature, supported LUN and
        // a plausible command block length
        if !raw.starts_with(&CBW_SIGNATURE_LE) {
            return Err(InvalidCbwError);
        }
        let cbw = Cbw::from_le_bytes(&raw[4..])?;
        if cbw.lun > self.max_lun {
            return Err(InvalidCbwError);
        }
        Ok(cbw)
    }

    fn start_data_transfer(&mut self, cbw: Cbw) {
        debug_assert!(matches!(self.state, State::Cbw | State::CbwPartial));

        match cbw.direction {
            DataDirection::Out => self.enter_state(State::DataOut),
            DataDirection::In => self.enter_state(State::DataIn),
            DataDirection::NotExpected => self.enter_state(State::DataNone),
        };
        self.cbw = cbw;
        self.fresh = true;
    }

    /// Latches the error state after a malformed CBW. Both endpoints stay
    /// stalled until the host performs a Reset Recovery.
    fn halt_until_reset(&mut self) {
        self.stall_in_ep();
        self.stall_out_ep();
        self.buf.reset();
        self.status = None;
        self.enter_state(State::Error);
    }

    /// Re-asserts the stalls while the error state is latched, in case the
    /// host cleared a halt without issuing the class reset first.
    fn keep_stalled(&self) {
        self.in_ep.stall();
        self.out_ep.stall();
    }

    fn take_pending_reset(&mut self) -> bool {
        if !self.reset_pending {
            return false;
        }
        info!("usb: bbb: Applying Bulk-Only Reset");
        self.reset_pending = false;
        self.in_ep.unstall();
        self.out_ep.unstall();
        self.enter_state(State::Cbw);
        true
    }

    #[inline]
    fn packet_size(&self) -> usize {
        self.in_ep.max_packet_size() as usize // same for both In and Out EPs
    }

    fn read_packet(&mut self) -> BulkOnlyTransportResult<usize> {
        let count = self.buf.fill_with(
            self.packet_size(),
            TransportError::Error(BulkOnlyError::IoBufferOverflow),
            |free| match self.out_ep.read(free) {
                Ok(count) => Ok(count),
                Err(UsbError::WouldBlock) => Ok(0),
                Err(err) => Err(TransportError::Usb(err)),
            },
        )?;

        trace!(
            "usb: bbb: Read bytes: {}, buf queued: {}",
            count,
            self.buf.queued()
        );

        if count == 0 {
            Err(TransportError::Usb(UsbError::WouldBlock))
        } else {
            Ok(count)
        }
    }

    /// Writes a single packet from the IO buffer returning the number of
    /// bytes actually written
    fn write_packet(&mut self) -> BulkOnlyTransportResult<usize> {
        let packet_size = self.packet_size();
        let count = self.buf.pop_with(|queued| {
            if !queued.is_empty() {
                match self.in_ep.write(&queued[..min(packet_size, queued.len())]) {
                    Ok(count) => Ok(count),
                    Err(UsbError::WouldBlock) => Ok(0),
                    Err(err) => Err(TransportError::Usb(err)),
                }
            } else {
                Ok(0) // not enough data in buf, though it's not an error
            }
        })?;

        trace!(
            "usb: bbb: Wrote bytes: {}, buf queued: {}",
            count,
            self.buf.queued()
        );

        if count == 0 {
            Err(TransportError::Usb(UsbError::WouldBlock))
        } else {
            Ok(count)
        }
    }

    #[inline]
    fn stall_in_ep(&self) {
        info!("usb: bbb: Stall IN ep");
        self.in_ep.stall();
    }

    #[inline]
    fn stall_out_ep(&self) {
        info!("usb: bbb: Stall OUT ep");
        self.out_ep.stall();
    }

    #[inline]
    fn enter_state(&mut self, state: State) {
        trace!("usb: bbb: Enter state: {}", state);
        // clean when a new command transport begins
        if matches!(state, State::Cbw) {
            self.buf.reset();
            self.cbw = Default::default();
            self.status = None;
            self.fresh = false;
        }
        self.state = state;
    }
}

impl<Bus, Buf> Transport for BulkOnly<'_, Bus, Buf>
where
    Bus: UsbBus,
    Buf: BorrowMut<[u8]>,
{
    const PROTO: u8 = TRANSPORT_BBB;
    type Bus = Bus;

    fn get_endpoint_descriptors(&self, writer: &mut DescriptorWriter) -> Result<(), UsbError> {
        writer.endpoint(&self.in_ep)?;
        writer.endpoint(&self.out_ep)?;
        Ok(())
    }

    fn reset(&mut self) {
        info!("usb: bbb: Recv reset");
        self.in_ep.unstall();
        self.out_ep.unstall();
        self.reset_pending = false;
        self.enter_state(State::Cbw);
    }

    fn control_in(&mut self, xfer: ControlIn<Self::Bus>) {
        let req = xfer.request();

        // not interested in this request
        if !(req.request_type == RequestType::Class && req.recipient == Recipient::Interface) {
            return;
        }

        info!("usb: bbb: Recv ctrl_in: {}", req);

        if req.request == CLASS_GET_MAX_LUN {
            // always respond with the max LUN index
            xfer.accept_with(&[self.max_lun])
                .expect("Failed to accept Get Max Lun!");
        }
    }

    fn control_out(&mut self, xfer: ControlOut<Self::Bus>) {
        let req = xfer.request();

        if !(req.request_type == RequestType::Class && req.recipient == Recipient::Interface) {
            return;
        }

        info!("usb: bbb: Recv ctrl_out: {}", req);

        if req.request == CLASS_BULK_ONLY_RESET {
            if req.value == 0 && req.length == 0 {
                // deferred by one drive cycle; the control handler only
                // flags it
                self.reset_pending = true;
                let _ = xfer.accept();
            } else {
                let _ = xfer.reject();
            }
        }
    }
}

impl Cbw {
    fn from_le_bytes(value: &[u8]) -> Result<Self, InvalidCbwError> {
        const MIN_CB_LEN: u8 = 1;
        const MAX_CB_LEN: u8 = 16;

        let block_len = value[10];

        if !(MIN_CB_LEN..=MAX_CB_LEN).contains(&block_len) {
            return Err(InvalidCbwError);
        }

        let declared = u32::from_le_bytes(value[4..8].try_into().unwrap());
        Ok(Cbw {
            tag: u32::from_le_bytes(value[..4].try_into().unwrap()),
            declared,
            residue: declared,
            direction: if declared != 0 {
                if (value[8] & (1 << 7)) > 0 {
                    DataDirection::In
                } else {
                    DataDirection::Out
                }
            } else {
                DataDirection::NotExpected
            },
            lun: value[9] & 0b00001111,
            block_len: block_len as usize,
            block: value[11..].try_into().unwrap(), // ok, cause we checked a length
        })
    }
}
