//! Fixed-format sense data
//!
//! One 18-byte record per device. Every failing command stamps it and the
//! record stays until a successful REQUEST SENSE reads it back; the host is
//! guaranteed a consistent view across one retry.

/// Length of the fixed-format record
pub const SENSE_LEN: usize = 18;

/// Current-error response code
const RESPONSE_CODE: u8 = 0x70;
/// Bytes following the additional-length field
const ADDITIONAL_LEN: u8 = 10;

/// Sense key (SPC 4.5.6)
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    NoSense = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    DataProtect = 0x07,
}

/// A `(key, asc, ascq)` triplet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenseCode {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseCode {
    const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        SenseCode { key, asc, ascq }
    }

    pub const INVALID_COMMAND_OPERATION_CODE: SenseCode =
        SenseCode::new(SenseKey::IllegalRequest, 0x20, 0x00);
    pub const INVALID_FIELD_IN_CDB: SenseCode = SenseCode::new(SenseKey::IllegalRequest, 0x24, 0x00);
    pub const LBA_OUT_OF_RANGE: SenseCode = SenseCode::new(SenseKey::IllegalRequest, 0x21, 0x00);
    pub const MEDIUM_NOT_PRESENT: SenseCode = SenseCode::new(SenseKey::NotReady, 0x3A, 0x00);
    pub const WRITE_PROTECTED: SenseCode = SenseCode::new(SenseKey::DataProtect, 0x27, 0x00);
    pub const WRITE_ERROR: SenseCode = SenseCode::new(SenseKey::MediumError, 0x0C, 0x00);
    pub const UNRECOVERED_READ_ERROR: SenseCode = SenseCode::new(SenseKey::MediumError, 0x11, 0x00);
    pub const NO_INDEX: SenseCode = SenseCode::new(SenseKey::HardwareError, 0x01, 0x00);
    pub const HARDWARE_ERROR: SenseCode = SenseCode::new(SenseKey::HardwareError, 0x00, 0x00);
}

/// The device's sense record
#[derive(Debug, Default, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenseData {
    key: u8,
    info: u32,
    cmd_specific: u32,
    asc: u8,
    ascq: u8,
    fruc: u8,
    key_specific: [u8; 3],
}

impl SenseData {
    pub const fn new() -> Self {
        SenseData {
            key: 0,
            info: 0,
            cmd_specific: 0,
            asc: 0,
            ascq: 0,
            fruc: 0,
            key_specific: [0; 3],
        }
    }

    /// Stamps the record with an error code
    pub fn set(&mut self, code: SenseCode) {
        self.key = code.key as u8;
        self.asc = code.asc;
        self.ascq = code.ascq;
    }

    /// Command- or device-specific information field
    pub fn set_info(&mut self, info: u32) {
        self.info = info;
    }

    /// Clears the key/asc/ascq triplet. Called after a successful
    /// REQUEST SENSE, and from nowhere else.
    pub fn clear(&mut self) {
        self.key = 0;
        self.asc = 0;
        self.ascq = 0;
    }

    pub fn is_clear(&self) -> bool {
        self.key == 0 && self.asc == 0 && self.ascq == 0
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn asc(&self) -> u8 {
        self.asc
    }

    pub fn ascq(&self) -> u8 {
        self.ascq
    }

    /// Wire encoding, fixed format (SPC 4.5.3)
    pub fn to_bytes(&self) -> [u8; SENSE_LEN] {
        let mut out = [0u8; SENSE_LEN];
        out[0] = RESPONSE_CODE;
        out[2] = self.key;
        out[3..7].copy_from_slice(&self.info.to_be_bytes());
        out[7] = ADDITIONAL_LEN;
        out[8..12].copy_from_slice(&self.cmd_specific.to_be_bytes());
        out[12] = self.asc;
        out[13] = self.ascq;
        out[14] = self.fruc;
        out[15..18].copy_from_slice(&self.key_specific);
        out
    }
}
