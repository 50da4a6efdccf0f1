//! The fixed-stride log record wire format.
//!
//! Every staged batch file and every row handed to the engine uses the same
//! 224-byte layout. A staged file is a bare concatenation of records with no
//! header; a valid file's length is always a whole multiple of
//! [`RECORD_SIZE`].
//!
//! Layout (little-endian, fixed field order):
//!
//! ```text
//! offset  size  field
//!      0     4  index          global capture counter
//!      4     4  token          device/session token
//!      8     4  seq            slot within the capture buffer
//!     12     4  captured_at    producer-side timestamp (s)
//!     16     4  stored_at      store-side timestamp (s)
//!     20     4  severity
//!     24    24  category       NUL-padded bytes
//!     48   160  message        NUL-padded bytes
//!    208    16  reserved
//! ```

use silo_error::{Result, SiloError};

/// Encoded size of one record in bytes.
pub const RECORD_SIZE: usize = 224;

/// Fixed width of the category field.
pub const CATEGORY_LEN: usize = 24;

/// Fixed width of the message field.
pub const MESSAGE_LEN: usize = 160;

const RESERVED_LEN: usize = 16;

/// Record severity, stored as a plain u32 on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Severity {
    Debug = 0,
    #[default]
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl Severity {
    /// Decode from the wire value, clamping unknown values to `Critical`.
    pub const fn from_wire(v: u32) -> Self {
        match v {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warning,
            3 => Self::Error,
            _ => Self::Critical,
        }
    }
}

/// One captured log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Global capture counter assigned by the producer.
    pub index: u32,
    /// Device or session token.
    pub token: u32,
    /// Slot index within the capture buffer at the time of capture.
    pub seq: u32,
    /// Timestamp at capture, seconds.
    pub captured_at: u32,
    /// Timestamp at store time, seconds.
    pub stored_at: u32,
    /// Severity wire value.
    pub severity: u32,
    /// NUL-padded category bytes.
    pub category: [u8; CATEGORY_LEN],
    /// NUL-padded message bytes.
    pub message: [u8; MESSAGE_LEN],
}

impl Default for LogRecord {
    fn default() -> Self {
        Self {
            index: 0,
            token: 0,
            seq: 0,
            captured_at: 0,
            stored_at: 0,
            severity: Severity::Info as u32,
            category: [0; CATEGORY_LEN],
            message: [0; MESSAGE_LEN],
        }
    }
}

impl LogRecord {
    /// Build a record from string fields, NUL-padding and erroring on
    /// overlong input rather than truncating silently.
    pub fn new(index: u32, token: u32, severity: Severity, category: &str, message: &str) -> Result<Self> {
        let mut rec = Self {
            index,
            token,
            severity: severity as u32,
            ..Self::default()
        };
        copy_padded(&mut rec.category, category.as_bytes(), "category")?;
        copy_padded(&mut rec.message, message.as_bytes(), "message")?;
        Ok(rec)
    }

    /// Category bytes up to the first NUL, as UTF-8 if valid.
    pub fn category_str(&self) -> &str {
        trimmed_str(&self.category)
    }

    /// Message bytes up to the first NUL, as UTF-8 if valid.
    pub fn message_str(&self) -> &str {
        trimmed_str(&self.message)
    }

    /// Encode into a caller-provided buffer of at least [`RECORD_SIZE`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= RECORD_SIZE);
        buf[0..4].copy_from_slice(&self.index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.token.to_le_bytes());
        buf[8..12].copy_from_slice(&self.seq.to_le_bytes());
        buf[12..16].copy_from_slice(&self.captured_at.to_le_bytes());
        buf[16..20].copy_from_slice(&self.stored_at.to_le_bytes());
        buf[20..24].copy_from_slice(&self.severity.to_le_bytes());
        buf[24..24 + CATEGORY_LEN].copy_from_slice(&self.category);
        buf[48..48 + MESSAGE_LEN].copy_from_slice(&self.message);
        buf[208..208 + RESERVED_LEN].fill(0);
    }

    /// Encode into a fresh array.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Decode from a buffer of at least [`RECORD_SIZE`] bytes.
    pub fn decode_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_SIZE {
            return Err(SiloError::ShortRead {
                expected: RECORD_SIZE,
                actual: buf.len(),
            });
        }
        let mut category = [0u8; CATEGORY_LEN];
        category.copy_from_slice(&buf[24..24 + CATEGORY_LEN]);
        let mut message = [0u8; MESSAGE_LEN];
        message.copy_from_slice(&buf[48..48 + MESSAGE_LEN]);
        Ok(Self {
            index: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            token: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            seq: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            captured_at: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            stored_at: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            severity: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            category,
            message,
        })
    }
}

fn copy_padded(dst: &mut [u8], src: &[u8], field: &'static str) -> Result<()> {
    if src.len() > dst.len() {
        return Err(SiloError::FieldTooLong { field });
    }
    dst[..src.len()].copy_from_slice(src);
    dst[src.len()..].fill(0);
    Ok(())
}

fn trimmed_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}
