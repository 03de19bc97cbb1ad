/// Types representing the bodies of fixed-size FastCGI records.
pub mod body;
mod fields;
/// An encoder and decoder for FastCGI name-value pairs.
pub mod nv;
/// An encoder and decoder for FastCGI's variable-length integers.
pub mod varint;

pub use fields::*;


/// The fixed FastCGI request ID for management records.
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

/// Bits of the wire request ID that carry the actual ID. The top bit is
/// reserved and ignored on input.
pub const REQUEST_ID_MASK: u16 = 0x7fff;


/// Error types that may occur while processing FastCGI protocol elements.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The FastCGI version field specifies an unknown version identifier.
    #[error("unknown FastCGI protocol version {0}")]
    UnknownVersion(u8),
    /// The FastCGI record type field specifies an unknown record type.
    #[error("unknown FastCGI record type {0}")]
    UnknownRecordType(u8),
    /// The FastCGI request role field specifies an unknown role identifier.
    #[error("unknown FastCGI role {0}")]
    UnknownRole(u16),
    /// The FastCGI request flags contain at least one unknown flag bit.
    #[error("unknown FastCGI request flags {0:#010b}")]
    UnknownFlags(u8),
    /// The FastCGI response protocol status specifies an unknown status.
    #[error("unknown FastCGI protocol status {0}")]
    UnknownStatus(u8),

    /// The input value is too large to be encoded as a FastCGI VarInt.
    #[error("input is too large to be encoded as a FastCGI VarInt")]
    InvalidVarInt,
}


/// A FastCGI record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHeader {
    /// The FastCGI version of this record.
    pub version: Version,
    /// The type of this record, defining its payload.
    pub rtype: RecordType,
    /// The ID of the request this record belongs to.
    pub request_id: u16,
    /// The length of this record's payload.
    pub content_length: u16,
    /// The amount of padding following this record.
    pub padding_length: u8,
}

impl RecordHeader {
    /// Creates a new [`RecordHeader`] with [`Version::V1`] and all
    /// lengths set to 0.
    #[inline]
    #[must_use]
    pub fn new(rtype: RecordType, request_id: u16) -> Self {
        Self { version: Version::V1, rtype, request_id, content_length: 0, padding_length: 0 }
    }

    /// Sets `content_length` and pads the record body to a multiple of 8.
    #[inline]
    pub fn set_lengths(&mut self, content_length: u16) {
        self.content_length = content_length;
        let mut padding = content_length % 8;
        if padding > 0 {
            padding = 8 - padding;
        }
        self.padding_length = padding as u8;
    }

    /// Tests whether this [`RecordHeader`] represents a management record.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        self.request_id == FCGI_NULL_REQUEST_ID
    }

    /// Returns the number of bytes following the header on the wire,
    /// i.e. payload plus padding.
    #[inline]
    #[must_use]
    pub fn body_len(self) -> usize {
        usize::from(self.content_length) + usize::from(self.padding_length)
    }

    /// Returns a slice of `self.padding_length` zero bytes to be used as padding.
    #[inline]
    #[must_use]
    pub fn padding_bytes(self) -> &'static [u8] {
        static PADDING: [u8; u8::MAX as usize] = [0; u8::MAX as usize];
        &PADDING[..self.padding_length.into()]
    }

    /// The number of bytes in the wire format of a [`RecordHeader`].
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`RecordHeader`].
    ///
    /// The reserved top bit of the request ID is masked off.
    ///
    /// # Errors
    /// Returns an error if the version or record type is unknown. The version
    /// is checked first, since a record of unknown version cannot be skipped.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, Error> {
        Ok(Self {
            version: Version::try_from(data[0])?,
            rtype: RecordType::try_from(data[1])?,
            request_id: u16::from_be_bytes([data[2], data[3]]) & REQUEST_ID_MASK,
            content_length: u16::from_be_bytes([data[4], data[5]]),
            padding_length: data[6],
        })
    }

    /// Reads the lengths of a raw header without validating it. Used to skip
    /// records of unknown type.
    #[inline]
    #[must_use]
    pub fn raw_body_len(data: [u8; Self::LEN]) -> usize {
        usize::from(u16::from_be_bytes([data[4], data[5]])) + usize::from(data[6])
    }

    /// Encodes the [`RecordHeader`] into its binary wire format.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.version.into();
        buf[1] = self.rtype.into();
        buf[2..4].copy_from_slice(&(self.request_id & REQUEST_ID_MASK).to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf
    }
}
