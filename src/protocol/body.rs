use super::Error as ProtocolError;
use super::{ProtocolStatus, RecordHeader, RecordType, RequestFlags, Role};


/// Frames an 8-byte record body with its header.
fn frame(rtype: RecordType, request_id: u16, body: [u8; 8]) -> [u8; 16] {
    let mut head = RecordHeader::new(rtype, request_id);
    head.set_lengths(8);
    let mut rec = [0; 16];
    rec[..RecordHeader::LEN].copy_from_slice(&head.to_bytes());
    rec[RecordHeader::LEN..].copy_from_slice(&body);
    rec
}


/// The body of a [`RecordType::Unknown`] FastCGI record.
#[derive(Debug, Clone, Copy)]
pub struct UnknownType {
    /// The type of the unknown record.
    pub rtype: u8,
}

impl UnknownType {
    /// The number of bytes in the wire format of an [`UnknownType`] body.
    pub const LEN: usize = 8;

    /// Encodes the [`UnknownType`] body as a complete management record.
    #[inline]
    #[must_use]
    pub fn to_record(self) -> [u8; 16] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.rtype;
        frame(RecordType::Unknown, super::FCGI_NULL_REQUEST_ID, buf)
    }
}


/// The body of a [`RecordType::BeginRequest`] FastCGI record.
#[derive(Debug, Clone, Copy)]
pub struct BeginRequest {
    /// The role of the FastCGI application in this request.
    pub role: Role,
    /// The control flags for this request.
    pub flags: RequestFlags,
}

impl BeginRequest {
    /// The number of bytes in the wire format of a [`BeginRequest`] body.
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`BeginRequest`] record body.
    ///
    /// Unknown flag bits are ignored, the reserved bytes are not inspected.
    ///
    /// # Errors
    /// Returns an error if the role is not a known FastCGI role.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        let role = u16::from_be_bytes([data[0], data[1]]);
        Ok(Self {
            role: Role::try_from(role)?,
            flags: RequestFlags::from_bits_truncate(data[2]),
        })
    }

    /// Encodes the [`BeginRequest`] record body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[..2].copy_from_slice(&u16::to_be_bytes(self.role.into()));
        buf[2] = self.flags.into();
        buf
    }

    /// Encodes the [`BeginRequest`] body as a complete record.
    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        frame(RecordType::BeginRequest, request_id, self.to_bytes())
    }
}


/// The body of a [`RecordType::EndRequest`] FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    /// The application's response status code, as would be set via exit(3)
    /// in regular CGI.
    pub app_status: u32,
    /// The protocol status code for this response.
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    /// The number of bytes in the wire format of an [`EndRequest`] body.
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`EndRequest`] record body.
    ///
    /// # Errors
    /// Returns an error if the protocol status is unknown.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            app_status: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            protocol_status: ProtocolStatus::try_from(data[4])?,
        })
    }

    /// Encodes the [`EndRequest`] record body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[..4].copy_from_slice(&u32::to_be_bytes(self.app_status));
        buf[4] = self.protocol_status.into();
        buf
    }

    /// Encodes the [`EndRequest`] body as a complete record.
    #[inline]
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        frame(RecordType::EndRequest, request_id, self.to_bytes())
    }
}
