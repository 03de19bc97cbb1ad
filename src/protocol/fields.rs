use std::fmt;

use super::Error as ProtocolError;


/// Declares a field-less wire enum together with its checked conversion from
/// the raw integer and the infallible conversion back.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident: $repr:ident => $err:ident {
            $($(#[$vmeta:meta])* $var:ident = $val:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
        #[cfg_attr(test, derive(strum::EnumIter))]
        #[repr($repr)]
        pub enum $name {
            $($(#[$vmeta])* $var = $val,)+
        }

        impl TryFrom<$repr> for $name {
            type Error = ProtocolError;

            #[doc = concat!("Parses a [`", stringify!($repr), "`] as a FastCGI [`", stringify!($name), "`].")]
            ///
            /// # Errors
            /// Returns an error naming the raw value if it is not defined.
            #[inline]
            fn try_from(v: $repr) -> Result<Self, Self::Error> {
                Self::from_repr(v).ok_or(ProtocolError::$err(v))
            }
        }

        impl From<$name> for $repr {
            #[inline]
            fn from(v: $name) -> Self {
                v as Self
            }
        }
    };
}


wire_enum! {
    /// A validated FastCGI version number.
    Version: u8 => UnknownVersion {
        /// FastCGI Version 1
        V1 = 1,
    }
}

wire_enum! {
    /// A validated FastCGI role identifier. Only [`Role::Responder`] requests
    /// are served; the others are answered with [`ProtocolStatus::UnknownRole`].
    #[allow(missing_docs)]
    Role: u16 => UnknownRole {
        Responder = 1,
        Authorizer = 2,
        Filter = 3,
    }
}

wire_enum! {
    /// The protocol-level outcome reported in `END_REQUEST`.
    ProtocolStatus: u8 => UnknownStatus {
        /// Normal end of request.
        RequestComplete = 0,
        /// Rejects a second request on a connection that already has one.
        CantMpxConn = 1,
        /// The application ran out of request capacity.
        Overloaded = 2,
        /// The request asked for a role other than responder.
        UnknownRole = 3,
    }
}

wire_enum! {
    /// A validated FastCGI record type.
    #[allow(missing_docs)]
    RecordType: u8 => UnknownRecordType {
        BeginRequest = 1,
        AbortRequest = 2,
        EndRequest = 3,
        Params = 4,
        Stdin = 5,
        Stdout = 6,
        Stderr = 7,
        Data = 8,
        GetValues = 9,
        GetValuesResult = 10,
        Unknown = 11,
    }
}

impl RecordType {
    /// Tests whether the web server sends records of this type.
    #[inline]
    #[must_use]
    pub fn is_inbound(self) -> bool {
        use RecordType::*;
        matches!(self, BeginRequest | AbortRequest | Params | Stdin | Data | GetValues)
    }

    /// Tests whether records of this type form a stream ended by an empty
    /// record.
    #[inline]
    #[must_use]
    pub fn is_stream(self) -> bool {
        use RecordType::*;
        matches!(self, Params | Stdin | Stdout | Stderr | Data)
    }
}


bitflags::bitflags! {
    /// The flags byte of `BEGIN_REQUEST`.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u8 {
        /// The web server wants the connection kept after this request.
        const KeepConn = 1;
    }
}

impl TryFrom<u8> for RequestFlags {
    type Error = ProtocolError;

    /// Parses the flags byte, rejecting undefined bits.
    ///
    /// # Errors
    /// Returns an error carrying the undefined bits.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v & !Self::all().bits() {
            0 => Ok(Self::from_bits_retain(v)),
            unknown => Err(ProtocolError::UnknownFlags(unknown)),
        }
    }
}

impl From<RequestFlags> for u8 {
    #[inline]
    fn from(v: RequestFlags) -> Self {
        v.bits()
    }
}

impl fmt::Debug for RequestFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Only as many binary digits as there are defined flags
        const DIGITS: usize = (u8::BITS - RequestFlags::all().bits().leading_zeros()) as usize;
        write!(f, "RequestFlags({:#0width$b})", self.bits(), width = DIGITS + 2)
    }
}
