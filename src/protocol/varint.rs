use std::io::{self, prelude::*};

use super::Error as ProtocolError;


/// A [`u32`] which can be variably encoded in either 1 or 4 bytes.
///
/// Values up to 127 use the short form. Larger values set the top bit of the
/// first byte and carry the remaining 31 bits big-endian.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VarInt(u32);

impl VarInt {
    /// The bit indicating whether the 4-byte encoding is used.
    const LONG_BIT: u8 = 1 << 7;
    /// The largest value using the 1-byte encoding.
    pub const SHORT_MAX: Self = VarInt(0x7f);
    /// The maximum value a [`VarInt`] can encode.
    pub const MAX: Self = VarInt((1 << 31) - 1);

    /// Decodes a [`VarInt`] from the start of `data`.
    ///
    /// Returns the value and the number of bytes it occupied, or [`None`]
    /// if `data` ends before the encoding does.
    #[inline]
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        let first = *data.first()?;
        if first & Self::LONG_BIT == 0 {
            return Some((first.into(), 1));
        }
        let long: [u8; 4] = data.get(..4)?.try_into().ok()?;
        let v = u32::from_be_bytes(long) & Self::MAX.0;
        Some((Self(v), 4))
    }

    /// Returns the number of bytes the wire encoding of this value needs.
    #[inline]
    #[must_use]
    pub fn encoded_len(self) -> usize {
        if self <= Self::SHORT_MAX { 1 } else { 4 }
    }

    /// Encodes the [`VarInt`] into the writer's output.
    ///
    /// # Errors
    /// Any errors from [`Write::write_all`] are forwarded to the caller.
    pub fn write(self, mut w: impl Write) -> io::Result<usize> {
        if self <= Self::SHORT_MAX {
            #[allow(clippy::cast_possible_truncation)]
            let e = [self.0 as u8];
            w.write_all(&e).and(Ok(e.len()))
        } else {
            let mut e: [u8; 4] = u32::to_be_bytes(self.0);
            e[0] |= Self::LONG_BIT;
            w.write_all(&e).and(Ok(e.len()))
        }
    }

    /// Converts the [`VarInt`] into a [`usize`], saturating at [`usize::MAX`].
    #[inline]
    #[must_use]
    pub fn to_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl From<VarInt> for u32 {
    /// Extracts the contained [`u32`].
    #[inline]
    fn from(v: VarInt) -> Self {
        v.0
    }
}

impl From<u8> for VarInt {
    #[inline]
    fn from(v: u8) -> Self {
        Self(v.into())
    }
}

impl From<u16> for VarInt {
    #[inline]
    fn from(v: u16) -> Self {
        Self(v.into())
    }
}

impl TryFrom<u32> for VarInt {
    type Error = ProtocolError;

    /// Converts a [`u32`] into a [`VarInt`], unless the [`u32`] is too large.
    ///
    /// # Errors
    /// Returns an error if the [`u32`] needs more than 31 bits.
    #[inline]
    fn try_from(v: u32) -> Result<Self, Self::Error> {
        if v > Self::MAX.0 {
            Err(ProtocolError::InvalidVarInt)
        } else {
            Ok(VarInt(v))
        }
    }
}

impl TryFrom<usize> for VarInt {
    type Error = ProtocolError;

    /// Converts a [`usize`] into a [`VarInt`], unless the [`usize`] is too large.
    ///
    /// # Errors
    /// Returns an error if the [`usize`] needs more than 31 bits.
    #[inline]
    fn try_from(v: usize) -> Result<Self, Self::Error> {
        u32::try_from(v)
            .map_err(|_| ProtocolError::InvalidVarInt)
            .and_then(VarInt::try_from)
    }
}
