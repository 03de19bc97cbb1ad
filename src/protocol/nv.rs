use std::io::{self, prelude::*};

use super::varint::VarInt;
use super::Error as ProtocolError;


/// The two length prefixes in front of every FastCGI name-value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPair {
    /// Length of the name in bytes.
    pub name_len: usize,
    /// Length of the value in bytes.
    pub value_len: usize,
    /// Bytes occupied by both prefixes: 2, 5 or 8.
    pub prefix_len: usize,
}

impl LengthPair {
    /// The largest possible prefix, with both lengths in the 4-byte form.
    pub const MAX_PREFIX: usize = 8;

    /// Decodes both length prefixes from the start of `data`.
    ///
    /// Returns [`None`] if `data` ends inside the prefixes. Callers holding at
    /// least [`LengthPair::MAX_PREFIX`] bytes never see [`None`].
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (name, nlen) = VarInt::decode(data)?;
        let (value, vlen) = VarInt::decode(&data[nlen..])?;
        Some(Self { name_len: name.to_usize(), value_len: value.to_usize(), prefix_len: nlen + vlen })
    }

    /// Returns the number of bytes of the complete pair, prefixes included.
    #[inline]
    #[must_use]
    pub fn total_len(self) -> usize {
        self.prefix_len + self.name_len + self.value_len
    }
}


/// An iterator decoding complete name-value pairs from its input.
#[derive(Debug, Clone)]
pub struct NVIter<'a> {
    data: &'a [u8],
}

impl<'a> NVIter<'a> {
    /// Creates a new [`NVIter`] over the referenced input bytes.
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Extracts the input bytes not consumed by complete pairs.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for NVIter<'a> {
    /// The name-value pair returned by the iterator.
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let lens = LengthPair::decode(self.data)?;
        let pair = self.data.get(lens.prefix_len..lens.total_len())?;
        self.data = &self.data[lens.total_len()..];
        Some(pair.split_at(lens.name_len))
    }
}

impl std::iter::FusedIterator for NVIter<'_> {}


/// Encodes a name-value pair into the writer's output.
///
/// # Errors
/// Fails with [`io::ErrorKind::InvalidInput`] if either length exceeds
/// [`VarInt::MAX`]. Any errors from [`Write::write_all`] are forwarded.
pub fn write((name, value): (&[u8], &[u8]), mut w: impl Write) -> io::Result<usize> {
    let varint = |len: usize| VarInt::try_from(len)
        .map_err(|e: ProtocolError| io::Error::new(io::ErrorKind::InvalidInput, e));
    let mut written = varint(name.len())?.write(&mut w)?;
    written += varint(value.len())?.write(&mut w)?;
    w.write_all(name)?;
    w.write_all(value)?;
    Ok(written + name.len() + value.len())
}
