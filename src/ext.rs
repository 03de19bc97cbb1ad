use memchr::memmem;


/// Decodes a single ASCII hex digit. Anything else decodes as 0.
#[inline]
#[must_use]
pub(crate) const fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => 0,
    }
}

/// Decodes two hex digits into the byte they spell, e.g. `b"2F"` to `b'/'`.
#[inline]
#[must_use]
pub(crate) const fn hex_byte(hi: u8, lo: u8) -> u8 {
    (hex_value(hi) << 4) | hex_value(lo)
}


/// An extension trait for the byte slices flowing through the driver.
pub(crate) trait ByteSliceExt {
    /// Finds the first occurrence of `needle`.
    fn find(&self, needle: &[u8]) -> Option<usize>;

    /// Removes leading and trailing ASCII whitespace.
    fn trim_ws(&self) -> &[u8];

    /// Keeps at most the last `max` bytes.
    fn tail(&self, max: usize) -> &[u8];

    /// Keeps at most the first `max` bytes.
    fn head(&self, max: usize) -> &[u8];
}

impl ByteSliceExt for [u8] {
    #[inline]
    fn find(&self, needle: &[u8]) -> Option<usize> {
        memmem::find(self, needle)
    }

    fn trim_ws(&self) -> &[u8] {
        let start = self.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(self.len());
        let end = self.iter().rposition(|c| !c.is_ascii_whitespace()).map_or(start, |e| e + 1);
        &self[start..end.max(start)]
    }

    #[inline]
    fn tail(&self, max: usize) -> &[u8] {
        &self[self.len().saturating_sub(max)..]
    }

    #[inline]
    fn head(&self, max: usize) -> &[u8] {
        &self[..self.len().min(max)]
    }
}
