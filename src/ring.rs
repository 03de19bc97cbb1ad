use std::fmt;
use std::io::{self, prelude::*, IoSliceMut};

use crate::macros::trace;

#[cfg(feature = "sync-ring")]
mod sync;
#[cfg(feature = "sync-ring")]
pub use sync::SyncByteRing;


/// Error types returned by [`ByteRing`] operations that can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `unread` was asked to rewind past the write cursor.
    #[error("cannot unread {requested} bytes, only {available} are free")]
    UnreadOverflow {
        /// The number of bytes the caller wanted to rewind.
        requested: usize,
        /// The number of bytes that could have been rewound.
        available: usize,
    },
}


/// A byte-wise consumer that can refuse input, such as the form decoder of
/// a [`ParamTable`](crate::params::ParamTable).
pub trait PushSink {
    /// The error reported when a byte is refused.
    type Error;

    /// Consumes the next input byte.
    ///
    /// # Errors
    /// Implementations reject bytes they cannot process.
    fn push_byte(&mut self, b: u8) -> Result<(), Self::Error>;
}


/// A fixed-capacity circular byte buffer.
///
/// Empty and full both have the read cursor on the write cursor, so a
/// separate flag marks the full case. The storage is allocated once and
/// never grows; every transfer is done in at most two contiguous copies.
pub struct ByteRing {
    buf: Box<[u8]>,
    rpos: usize,
    wpos: usize,
    full: bool,
    last_read: usize,
}

impl ByteRing {
    /// Creates an empty ring holding at most `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { buf: vec![0; size].into_boxed_slice(), rpos: 0, wpos: 0, full: false, last_read: 0 }
    }

    /// Returns the total storage size.
    #[inline]
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.buf.len()
    }

    /// Returns the number of readable bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        if self.full {
            self.buf.len()
        } else if self.wpos >= self.rpos {
            self.wpos - self.rpos
        } else {
            self.buf.len() - self.rpos + self.wpos
        }
    }

    /// Returns the number of bytes that can still be written.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len() - self.size()
    }

    /// Tests whether there is nothing to read.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.full && self.rpos == self.wpos
    }

    /// Tests whether there is no room to write.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Returns the number of bytes moved by the last `read`, `discard` or
    /// `read_into` call.
    #[inline]
    #[must_use]
    pub fn last_read(&self) -> usize {
        self.last_read
    }

    /// Drops all content. The storage is kept.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
        self.full = false;
        self.last_read = 0;
    }

    /// Returns the readable bytes as up to two contiguous slices, in order.
    #[must_use]
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.is_empty() {
            (&[], &[])
        } else if self.wpos > self.rpos {
            (&self.buf[self.rpos..self.wpos], &[])
        } else {
            let (front, back) = self.buf.split_at(self.rpos);
            (back, &front[..self.wpos])
        }
    }

    fn free_slices_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        if self.full {
            (&mut [], &mut [])
        } else if self.wpos >= self.rpos {
            let (front, back) = self.buf.split_at_mut(self.wpos);
            (back, &mut front[..self.rpos])
        } else {
            (&mut self.buf[self.wpos..self.rpos], &mut [])
        }
    }

    fn commit_write(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.wpos = (self.wpos + n) % self.buf.len();
        self.full = self.wpos == self.rpos;
    }

    fn commit_read(&mut self, n: usize) {
        self.last_read = n;
        if n == 0 {
            return;
        }
        self.rpos = (self.rpos + n) % self.buf.len();
        self.full = false;
    }

    /// Appends as much of `data` as fits and returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let (a, b) = self.free_slices_mut();
        let first = a.len().min(data.len());
        a[..first].copy_from_slice(&data[..first]);
        let second = b.len().min(data.len() - first);
        b[..second].copy_from_slice(&data[first..(first + second)]);

        let n = first + second;
        self.commit_write(n);
        trace!(bytes = n, wanted = data.len(), "ring write");
        n
    }

    /// Copies up to `out.len()` bytes into `out` without consuming them.
    #[must_use]
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let (a, b) = self.as_slices();
        let first = a.len().min(out.len());
        out[..first].copy_from_slice(&a[..first]);
        let second = b.len().min(out.len() - first);
        out[first..(first + second)].copy_from_slice(&b[..second]);
        first + second
    }

    /// Moves up to `out.len()` bytes into `out`.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.commit_read(n);
        n
    }

    /// Consumes up to `n` bytes without copying them.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.size());
        self.commit_read(n);
        n
    }

    /// Moves the read cursor back by `n` bytes, restoring bytes consumed
    /// earlier. `n == 0` rewinds by [`last_read`](Self::last_read).
    ///
    /// # Errors
    /// Fails without moving the cursor if the rewind would cross the write
    /// cursor, i.e. if `n` exceeds the free capacity.
    pub fn unread(&mut self, n: usize) -> Result<(), Error> {
        let n = if n == 0 { self.last_read } else { n };
        let available = self.capacity();
        if n > available {
            return Err(Error::UnreadOverflow { requested: n, available });
        }
        if n > 0 {
            let len = self.buf.len();
            self.rpos = (self.rpos + len - n) % len;
            self.full = self.rpos == self.wpos;
        }
        self.last_read = 0;
        Ok(())
    }

    /// Reads the first `store.len()` bytes of a `max`-byte item into `store`
    /// and discards the rest of the item.
    pub fn read_max(&mut self, store: &mut [u8], max: usize) -> usize {
        let keep = store.len().min(max);
        let n = self.read(&mut store[..keep]);
        self.discard(max - keep);
        n
    }

    /// Moves everything readable to the end of `v`.
    pub fn read_to_vec(&mut self, v: &mut Vec<u8>) -> usize {
        let (a, b) = self.as_slices();
        v.extend_from_slice(a);
        v.extend_from_slice(b);
        let n = a.len() + b.len();
        self.commit_read(n);
        n
    }

    /// Writes up to `n` readable bytes to `w` and consumes what was written.
    ///
    /// # Errors
    /// Write errors are forwarded. Nothing is consumed in that case.
    pub fn read_into(&mut self, w: &mut impl Write, n: usize) -> io::Result<usize> {
        let (a, b) = self.as_slices();
        let first = a.len().min(n);
        let second = b.len().min(n - first);
        w.write_all(&a[..first])?;
        w.write_all(&b[..second])?;
        self.commit_read(first + second);
        Ok(first + second)
    }

    /// Fills free space with a single vectored read from `r`.
    ///
    /// Returns `Ok(0)` without reading when the ring is full.
    ///
    /// # Errors
    /// Read errors are forwarded, including [`io::ErrorKind::WouldBlock`].
    pub fn write_from(&mut self, r: &mut impl Read) -> io::Result<usize> {
        if self.full {
            return Ok(0);
        }
        let (a, b) = self.free_slices_mut();
        let mut bufs = [IoSliceMut::new(a), IoSliceMut::new(b)];
        let n = r.read_vectored(&mut bufs)?;
        self.commit_write(n);
        Ok(n)
    }

    /// Moves up to `n` bytes from `other` into this ring, limited by free space.
    pub fn copy_from(&mut self, other: &mut ByteRing, n: usize) -> usize {
        let (a, b) = other.as_slices();
        let want = n.min(a.len() + b.len()).min(self.capacity());
        let first = self.write(&a[..want.min(a.len())]);
        let second = self.write(&b[..(want - first)]);
        other.commit_read(first + second);
        first + second
    }

    /// Feeds up to `n` bytes into `sink` byte by byte.
    ///
    /// # Errors
    /// When the sink refuses a byte, the read cursor is restored to where it
    /// was before the call and the sink's error is returned.
    pub fn push_to<S: PushSink>(&mut self, sink: &mut S, n: usize) -> Result<usize, S::Error> {
        let (a, b) = self.as_slices();
        let first = a.len().min(n);
        let second = b.len().min(n - first);
        for &c in a[..first].iter().chain(&b[..second]) {
            sink.push_byte(c)?;
        }
        self.commit_read(first + second);
        Ok(first + second)
    }
}

impl fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let alternate = f.alternate();
        let mut d = f.debug_struct("ByteRing");
        d.field("max_size", &self.max_size())
            .field("size", &self.size())
            .field("rpos", &self.rpos)
            .field("wpos", &self.wpos)
            .field("full", &self.full);
        if alternate {
            let (a, b) = self.as_slices();
            let dump: String = a.iter().chain(b).map(|c| format!("{c:02x}")).collect();
            d.field("data", &dump);
        }
        d.finish()
    }
}
