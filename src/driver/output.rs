use std::io::{self, Write};

use crate::protocol::{RecordHeader, RecordType};


/// Size of the per-request output buffer, framing included.
pub const MAX_OUT: usize = 0xCFFF;

const HEAD: usize = RecordHeader::LEN;


/// The STDOUT side of a request.
///
/// The buffer holds complete records waiting to be sent, followed by at most
/// one open STDOUT record whose header is written once it gets closed. Cursors
/// satisfy `sent <= framed <= len`, and an open record exists iff
/// `len > framed`.
#[derive(Debug)]
pub(crate) struct Output {
    buf: Box<[u8]>,
    sent: usize,
    framed: usize,
    len: usize,
    records: u32,
}

impl Output {
    pub(crate) fn new() -> Self {
        Self { buf: vec![0; MAX_OUT].into_boxed_slice(), sent: 0, framed: 0, len: 0, records: 0 }
    }

    pub(crate) fn clear(&mut self) {
        self.sent = 0;
        self.framed = 0;
        self.len = 0;
        self.records = 0;
    }

    /// Framed bytes not sent yet.
    #[inline]
    pub(crate) fn pending(&self) -> usize {
        self.framed - self.sent
    }

    /// Payload bytes in the open record.
    #[inline]
    pub(crate) fn open_len(&self) -> usize {
        (self.len - self.framed).saturating_sub(HEAD)
    }

    /// Buffer bytes in use, headers included.
    #[inline]
    pub(crate) fn reserved(&self) -> usize {
        self.len - self.sent
    }

    /// Payload bytes that still fit without sending anything.
    pub(crate) fn capacity(&self) -> usize {
        let head = if self.len > self.framed { 0 } else { HEAD };
        self.buf.len().saturating_sub(self.len + head)
    }

    /// Number of STDOUT records closed since the last [`clear`](Self::clear).
    #[inline]
    pub(crate) fn records(&self) -> u32 {
        self.records
    }

    #[inline]
    pub(crate) fn has_output(&self) -> bool {
        self.records > 0 || self.open_len() > 0
    }

    /// Returns the free payload space of the open record, opening one first
    /// if necessary. Empty if not even a header fits.
    pub(crate) fn space(&mut self) -> &mut [u8] {
        if self.len == self.framed {
            if self.buf.len() - self.len <= HEAD {
                return &mut [];
            }
            self.len += HEAD;
        }
        &mut self.buf[self.len..]
    }

    /// Marks `n` bytes of [`space`](Self::space) as written.
    #[inline]
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len());
        self.len += n;
    }

    /// Appends as much of `data` to the open record as fits.
    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        let space = self.space();
        let n = space.len().min(data.len());
        space[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    /// Writes the header of the open record. `prefix` goes in front of the
    /// payload if there is room for it. An empty record is dropped.
    pub(crate) fn close(&mut self, request_id: u16, prefix: Option<&[u8]>) {
        if self.len == self.framed {
            return;
        }

        let start = self.framed + HEAD;
        if let Some(prefix) = prefix {
            if self.len + prefix.len() <= self.buf.len() {
                self.buf.copy_within(start..self.len, start + prefix.len());
                self.buf[start..(start + prefix.len())].copy_from_slice(prefix);
                self.len += prefix.len();
            } else {
                tracing::warn!(request_id, "no room for status line in output");
            }
        }

        let payload = self.len - start;
        if payload == 0 {
            self.len = self.framed;
            return;
        }

        let mut head = RecordHeader::new(RecordType::Stdout, request_id);
        // The whole buffer is smaller than u16::MAX
        #[allow(clippy::cast_possible_truncation)]
        {
            head.content_length = payload as u16;
        }
        self.buf[self.framed..start].copy_from_slice(&head.to_bytes());
        self.framed = self.len;
        self.records += 1;
    }

    /// Appends complete records. Requires that no record is open.
    ///
    /// Returns `false` if they don't fit.
    pub(crate) fn queue(&mut self, records: &[u8]) -> bool {
        debug_assert_eq!(self.len, self.framed, "record still open");
        if self.buf.len() - self.len < records.len() {
            return false;
        }
        self.buf[self.len..(self.len + records.len())].copy_from_slice(records);
        self.len += records.len();
        self.framed = self.len;
        true
    }

    /// Writes pending records once. Cursors rewind to the start of the buffer
    /// when everything framed is gone.
    pub(crate) fn send(&mut self, w: &mut impl Write) -> io::Result<usize> {
        let n = w.write(&self.buf[self.sent..self.framed])?;
        self.sent += n;
        if self.sent == self.framed {
            // Move the open record (if any) to the front
            self.buf.copy_within(self.framed..self.len, 0);
            self.len -= self.framed;
            self.framed = 0;
            self.sent = 0;
        }
        Ok(n)
    }
}
