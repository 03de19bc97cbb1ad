use std::any::Any;
use std::fmt;
use std::io::{self, prelude::*};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use compact_str::CompactString;
use mio::net::UnixStream;
use mio::unix::SourceFd;
use smallvec::SmallVec;

use super::output::Output;
use super::spool::{Spool, SpoolError};
use super::PageArbiter;
use crate::ext::ByteSliceExt;
use crate::macros::trace;
use crate::multipart::{MultipartParser, Target, UploadFile, UploadStore, MAX_BOUNDARY};
use crate::params::{self, keys, ParamTable, MAX_PARAM_NAME};
use crate::protocol::{self as fcgi, body, nv::NVIter, ProtocolStatus, RecordHeader, RecordType};
use crate::ring::{ByteRing, PushSink};
use crate::Config;


/// Longest stored request URI, terminator included.
pub const MAX_URI: usize = 255;

const FLUSH_ROUNDS: u32 = 5;
const FLUSH_WAIT: Duration = Duration::from_millis(200);


/// Lifecycle of a request slot. States only ever advance, until the slot is
/// reset to [`State::Wait`] for the next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// The slot is free.
    Wait,
    /// Receiving the parameter stream.
    Params,
    /// Routed to a handler, receiving the body.
    Stdin,
    /// Body complete, the handler produces output.
    Open,
    /// Output is drained synchronously.
    Flush,
    /// The request ended, final records are being sent.
    End,
    /// Everything is sent, the connection waits to be closed.
    Eof,
}


bitflags::bitflags! {
    /// Facts about a request collected while reading its parameters.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u16 {
        /// The web server asked to keep the connection.
        const KEEP = 1 << 0;
        /// A query string was decoded.
        const QUERY = 1 << 1;
        /// A cookie header was decoded.
        const COOKIE = 1 << 2;
        /// The body is `multipart/form-data`.
        const MULTIPART = 1 << 3;
        /// The body is being spooled.
        const SPOOLING = 1 << 4;
        /// The body is saved as an upload instead of being decoded.
        const BODYDATA = 1 << 5;
        /// A session id was received.
        const SESSION_ID = 1 << 6;
        /// The body is `text/markdown`, stored unchanged.
        const MARKDOWN = 1 << 7;
    }
}


/// The HTTP methods a request may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::EnumString, strum::IntoStaticStr, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}


/// Notifications passed down to handlers outside of any request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerEvent {
    /// Nothing happened for a poll period.
    Idle,
    /// The embedding asks for configuration to be reloaded.
    Reload,
}


/// Application code serving requests.
///
/// A handler is attached to a request by the [`PageArbiter`]. Callbacks run
/// on the scheduler thread and must not block.
pub trait Handler {
    /// Called once all parameters arrived, before the body is read.
    fn exec(&self, request: &mut Request);

    /// Called once the body is complete and decoded.
    fn done(&self, request: &mut Request);

    /// Called if the web server aborts the request.
    fn abort(&self, _request: &mut Request) {}

    /// Receives notifications forwarded by the arbiter.
    fn event(&self, _event: HandlerEvent) {}
}


/// State shared by all slots of a driver.
pub(crate) struct Shared<'a> {
    pub(crate) config: &'a Config,
    pub(crate) store: &'a mut UploadStore,
    pub(crate) scratch: &'a mut Vec<u8>,
}


/// One connection slot of a [`Driver`](super::Driver) and the request it
/// currently serves.
pub struct Request {
    slot: usize,
    conn: Option<UnixStream>,
    readable: bool,
    writable: bool,
    peer_closed: bool,
    want_write: bool,

    request_id: u16,
    begun: bool,
    state: State,
    flags: Flags,
    method: Option<Method>,
    app_status: u32,
    status_sent: bool,

    input: ByteRing,
    params: ParamTable,
    pending_nv: Vec<u8>,
    uri: CompactString,
    boundary: SmallVec<[u8; MAX_BOUNDARY]>,
    spool: Spool,
    body_bytes: u64,
    uploads: Vec<UploadFile>,

    handler: Option<Rc<dyn Handler>>,
    app_data: Option<Box<dyn Any>>,
    out: Output,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("slot", &self.slot)
            .field("fd", &self.fd())
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("params", &self.params.len())
            .field("uploads", &self.uploads.len())
            .field("input", &self.input.size())
            .field("output", &self.out.reserved())
            .finish_non_exhaustive()
    }
}

impl Request {
    pub(crate) fn new(slot: usize, config: &Config) -> Self {
        Self {
            slot,
            conn: None,
            readable: false,
            writable: false,
            peer_closed: false,
            want_write: false,
            request_id: 0,
            begun: false,
            state: State::Wait,
            flags: Flags::empty(),
            method: None,
            app_status: 0,
            status_sent: false,
            input: ByteRing::new(config.input_buffer()),
            params: ParamTable::new(config.param_arena_size),
            pending_nv: Vec::new(),
            uri: CompactString::default(),
            boundary: SmallVec::new(),
            spool: Spool::new(),
            body_bytes: 0,
            uploads: Vec::new(),
            handler: None,
            app_data: None,
            out: Output::new(),
        }
    }

    /// Index of this slot in its driver.
    #[inline]
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Descriptor of the connection, if one is attached.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// FastCGI id of the current request, 0 before it began.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Tests whether the web server wants to keep the connection. It is
    /// closed after the request regardless.
    #[inline]
    #[must_use]
    pub fn keep_conn(&self) -> bool {
        self.flags.contains(Flags::KEEP)
    }

    #[inline]
    #[must_use]
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// The request URI, truncated to `MAX_URI - 1` bytes.
    #[inline]
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Parameters, query string and cookie values and decoded form fields.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &ParamTable {
        &self.params
    }

    #[inline]
    pub fn params_mut(&mut self) -> &mut ParamTable {
        &mut self.params
    }

    /// Files saved from the request body.
    #[inline]
    #[must_use]
    pub fn uploads(&self) -> &[UploadFile] {
        &self.uploads
    }

    /// The inbound bytes not processed yet.
    #[inline]
    #[must_use]
    pub fn input(&self) -> &ByteRing {
        &self.input
    }

    /// Size of the request body received so far. It stays available after
    /// the body has been decoded.
    #[inline]
    #[must_use]
    pub fn body_size(&self) -> u64 {
        self.body_bytes
    }

    /// The status reported in `END_REQUEST`.
    #[inline]
    #[must_use]
    pub fn app_status(&self) -> u32 {
        self.app_status
    }

    /// Sets the status reported to the web server. Unless output was already
    /// sent, the response also starts with a matching `Status:` line.
    #[inline]
    pub fn set_status(&mut self, status: u32) {
        self.app_status = status;
    }

    /// Attaches the handler serving this request.
    #[inline]
    pub fn set_handler(&mut self, handler: Rc<dyn Handler>) {
        self.handler = Some(handler);
    }

    #[inline]
    #[must_use]
    pub fn handler(&self) -> Option<&Rc<dyn Handler>> {
        self.handler.as_ref()
    }

    /// Stores application data for the lifetime of the request.
    #[inline]
    pub fn set_app_data<T: Any>(&mut self, data: T) {
        self.app_data = Some(Box::new(data));
    }

    #[must_use]
    pub fn app_data<T: Any>(&self) -> Option<&T> {
        self.app_data.as_ref()?.downcast_ref()
    }

    pub fn app_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.app_data.as_mut()?.downcast_mut()
    }

    /// Output bytes not sent yet.
    #[inline]
    #[must_use]
    pub fn out_pending(&self) -> usize {
        self.out.pending() + self.out.open_len()
    }

    /// Output buffer bytes in use, framing included.
    #[inline]
    #[must_use]
    pub fn out_reserved(&self) -> usize {
        self.out.reserved()
    }

    /// Output bytes that fit before the buffer must be flushed.
    #[inline]
    #[must_use]
    pub fn out_capacity(&self) -> usize {
        self.out.capacity()
    }

    fn accepts_output(&self) -> bool {
        matches!(self.state, State::Stdin | State::Open)
    }

    /// Appends response bytes, flushing synchronously if the buffer fills.
    ///
    /// Returns the number of bytes taken, which is less than `data.len()`
    /// only if the connection failed. Output after [`end`](Self::end) is
    /// ignored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if !self.accepts_output() {
            trace!(slot = self.slot, state = ?self.state, "output ignored");
            return 0;
        }

        let mut rest = data;
        while !rest.is_empty() {
            let n = self.out.write(rest);
            rest = &rest[n..];
            if n == 0 && !self.flush() {
                break;
            }
        }
        if self.accepts_output() {
            self.want_write = true;
        }
        data.len() - rest.len()
    }

    #[inline]
    pub fn write_str(&mut self, s: &str) -> usize {
        self.write(s.as_bytes())
    }

    /// Copies everything `input` yields into the response.
    ///
    /// # Errors
    /// Read errors of `input` are forwarded. Fails if the request does not
    /// take output or the connection stalls.
    pub fn write_from(&mut self, mut input: impl Read) -> io::Result<u64> {
        if !self.accepts_output() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "request does not accept output"));
        }

        let mut total = 0;
        loop {
            let space = self.out.space();
            if space.is_empty() {
                if self.flush() {
                    continue;
                }
                return Err(io::Error::other("response output stalled"));
            }
            let n = match input.read(space) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.out.commit(n);
            total += n as u64;
        }

        self.want_write = true;
        Ok(total)
    }

    /// Sends all buffered output before returning.
    ///
    /// Between attempts this waits for the socket to become writable, which
    /// blocks the whole driver for up to a second and should be a last
    /// resort. On timeout the output is discarded and the request is closed.
    /// Returns whether everything was sent.
    pub fn flush(&mut self) -> bool {
        if !matches!(self.state, State::Params | State::Stdin | State::Open) {
            return self.out.pending() == 0;
        }

        let prev = self.state;
        self.state = State::Flush;
        self.close_output();
        for round in 0..FLUSH_ROUNDS {
            if round > 0 && !self.writable {
                self.wait_writable();
            }
            match self.send_pending() {
                Ok(true) => {
                    self.state = prev;
                    return true;
                },
                Ok(false) => {},
                Err(error) => {
                    self.fail_output(&error);
                    return false;
                },
            }
        }

        tracing::error!(
            slot = self.slot, request_id = self.request_id, pending = self.out.pending(),
            "output flush timed out, response discarded"
        );
        self.out.clear();
        self.app_status = 500;
        self.state = State::Eof;
        self.want_write = false;
        false
    }

    /// Completes the response with `status` as application status.
    pub fn end(&mut self, status: u32) {
        self.finish(status, ProtocolStatus::RequestComplete);
    }

    fn finish(&mut self, app_status: u32, protocol_status: ProtocolStatus) {
        if !matches!(self.state, State::Params | State::Stdin | State::Open | State::Flush) {
            trace!(slot = self.slot, state = ?self.state, "request already ended");
            return;
        }

        self.app_status = app_status;
        let complete = protocol_status == ProtocolStatus::RequestComplete;
        if complete && app_status > 0 && !self.out.has_output() {
            let mut line = SmallVec::<[u8; 32]>::new();
            let _res = write!(line, "Status: {app_status}\r\n\r\n");
            self.out.write(&line);
            self.status_sent = true;
        }
        self.close_output();

        let mut tail = [0; RecordHeader::LEN + 16];
        tail[..RecordHeader::LEN]
            .copy_from_slice(&RecordHeader::new(RecordType::Stdout, self.request_id).to_bytes());
        tail[RecordHeader::LEN..].copy_from_slice(
            &body::EndRequest { app_status, protocol_status }.to_record(self.request_id),
        );
        // Only completed requests had a stdout stream to terminate
        let tail = if complete { &tail[..] } else { &tail[RecordHeader::LEN..] };
        if !self.queue_records(tail) {
            return;
        }

        self.state = State::End;
        self.want_write = true;
        tracing::debug!(
            slot = self.slot, request_id = self.request_id, app_status, ?protocol_status,
            "request ended"
        );
    }

    fn queue_records(&mut self, records: &[u8]) -> bool {
        if self.out.queue(records) || (self.flush() && self.out.queue(records)) {
            return true;
        }
        tracing::error!(slot = self.slot, request_id = self.request_id, "no room for final records");
        false
    }

    /// Frames handler output written so far, starting the first record with
    /// the status line if a status was set.
    fn close_output(&mut self) {
        let prefix = (self.app_status > 0 && !self.status_sent && self.out.records() == 0
            && self.out.open_len() > 0)
            .then(|| {
                let mut line = SmallVec::<[u8; 24]>::new();
                let _res = write!(line, "Status: {}\r\n", self.app_status);
                line
            });
        if prefix.is_some() {
            self.status_sent = true;
        }
        self.out.close(self.request_id, prefix.as_deref());
    }

    /// Writes pending output until done or the socket would block.
    fn send_pending(&mut self) -> io::Result<bool> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        while self.out.pending() > 0 {
            match self.out.send(conn) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => trace!(slot = self.slot, bytes = n, "output sent"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    return Ok(false);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Blocks for at most [`FLUSH_WAIT`] until the connection accepts more
    /// output. The connection stays registered with the driver's poller, so
    /// a separate one-shot poller watches the descriptor.
    fn wait_writable(&mut self) {
        let Some(fd) = self.fd() else {
            return;
        };
        let wait = || -> io::Result<bool> {
            let mut poll = mio::Poll::new()?;
            poll.registry().register(&mut SourceFd(&fd), mio::Token(0), mio::Interest::WRITABLE)?;
            let mut events = mio::Events::with_capacity(1);
            match poll.poll(&mut events, Some(FLUSH_WAIT)) {
                Ok(()) => Ok(!events.is_empty()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
                Err(e) => Err(e),
            }
        };
        match wait() {
            Ok(ready) => self.writable = ready,
            Err(error) => {
                tracing::warn!(slot = self.slot, %error, "cannot wait for writability");
                self.writable = false;
            },
        }
    }

    fn fail_output(&mut self, error: &io::Error) {
        tracing::error!(slot = self.slot, request_id = self.request_id, %error, "cannot send response");
        self.out.clear();
        self.app_status = 500;
        self.state = State::Eof;
        self.want_write = false;
    }

    fn call_handler(&mut self, f: impl FnOnce(&dyn Handler, &mut Self)) {
        if let Some(handler) = self.handler.clone() {
            f(&*handler, self);
        }
    }
}

// Connection handling, used by the driver
impl Request {
    pub(crate) fn attach(&mut self, conn: UnixStream) {
        self.conn = Some(conn);
        self.readable = true;
        self.writable = true;
        self.state = State::Params;
    }

    pub(crate) fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        match &mut self.conn {
            Some(conn) => registry.register(conn, token, mio::Interest::READABLE | mio::Interest::WRITABLE),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) fn mark_ready(&mut self, readable: bool, writable: bool) {
        self.readable |= readable;
        self.writable |= writable;
    }

    pub(crate) fn wants_read(&self) -> bool {
        self.conn.is_some() && !self.peer_closed && !self.input.is_full()
            && matches!(self.state, State::Params | State::Stdin | State::Open)
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.conn.is_some() && (self.want_write || self.state == State::Eof)
    }

    /// Tests whether the driver can make progress on this slot right now.
    pub(crate) fn is_actionable(&self) -> bool {
        (self.wants_read() && self.readable)
            || (self.wants_write() && self.writable)
            || self.is_dormant()
            || self.is_abandoned()
    }

    /// Tests whether the web server went away in the middle of the request.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.peer_closed && self.is_live()
    }

    fn is_live(&self) -> bool {
        matches!(self.state, State::Params | State::Stdin | State::Open | State::Flush)
    }

    /// Tests whether the slot only waits to be closed.
    pub(crate) fn is_dormant(&self) -> bool {
        self.state == State::Eof && (self.writable || self.peer_closed)
    }

    /// Reads once from the connection into the input ring.
    pub(crate) fn receive(&mut self) -> usize {
        if !self.wants_read() || !self.readable {
            return 0;
        }
        let Some(conn) = self.conn.as_mut() else {
            return 0;
        };

        match self.input.write_from(conn) {
            Ok(0) => {
                tracing::debug!(slot = self.slot, "connection closed by web server");
                self.peer_closed = true;
                self.readable = false;
                0
            },
            Ok(n) => {
                trace!(slot = self.slot, bytes = n, "input received");
                n
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.readable = false;
                0
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(error) => {
                tracing::error!(slot = self.slot, %error, "cannot read from connection");
                self.peer_closed = true;
                self.readable = false;
                0
            },
        }
    }

    /// Sends buffered output while the socket takes it.
    pub(crate) fn send(&mut self) {
        if !self.want_write || !self.writable || matches!(self.state, State::Wait | State::Eof) {
            return;
        }
        if self.accepts_output() {
            self.close_output();
        }

        match self.send_pending() {
            Ok(true) => {
                self.want_write = false;
                if self.state == State::End {
                    self.state = State::Eof;
                    tracing::debug!(slot = self.slot, request_id = self.request_id, "response sent");
                }
            },
            Ok(false) => {},
            Err(error) => self.fail_output(&error),
        }
    }

    /// Gives up on a request whose web server went away.
    pub(crate) fn hang_up(&mut self) {
        if !self.is_live() {
            return;
        }
        tracing::info!(slot = self.slot, request_id = self.request_id, state = ?self.state, "request lost its connection");
        if self.begun && self.state != State::Params {
            self.call_handler(|h, req| h.abort(req));
        }
        self.out.clear();
        self.state = State::Eof;
        self.want_write = false;
    }

    /// Closes the connection and prepares the slot for the next one.
    pub(crate) fn reset(&mut self) {
        self.conn = None;
        self.readable = false;
        self.writable = false;
        self.peer_closed = false;
        self.want_write = false;
        self.request_id = 0;
        self.begun = false;
        self.state = State::Wait;
        self.flags = Flags::empty();
        self.method = None;
        self.app_status = 0;
        self.status_sent = false;
        self.input.clear();
        self.params.clear();
        self.pending_nv.clear();
        self.uri.clear();
        self.boundary.clear();
        self.spool.clear();
        self.body_bytes = 0;
        self.uploads.clear();
        self.handler = None;
        self.app_data = None;
        self.out.clear();
    }
}

// Record processing
impl Request {
    /// Processes the next record if it is completely buffered.
    ///
    /// Returns whether a record was consumed.
    pub(crate) fn process_next<A: PageArbiter + ?Sized>(
        &mut self,
        arbiter: &mut A,
        shared: &mut Shared<'_>,
    ) -> bool {
        if !matches!(self.state, State::Params | State::Stdin | State::Open) {
            return false;
        }

        let mut raw = [0; RecordHeader::LEN];
        if self.input.peek(&mut raw) < RecordHeader::LEN {
            return false;
        }

        let head = match RecordHeader::from_bytes(raw) {
            Ok(head) => head,
            Err(fcgi::Error::UnknownRecordType(rtype)) => {
                let total = RecordHeader::LEN + RecordHeader::raw_body_len(raw);
                if self.input.size() < total {
                    return false;
                }
                self.input.discard(total);
                self.reject_unknown_type(rtype, raw);
                return true;
            },
            Err(error) => {
                tracing::warn!(slot = self.slot, %error, "malformed record header");
                self.input.clear();
                self.end(501);
                return false;
            },
        };

        let total = RecordHeader::LEN + head.body_len();
        if self.input.size() < total {
            trace!(slot = self.slot, have = self.input.size(), need = total, "record incomplete");
            return false;
        }
        trace!(slot = self.slot, header = ?head, "record received");

        self.input.discard(RecordHeader::LEN);
        let before = self.input.size();
        self.dispatch(head, arbiter, shared);
        // Skip padding and whatever the record type left unread
        let consumed = before - self.input.size();
        self.input.discard(head.body_len().saturating_sub(consumed));
        true
    }

    fn reject_unknown_type(&mut self, rtype: u8, raw: [u8; RecordHeader::LEN]) {
        let request_id = u16::from_be_bytes([raw[2], raw[3]]) & fcgi::REQUEST_ID_MASK;
        if request_id != fcgi::FCGI_NULL_REQUEST_ID {
            tracing::warn!(slot = self.slot, rtype, request_id, "record of unknown type");
            self.end(501);
            return;
        }

        tracing::info!(slot = self.slot, rtype, "management record of unknown type");
        self.close_output();
        if self.out.queue(&body::UnknownType { rtype }.to_record()) {
            self.want_write = true;
        }
    }

    fn dispatch<A: PageArbiter + ?Sized>(
        &mut self,
        head: RecordHeader,
        arbiter: &mut A,
        shared: &mut Shared<'_>,
    ) {
        let len = usize::from(head.content_length);
        match head.rtype {
            RecordType::BeginRequest => self.process_begin_request(head),
            _ if head.is_management() => {
                tracing::info!(slot = self.slot, rtype = ?head.rtype, "management record ignored");
            },
            _ if !self.begun || head.request_id != self.request_id => {
                tracing::debug!(
                    slot = self.slot, request_id = head.request_id, rtype = ?head.rtype,
                    "record for inactive request ignored"
                );
            },
            RecordType::AbortRequest => self.abort(),
            RecordType::Params if self.state == State::Params => {
                if self.process_params(len, shared) && self.state == State::Params {
                    self.route(arbiter);
                }
            },
            RecordType::Stdin if self.state == State::Stdin => self.process_stdin(len, shared),
            RecordType::Data => {
                tracing::info!(slot = self.slot, bytes = len, "DATA stream not supported");
            },
            rtype => {
                tracing::warn!(slot = self.slot, ?rtype, state = ?self.state, "unexpected record discarded");
            },
        }
    }

    fn process_begin_request(&mut self, head: RecordHeader) {
        let mut raw = [0; body::BeginRequest::LEN];
        self.input.read_max(&mut raw, head.content_length.into());

        if head.is_management() {
            tracing::warn!(slot = self.slot, "BeginRequest without request id ignored");
            return;
        }
        if self.begun {
            if head.request_id == self.request_id {
                tracing::warn!(slot = self.slot, request_id = head.request_id, "duplicate BeginRequest ignored");
            } else {
                self.reject_multiplexed(head.request_id);
            }
            return;
        }

        self.request_id = head.request_id;
        self.begun = true;
        match body::BeginRequest::from_bytes(raw) {
            Ok(body::BeginRequest { role: fcgi::Role::Responder, flags }) => {
                self.flags.set(Flags::KEEP, flags.contains(fcgi::RequestFlags::KeepConn));
                tracing::debug!(
                    slot = self.slot, request_id = self.request_id, keep_conn = self.keep_conn(),
                    "request started"
                );
            },
            Ok(body::BeginRequest { role, .. }) => {
                tracing::info!(slot = self.slot, ?role, "role not supported");
                self.finish(0, ProtocolStatus::UnknownRole);
            },
            Err(error) => {
                tracing::info!(slot = self.slot, %error, "request rejected");
                self.finish(0, ProtocolStatus::UnknownRole);
            },
        }
    }

    fn reject_multiplexed(&mut self, request_id: u16) {
        tracing::info!(slot = self.slot, request_id, active = self.request_id, "multiplexed request rejected");
        self.close_output();
        let rec = body::EndRequest { app_status: 0, protocol_status: ProtocolStatus::CantMpxConn }
            .to_record(request_id);
        if self.out.queue(&rec) {
            self.want_write = true;
        } else {
            tracing::warn!(slot = self.slot, request_id, "no room to reject request");
        }
    }

    /// Decodes the pairs of one PARAMS record. A pair may continue in the
    /// next record.
    ///
    /// Returns `true` on the empty record ending the stream.
    fn process_params(&mut self, len: usize, shared: &mut Shared<'_>) -> bool {
        if len == 0 {
            if !self.pending_nv.is_empty() {
                tracing::warn!(slot = self.slot, bytes = self.pending_nv.len(), "parameter stream ends inside a pair");
                self.pending_nv.clear();
            }
            return true;
        }

        let scratch = &mut *shared.scratch;
        scratch.clear();
        scratch.append(&mut self.pending_nv);
        let start = scratch.len();
        scratch.resize(start + len, 0);
        let got = self.input.read(&mut scratch[start..]);
        scratch.truncate(start + got);

        let mut pairs = NVIter::new(scratch);
        for (name, value) in &mut pairs {
            self.take_param(name, value, shared.config);
            if self.state != State::Params {
                return false;
            }
        }

        let rest = pairs.into_inner();
        if rest.len() > shared.config.input_buffer() {
            tracing::warn!(slot = self.slot, bytes = rest.len(), "parameter pair too long");
            self.end(400);
        } else {
            self.pending_nv.extend_from_slice(rest);
        }
        false
    }

    fn take_param(&mut self, name: &[u8], value: &[u8], config: &Config) {
        if name.len() >= MAX_PARAM_NAME - 1 {
            trace!(slot = self.slot, len = name.len(), "overlong parameter name dropped");
            return;
        }

        let key = params::hash_key(name);
        if key == config.session_key {
            if !value.is_empty() && self.params.add_hashed(key, value) != 0 {
                self.flags |= Flags::SESSION_ID;
            }
            return;
        }

        match key {
            keys::REQUEST_METHOD => self.take_method(value),
            keys::REQUEST_URI => self.uri = CompactString::from_utf8_lossy(value.head(MAX_URI - 1)),
            keys::QUERY_STRING => self.decode_env(Flags::QUERY, value),
            keys::HTTP_COOKIE => self.decode_env(Flags::COOKIE, value),
            keys::CONTENT_TYPE => self.take_content_type(value, config),
            _ if value.is_empty() || !config.keeps_param(key) => {
                trace!(slot = self.slot, name = %String::from_utf8_lossy(name), "parameter skipped");
            },
            _ => {
                if self.params.add_hashed(key, value) == 0 {
                    tracing::warn!(
                        slot = self.slot, name = %String::from_utf8_lossy(name),
                        "parameter dropped, table full"
                    );
                }
            },
        }
    }

    fn take_method(&mut self, value: &[u8]) {
        match std::str::from_utf8(value).ok().and_then(|m| m.parse::<Method>().ok()) {
            Some(method) => self.method = Some(method),
            None => {
                tracing::warn!(slot = self.slot, method = %String::from_utf8_lossy(value), "unsupported request method");
                self.end(400);
            },
        }
    }

    fn decode_env(&mut self, flag: Flags, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        self.flags |= flag;
        if let Err(error) = self.params.decode_form(value) {
            tracing::debug!(slot = self.slot, ?flag, %error, "form data partially decoded");
        }
    }

    fn take_content_type(&mut self, value: &[u8], config: &Config) {
        if value.len() >= MAX_BOUNDARY + 30 {
            tracing::warn!(slot = self.slot, len = value.len(), "Content-Type too long, ignored");
            return;
        }
        if self.params.add_hashed(keys::CONTENT_TYPE, value) == 0 {
            tracing::warn!(slot = self.slot, "Content-Type dropped, table full");
        }

        if starts_with_ci(value, b"multipart/form-data") {
            let Some(pos) = value.find(b"boundary=") else {
                tracing::warn!(slot = self.slot, "multipart body without boundary");
                return;
            };
            let token = value[(pos + 9)..].split(|&c| c == b';').next().unwrap_or_default().trim_ws();
            let token = token.strip_prefix(b"\"").unwrap_or(token);
            let token = token.strip_suffix(b"\"").unwrap_or(token);
            if token.is_empty() {
                tracing::warn!(slot = self.slot, "multipart body with empty boundary");
                return;
            }

            self.boundary = SmallVec::from_slice(token.head(MAX_BOUNDARY));
            match self.spool.open_multipart(config, self.slot) {
                Ok(()) => self.flags |= Flags::MULTIPART | Flags::SPOOLING,
                Err(error) => {
                    tracing::error!(slot = self.slot, %error, "cannot spool multipart body");
                    self.end(500);
                },
            }
        } else if starts_with_ci(value, b"text/markdown") {
            self.flags |= Flags::MARKDOWN;
        } else if !starts_with_ci(value, b"application/x-www-form-urlencoded") {
            self.flags |= Flags::BODYDATA;
        }
    }

    /// Routes the request once all parameters arrived.
    fn route<A: PageArbiter + ?Sized>(&mut self, arbiter: &mut A) {
        self.state = State::Stdin;
        if !arbiter.match_page(self) || self.handler.is_none() {
            tracing::info!(slot = self.slot, uri = %self.uri, "no handler for request");
            self.end(400);
            return;
        }

        tracing::debug!(slot = self.slot, request_id = self.request_id, uri = %self.uri, method = ?self.method, "request routed");
        self.call_handler(|h, req| h.exec(req));
    }

    fn process_stdin(&mut self, len: usize, shared: &mut Shared<'_>) {
        if len == 0 {
            self.complete_body(shared);
            return;
        }

        self.flags |= Flags::SPOOLING;
        match self.spool.write_from_ring(&mut self.input, len, shared.config, self.slot) {
            Ok(()) => self.body_bytes += len as u64,
            Err(error) => {
                tracing::error!(slot = self.slot, %error, "cannot spool request body");
                self.end(500);
            },
        }
    }

    fn complete_body(&mut self, shared: &mut Shared<'_>) {
        self.flags.remove(Flags::SPOOLING);
        let res = self.process_spool(shared);
        self.spool.clear();

        match res {
            Ok(()) => {
                self.state = State::Open;
                tracing::debug!(
                    slot = self.slot, request_id = self.request_id, params = self.params.len(),
                    uploads = self.uploads.len(), "request body complete"
                );
                self.call_handler(|h, req| h.done(req));
            },
            Err(error) => {
                tracing::warn!(slot = self.slot, request_id = self.request_id, %error, "request body rejected");
                self.params.clear();
                self.end(500);
            },
        }
    }

    /// Decodes the spooled body according to its content type.
    fn process_spool(&mut self, shared: &mut Shared<'_>) -> Result<(), SpoolError> {
        let size = self.spool.size();
        if size == 0 {
            return Ok(());
        }

        if self.flags.contains(Flags::MULTIPART) {
            let mut parser = MultipartParser::new(&self.boundary);
            let reader = self.spool.reader()?;
            let mut target = Target { params: &mut self.params, uploads: &mut self.uploads, store: &mut *shared.store };
            parser.run(reader, &mut target)?;
            if !parser.is_finished() {
                tracing::debug!(slot = self.slot, "multipart body ends without closing boundary");
            }
            return Ok(());
        }

        let len = usize::try_from(size).unwrap_or(usize::MAX);
        let mut reader = self.spool.reader()?;
        if self.flags.contains(Flags::MARKDOWN) {
            match self.params.reserve(keys::MARKDOWN, len) {
                Some(dst) => reader.read_exact(dst)?,
                None => tracing::warn!(slot = self.slot, "markdown body dropped, table full"),
            }
        } else if self.flags.contains(Flags::BODYDATA) {
            let ctype = self.params.get_hashed(keys::CONTENT_TYPE);
            if let Some(mut file) = shared.store.create(&mut self.uploads, b"[body]", ctype) {
                let bytes = io::copy(&mut reader, &mut file)?;
                if let Some(upload) = self.uploads.last_mut() {
                    upload.bytes = bytes;
                }
            }
        } else {
            let buf = &mut *shared.scratch;
            buf.clear();
            buf.resize(0x1000, 0);
            self.params.begin_entry(len);
            loop {
                let n = reader.read(buf)?;
                if n == 0 {
                    break;
                }
                for &c in &buf[..n] {
                    self.params.push_byte(c)?;
                }
            }
            self.params.end_entry()?;
        }
        Ok(())
    }

    /// Ends the request on behalf of the web server.
    fn abort(&mut self) {
        if !self.is_live() {
            return;
        }
        tracing::info!(slot = self.slot, request_id = self.request_id, "request aborted by web server");
        self.call_handler(|h, req| h.abort(req));
        self.end(500);
    }
}

impl Write for Request {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.accepts_output() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "request does not accept output"));
        }
        match Request::write(self, buf) {
            0 if !buf.is_empty() => Err(io::ErrorKind::WriteZero.into()),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if Request::flush(self) {
            Ok(())
        } else {
            Err(io::Error::other("response flush failed"))
        }
    }
}

fn starts_with_ci(value: &[u8], prefix: &[u8]) -> bool {
    value.get(..prefix.len()).is_some_and(|v| v.eq_ignore_ascii_case(prefix))
}
