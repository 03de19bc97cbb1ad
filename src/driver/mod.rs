//! The request slot pool and FastCGI record processing.
//!
//! A [`Driver`] owns a fixed number of [`Request`] slots, one per accepted
//! connection. It reads raw bytes into each slot's input ring, decodes whole
//! records once they are buffered and sends the framed responses back. All of
//! this happens on the caller's thread; the [`Scheduler`](crate::Scheduler)
//! decides when each step runs.

use std::io;
use std::os::fd::RawFd;

use mio::net::UnixStream;

use crate::multipart::UploadStore;
use crate::Config;

mod output;
mod request;
mod spool;
#[cfg(test)]
mod test_support;

pub use output::MAX_OUT;
pub use request::{Flags, Handler, HandlerEvent, Method, Request, State, MAX_URI};
pub use spool::{SpoolError, MAX_MEM_STDIN};
use request::Shared;


/// Resolves the [`Handler`] serving a request.
pub trait PageArbiter {
    /// Attaches a handler to `request` with [`Request::set_handler`].
    ///
    /// Called once per request, after the last parameter arrived. Returning
    /// `false` or leaving the request without handler ends it with status 400.
    fn match_page(&mut self, request: &mut Request) -> bool;

    /// Receives notifications passed to [`Driver::notify`].
    fn event(&mut self, _event: HandlerEvent) {}
}


/// A slot that currently wants to be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEntry {
    pub slot: usize,
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}


/// The pool of request slots.
#[derive(Debug)]
pub struct Driver<A> {
    slots: Vec<Request>,
    arbiter: A,
    config: Config,
    store: UploadStore,
    scratch: Vec<u8>,
    served: u64,
}

impl<A: PageArbiter> Driver<A> {
    /// Creates a driver with `config.slots()` request slots.
    #[must_use]
    pub fn new(config: Config, arbiter: A) -> Self {
        let slots = (0..config.slots()).map(|slot| Request::new(slot, &config)).collect();
        let store = UploadStore::new(config.upload_dir.clone());
        tracing::debug!(slots = config.slots(), version = Self::version(), "driver created");
        Self { slots, arbiter, config, store, scratch: Vec::new(), served: 0 }
    }

    /// Version of this crate.
    #[inline]
    #[must_use]
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn arbiter(&self) -> &A {
        &self.arbiter
    }

    #[inline]
    pub fn arbiter_mut(&mut self) -> &mut A {
        &mut self.arbiter
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn max_requests(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots without a connection.
    #[must_use]
    pub fn free_request_count(&self) -> usize {
        self.slots.iter().filter(|r| r.state() == State::Wait).count()
    }

    /// Number of connections accepted so far.
    #[inline]
    #[must_use]
    pub fn served_count(&self) -> u64 {
        self.served
    }

    #[inline]
    #[must_use]
    pub fn request(&self, slot: usize) -> Option<&Request> {
        self.slots.get(slot)
    }

    #[inline]
    pub fn request_mut(&mut self, slot: usize) -> Option<&mut Request> {
        self.slots.get_mut(slot)
    }

    /// Assigns `conn` to the first free slot.
    ///
    /// Returns [`None`] if all slots are busy. The connection is closed in
    /// that case, so the web server sees the refusal right away.
    pub fn create_request(&mut self, conn: UnixStream) -> Option<usize> {
        let Some(req) = self.slots.iter_mut().find(|r| r.state() == State::Wait) else {
            tracing::info!(max = self.slots.len(), "no free request slot, connection refused");
            return None;
        };

        req.attach(conn);
        self.served += 1;
        tracing::debug!(slot = req.slot(), fd = ?req.fd(), served = self.served, "connection accepted");
        Some(req.slot())
    }

    /// Finds the slot serving the connection `fd`.
    #[must_use]
    pub fn find_request(&self, fd: RawFd) -> Option<usize> {
        self.slots.iter().position(|r| r.fd() == Some(fd))
    }

    /// Registers the connection of `slot` for read and write readiness.
    ///
    /// # Errors
    /// Forwards registration errors. Fails if the slot has no connection.
    pub fn register(&mut self, slot: usize, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        match self.slots.get_mut(slot) {
            Some(req) => req.register(registry, token),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    /// Closes the connection of `slot` without sending anything.
    pub fn drop_request(&mut self, slot: usize) {
        if let Some(req) = self.slots.get_mut(slot) {
            tracing::debug!(slot, "connection dropped");
            req.reset();
        }
    }

    /// Records readiness reported by the poller for `slot`.
    pub fn mark_ready(&mut self, slot: usize, readable: bool, writable: bool) {
        if let Some(req) = self.slots.get_mut(slot) {
            req.mark_ready(readable, writable);
        }
    }

    /// Collects the slots that want to read or write into `out`.
    ///
    /// Returns the number of entries added.
    pub fn fill_poll_fd(&self, out: &mut Vec<PollEntry>) -> usize {
        let before = out.len();
        out.extend(self.slots.iter().filter_map(|r| {
            let (read, write) = (r.wants_read(), r.wants_write());
            let fd = r.fd()?;
            (read || write).then_some(PollEntry { slot: r.slot(), fd, read, write })
        }));
        out.len() - before
    }

    /// Tests whether some slot can make progress without waiting for the
    /// poller.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.slots.iter().any(Request::is_actionable)
    }

    /// Reads once from the connection of `slot`.
    ///
    /// Returns the number of bytes received.
    pub fn read(&mut self, slot: usize) -> usize {
        self.slots.get_mut(slot).map_or(0, Request::receive)
    }

    /// Processes every completely buffered record, slot by slot and in
    /// arrival order.
    pub fn work(&mut self) {
        let Self { slots, arbiter, config, store, scratch, .. } = self;
        let mut shared = Shared { config, store, scratch };
        for req in slots.iter_mut() {
            while req.process_next(arbiter, &mut shared) {}
        }
    }

    /// Sends pending output of `slot`.
    pub fn write(&mut self, slot: usize) {
        if let Some(req) = self.slots.get_mut(slot) {
            req.send();
        }
    }

    /// Closes finished connections and those the web server left.
    ///
    /// Returns the number of slots freed.
    pub fn free_dormant_requests(&mut self) -> usize {
        let mut freed = 0;
        for req in &mut self.slots {
            if req.is_abandoned() {
                req.hang_up();
            }
            if req.is_dormant() {
                tracing::debug!(slot = req.slot(), request_id = req.request_id(), "connection closed");
                req.reset();
                freed += 1;
            }
        }
        freed
    }

    /// Passes `event` to the arbiter.
    pub fn notify(&mut self, event: HandlerEvent) {
        tracing::debug!(?event, "notifying handlers");
        self.arbiter.event(event);
    }
}


#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::rc::Rc;

    use super::test_support::*;
    use super::*;
    use crate::protocol::{ProtocolStatus, RecordHeader, RecordType, Role};

    const RESPONSE: &[u8] = b"Content-Type: text/plain\r\n\r\nhi";

    #[derive(Default)]
    struct Recorder {
        exec: Cell<u32>,
        done: Cell<u32>,
        abort: Cell<u32>,
        /// Leaves the request open after `done` instead of ending it.
        hold: Cell<bool>,
        body: Cell<u64>,
        field: RefCell<Option<Vec<u8>>>,
        uploads: RefCell<Vec<u64>>,
    }

    impl Handler for Recorder {
        fn exec(&self, _request: &mut Request) {
            self.exec.set(self.exec.get() + 1);
        }

        fn done(&self, request: &mut Request) {
            self.done.set(self.done.get() + 1);
            self.body.set(request.body_size());
            *self.field.borrow_mut() = request.params().value(b"f").map(<[u8]>::to_vec);
            *self.uploads.borrow_mut() = request.uploads().iter().map(|u| u.bytes).collect();
            assert_eq!(request.write(RESPONSE), RESPONSE.len());
            if !self.hold.get() {
                request.end(0);
            }
        }

        fn abort(&self, _request: &mut Request) {
            self.abort.set(self.abort.get() + 1);
        }
    }

    struct Arbiter {
        recorder: Rc<Recorder>,
        events: Vec<HandlerEvent>,
    }

    impl PageArbiter for Arbiter {
        fn match_page(&mut self, request: &mut Request) -> bool {
            if request.uri() == "/missing" {
                return false;
            }
            request.set_handler(self.recorder.clone());
            true
        }

        fn event(&mut self, event: HandlerEvent) {
            self.events.push(event);
        }
    }

    struct Harness {
        driver: Driver<Arbiter>,
        recorder: Rc<Recorder>,
        peer: UnixStream,
        slot: usize,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            tracing_subscriber::fmt().with_test_writer().try_init().ok();
            let dir = tempfile::tempdir().unwrap();
            let config = Config::with_requests(2).spool_dir(dir.path()).upload_dir(dir.path());
            let recorder = Rc::new(Recorder::default());
            let mut driver = Driver::new(config, Arbiter { recorder: Rc::clone(&recorder), events: Vec::new() });

            let (ours, peer) = UnixStream::pair().unwrap();
            let slot = driver.create_request(ours).unwrap();
            Self { driver, recorder, peer, slot, dir }
        }

        fn send(&mut self, data: &[u8]) {
            self.peer.write_all(data).unwrap();
            self.pump();
        }

        /// Runs the read/work/write cycle the scheduler would run.
        fn pump(&mut self) {
            for _ in 0..8 {
                self.driver.mark_ready(self.slot, true, true);
                while self.driver.read(self.slot) > 0 {}
                self.driver.work();
                self.driver.write(self.slot);
            }
        }

        fn output(&mut self) -> Vec<(RecordHeader, Vec<u8>)> {
            parse_records(&read_available(&mut self.peer))
        }

        fn req(&self) -> &Request {
            self.driver.request(self.slot).unwrap()
        }
    }

    fn request(params: &[(&[u8], &[u8])], body: &[u8], lens: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        add_params(&mut buf, 1, params, lens);
        add_stdin(&mut buf, 1, body, lens);
        randomize_padding(&mut buf);
        buf
    }

    #[test]
    fn get_request() {
        let mut h = Harness::new();
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"GET"),
            (b"REQUEST_URI", b"/x"),
            (b"QUERY_STRING", b"a=1&b=two+words"),
            (b"HTTP_USER_AGENT", b"test/1.0"),
        ];
        h.send(&request(params, b"", &[7, 300]));

        assert_eq!((h.recorder.exec.get(), h.recorder.done.get(), h.recorder.abort.get()), (1, 1, 0));
        assert_eq!(h.recorder.body.get(), 0);
        let req = h.req();
        assert_eq!(req.state(), State::Eof);
        assert_eq!(req.method(), Some(Method::Get));
        assert_eq!(req.uri(), "/x");
        assert!(req.flags().contains(Flags::QUERY | Flags::KEEP));
        assert_eq!(req.params().get(b"b"), b"two words");
        assert_eq!(req.params().get(b"HTTP_USER_AGENT"), b"test/1.0");

        let recs = h.output();
        assert_eq!(stdout(&recs), RESPONSE);
        let (request_id, end) = end_request(&recs).unwrap();
        assert_eq!((request_id, end.app_status, end.protocol_status), (1, 0, ProtocolStatus::RequestComplete));
        assert_eq!(recs.last().map(|(h, _)| h.rtype), Some(RecordType::EndRequest));

        assert_eq!(h.driver.free_dormant_requests(), 1);
        assert_eq!(h.req().state(), State::Wait);
        assert_eq!(h.driver.free_request_count(), 2);
        assert_eq!(h.driver.served_count(), 1);
    }

    #[test]
    fn incomplete_params_wait() {
        let mut h = Harness::new();
        let mut params = Vec::new();
        add_params(&mut params, 1, &[(b"REQUEST_METHOD", b"GET"), (b"HTTP_HOST", b"example.org")], &[u16::MAX]);

        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        let split = RecordHeader::LEN + 5;
        buf.extend(&params[..split]);
        h.send(&buf);

        assert_eq!(h.req().state(), State::Params);
        assert!(h.req().params().is_empty());
        assert_eq!(h.req().method(), None);

        h.send(&params[split..]);
        assert_eq!(h.req().state(), State::Stdin);
        assert_eq!(h.req().method(), Some(Method::Get));
        assert_eq!(h.req().params().get(b"HTTP_HOST"), b"example.org");
        assert_eq!((h.recorder.exec.get(), h.recorder.done.get()), (1, 0));
    }

    #[test]
    fn multipart_upload() {
        const BODY: &[u8] = b"--XYZ\r\n\
            Content-Disposition: form-data; name=\"f\"\r\n\
            \r\n\
            bar\r\n--XYZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n\
            Content-Type: application/octet-stream\r\n\
            \r\n\
            0123456789\r\n--XYZ--\r\n";

        let mut h = Harness::new();
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"REQUEST_URI", b"/upload"),
            (b"CONTENT_TYPE", b"multipart/form-data; boundary=XYZ"),
        ];
        h.send(&request(params, BODY, &[fastrand::u16(1..40)]));

        assert_eq!(h.recorder.done.get(), 1);
        assert_eq!(h.recorder.field.borrow().as_deref(), Some(&b"bar"[..]));
        assert_eq!(*h.recorder.uploads.borrow(), [10]);

        let req = h.req();
        assert!(req.flags().contains(Flags::MULTIPART));
        let upload = &req.uploads()[0];
        assert_eq!((upload.field.as_str(), upload.external.as_str()), ("file", "a.bin"));
        assert_eq!(std::fs::read(&upload.path).unwrap(), b"0123456789");

        // The spool file is gone, the upload and its log remain
        let names: Vec<_> = std::fs::read_dir(h.dir.path()).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.starts_with("req-spool_")), "{names:?}");
        assert_eq!(names.len(), 2, "{names:?}");
    }

    #[test]
    fn form_body_spills() {
        let mut h = Harness::new();
        let value: String = std::iter::repeat_with(fastrand::alphanumeric).take(2000).collect();
        let body = format!("small=1&big={value}&sp=a%20b");
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"REQUEST_URI", b"/form"),
            (b"CONTENT_TYPE", b"application/x-www-form-urlencoded"),
        ];
        h.send(&request(params, body.as_bytes(), &[fastrand::u16(100..1000)]));

        assert_eq!(h.recorder.done.get(), 1);
        assert_eq!(h.recorder.body.get(), body.len() as u64);
        let req = h.req();
        assert_eq!(req.body_size(), body.len() as u64);
        assert_eq!(req.params().get(b"small"), b"1");
        assert_eq!(req.params().get(b"big"), value.as_bytes());
        assert_eq!(req.params().get(b"sp"), b"a b");
    }

    #[test]
    fn malformed_body() {
        let mut h = Harness::new();
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"REQUEST_URI", b"/form"),
            (b"CONTENT_TYPE", b"application/x-www-form-urlencoded"),
        ];
        h.send(&request(params, b"a=1&bare", &[u16::MAX]));

        assert_eq!((h.recorder.exec.get(), h.recorder.done.get()), (1, 0));
        assert_eq!(h.req().params().len(), 0);
        assert_eq!(h.req().app_status(), 500);

        let recs = h.output();
        assert_eq!(stdout(&recs), b"Status: 500\r\n\r\n");
        let (_, end) = end_request(&recs).unwrap();
        assert_eq!((end.app_status, end.protocol_status), (500, ProtocolStatus::RequestComplete));
    }

    #[test]
    fn raw_body_saved() {
        let mut h = Harness::new();
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"PUT"),
            (b"REQUEST_URI", b"/raw"),
            (b"CONTENT_TYPE", b"application/json"),
        ];
        h.send(&request(params, br#"{"k": [1, 2, 3]}"#, &[5]));

        let req = h.req();
        assert!(req.flags().contains(Flags::BODYDATA));
        let upload = &req.uploads()[0];
        assert_eq!((upload.field.as_str(), upload.external.as_str()), ("[body]", "application/json"));
        assert_eq!(upload.bytes, 16);
        assert_eq!(h.recorder.body.get(), 16);
    }

    #[test]
    fn markdown_body() {
        let mut h = Harness::new();
        let params: &[(&[u8], &[u8])] = &[
            (b"REQUEST_METHOD", b"POST"),
            (b"REQUEST_URI", b"/md"),
            (b"CONTENT_TYPE", b"text/markdown; charset=utf-8"),
        ];
        h.send(&request(params, b"# Title\n\na & b + c", &[u16::MAX]));
        assert_eq!(h.req().params().get(b"MARKDOWN"), b"# Title\n\na & b + c");
    }

    #[test]
    fn abort_request() {
        let mut h = Harness::new();
        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        add_params(&mut buf, 1, &[(b"REQUEST_METHOD", b"POST"), (b"REQUEST_URI", b"/slow")], &[u16::MAX]);
        h.send(&buf);
        assert_eq!(h.req().state(), State::Stdin);

        let mut buf = Vec::new();
        add_abort(&mut buf, 1);
        add_abort(&mut buf, 1);
        h.send(&buf);

        assert_eq!((h.recorder.exec.get(), h.recorder.abort.get(), h.recorder.done.get()), (1, 1, 0));
        let (_, end) = end_request(&h.output()).unwrap();
        assert_eq!(end.app_status, 500);
        assert_eq!(h.req().state(), State::Eof);
    }

    #[test]
    fn rejected_requests() {
        // Unsupported role
        let mut h = Harness::new();
        let mut buf = Vec::new();
        add_begin_role(&mut buf, 3, Role::Authorizer);
        h.send(&buf);
        let recs = h.output();
        assert_eq!(recs.len(), 1);
        let (request_id, end) = end_request(&recs).unwrap();
        assert_eq!((request_id, end.protocol_status), (3, ProtocolStatus::UnknownRole));

        // Unknown method and unrouted URI
        let cases: [(&[u8], &[u8]); 2] = [(b"BREW", b"/pot"), (b"GET", b"/missing")];
        for (method, uri) in cases {
            let mut h = Harness::new();
            h.send(&request(&[(b"REQUEST_METHOD", method), (b"REQUEST_URI", uri)], b"", &[u16::MAX]));
            let (_, end) = end_request(&h.output()).unwrap();
            assert_eq!(end.app_status, 400);
            assert_eq!(h.recorder.exec.get(), 0);
        }
    }

    #[test]
    fn multiplexing_rejected() {
        let mut h = Harness::new();
        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        add_unk(&mut buf, 0, 42);
        add_begin(&mut buf, 2);
        h.send(&buf);

        let recs = h.output();
        assert_eq!(recs.len(), 2);
        assert_eq!((recs[0].0.rtype, recs[0].0.request_id, recs[0].1[0]), (RecordType::Unknown, 0, 42));
        let (request_id, end) = end_request(&recs).unwrap();
        assert_eq!((request_id, end.protocol_status), (2, ProtocolStatus::CantMpxConn));
        assert_eq!(h.req().state(), State::Params);
        assert_eq!(h.req().request_id(), 1);
    }

    #[test]
    fn status_line() {
        struct NotFound;
        impl Handler for NotFound {
            fn exec(&self, _request: &mut Request) {}
            fn done(&self, request: &mut Request) {
                let uri = request.uri().to_owned();
                request.set_status(404);
                write!(request, "Content-Type: text/plain\r\n\r\n{uri} not found").unwrap();
                request.end(404);
                assert_eq!(request.write(b"late"), 0);
            }
        }
        struct Fixed;
        impl PageArbiter for Fixed {
            fn match_page(&mut self, request: &mut Request) -> bool {
                request.set_handler(Rc::new(NotFound));
                true
            }
        }

        let mut driver = Driver::new(Config::with_requests(1), Fixed);
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let slot = driver.create_request(ours).unwrap();
        peer.write_all(&request(&[(b"REQUEST_URI", b"/gone")], b"", &[u16::MAX])).unwrap();
        for _ in 0..4 {
            driver.mark_ready(slot, true, true);
            driver.read(slot);
            driver.work();
            driver.write(slot);
        }

        let recs = parse_records(&read_available(&mut peer));
        assert_eq!(stdout(&recs), b"Status: 404\r\nContent-Type: text/plain\r\n\r\n/gone not found");
        assert_eq!(end_request(&recs).unwrap().1.app_status, 404);
    }

    #[test]
    fn pool_exhaustion() {
        let mut h = Harness::new();
        let (second, _peer2) = UnixStream::pair().unwrap();
        assert_eq!(h.driver.create_request(second), Some(1));
        assert_eq!(h.driver.free_request_count(), 0);

        let (third, mut peer3) = UnixStream::pair().unwrap();
        assert_eq!(h.driver.create_request(third), None);
        // The refused connection is closed
        let mut buf = [0; 8];
        assert_eq!(std::io::Read::read(&mut peer3, &mut buf).unwrap(), 0);

        let mut entries = Vec::new();
        assert_eq!(h.driver.fill_poll_fd(&mut entries), 2);
        assert!(entries.iter().all(|e| e.read && !e.write));
        assert_eq!(h.driver.find_request(entries[1].fd), Some(1));

        h.driver.notify(HandlerEvent::Idle);
        assert_eq!(h.driver.arbiter().events, [HandlerEvent::Idle]);
    }

    #[test]
    fn bad_version_ends_request() {
        let mut h = Harness::new();
        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        let mut head = RecordHeader::new(RecordType::Params, 1).to_bytes();
        head[0] = 2;
        buf.extend(head);
        buf.extend(RecordHeader::new(RecordType::Params, 1).to_bytes());
        h.send(&buf);

        assert_eq!(h.recorder.exec.get(), 0);
        assert_eq!(h.req().state(), State::Eof);
        assert_eq!(h.req().input().size(), 0);
        let recs = h.output();
        assert_eq!(stdout(&recs), b"Status: 501\r\n\r\n");
        let (request_id, end) = end_request(&recs).unwrap();
        assert_eq!((request_id, end.app_status, end.protocol_status), (1, 501, ProtocolStatus::RequestComplete));
    }

    #[test]
    fn unknown_type_for_request() {
        let mut h = Harness::new();
        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        add_unk(&mut buf, 1, 42);
        h.send(&buf);

        let recs = h.output();
        assert!(recs.iter().all(|(head, _)| head.rtype != RecordType::Unknown));
        let (request_id, end) = end_request(&recs).unwrap();
        assert_eq!((request_id, end.app_status), (1, 501));
        assert_eq!(h.req().state(), State::Eof);
    }

    #[test]
    fn data_record_ignored() {
        let mut h = Harness::new();
        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        add_params(&mut buf, 1, &[(b"REQUEST_METHOD", b"GET"), (b"REQUEST_URI", b"/x")], &[u16::MAX]);
        add_data(&mut buf, 1, b"filter input", &[5]);
        add_stdin(&mut buf, 1, b"", &[u16::MAX]);
        randomize_padding(&mut buf);
        h.send(&buf);

        assert_eq!(h.recorder.done.get(), 1);
        assert_eq!(h.recorder.body.get(), 0);
        let recs = h.output();
        assert_eq!(stdout(&recs), RESPONSE);
        assert_eq!(end_request(&recs).unwrap().1.app_status, 0);
    }

    #[test]
    fn write_error_closes_request() {
        let mut h = Harness::new();
        h.recorder.hold.set(true);
        h.send(&request(&[(b"REQUEST_METHOD", b"GET"), (b"REQUEST_URI", b"/x")], b"", &[u16::MAX]));
        assert_eq!(h.req().state(), State::Open);
        assert_eq!(stdout(&h.output()), RESPONSE);

        drop(std::mem::replace(&mut h.peer, UnixStream::pair().unwrap().0));
        let req = h.driver.request_mut(h.slot).unwrap();
        assert_eq!(req.write(b"more"), 4);
        h.driver.mark_ready(h.slot, false, true);
        h.driver.write(h.slot);

        let req = h.req();
        assert_eq!((req.state(), req.app_status(), req.out_pending()), (State::Eof, 500, 0));
        assert_eq!(h.driver.free_dormant_requests(), 1);
    }

    #[test]
    fn flush_waits_for_reader() {
        struct Bulk(Vec<u8>);
        impl Handler for Bulk {
            fn exec(&self, _request: &mut Request) {}
            fn done(&self, request: &mut Request) {
                assert_eq!(request.write(&self.0), self.0.len());
                assert!(request.flush());
                assert_eq!(request.out_pending(), 0);
                request.end(0);
            }
        }
        struct Fixed(Rc<Bulk>);
        impl PageArbiter for Fixed {
            fn match_page(&mut self, request: &mut Request) -> bool {
                request.set_handler(self.0.clone());
                true
            }
        }

        // Far more than the socket buffer holds, so writes must wait for the reader
        let payload: Vec<u8> = std::iter::repeat_with(|| fastrand::u8(..)).take(1 << 21).collect();
        let (ours, mut peer) = std::os::unix::net::UnixStream::pair().unwrap();
        peer.write_all(&request(&[(b"REQUEST_URI", b"/bulk")], b"", &[u16::MAX])).unwrap();
        ours.set_nonblocking(true).unwrap();
        let reader = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut peer, &mut out).unwrap();
            out
        });

        let mut driver = Driver::new(Config::with_requests(1), Fixed(Rc::new(Bulk(payload.clone()))));
        let slot = driver.create_request(UnixStream::from_std(ours)).unwrap();
        for _ in 0..8 {
            driver.mark_ready(slot, true, true);
            driver.read(slot);
            driver.work();
            driver.write(slot);
            if driver.free_dormant_requests() == 1 {
                break;
            }
        }
        assert_eq!(driver.free_request_count(), 1);

        let recs = parse_records(&reader.join().unwrap());
        assert!(stdout(&recs) == payload, "response payload differs");
        assert_eq!(end_request(&recs).unwrap().1.app_status, 0);
    }

    #[test]
    fn peer_hangup() {
        let mut h = Harness::new();
        let mut buf = Vec::new();
        add_begin(&mut buf, 1);
        add_params(&mut buf, 1, &[(b"REQUEST_URI", b"/x")], &[u16::MAX]);
        h.send(&buf);
        assert_eq!(h.req().state(), State::Stdin);

        let peer = std::mem::replace(&mut h.peer, UnixStream::pair().unwrap().0);
        drop(peer);
        h.pump();
        assert_eq!(h.driver.free_dormant_requests(), 1);
        assert_eq!(h.recorder.abort.get(), 1);
        assert_eq!(h.req().state(), State::Wait);
    }
}
