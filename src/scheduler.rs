//! The accept and poll loop around a [`Driver`].

use std::fs;
use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mio::net::UnixListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::driver::{Driver, HandlerEvent, PageArbiter, PollEntry};


/// Connections queued by the kernel before they are accepted.
const BACKLOG: i32 = 5;

const LISTENER: Token = Token(0);


/// Failures that stop the scheduler.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The listening socket could not be set up.
    #[error("cannot listen on {}: {source}", path.display())]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// Accepting a connection failed.
    #[error("cannot accept connection: {0}")]
    Accept(#[source] io::Error),
    /// A socket could not be registered with the poller.
    #[error("cannot register socket: {0}")]
    Register(#[source] io::Error),
    /// Polling failed too often in a row.
    #[error("polling failed {failures} times in a row: {source}")]
    Poll {
        /// Consecutive failures.
        failures: u32,
        /// The last error.
        source: io::Error,
    },
    /// Any other I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}


/// Runs a [`Driver`] on a listening UNIX socket.
///
/// Each call to [`run`](Self::run) is one iteration: wait for readiness,
/// accept new connections, read, decode, write and close finished
/// connections. The embedding loops for as long as it likes, which leaves
/// room for signal handling and idle shutdown between iterations.
#[derive(Debug)]
pub struct Scheduler<A> {
    driver: Driver<A>,
    poll: Poll,
    events: Events,
    listener: UnixListener,
    path: Option<PathBuf>,
    idle_period: Duration,
    idle_since: Instant,
    failures: u32,
    entries: Vec<PollEntry>,
}

impl<A: PageArbiter> Scheduler<A> {
    /// Listens on a new socket at `path`, replacing a stale socket file.
    /// The file is removed again when the scheduler is dropped.
    ///
    /// # Errors
    /// Fails if the socket cannot be bound or polled.
    pub fn bind(driver: Driver<A>, path: impl AsRef<Path>, idle_period: Duration) -> Result<Self, Error> {
        let path = path.as_ref();
        let bind_err = |source| Error::Bind { path: path.to_owned(), source };

        match fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "stale socket file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(bind_err(e)),
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(bind_err)?;
        let addr = SockAddr::unix(path).map_err(bind_err)?;
        socket.bind(&addr).map_err(bind_err)?;
        socket.listen(BACKLOG).map_err(bind_err)?;
        tracing::info!(path = %path.display(), backlog = BACKLOG, "listening");

        let mut this = Self::from_listener(driver, socket.into())?;
        this.path = Some(path.to_owned());
        this.idle_period = idle_period;
        Ok(this)
    }

    /// Uses an already listening socket, e.g. one inherited from a FastCGI
    /// process manager.
    ///
    /// # Errors
    /// Fails if the socket cannot be made non-blocking or polled.
    pub fn from_listener(driver: Driver<A>, listener: StdUnixListener) -> Result<Self, Error> {
        listener.set_nonblocking(true)?;
        let mut listener = UnixListener::from_std(listener);
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE).map_err(Error::Register)?;

        let idle_period = driver.config().idle_period;
        let max = driver.max_requests();
        Ok(Self {
            driver,
            poll,
            events: Events::with_capacity(max + 1),
            listener,
            path: None,
            idle_period,
            idle_since: Instant::now(),
            failures: 0,
            entries: Vec::with_capacity(max),
        })
    }

    #[inline]
    #[must_use]
    pub fn driver(&self) -> &Driver<A> {
        &self.driver
    }

    #[inline]
    pub fn driver_mut(&mut self) -> &mut Driver<A> {
        &mut self.driver
    }

    /// Path of the socket file created by [`bind`](Self::bind).
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Time since the last connection activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.idle_since.elapsed()
    }

    /// Tests whether the scheduler has been idle for the configured period.
    #[must_use]
    pub fn idle_expired(&self) -> bool {
        !self.idle_period.is_zero() && self.idle() >= self.idle_period
    }

    #[inline]
    pub fn reset_idle_timer(&mut self) {
        self.idle_since = Instant::now();
    }

    /// Runs one iteration.
    ///
    /// Returns `Ok(true)` to be called again. Interrupted polls return early
    /// so that the caller can look at signals. Returns `Ok(false)` once the
    /// idle period expired.
    ///
    /// # Errors
    /// Returns fatal errors: poll failures beyond the retry limit and
    /// failures to accept or register connections.
    pub fn run(&mut self) -> Result<bool, Error> {
        let busy = self.driver.has_pending_work();
        let timeout = if busy { Duration::ZERO } else { self.driver.config().idle_poll_timeout };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => self.failures = 0,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(true),
            Err(source) => {
                self.failures += 1;
                tracing::warn!(failures = self.failures, error = %source, "poll failed");
                if self.failures > self.driver.config().poll_retry_limit {
                    return Err(Error::Poll { failures: self.failures, source });
                }
                return Ok(true);
            },
        }

        let mut accept = false;
        for event in &self.events {
            match event.token() {
                LISTENER => accept = true,
                Token(t) => self.driver.mark_ready(
                    t - 1,
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable() || event.is_write_closed() || event.is_error(),
                ),
            }
        }
        if accept {
            self.accept()?;
        }

        self.entries.clear();
        self.driver.fill_poll_fd(&mut self.entries);
        for e in self.entries.iter().filter(|e| e.read) {
            self.driver.read(e.slot);
        }
        self.driver.work();
        self.entries.clear();
        self.driver.fill_poll_fd(&mut self.entries);
        for e in self.entries.iter().filter(|e| e.write) {
            self.driver.write(e.slot);
        }
        let freed = self.driver.free_dormant_requests();

        let active = self.driver.free_request_count() < self.driver.max_requests();
        if active || freed > 0 || !self.events.is_empty() {
            self.reset_idle_timer();
        } else if !busy {
            self.driver.notify(HandlerEvent::Idle);
        }

        if self.idle_expired() {
            tracing::info!(idle = ?self.idle(), "idle period expired");
            return Ok(false);
        }
        Ok(true)
    }

    fn accept(&mut self) -> Result<(), Error> {
        loop {
            let conn = match self.listener.accept() {
                Ok((conn, _)) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) => continue,
                Err(e) => return Err(Error::Accept(e)),
            };

            let Some(slot) = self.driver.create_request(conn) else {
                continue;
            };
            if let Err(e) = self.driver.register(slot, self.poll.registry(), Token(slot + 1)) {
                self.driver.drop_request(slot);
                return Err(Error::Register(e));
            }
        }
    }
}

impl<A> Drop for Scheduler<A> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(error) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %error, "cannot remove socket file");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    use super::*;
    use crate::driver::{Handler, Request};
    use crate::protocol::{body, nv, ProtocolStatus, RecordHeader, RecordType, RequestFlags, Role};
    use crate::Config;

    struct Hello;

    impl Handler for Hello {
        fn exec(&self, _request: &mut Request) {}

        fn done(&self, request: &mut Request) {
            request.write(b"Content-Type: text/plain\r\n\r\nhello");
            request.end(0);
        }
    }

    struct Single;

    impl PageArbiter for Single {
        fn match_page(&mut self, request: &mut Request) -> bool {
            request.set_handler(Rc::new(Hello));
            true
        }
    }

    fn config() -> Config {
        Config { idle_poll_timeout: Duration::from_millis(10), ..Config::with_requests(4) }
    }

    fn get_request(id: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(body::BeginRequest { role: Role::Responder, flags: RequestFlags::empty() }.to_record(id));
        let mut params = Vec::new();
        nv::write((b"REQUEST_METHOD", b"GET"), &mut params).unwrap();
        nv::write((b"REQUEST_URI", b"/"), &mut params).unwrap();
        let mut head = RecordHeader::new(RecordType::Params, id);
        head.set_lengths(params.len() as u16);
        buf.extend(head.to_bytes());
        buf.extend(&params);
        buf.extend(head.padding_bytes());
        buf.extend(RecordHeader::new(RecordType::Params, id).to_bytes());
        buf.extend(RecordHeader::new(RecordType::Stdin, id).to_bytes());
        buf
    }

    #[test]
    fn serves_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sock");
        std::fs::write(&path, b"stale").unwrap();

        let driver = Driver::new(config(), Single);
        let mut sched = Scheduler::bind(driver, &path, Duration::ZERO).unwrap();
        assert_eq!(sched.path(), Some(path.as_path()));

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(&get_request(9)).unwrap();
        client.set_nonblocking(true).unwrap();

        let mut out = Vec::new();
        let mut buf = [0; 1024];
        for _ in 0..200 {
            assert!(sched.run().unwrap());
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                Err(e) => panic!("client read failed: {e}"),
            }
        }

        let tail = &out[(out.len() - 16)..];
        let end = body::EndRequest::from_bytes(tail[8..].try_into().unwrap()).unwrap();
        assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete);
        assert!(out.windows(5).any(|w| w == b"hello"));
        assert_eq!(sched.driver().served_count(), 1);
        assert_eq!(sched.driver().free_request_count(), 4);

        drop(sched);
        assert!(!path.exists());
    }

    #[test]
    fn idle_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let listener = StdUnixListener::bind(dir.path().join("s")).unwrap();
        let mut sched = Scheduler::from_listener(Driver::new(config(), Single), listener).unwrap();
        assert_eq!(sched.path(), None);
        assert!(!sched.idle_expired());

        sched.idle_period = Duration::from_millis(20);
        let mut iterations = 0;
        while sched.run().unwrap() {
            iterations += 1;
            assert!(iterations < 100, "idle period never expired");
        }
        assert!(sched.idle() >= Duration::from_millis(20));

        sched.reset_idle_timer();
        assert!(sched.idle() < Duration::from_millis(20));
    }
}
