// TODO(docs): #![deny(missing_docs)]
#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes, pointer_structural_match)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements, clippy::module_name_repetitions)]

//! A single-threaded FastCGI responder driver.
//!
//! A [`Scheduler`] accepts connections on a UNIX socket and hands them to a
//! [`Driver`], which reassembles FastCGI records per connection, decodes the
//! request parameters and body, and calls the application's [`Handler`].

use std::path::PathBuf;
use std::time::Duration;

/// Helpful extension traits shared across the crate.
pub(crate) mod ext;
pub(crate) mod macros;

// See: https://fastcgi-archives.github.io/FastCGI_Specification.html
pub mod protocol;

pub mod ring;
pub mod params;
pub mod multipart;
pub mod driver;
pub mod scheduler;

pub use driver::{Driver, Handler, HandlerEvent, PageArbiter, Request};
pub use scheduler::Scheduler;


/// Hard limit for the number of concurrent requests of one driver.
pub const MAX_REQUESTS: usize = 30;

/// Smallest input buffer that can hold any FastCGI record: the header plus
/// the largest payload and padding.
pub const MIN_INPUT_BUFFER: usize = protocol::RecordHeader::LEN + 0xffff + 0xff;


/// Runtime configuration of a [`Driver`] and its [`Scheduler`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of request slots, at most [`MAX_REQUESTS`].
    pub max_requests: usize,
    /// Size of the per-connection input ring, at least [`MIN_INPUT_BUFFER`].
    pub input_buffer_size: usize,
    /// Initial size of each request's parameter value arena.
    pub param_arena_size: usize,
    /// Directory for uploaded files and the upload log. Uploads are dropped
    /// without one.
    pub upload_dir: Option<PathBuf>,
    /// Directory for request bodies spilled to disk. Defaults to the system
    /// temporary directory.
    pub spool_dir: Option<PathBuf>,
    /// Hashed names of the only parameters to keep, if set. The parameters
    /// interpreted by the driver itself are always processed.
    pub param_whitelist: Option<Vec<u64>>,
    /// Hashed name of the parameter carrying the session id.
    pub session_key: u64,
    /// After this long without activity, the scheduler reports itself idle.
    /// Zero disables the check.
    pub idle_period: Duration,
    /// Poll timeout while no request needs attention.
    pub idle_poll_timeout: Duration,
    /// Number of consecutive poll failures tolerated before giving up.
    pub poll_retry_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_requests: MAX_REQUESTS,
            input_buffer_size: 0x11000,
            param_arena_size: 0x1000,
            upload_dir: None,
            spool_dir: None,
            param_whitelist: None,
            session_key: params::keys::SESSION_ID,
            idle_period: Duration::ZERO,
            idle_poll_timeout: Duration::from_secs(3),
            poll_retry_limit: 10,
        }
    }
}

impl Config {
    /// Creates the default configuration with `max_requests` slots.
    #[inline]
    #[must_use]
    pub fn with_requests(max_requests: usize) -> Self {
        Self { max_requests, ..Self::default() }
    }

    /// Sets the upload directory.
    #[must_use]
    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    /// Sets the spool directory.
    #[must_use]
    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Keeps only the named parameters.
    #[must_use]
    pub fn whitelist(mut self, names: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        self.param_whitelist = Some(names.into_iter().map(|n| params::hash_key(n.as_ref())).collect());
        self
    }

    /// Sets the name of the session id parameter.
    #[must_use]
    pub fn session_param(mut self, name: &[u8]) -> Self {
        self.session_key = params::hash_key(name);
        self
    }

    /// Returns the number of slots actually used.
    #[inline]
    #[must_use]
    pub fn slots(&self) -> usize {
        self.max_requests.clamp(1, MAX_REQUESTS)
    }

    /// Returns the input ring size actually used.
    #[inline]
    #[must_use]
    pub fn input_buffer(&self) -> usize {
        self.input_buffer_size.max(MIN_INPUT_BUFFER)
    }

    /// Returns the spool directory actually used.
    #[must_use]
    pub fn spool_path(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Tests whether a parameter passes the whitelist.
    #[inline]
    #[must_use]
    pub fn keeps_param(&self, key: u64) -> bool {
        self.param_whitelist.as_ref().map_or(true, |w| w.contains(&key))
    }
}
