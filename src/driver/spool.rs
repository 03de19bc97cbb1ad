use std::fs::{self, File, OpenOptions};
use std::io::{self, prelude::*, SeekFrom};
use std::path::{Path, PathBuf};

use crate::ring::ByteRing;
use crate::Config;


/// Request bodies below this size stay in memory.
pub const MAX_MEM_STDIN: usize = 512;


/// Failures while staging or parsing a request body.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SpoolError {
    /// The spool file could not be created.
    #[error("cannot create spool file {}: {source}", path.display())]
    Create {
        /// Path of the spool file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// Writing, rewinding or reading the spool failed.
    #[error("spool I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The body is not valid form data.
    #[error("malformed form body: {0}")]
    Form(#[from] crate::params::Error),
    /// The body is not valid multipart data.
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] crate::multipart::Error),
}


/// A request body staged in memory, or in a file once it grows.
#[derive(Debug)]
pub(crate) struct Spool {
    mem: Vec<u8>,
    disk: Option<(File, PathBuf)>,
    size: u64,
    spills: u32,
}

impl Spool {
    pub(crate) fn new() -> Self {
        Self { mem: Vec::with_capacity(MAX_MEM_STDIN), disk: None, size: 0, spills: 0 }
    }

    /// Body bytes staged so far.
    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub(crate) fn path(&self) -> Option<&Path> {
        self.disk.as_ref().map(|(_, p)| p.as_path())
    }

    /// Moves the spool into a file named after the process, slot and spill
    /// count, so concurrent requests and processes never share one.
    fn spill(&mut self, config: &Config, slot: usize) -> Result<(), SpoolError> {
        if self.disk.is_some() {
            return Ok(());
        }

        self.spills += 1;
        let path = config.spool_path()
            .join(format!("req-spool_{}_{slot}_{}", std::process::id(), self.spills));
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true)
            .open(&path)
            .map_err(|source| SpoolError::Create { path: path.clone(), source })?;

        tracing::debug!(slot, path = %path.display(), bytes = self.mem.len(), "request body spooled to disk");
        let (file, _) = self.disk.insert((file, path));
        file.write_all(&self.mem)?;
        self.mem.clear();
        Ok(())
    }

    /// Starts a spool file primed with CRLF, the way multipart bodies are
    /// parsed. The prefix does not count towards [`size`](Self::size).
    pub(crate) fn open_multipart(&mut self, config: &Config, slot: usize) -> Result<(), SpoolError> {
        self.spill(config, slot)?;
        if let Some((file, _)) = &mut self.disk {
            file.write_all(b"\r\n")?;
        }
        Ok(())
    }

    /// Moves `n` body bytes out of `ring`.
    pub(crate) fn write_from_ring(
        &mut self,
        ring: &mut ByteRing,
        n: usize,
        config: &Config,
        slot: usize,
    ) -> Result<(), SpoolError> {
        if self.disk.is_none() && self.mem.len() + n >= MAX_MEM_STDIN {
            self.spill(config, slot)?;
        }

        let moved = match &mut self.disk {
            Some((file, _)) => ring.read_into(file, n)?,
            None => {
                let start = self.mem.len();
                self.mem.resize(start + n, 0);
                let got = ring.read(&mut self.mem[start..]);
                self.mem.truncate(start + got);
                got
            },
        };
        self.size += moved as u64;
        Ok(())
    }

    /// Rewinds the spool and returns a reader over the whole body.
    pub(crate) fn reader(&mut self) -> Result<SpoolReader<'_>, SpoolError> {
        match &mut self.disk {
            Some((file, _)) => {
                file.flush()?;
                file.seek(SeekFrom::Start(0))?;
                Ok(SpoolReader::Disk(file))
            },
            None => Ok(SpoolReader::Mem(&self.mem)),
        }
    }

    /// Empties the spool and removes its file.
    pub(crate) fn clear(&mut self) {
        self.mem.clear();
        self.size = 0;
        if let Some((file, path)) = self.disk.take() {
            drop(file);
            if let Err(error) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %error, "cannot remove spool file");
            }
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        self.clear();
    }
}


/// Reads a spooled body from the start.
#[derive(Debug)]
pub(crate) enum SpoolReader<'a> {
    Mem(&'a [u8]),
    Disk(&'a mut File),
}

impl Read for SpoolReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Mem(data) => data.read(buf),
            Self::Disk(file) => file.read(buf),
        }
    }
}
