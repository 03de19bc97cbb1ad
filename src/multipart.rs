use std::fs::{self, File, OpenOptions};
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::ext::ByteSliceExt;
use crate::macros::trace;
use crate::params::ParamTable;


/// Field names of multipart parts are truncated to fit below this length.
pub const MAX_MP_FIELD: usize = 50;
/// External file names are truncated to their last `MAX_FILENAME - 1` bytes.
pub const MAX_FILENAME: usize = 96;
/// Maximum length of a boundary token from the Content-Type.
pub const MAX_BOUNDARY: usize = 64;
/// Maximum number of uploaded files per request.
pub const MAX_UPLOADS: usize = 16;
/// Maximum number of bytes kept for a plain field value.
pub const MAX_FIELD_DATA: usize = 0x10000;
/// Size of the buffer `MultipartParser::run` reads its input into.
pub const MP_CHUNK: usize = 10000;

/// File name of the upload log inside the upload directory.
pub const UPLOAD_LOG: &str = "fcgi-upload.log";

const BOUNDARY_PREFIX: &[u8] = b"\r\n--";
const DISPOSITION: &[u8] = b"form-data; name=\"";
const FILENAME: &[u8] = b"filename=\"";


/// Errors that abort parsing a multipart body.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A boundary or part header was not followed by a line break.
    #[error("multipart boundary or header not followed by CRLF")]
    MissingCrlf,
    /// A plain field ended without any value bytes.
    #[error("unexpected empty multipart field")]
    EmptyField,
    /// A single header line does not fit into the parse buffer.
    #[error("multipart header exceeds {MP_CHUNK} bytes")]
    HeaderTooLong,
    /// Reading the spooled body failed.
    #[error("cannot read multipart body: {0}")]
    Io(#[from] io::Error),
}


/// An uploaded file saved by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// The form field the file was sent for.
    pub field: CompactString,
    /// Where the content was saved.
    pub path: PathBuf,
    /// The file name sent by the client (or the Content-Type for raw bodies).
    pub external: CompactString,
    /// Number of bytes saved.
    pub bytes: u64,
}


fn datestamp() -> CompactString {
    let fmt = time::macros::format_description!("[year]-[month]-[day]_[hour][minute]");
    match time::OffsetDateTime::now_utc().format(fmt) {
        Ok(s) => s.into(),
        Err(_) => CompactString::const_new("0000-00-00_0000"),
    }
}


/// Creates upload files and keeps the append-only upload log.
///
/// One store is shared by all requests of a driver so that upload names stay
/// unique across them.
#[derive(Debug)]
pub struct UploadStore {
    dir: Option<PathBuf>,
    log: Option<File>,
    seq: u64,
}

impl UploadStore {
    /// Creates a store saving uploads into `dir`. Without a directory, all
    /// uploads are dropped.
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        let log = dir.as_deref().and_then(|d| {
            let path = d.join(UPLOAD_LOG);
            OpenOptions::new().create(true).append(true).open(&path)
                .map_err(|error| tracing::warn!(path = %path.display(), %error, "upload log unavailable"))
                .ok()
        });
        Self { dir, log, seq: 0 }
    }

    /// Returns the upload directory.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn log_line(&mut self, line: std::fmt::Arguments<'_>) {
        if let Some(log) = &mut self.log {
            if let Err(error) = log.write_fmt(line).and_then(|()| log.write_all(b"\n")) {
                tracing::warn!(%error, "cannot append to upload log");
            }
        }
    }

    /// Creates the file for a new upload and records it in `uploads`.
    ///
    /// Returns [`None`] if there is no upload directory, the request already
    /// has [`MAX_UPLOADS`] files, or the file cannot be created.
    pub fn create(
        &mut self,
        uploads: &mut Vec<UploadFile>,
        field: &[u8],
        external: &[u8],
    ) -> Option<File> {
        let dir = self.dir.as_ref()?;
        let stamp = datestamp();
        if uploads.len() >= MAX_UPLOADS {
            tracing::warn!(max = MAX_UPLOADS, "upload dropped, too many files in request");
            self.log_line(format_args!("{stamp} - uploads buffer full."));
            return None;
        }

        // Other processes and earlier runs share the directory, so never reuse a name
        let (file, path) = loop {
            self.seq += 1;
            let path = dir.join(format!("upload{stamp}_{}", self.seq));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => break (f, path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    trace!(path = %path.display(), "upload name taken");
                },
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "cannot create upload file");
                    return None;
                },
            }
        };

        let seq = self.seq;
        let field = CompactString::from_utf8_lossy(field.head(MAX_MP_FIELD - 1));
        let external = CompactString::from_utf8_lossy(external);
        self.log_line(format_args!("{stamp}_{seq}|{field}|{external}"));
        tracing::debug!(path = %path.display(), %field, "upload started");
        uploads.push(UploadFile { field, path, external, bytes: 0 });
        Some(file)
    }
}


/// Where a parsed multipart body goes.
#[derive(Debug)]
pub struct Target<'a> {
    /// Receives plain fields.
    pub params: &'a mut ParamTable,
    /// Receives a record per uploaded file.
    pub uploads: &'a mut Vec<UploadFile>,
    /// Creates the upload files.
    pub store: &'a mut UploadStore,
}


/// The states of [`MultipartParser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Looking for the next boundary.
    Begin,
    /// Reading the Content-Disposition line of a part.
    Header,
    /// Skipping the remaining header lines of a file part.
    FileType,
    /// Streaming a file part into its upload file.
    FileData,
    /// Collecting a plain field value.
    FieldData,
    /// The closing boundary was seen.
    Finish,
}


#[derive(Debug)]
struct ParseContext {
    state: State,
    field: SmallVec<[u8; MAX_MP_FIELD]>,
    external: SmallVec<[u8; MAX_FILENAME]>,
    value: Vec<u8>,
    truncated: bool,
    upload: Option<(File, usize)>,
    offset: u64,
}


/// Returns the bytes between `marker` and the next double quote.
fn quoted_after<'a>(line: &'a [u8], marker: &[u8]) -> Option<(&'a [u8], usize)> {
    let start = line.find(marker)? + marker.len();
    let len = memchr::memchr(b'"', &line[start..])?;
    Some((&line[start..(start + len)], start + len + 1))
}


/// An incremental `multipart/form-data` parser.
///
/// Input is handed in as byte ranges of any size. Each call consumes as much
/// as can be decided on and leaves the rest, such as a possible partial
/// boundary, for the next call with more data appended. The body is expected
/// to start with CRLF so that the first boundary looks like all others.
#[derive(Debug)]
pub struct MultipartParser {
    boundary: SmallVec<[u8; MAX_BOUNDARY + 4]>,
    ctx: ParseContext,
}

impl MultipartParser {
    /// Creates a parser for parts separated by `--token`.
    #[must_use]
    pub fn new(token: &[u8]) -> Self {
        let mut boundary = SmallVec::from_slice(BOUNDARY_PREFIX);
        boundary.extend_from_slice(token.head(MAX_BOUNDARY));
        Self {
            boundary,
            ctx: ParseContext {
                state: State::Begin,
                field: SmallVec::new(),
                external: SmallVec::new(),
                value: Vec::new(),
                truncated: false,
                upload: None,
                offset: 0,
            },
        }
    }

    /// Returns the full delimiter searched for, i.e. `CRLF--token`.
    #[inline]
    #[must_use]
    pub fn boundary(&self) -> &[u8] {
        &self.boundary
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.ctx.state
    }

    /// Tests whether the closing boundary was seen.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ctx.state == State::Finish
    }

    /// Returns the number of input bytes consumed so far.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.ctx.offset
    }

    fn write_upload(&mut self, data: &[u8], target: &mut Target<'_>) {
        let Some((file, idx)) = &mut self.ctx.upload else { return };
        match file.write_all(data) {
            Ok(()) => target.uploads[*idx].bytes += data.len() as u64,
            Err(error) => {
                tracing::warn!(%error, "upload write failed, rest of file dropped");
                self.ctx.upload = None;
            },
        }
    }

    fn finish_upload(&mut self, target: &mut Target<'_>) {
        let Some((file, idx)) = self.ctx.upload.take() else { return };
        drop(file);
        if target.uploads[idx].bytes == 0 {
            let rec = target.uploads.remove(idx);
            tracing::debug!(field = %rec.field, "empty upload removed");
            if let Err(error) = fs::remove_file(&rec.path) {
                tracing::warn!(path = %rec.path.display(), %error, "cannot remove empty upload");
            }
        } else {
            let rec = &target.uploads[idx];
            tracing::debug!(field = %rec.field, bytes = rec.bytes, "upload finished");
        }
    }

    fn push_value(&mut self, data: &[u8]) {
        let room = MAX_FIELD_DATA - self.ctx.value.len();
        if data.len() > room && !self.ctx.truncated {
            self.ctx.truncated = true;
            tracing::warn!(max = MAX_FIELD_DATA, "multipart field value truncated");
        }
        self.ctx.value.extend_from_slice(data.head(room));
    }

    fn finish_field(&mut self, target: &mut Target<'_>) -> Result<(), Error> {
        if self.ctx.value.is_empty() {
            return Err(Error::EmptyField);
        }
        if target.params.add(&self.ctx.field, &self.ctx.value) == 0 {
            let field = String::from_utf8_lossy(&self.ctx.field);
            tracing::warn!(%field, "multipart field dropped, parameter table full");
        }
        self.ctx.value.clear();
        Ok(())
    }

    fn step(&mut self, data: &[u8], target: &mut Target<'_>) -> Result<usize, Error> {
        let blen = self.boundary.len();
        match self.ctx.state {
            State::Begin => {
                if data.len() < blen {
                    return Ok(0);
                }
                let Some(pos) = data.find(&self.boundary) else {
                    return Ok(data.len() - blen + 1);
                };
                let after = pos + blen;
                match data.get(after..(after + 2)) {
                    None => Ok(pos),
                    Some(b"--") => {
                        self.ctx.state = State::Finish;
                        Ok(after + 2)
                    },
                    Some(b"\r\n") => {
                        self.ctx.state = State::Header;
                        Ok(after + 2)
                    },
                    Some(_) => Err(Error::MissingCrlf),
                }
            },

            State::Header => {
                let Some(eol) = data.find(b"\r\n") else { return Ok(0) };
                let line = &data[..eol];
                let Some((name, name_end)) = quoted_after(line, DISPOSITION) else {
                    tracing::debug!("multipart part without form-data name skipped");
                    self.ctx.state = State::Begin;
                    return Ok(eol + 2);
                };
                self.ctx.field = SmallVec::from_slice(name.head(MAX_MP_FIELD - 1));

                if let Some((fname, _)) = quoted_after(&line[name_end..], FILENAME) {
                    self.ctx.state = if fname.is_empty() {
                        trace!("file part without file name skipped");
                        State::Begin
                    } else {
                        self.ctx.external = SmallVec::from_slice(fname.tail(MAX_FILENAME - 1));
                        State::FileType
                    };
                    return Ok(eol + 2);
                }

                // Plain field: skip any further headers up to the blank line
                let Some(end) = data[eol..].find(b"\r\n\r\n") else { return Ok(0) };
                let body = eol + end + 4;
                let Some(head) = data.get(body..(body + blen)) else { return Ok(0) };
                if head == &self.boundary[..] {
                    trace!("empty multipart field skipped");
                    self.ctx.state = State::Begin;
                } else {
                    self.ctx.value.clear();
                    self.ctx.truncated = false;
                    self.ctx.state = State::FieldData;
                }
                Ok(body)
            },

            State::FileType => {
                let body = if data.starts_with(b"\r\n") {
                    2
                } else {
                    match data.find(b"\r\n\r\n") {
                        Some(p) => p + 4,
                        None => return Ok(0),
                    }
                };
                let Some(head) = data.get(body..(body + blen)) else { return Ok(0) };
                if head == &self.boundary[..] {
                    trace!("empty file part skipped");
                    self.ctx.state = State::Begin;
                    return Ok(body);
                }

                let file = target.store.create(target.uploads, &self.ctx.field, &self.ctx.external);
                self.ctx.upload = file.map(|f| (f, target.uploads.len() - 1));
                self.ctx.state = State::FileData;
                Ok(body)
            },

            State::FileData | State::FieldData => {
                if data.len() < blen {
                    return Ok(0);
                }
                let (chunk, done) = match data.find(&self.boundary) {
                    Some(pos) => (&data[..pos], true),
                    None => (&data[..(data.len() - blen + 1)], false),
                };
                if self.ctx.state == State::FileData {
                    self.write_upload(chunk, target);
                    if done {
                        self.finish_upload(target);
                    }
                } else {
                    self.push_value(chunk);
                    if done {
                        self.finish_field(target)?;
                    }
                }
                if done {
                    self.ctx.state = State::Begin;
                }
                Ok(chunk.len())
            },

            State::Finish => Ok(0),
        }
    }

    /// Parses as much of `data` as possible.
    ///
    /// Returns the number of bytes consumed. The caller must hand the rest in
    /// again, followed by more input. Parsing stops once the closing
    /// boundary was seen; anything after it is left unconsumed.
    ///
    /// # Errors
    /// Fails on malformed part structure. The parser must not be used after
    /// an error.
    pub fn parse(&mut self, data: &[u8], target: &mut Target<'_>) -> Result<usize, Error> {
        let mut used = 0;
        while self.ctx.state != State::Finish {
            let state = self.ctx.state;
            let n = self.step(&data[used..], target)?;
            // A part may end right at the start of `data` without consuming any
            if n == 0 && self.ctx.state == state {
                break;
            }
            used += n;
        }
        self.ctx.offset += used as u64;
        Ok(used)
    }

    /// Parses a complete body from `input`, reading it in [`MP_CHUNK`]-sized
    /// pieces.
    ///
    /// Stops at the closing boundary or at the end of the input. An upload
    /// still open at that point is finalized with what was received.
    ///
    /// # Errors
    /// Fails on read errors, malformed part structure, or a header line
    /// longer than the read buffer.
    pub fn run(&mut self, mut input: impl Read, target: &mut Target<'_>) -> Result<(), Error> {
        let mut buf = vec![0; MP_CHUNK];
        let mut filled = 0;
        let res = loop {
            let n = match input.read(&mut buf[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(Error::Io(e)),
            };
            filled += n;

            let used = match self.parse(&buf[..filled], target) {
                Ok(used) => used,
                Err(e) => break Err(e),
            };
            if self.is_finished() {
                break Ok(());
            }
            if n == 0 {
                tracing::warn!(offset = self.ctx.offset, "multipart body ended before closing boundary");
                break Ok(());
            }

            buf.copy_within(used..filled, 0);
            filled -= used;
            if filled == buf.len() {
                break Err(Error::HeaderTooLong);
            }
        };
        self.finish_upload(target);
        res
    }
}
