use std::iter::FusedIterator;

use smallvec::SmallVec;

use crate::ext::hex_byte;
use crate::macros::trace;
use crate::ring::PushSink;


/// Maximum number of entries a [`ParamTable`] accepts.
pub const MAX_PARAM_KEYS: usize = 75;
/// Parameter names must be shorter than this (terminator included).
pub const MAX_PARAM_NAME: usize = 100;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;


/// Packs up to 8 bytes little-endian into a [`u64`], first byte lowest.
#[inline]
#[must_use]
const fn pack(name: &[u8]) -> u64 {
    let mut key = 0;
    let mut i = 0;
    while i < name.len() && i < 8 {
        key |= (name[i] as u64) << (8 * i);
        i += 1;
    }
    key
}

/// Hashes a parameter name into a [`ParamTable`] key.
///
/// Names of at most 8 bytes are packed into the key verbatim (see
/// [`ParamTable::find_prefix`]); longer names use 64-bit FNV-1a. The result is
/// a hash, not an identity: distinct long names may collide, and a long name
/// may collide with a packed short one. The empty name hashes to 0, which
/// the table never stores.
#[must_use]
pub const fn hash_key(name: &[u8]) -> u64 {
    if name.len() <= 8 {
        return pack(name);
    }
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < name.len() {
        hash ^= name[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}


/// Precomputed keys of the parameters the driver interprets itself.
pub mod keys {
    use super::hash_key;

    #[allow(missing_docs)]
    pub const REQUEST_METHOD: u64 = hash_key(b"REQUEST_METHOD");
    #[allow(missing_docs)]
    pub const REQUEST_URI: u64 = hash_key(b"REQUEST_URI");
    #[allow(missing_docs)]
    pub const QUERY_STRING: u64 = hash_key(b"QUERY_STRING");
    #[allow(missing_docs)]
    pub const HTTP_COOKIE: u64 = hash_key(b"HTTP_COOKIE");
    #[allow(missing_docs)]
    pub const CONTENT_TYPE: u64 = hash_key(b"CONTENT_TYPE");
    #[allow(missing_docs)]
    pub const SCRIPT_FILENAME: u64 = hash_key(b"SCRIPT_FILENAME");
    #[allow(missing_docs)]
    pub const REMOTE_ADDR: u64 = hash_key(b"REMOTE_ADDR");
    #[allow(missing_docs)]
    pub const HTTP_USER_AGENT: u64 = hash_key(b"HTTP_USER_AGENT");
    /// Default name of the session id parameter.
    pub const SESSION_ID: u64 = hash_key(b"SESSION_ID");
    /// Parameter receiving a `text/markdown` body.
    pub const MARKDOWN: u64 = hash_key(b"MARKDOWN");
}


/// Errors of the form decoder. Both only abort the current input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The input ended or was split while not inside a value.
    #[error("malformed key=value input")]
    Syntax,
    /// The table already holds [`MAX_PARAM_KEYS`] entries.
    #[error("parameter table is full ({MAX_PARAM_KEYS} entries)")]
    Full,
}


#[derive(Debug, Clone, Copy)]
struct Entry {
    key: u64,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decode {
    Idle,
    Key,
    Value,
    Hex,
}


/// A small associative store from hashed names to byte values.
///
/// Lookups scan the key array linearly, which beats a map for the few dozen
/// entries a request carries. Values live back to back in one arena that
/// grows on demand and keeps its allocation across [`clear`](Self::clear).
///
/// The table doubles as an incremental decoder for `key=value&key=value`
/// input, see [`begin_entry`](Self::begin_entry).
#[derive(Debug, Clone)]
pub struct ParamTable {
    entries: Vec<Entry>,
    arena: Vec<u8>,
    state: Decode,
    name: SmallVec<[u8; 32]>,
    hex: [u8; 2],
    hex_len: usize,
    value_start: usize,
}

impl ParamTable {
    /// Creates an empty table with `arena_size` bytes of value storage.
    #[must_use]
    pub fn new(arena_size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(MAX_PARAM_KEYS),
            arena: Vec::with_capacity(arena_size),
            state: Decode::Idle,
            name: SmallVec::new(),
            hex: [0; 2],
            hex_len: 0,
            value_start: 0,
        }
    }

    /// Returns the number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tests whether the table has no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of arena bytes holding values.
    #[inline]
    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Drops all entries and resets the decoder. The arena keeps its
    /// allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.arena.clear();
        self.state = Decode::Idle;
        self.name.clear();
        self.hex_len = 0;
        self.value_start = 0;
    }

    fn grow_for(&mut self, additional: usize) {
        let free = self.arena.capacity() - self.arena.len();
        if additional > free {
            let step = self.arena.capacity().max(additional);
            trace!(capacity = self.arena.capacity(), step, "param arena grows");
            self.arena.reserve(step);
        }
    }

    /// Inserts a value under an already hashed key.
    ///
    /// Returns the key, or 0 if the table is full or `key` is 0.
    pub fn add_hashed(&mut self, key: u64, value: &[u8]) -> u64 {
        match self.reserve(key, value.len()) {
            Some(slot) => {
                slot.copy_from_slice(value);
                key
            },
            None => 0,
        }
    }

    /// Inserts a value under the hash of `name`.
    ///
    /// Returns the key, or 0 if the table is full or `name` is empty.
    #[inline]
    pub fn add(&mut self, name: &[u8], value: &[u8]) -> u64 {
        self.add_hashed(hash_key(name), value)
    }

    /// Inserts a zeroed value of `len` bytes and returns it for filling in.
    ///
    /// Returns [`None`] if the table is full or `key` is 0.
    pub fn reserve(&mut self, key: u64, len: usize) -> Option<&mut [u8]> {
        if key == 0 || self.entries.len() >= MAX_PARAM_KEYS {
            return None;
        }
        self.grow_for(len);
        let start = self.arena.len();
        self.arena.resize(start + len, 0);
        self.entries.push(Entry { key, start, end: start + len });
        self.value_start = self.arena.len();
        Some(&mut self.arena[start..])
    }

    fn value_of(&self, entry: Entry) -> &[u8] {
        &self.arena[entry.start..entry.end]
    }

    /// Looks up the first value stored under `key`.
    #[must_use]
    pub fn value_hashed(&self, key: u64) -> Option<&[u8]> {
        self.entries.iter().find(|e| e.key == key).map(|&e| self.value_of(e))
    }

    /// Looks up the first value stored under `name`.
    #[inline]
    #[must_use]
    pub fn value(&self, name: &[u8]) -> Option<&[u8]> {
        self.value_hashed(hash_key(name))
    }

    /// Returns the value stored under `key`, or an empty slice.
    #[inline]
    #[must_use]
    pub fn get_hashed(&self, key: u64) -> &[u8] {
        self.value_hashed(key).unwrap_or_default()
    }

    /// Returns the value stored under `name`, or an empty slice.
    #[inline]
    #[must_use]
    pub fn get(&self, name: &[u8]) -> &[u8] {
        self.get_hashed(hash_key(name))
    }

    /// Returns the value stored under `name` if it is valid UTF-8.
    #[must_use]
    pub fn get_str(&self, name: &[u8]) -> Option<&str> {
        self.value(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Parses the value stored under `name` as a decimal integer.
    ///
    /// Leading whitespace and a sign are accepted, parsing stops at the first
    /// non-digit and saturates on overflow. Returns [`None`] if the name is
    /// missing or the value does not start with a number.
    #[must_use]
    pub fn get_int(&self, name: &[u8]) -> Option<i64> {
        let v = self.value(name)?;
        let v = &v[v.iter().take_while(|c| c.is_ascii_whitespace()).count()..];
        let (neg, digits) = match v.split_first() {
            Some((b'-', rest)) => (true, rest),
            Some((b'+', rest)) => (false, rest),
            _ => (false, v),
        };
        let digits = &digits[..digits.iter().take_while(|c| c.is_ascii_digit()).count()];
        if digits.is_empty() {
            return None;
        }
        let mag = digits.iter().fold(0i64, |acc, &d| {
            acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))
        });
        Some(if neg { -mag } else { mag })
    }

    /// Tests whether any value is stored under `name`.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &[u8]) -> bool {
        let key = hash_key(name);
        self.entries.iter().any(|e| e.key == key)
    }

    /// Iterates over all entries as `(key, value)` in insertion order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (u64, &[u8])> + FusedIterator + '_ {
        self.entries.iter().map(|&e| (e.key, self.value_of(e)))
    }

    /// Iterates over the entries whose name starts with `subkey`.
    ///
    /// Only the first 7 bytes of `subkey` are used. They are packed like a
    /// short name and compared against the same low bytes of every key.
    /// This finds exactly the matching names of at most 8 bytes, since those
    /// keys are the packed names themselves. Keys of longer names are hashes,
    /// so they match only by chance: such false positives are possible and
    /// cannot be told apart from real matches.
    #[must_use]
    pub fn find_prefix(&self, subkey: &[u8]) -> FindPrefix<'_> {
        let find = pack(&subkey[..subkey.len().min(7)]);
        let mut mask: u64 = 0xff;
        while find & !mask != 0 {
            mask = (mask << 8) | 0xff;
        }
        FindPrefix { table: self, pos: 0, find, mask }
    }

    /// Starts decoding a `key=value&key=value` stream into the table.
    ///
    /// `hint` is the expected input size, used to grow the arena up front.
    /// Feed the input through [`PushSink::push_byte`], then finish with
    /// [`end_entry`](Self::end_entry).
    pub fn begin_entry(&mut self, hint: usize) {
        self.grow_for(hint);
        self.state = Decode::Key;
        self.name.clear();
        self.hex_len = 0;
        self.value_start = self.arena.len();
    }

    /// Tests whether a stream started by `begin_entry` is still open.
    #[inline]
    #[must_use]
    pub fn is_decoding(&self) -> bool {
        self.state != Decode::Idle
    }

    fn abandon_value(&mut self) {
        self.arena.truncate(self.value_start);
        self.state = Decode::Idle;
    }

    fn finish_pair(&mut self) -> Result<u64, Error> {
        if self.state != Decode::Value {
            self.abandon_value();
            return Err(Error::Syntax);
        }
        if self.entries.len() >= MAX_PARAM_KEYS {
            self.abandon_value();
            return Err(Error::Full);
        }

        let key = hash_key(&self.name);
        if key == 0 {
            trace!("empty parameter name skipped");
            self.arena.truncate(self.value_start);
        } else {
            self.entries.push(Entry { key, start: self.value_start, end: self.arena.len() });
        }
        self.value_start = self.arena.len();
        Ok(key)
    }

    /// Completes the last pair of the current stream.
    ///
    /// # Errors
    /// [`Error::Syntax`] if the stream did not end inside a value, for
    /// example on a trailing name without `=`. [`Error::Full`] if there is no
    /// room for the pair. Pairs completed earlier stay in the table.
    pub fn end_entry(&mut self) -> Result<u64, Error> {
        let res = self.finish_pair();
        self.state = Decode::Idle;
        self.name.clear();
        res
    }

    /// Decodes a complete `key=value&key=value` input.
    ///
    /// Returns the number of entries added.
    ///
    /// # Errors
    /// See [`end_entry`](Self::end_entry).
    pub fn decode_form(&mut self, data: &[u8]) -> Result<usize, Error> {
        let before = self.entries.len();
        self.begin_entry(data.len());
        for &c in data {
            if let Err(e) = self.push_byte(c) {
                self.state = Decode::Idle;
                return Err(e);
            }
        }
        self.end_entry()?;
        Ok(self.entries.len() - before)
    }
}

impl PushSink for ParamTable {
    type Error = Error;

    fn push_byte(&mut self, c: u8) -> Result<(), Error> {
        match self.state {
            Decode::Idle => {},
            Decode::Key => {
                if c == b'=' {
                    self.state = Decode::Value;
                    self.value_start = self.arena.len();
                } else if self.name.len() < MAX_PARAM_NAME - 1 && c != b' ' {
                    self.name.push(c);
                }
            },
            Decode::Value => match c {
                b'&' | b';' => {
                    self.finish_pair()?;
                    self.name.clear();
                    self.state = Decode::Key;
                },
                b'%' => {
                    self.hex_len = 0;
                    self.state = Decode::Hex;
                },
                b'+' => self.arena.push(b' '),
                _ => self.arena.push(c),
            },
            Decode::Hex => {
                self.hex[self.hex_len] = c;
                self.hex_len += 1;
                if self.hex_len == self.hex.len() {
                    self.arena.push(hex_byte(self.hex[0], self.hex[1]));
                    self.state = Decode::Value;
                }
            },
        }
        Ok(())
    }
}


/// Iterator returned by [`ParamTable::find_prefix`].
#[derive(Debug, Clone)]
pub struct FindPrefix<'a> {
    table: &'a ParamTable,
    pos: usize,
    find: u64,
    mask: u64,
}

impl<'a> Iterator for FindPrefix<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let table = self.table;
        let entries = table.entries.get(self.pos..)?;
        let hit = entries.iter().position(|e| (e.key & self.mask) ^ self.find == 0);
        match hit {
            Some(i) => {
                let e = entries[i];
                self.pos += i + 1;
                Some((e.key, table.value_of(e)))
            },
            None => {
                self.pos = table.entries.len();
                None
            },
        }
    }
}

impl FusedIterator for FindPrefix<'_> {}
