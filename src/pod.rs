//! Self-describing structured records ("pods") used as message payloads.
//!
//! Every payload is one balanced struct block: a [`Tag::StructStart`]
//! marker, a run of typed fields and the matching [`Tag::StructEnd`]. A
//! field is `(u32 tag, u32 size, size bytes of payload)` with all scalars
//! little-endian. Strings carry a trailing NUL inside `size`. A nested
//! record ("pod") is a balanced sub-block spliced verbatim; an object is a
//! symbolic type name followed by such a block.
//!
//! [`PodBuilder`] appends into a caller-provided buffer and [`PodIter`]
//! walks one block, yielding one typed field at a time. A failed pull
//! leaves the iterator where it was.

use byteorder::{ByteOrder, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::error::Error;
use std::fmt;

/// Builder growth granularity in bytes.
pub const GROW_STEP: usize = 512;

/// Bytes of `(tag, size)` in front of every field payload.
pub const FIELD_HEADER: usize = 8;

/// Wire tag of a field.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Tag {
    Int = 1,
    Long = 2,
    String = 3,
    Bytes = 4,
    Object = 6,
    StructStart = 7,
    StructEnd = 8,
}

/// Why a decode failed. Decoding never panics on hostile input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodError {
    /// Input ended in the middle of a field header or payload.
    Truncated,
    /// A field claims more payload than the enclosing block holds.
    Overrun,
    /// The field at the cursor is not of the requested type.
    Mismatch { want: Tag, found: u32 },
    /// The field has the right tag but an impossible size.
    BadSize { want: Tag, size: u32 },
    /// String payload without NUL terminator or invalid UTF-8.
    BadString,
    /// A struct block is missing its closing marker.
    Unterminated,
}

impl fmt::Display for PodError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PodError::Truncated => write!(f, "truncated record"),
            PodError::Overrun => write!(f, "field overruns enclosing struct"),
            PodError::Mismatch { want, found } => {
                write!(f, "expected {want:?}, found tag {found}")
            }
            PodError::BadSize { want, size } => write!(f, "bad size {size} for {want:?}"),
            PodError::BadString => write!(f, "malformed string payload"),
            PodError::Unterminated => write!(f, "unterminated struct"),
        }
    }
}

impl Error for PodError {}

/// Appends typed fields to a caller-provided buffer.
///
/// The buffer grows in [`GROW_STEP`] increments so repeated small fields
/// do not reallocate. Each push returns the byte offset the field starts
/// at, for back-patching.
pub struct PodBuilder<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> PodBuilder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> PodBuilder<'a> {
        PodBuilder { buf }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    fn reserve(&mut self, add: usize) {
        let need = self.buf.len() + add;
        if need > self.buf.capacity() {
            let rounded = need.div_ceil(GROW_STEP) * GROW_STEP;
            self.buf.reserve_exact(rounded - self.buf.len());
        }
    }

    fn header(&mut self, tag: Tag, size: usize) {
        self.buf.extend_from_slice(&u32::from(tag).to_le_bytes());
        self.buf.extend_from_slice(&(size as u32).to_le_bytes());
    }

    fn field(&mut self, tag: Tag, payload: &[u8]) -> u32 {
        let off = self.offset();
        self.reserve(FIELD_HEADER + payload.len());
        self.header(tag, payload.len());
        self.buf.extend_from_slice(payload);
        off
    }

    pub fn push_int(&mut self, v: i32) -> u32 {
        self.field(Tag::Int, &v.to_le_bytes())
    }

    pub fn push_long(&mut self, v: i64) -> u32 {
        self.field(Tag::Long, &v.to_le_bytes())
    }

    /// The encoded size includes the trailing NUL.
    pub fn push_string(&mut self, s: &str) -> u32 {
        let off = self.offset();
        self.reserve(FIELD_HEADER + s.len() + 1);
        self.header(Tag::String, s.len() + 1);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        off
    }

    pub fn push_bytes(&mut self, b: &[u8]) -> u32 {
        self.field(Tag::Bytes, b)
    }

    /// Encode an attached file descriptor as its index in the message's
    /// FD list (see `SendHalf::attach_fd`).
    pub fn push_fd(&mut self, index: u32) -> u32 {
        self.push_int(index as i32)
    }

    /// Splice an already-encoded record byte-exact.
    pub fn push_pod(&mut self, pod: &[u8]) -> u32 {
        let off = self.offset();
        self.reserve(pod.len());
        self.buf.extend_from_slice(pod);
        off
    }

    /// An object is its symbolic type name followed by the body record.
    pub fn push_object(&mut self, kind: &str, body: &[u8]) -> u32 {
        let off = self.offset();
        self.reserve(FIELD_HEADER + kind.len() + 1 + body.len());
        self.header(Tag::Object, kind.len() + 1);
        self.buf.extend_from_slice(kind.as_bytes());
        self.buf.push(0);
        self.buf.extend_from_slice(body);
        off
    }

    pub fn begin_struct(&mut self) -> u32 {
        self.field(Tag::StructStart, &[])
    }

    pub fn end_struct(&mut self) -> u32 {
        self.field(Tag::StructEnd, &[])
    }
}

/// Linear reader over one balanced struct block.
pub struct PodIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PodIter<'a> {
    /// Start walking `data`, which must open with a struct marker.
    pub fn new(data: &'a [u8]) -> Result<PodIter<'a>, PodError> {
        let mut it = PodIter { data, pos: 0 };
        it.marker(Tag::StructStart)?;
        Ok(it)
    }

    fn header_at(&self, pos: usize) -> Result<(u32, usize), PodError> {
        if self.data.len().saturating_sub(pos) < FIELD_HEADER {
            return Err(PodError::Truncated);
        }
        let tag = LE::read_u32(&self.data[pos..]);
        let size = LE::read_u32(&self.data[pos + 4..]) as usize;
        if self.data.len() - pos - FIELD_HEADER < size {
            return Err(PodError::Overrun);
        }
        Ok((tag, size))
    }

    /// Tag of the next field, without consuming it.
    pub fn peek(&self) -> Result<u32, PodError> {
        self.header_at(self.pos).map(|(tag, _)| tag)
    }

    fn pull(&mut self, want: Tag, want_size: Option<usize>) -> Result<&'a [u8], PodError> {
        let (tag, size) = self.header_at(self.pos)?;
        if tag != u32::from(want) {
            return Err(PodError::Mismatch { want, found: tag });
        }
        if want_size.is_some_and(|ws| ws != size) {
            return Err(PodError::BadSize {
                want,
                size: size as u32,
            });
        }
        let start = self.pos + FIELD_HEADER;
        self.pos = start + size;
        Ok(&self.data[start..start + size])
    }

    fn marker(&mut self, want: Tag) -> Result<(), PodError> {
        self.pull(want, Some(0)).map(drop)
    }

    pub fn pull_int(&mut self) -> Result<i32, PodError> {
        self.pull(Tag::Int, Some(4)).map(LE::read_i32)
    }

    pub fn pull_long(&mut self) -> Result<i64, PodError> {
        self.pull(Tag::Long, Some(8)).map(LE::read_i64)
    }

    pub fn pull_str(&mut self) -> Result<&'a str, PodError> {
        let (tag, size) = self.header_at(self.pos)?;
        if tag != u32::from(Tag::String) {
            return Err(PodError::Mismatch {
                want: Tag::String,
                found: tag,
            });
        }
        let start = self.pos + FIELD_HEADER;
        let s = str_payload(&self.data[start..start + size])?;
        self.pos = start + size;
        Ok(s)
    }

    pub fn pull_bytes(&mut self) -> Result<&'a [u8], PodError> {
        self.pull(Tag::Bytes, None)
    }

    /// An attached-FD field: the index into the message's FD list.
    pub fn pull_fd_index(&mut self) -> Result<u32, PodError> {
        self.pull_int().map(|v| v as u32)
    }

    /// Capture a balanced nested block verbatim, without entering it.
    pub fn pull_pod(&mut self) -> Result<&'a [u8], PodError> {
        let end = self.balanced_end(self.pos)?;
        let start = self.pos;
        self.pos = end;
        Ok(&self.data[start..end])
    }

    /// Pull an object: its type name and the body block.
    pub fn pull_object(&mut self) -> Result<(&'a str, &'a [u8]), PodError> {
        let (tag, size) = self.header_at(self.pos)?;
        if tag != u32::from(Tag::Object) {
            return Err(PodError::Mismatch {
                want: Tag::Object,
                found: tag,
            });
        }
        let name_start = self.pos + FIELD_HEADER;
        let name = str_payload(&self.data[name_start..name_start + size])?;
        let body_start = name_start + size;
        let body_end = self.balanced_end(body_start)?;
        self.pos = body_end;
        Ok((name, &self.data[body_start..body_end]))
    }

    // End offset of the balanced struct block starting at `pos`.
    fn balanced_end(&self, pos: usize) -> Result<usize, PodError> {
        let (tag, _) = self.header_at(pos)?;
        if tag != u32::from(Tag::StructStart) {
            return Err(PodError::Mismatch {
                want: Tag::StructStart,
                found: tag,
            });
        }
        let mut depth = 0usize;
        let mut at = pos;
        loop {
            let (tag, size) = self.header_at(at).map_err(|e| match e {
                PodError::Truncated => PodError::Unterminated,
                other => other,
            })?;
            at += FIELD_HEADER + size;
            if tag == u32::from(Tag::StructStart) {
                depth += 1;
            } else if tag == u32::from(Tag::StructEnd) {
                depth -= 1;
                if depth == 0 {
                    return Ok(at);
                }
            }
        }
    }

    /// Consume the closing marker of the block this iterator walks.
    pub fn finish(&mut self) -> Result<(), PodError> {
        match self.marker(Tag::StructEnd) {
            Err(PodError::Truncated) => Err(PodError::Unterminated),
            other => other,
        }
    }

    /// True once the cursor reached the end of the input.
    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn str_payload(payload: &[u8]) -> Result<&str, PodError> {
    match payload.split_last() {
        Some((0, head)) => std::str::from_utf8(head).map_err(|_| PodError::BadString),
        _ => Err(PodError::BadString),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut buf = Vec::new();
        let mut b = PodBuilder::new(&mut buf);
        b.begin_struct();
        b.push_int(7);
        b.push_long(-1);
        b.push_string("tick");
        b.push_bytes(&[0xde, 0xad]);
        b.end_struct();
        buf
    }

    #[test]
    fn roundtrip() {
        let buf = sample();
        let mut it = PodIter::new(&buf).unwrap();
        assert_eq!(it.pull_int().unwrap(), 7);
        assert_eq!(it.pull_long().unwrap(), -1);
        assert_eq!(it.pull_str().unwrap(), "tick");
        assert_eq!(it.pull_bytes().unwrap(), &[0xde, 0xad]);
        it.finish().unwrap();
        assert!(it.at_end());
    }

    #[test]
    fn mismatch_does_not_advance() {
        let buf = sample();
        let mut it = PodIter::new(&buf).unwrap();
        assert_eq!(
            it.pull_str(),
            Err(PodError::Mismatch {
                want: Tag::String,
                found: Tag::Int.into(),
            })
        );
        // same field still pullable with the right type
        assert_eq!(it.pull_int().unwrap(), 7);
    }

    #[test]
    fn truncated_and_overrun() {
        let buf = sample();
        let mut it = PodIter::new(&buf[..buf.len() - 10]).unwrap();
        it.pull_int().unwrap();
        it.pull_long().unwrap();
        it.pull_str().unwrap();
        assert_eq!(it.pull_bytes(), Err(PodError::Overrun));

        let mut short = sample();
        short.truncate(10);
        let mut it = PodIter::new(&short).unwrap();
        assert_eq!(it.pull_int(), Err(PodError::Truncated));
    }

    #[test]
    fn unterminated_struct() {
        let mut buf = Vec::new();
        let mut b = PodBuilder::new(&mut buf);
        b.begin_struct();
        b.push_int(1);
        // no end_struct
        let mut it = PodIter::new(&buf).unwrap();
        it.pull_int().unwrap();
        assert_eq!(it.finish(), Err(PodError::Unterminated));
    }

    #[test]
    fn nested_pod_capture() {
        let mut inner = Vec::new();
        let mut b = PodBuilder::new(&mut inner);
        b.begin_struct();
        b.push_int(42);
        b.end_struct();

        let mut outer = Vec::new();
        let mut b = PodBuilder::new(&mut outer);
        b.begin_struct();
        b.push_string("before");
        b.push_pod(&inner);
        b.push_int(9);
        b.end_struct();

        let mut it = PodIter::new(&outer).unwrap();
        assert_eq!(it.pull_str().unwrap(), "before");
        assert_eq!(it.pull_pod().unwrap(), &inner[..]);
        assert_eq!(it.pull_int().unwrap(), 9);
        it.finish().unwrap();
    }

    #[test]
    fn object_capture() {
        let mut body = Vec::new();
        let mut b = PodBuilder::new(&mut body);
        b.begin_struct();
        b.push_string("audio/raw");
        b.end_struct();

        let mut buf = Vec::new();
        let mut b = PodBuilder::new(&mut buf);
        b.begin_struct();
        b.push_object("Format", &body);
        b.end_struct();

        let mut it = PodIter::new(&buf).unwrap();
        let (name, got) = it.pull_object().unwrap();
        assert_eq!(name, "Format");
        assert_eq!(got, &body[..]);
        it.finish().unwrap();
    }

    #[test]
    fn growth_steps() {
        let mut buf = Vec::new();
        let mut b = PodBuilder::new(&mut buf);
        b.begin_struct();
        assert_eq!(buf.capacity(), GROW_STEP);

        let mut b = PodBuilder::new(&mut buf);
        let big = vec![0u8; GROW_STEP];
        b.push_bytes(&big);
        assert_eq!(buf.capacity(), 2 * GROW_STEP);
    }

    #[test]
    fn offsets_for_backpatching() {
        let mut buf = Vec::new();
        let mut b = PodBuilder::new(&mut buf);
        let start = b.begin_struct();
        assert_eq!(start, 0);
        let at = b.push_int(0);
        b.end_struct();
        // patch the int payload in place
        buf[at as usize + FIELD_HEADER..at as usize + FIELD_HEADER + 4]
            .copy_from_slice(&5i32.to_le_bytes());
        let mut it = PodIter::new(&buf).unwrap();
        assert_eq!(it.pull_int().unwrap(), 5);
    }
}
