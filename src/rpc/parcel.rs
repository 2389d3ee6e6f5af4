//! Envelope primitives — ordered, typed, 4-byte aligned fields.
//!
//! Wire layout of each field (little-endian):
//! ```text
//! i32 / u32   ┌──────────┐
//!             │ value 4B │
//!             └──────────┘
//! string      ┌──────────┬──────────────┬─────┐
//!             │ len i32  │ UTF-8 bytes  │ pad │   len = -1 → absent
//!             └──────────┴──────────────┴─────┘
//! blob        ┌──────────┬──────────────┬─────┐
//!             │ len i32  │ bytes        │ pad │
//!             └──────────┴──────────────┴─────┘
//! handler     ┌──────────┐
//!             │ idx i32  │  index into the object table, -1 → absent
//!             └──────────┘
//! ```
//!
//! Handler objects travel out of band in `objects`; the IPC substrate is
//! responsible for carrying them (in-process they are plain `Arc`s, over the
//! socket endpoint they become per-connection proxies).
//!
//! The reader never panics and never reads past the end of the buffer:
//! every failure is a [`CodecError`].

use core::fmt;

use crate::app::ports::HandlerRef;
use crate::error::Status;

const ALIGN: usize = 4;

/// Length prefix meaning "no value".
const ABSENT: i32 = -1;

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Envelope ended before the declared field.
    Truncated,
    /// A length prefix was negative (other than the absent marker).
    BadLength(i32),
    /// String field was not valid UTF-8.
    InvalidUtf8,
    /// First field did not match the interface descriptor.
    InterfaceMismatch,
    /// Handler index does not name an entry of the object table.
    BadObjectIndex(i32),
    /// Opcode is not part of the table.
    UnknownOpcode(u32),
    /// Bytes left over after the last declared field.
    Trailing(usize),
    /// Staging buffer could not be allocated.
    Alloc,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "envelope truncated"),
            Self::BadLength(len) => write!(f, "bad length prefix {len}"),
            Self::InvalidUtf8 => write!(f, "string is not UTF-8"),
            Self::InterfaceMismatch => write!(f, "interface token mismatch"),
            Self::BadObjectIndex(idx) => write!(f, "bad object index {idx}"),
            Self::UnknownOpcode(code) => write!(f, "unknown opcode {code}"),
            Self::Trailing(n) => write!(f, "{n} byte(s) after the last field"),
            Self::Alloc => write!(f, "allocation failed"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for Status {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Alloc => Self::Memory,
            CodecError::UnknownOpcode(_) => Self::NotImplemented,
            _ => Self::InternalError,
        }
    }
}

const fn padded(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

// ---------------------------------------------------------------------------
// Parcel (writer)
// ---------------------------------------------------------------------------

/// One serialized request or reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parcel {
    data: Vec<u8>,
    objects: Vec<HandlerRef>,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(data: Vec<u8>, objects: Vec<HandlerRef>) -> Self {
        Self { data, objects }
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<HandlerRef>) {
        (self.data, self.objects)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn objects(&self) -> &[HandlerRef] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn write_padded(&mut self, bytes: &[u8]) {
        self.write_i32(bytes.len() as i32);
        self.data.extend_from_slice(bytes);
        self.data.resize(self.data.len() + padded(bytes.len()) - bytes.len(), 0);
    }

    pub fn write_str(&mut self, value: Option<&str>) {
        match value {
            Some(s) => self.write_padded(s.as_bytes()),
            None => self.write_i32(ABSENT),
        }
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_padded(bytes);
    }

    pub fn write_handler(&mut self, handler: Option<&HandlerRef>) {
        match handler {
            Some(h) => {
                let idx = self.objects.len() as i32;
                self.objects.push(h.clone());
                self.write_i32(idx);
            }
            None => self.write_i32(ABSENT),
        }
    }

    /// Every request starts with the interface descriptor.
    pub fn write_interface_token(&mut self, descriptor: &str) {
        self.write_str(Some(descriptor));
    }

    pub fn reader(&self) -> ParcelReader<'_> {
        ParcelReader {
            data: &self.data,
            objects: &self.objects,
            pos: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// ParcelReader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over a [`Parcel`].
pub struct ParcelReader<'a> {
    data: &'a [u8],
    objects: &'a [HandlerRef],
    pos: usize,
}

impl<'a> ParcelReader<'a> {
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.read_i32()? as u32)
    }

    /// Read a length prefix and its (padded) payload. `None` for absent.
    fn read_padded(&mut self) -> Result<Option<&'a [u8]>, CodecError> {
        let len = self.read_i32()?;
        if len == ABSENT {
            return Ok(None);
        }
        if len < 0 {
            return Err(CodecError::BadLength(len));
        }
        let len = len as usize;
        if padded(len) > self.remaining() {
            return Err(CodecError::Truncated);
        }
        let bytes = self.take(len)?;
        self.take(padded(len) - len)?;
        Ok(Some(bytes))
    }

    pub fn read_str(&mut self) -> Result<Option<String>, CodecError> {
        match self.read_padded()? {
            Some(bytes) => {
                let s = core::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Some(s.to_owned()))
            }
            None => Ok(None),
        }
    }

    /// Read a blob into a freshly staged buffer. An absent blob reads as
    /// empty.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let Some(bytes) = self.read_padded()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        out.try_reserve_exact(bytes.len())
            .map_err(|_| CodecError::Alloc)?;
        out.extend_from_slice(bytes);
        Ok(out)
    }

    pub fn read_handler(&mut self) -> Result<Option<HandlerRef>, CodecError> {
        let idx = self.read_i32()?;
        if idx == ABSENT {
            return Ok(None);
        }
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.objects.get(i))
            .cloned()
            .map(Some)
            .ok_or(CodecError::BadObjectIndex(idx))
    }

    /// Check the leading interface token.
    pub fn enforce_interface(&mut self, descriptor: &str) -> Result<(), CodecError> {
        match self.read_str()? {
            Some(token) if token == descriptor => Ok(()),
            _ => Err(CodecError::InterfaceMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::AppletEvent;

    #[test]
    fn fields_are_four_byte_aligned() {
        let mut p = Parcel::new();
        p.write_str(Some("abc"));
        assert_eq!(p.len(), 8);
        p.write_blob(&[1, 2, 3, 4, 5]);
        assert_eq!(p.len(), 8 + 4 + 8);
        p.write_i32(-7);
        assert_eq!(p.len() % 4, 0);

        let mut r = p.reader();
        assert_eq!(r.read_str().unwrap().as_deref(), Some("abc"));
        assert_eq!(r.read_blob().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert!(r.is_exhausted());
    }

    #[test]
    fn absent_string_and_empty_string_differ() {
        let mut p = Parcel::new();
        p.write_str(None);
        p.write_str(Some(""));
        let mut r = p.reader();
        assert_eq!(r.read_str().unwrap(), None);
        assert_eq!(r.read_str().unwrap(), Some(String::new()));
    }

    #[test]
    fn truncated_reads_fail_cleanly() {
        let mut p = Parcel::new();
        p.write_i32(100); // claims a 100-byte blob
        p.write_i32(0);
        let mut r = p.reader();
        assert_eq!(r.read_blob(), Err(CodecError::Truncated));

        let p = Parcel::from_parts(vec![1, 2], Vec::new());
        assert_eq!(p.reader().read_i32(), Err(CodecError::Truncated));
    }

    #[test]
    fn negative_lengths_are_rejected() {
        let mut p = Parcel::new();
        p.write_i32(-5);
        assert_eq!(p.reader().read_blob(), Err(CodecError::BadLength(-5)));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut p = Parcel::new();
        p.write_blob(&[0xFF, 0xFE]);
        assert_eq!(p.reader().read_str(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn handlers_travel_in_object_table() {
        let h = HandlerRef::new(|_: &AppletEvent| Ok(()));
        let mut p = Parcel::new();
        p.write_handler(Some(&h));
        p.write_handler(None);
        assert_eq!(p.objects().len(), 1);

        let mut r = p.reader();
        assert_eq!(r.read_handler().unwrap(), Some(h));
        assert_eq!(r.read_handler().unwrap(), None);

        let mut bad = Parcel::new();
        bad.write_i32(3);
        assert_eq!(bad.reader().read_handler(), Err(CodecError::BadObjectIndex(3)));
    }

    #[test]
    fn interface_token_is_enforced() {
        let mut p = Parcel::new();
        p.write_interface_token("svc.A");
        assert!(p.reader().enforce_interface("svc.A").is_ok());
        assert_eq!(
            p.reader().enforce_interface("svc.B"),
            Err(CodecError::InterfaceMismatch)
        );
    }

    #[test]
    fn codec_errors_map_to_status() {
        assert_eq!(Status::from(CodecError::Truncated), Status::InternalError);
        assert_eq!(Status::from(CodecError::Alloc), Status::Memory);
        assert_eq!(Status::from(CodecError::UnknownOpcode(99)), Status::NotImplemented);
    }
}
