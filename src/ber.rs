//! BER framing and structural decoding for LDAPv3.
//!
//! Three layers live here:
//! - framing: pull exactly one top-level TLV off a byte stream (`try_frame`, `read_frame`);
//! - decoding: turn one TLV into a `BerElement` tree that callers interpret positionally;
//! - encoding: `BerWriter`, which builds nested constructed values and back-patches lengths.

use crate::result::LdapError;
use bytes::{Buf, BytesMut};
use std::io::{Cursor, Read};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const TAG_BOOLEAN: u32 = 0x01;
pub const TAG_INTEGER: u32 = 0x02;
pub const TAG_OCTET_STRING: u32 = 0x04;
pub const TAG_NULL: u32 = 0x05;
pub const TAG_ENUMERATED: u32 = 0x0A;
pub const TAG_SEQUENCE: u32 = 0x10;
pub const TAG_SET: u32 = 0x11;

/// Nested constructed values deeper than this are rejected rather than recursed into.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum BerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed BER: {0}")]
    Malformed(String),
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: usize, max: usize },
}

impl From<BerError> for LdapError {
    fn from(err: BerError) -> Self {
        LdapError::protocol(err.to_string())
    }
}

fn malformed<T>(msg: impl Into<String>) -> Result<T, BerError> {
    Err(BerError::Malformed(msg.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

impl TagClass {
    fn from_bits(byte: u8) -> Self {
        match byte >> 6 {
            0 => TagClass::Universal,
            1 => TagClass::Application,
            2 => TagClass::Context,
            _ => TagClass::Private,
        }
    }
}

/// Parse the identifier and length octets at the start of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise
/// `(class, constructed, tag number, header length, content length)`.
fn parse_header(data: &[u8]) -> Result<Option<(TagClass, bool, u32, usize, usize)>, BerError> {
    if data.len() < 2 {
        return Ok(None);
    }
    let first = data[0];
    let class = TagClass::from_bits(first);
    let constructed = first & 0x20 != 0;
    let mut pos = 1;
    let mut tag = (first & 0x1f) as u32;
    if tag == 0x1f {
        // high-tag-number form: base-128 digits, continuation bit 0x80
        tag = 0;
        loop {
            let Some(&b) = data.get(pos) else {
                return Ok(None);
            };
            pos += 1;
            if pos > 5 {
                return malformed("tag number too large");
            }
            tag = (tag << 7) | (b & 0x7f) as u32;
            if b & 0x80 == 0 {
                break;
            }
        }
    }
    let Some(&len_byte) = data.get(pos) else {
        return Ok(None);
    };
    pos += 1;
    let length = if len_byte & 0x80 == 0 {
        len_byte as usize
    } else {
        let length_bytes = (len_byte & 0x7f) as usize;
        if length_bytes == 0 {
            return malformed("indefinite length form is not permitted");
        }
        if length_bytes > 4 {
            return malformed(format!("length field of {} bytes", length_bytes));
        }
        if data.len() < pos + length_bytes {
            return Ok(None);
        }
        let mut length = 0usize;
        for b in &data[pos..pos + length_bytes] {
            length = (length << 8) | *b as usize;
        }
        pos += length_bytes;
        length
    };
    Ok(Some((class, constructed, tag, pos, length)))
}

/// Split one complete top-level element off the front of `buffer`.
///
/// Returns `Ok(None)` if the buffer does not yet hold a whole element.
pub fn try_frame(buffer: &mut BytesMut, max_size: usize) -> Result<Option<Vec<u8>>, BerError> {
    let Some((_, _, _, header_len, content_len)) = parse_header(&buffer[..])? else {
        return Ok(None);
    };
    let total = header_len + content_len;
    if total > max_size {
        return Err(BerError::TooLarge {
            size: total,
            max: max_size,
        });
    }
    if buffer.len() < total {
        return Ok(None);
    }
    let frame = buffer[..total].to_vec();
    buffer.advance(total);
    Ok(Some(frame))
}

/// Read one complete element from `reader`, buffering partial reads in `buffer`.
///
/// `Ok(None)` means the peer closed the stream at a message boundary.
/// EOF in the middle of a message is an `UnexpectedEof` I/O error.
pub async fn read_frame<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_size: usize,
) -> Result<Option<Vec<u8>>, BerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = try_frame(buffer, max_size)? {
            return Ok(Some(frame));
        }
        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(BerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a message",
            )));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BerContents {
    Primitive(Vec<u8>),
    Constructed(Vec<BerElement>),
}

/// One decoded TLV. Constructed values hold their children already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerElement {
    pub class: TagClass,
    pub tag: u32,
    pub contents: BerContents,
}

impl BerElement {
    /// Decode exactly one element occupying all of `data`.
    pub fn parse(data: &[u8]) -> Result<BerElement, BerError> {
        let mut reader = BerReader::new(data);
        let element = reader.read_element(0)?;
        if reader.remaining() != 0 {
            return malformed(format!("{} trailing bytes after element", reader.remaining()));
        }
        Ok(element)
    }

    pub fn is(&self, class: TagClass, tag: u32) -> bool {
        self.class == class && self.tag == tag
    }

    pub fn is_constructed(&self) -> bool {
        matches!(self.contents, BerContents::Constructed(_))
    }

    pub fn expect(&self, class: TagClass, tag: u32, what: &str) -> Result<&Self, BerError> {
        if self.is(class, tag) {
            Ok(self)
        } else {
            malformed(format!(
                "expected {} ({:?} {}), got {:?} {}",
                what, class, tag, self.class, self.tag
            ))
        }
    }

    pub fn bytes(&self) -> Result<&[u8], BerError> {
        match &self.contents {
            BerContents::Primitive(v) => Ok(v),
            BerContents::Constructed(_) => {
                malformed(format!("expected primitive value for tag {}", self.tag))
            }
        }
    }

    pub fn children(&self) -> Result<&[BerElement], BerError> {
        match &self.contents {
            BerContents::Constructed(c) => Ok(c),
            BerContents::Primitive(_) => {
                malformed(format!("expected constructed value for tag {}", self.tag))
            }
        }
    }

    /// Two's complement big-endian integer of up to 8 bytes.
    pub fn as_integer(&self) -> Result<i64, BerError> {
        let bytes = self.bytes()?;
        if bytes.is_empty() || bytes.len() > 8 {
            return malformed(format!("integer of {} bytes", bytes.len()));
        }
        let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for b in bytes {
            value = (value << 8) | *b as i64;
        }
        Ok(value)
    }

    pub fn as_bool(&self) -> Result<bool, BerError> {
        match self.bytes()? {
            [b] => Ok(*b != 0),
            other => malformed(format!("boolean of {} bytes", other.len())),
        }
    }

    /// LDAPString: must be valid UTF-8.
    pub fn as_string(&self) -> Result<String, BerError> {
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|_| BerError::Malformed("invalid UTF-8 in string".to_string()))
    }

    /// Attribute values are carried as text; invalid UTF-8 is replaced.
    pub fn as_value(&self) -> Result<String, BerError> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }
}

struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    fn read_element(&mut self, depth: usize) -> Result<BerElement, BerError> {
        if depth > MAX_DEPTH {
            return malformed("elements nested too deeply");
        }
        let pos = self.cursor.position() as usize;
        let rest = &self.cursor.get_ref()[pos..];
        let (class, constructed, tag, header_len, length) = match parse_header(rest)? {
            Some(h) => h,
            None => return malformed("truncated header"),
        };
        if rest.len() < header_len + length {
            return malformed(format!(
                "truncated: element needs {} bytes, {} remaining",
                length,
                rest.len() - header_len
            ));
        }
        self.cursor.set_position((pos + header_len) as u64);
        let mut content = vec![0u8; length];
        Read::read_exact(&mut self.cursor, &mut content)?;
        let contents = if constructed {
            let mut inner = BerReader::new(&content);
            let mut children = Vec::new();
            while inner.remaining() > 0 {
                children.push(inner.read_element(depth + 1)?);
            }
            BerContents::Constructed(children)
        } else {
            BerContents::Primitive(content)
        };
        Ok(BerElement {
            class,
            tag,
            contents,
        })
    }
}

/// BER encoder. Constructed values are opened with `start_*` and closed with
/// `end`, which back-patches the length in short or long form.
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn length_octets(length: usize) -> Vec<u8> {
        if length < 128 {
            vec![length as u8]
        } else {
            let bytes: Vec<u8> = length
                .to_be_bytes()
                .iter()
                .copied()
                .skip_while(|b| *b == 0)
                .collect();
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(0x80 | bytes.len() as u8);
            out.extend_from_slice(&bytes);
            out
        }
    }

    pub fn write_length(&mut self, length: usize) {
        let octets = Self::length_octets(length);
        self.buffer.extend_from_slice(&octets);
    }

    /// Write a primitive TLV with an arbitrary single-byte tag.
    pub fn write_primitive(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_integer_tagged(&mut self, tag: u8, value: i64) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        // drop redundant sign octets, keeping the sign bit of the first remaining octet
        while start < 7 {
            let b = bytes[start];
            let next_high = bytes[start + 1] & 0x80;
            if (b == 0x00 && next_high == 0) || (b == 0xff && next_high != 0) {
                start += 1;
            } else {
                break;
            }
        }
        self.write_primitive(tag, &bytes[start..]);
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_integer_tagged(TAG_INTEGER as u8, value);
    }

    pub fn write_enumerated(&mut self, value: u32) {
        self.write_integer_tagged(TAG_ENUMERATED as u8, value as i64);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_primitive(TAG_BOOLEAN as u8, &[if value { 0xff } else { 0x00 }]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_primitive(TAG_OCTET_STRING as u8, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// Open a constructed value with the given identifier octet; returns the
    /// position of its length placeholder for `end`.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn start_set(&mut self) -> usize {
        self.start_constructed(0x31)
    }

    pub fn end(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        let octets = Self::length_octets(content_len);
        self.buffer.splice(pos..pos + 1, octets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_frame_short_form() {
        let mut buf = BytesMut::from(&[0x30, 0x03, 0x02, 0x01, 0x05, 0xaa][..]);
        let frame = try_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(frame, vec![0x30, 0x03, 0x02, 0x01, 0x05]);
        assert_eq!(&buf[..], &[0xaa]);
    }

    #[test]
    fn test_try_frame_incomplete() {
        let mut buf = BytesMut::from(&[0x30][..]);
        assert!(try_frame(&mut buf, 1024).unwrap().is_none());
        let mut buf = BytesMut::from(&[0x30, 0x82, 0x01][..]);
        assert!(try_frame(&mut buf, 1024).unwrap().is_none());
        let mut buf = BytesMut::from(&[0x30, 0x05, 0x02, 0x01][..]);
        assert!(try_frame(&mut buf, 1024).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_try_frame_long_form() {
        let mut data = vec![0x04, 0x82, 0x01, 0x00];
        data.extend(std::iter::repeat(b'x').take(256));
        let mut buf = BytesMut::from(&data[..]);
        let frame = try_frame(&mut buf, 4096).unwrap().unwrap();
        assert_eq!(frame.len(), 260);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_try_frame_indefinite_length_rejected() {
        let mut buf = BytesMut::from(&[0x30, 0x80][..]);
        assert!(matches!(try_frame(&mut buf, 1024), Err(BerError::Malformed(_))));
    }

    #[test]
    fn test_try_frame_too_large() {
        let mut buf = BytesMut::from(&[0x30, 0x84, 0x10, 0x00, 0x00, 0x00][..]);
        assert!(matches!(try_frame(&mut buf, 1024), Err(BerError::TooLarge { .. })));
    }

    #[test]
    fn test_multi_byte_tag() {
        // [APPLICATION 200] primitive: 0x5f 0x81 0x48
        let data = [0x5f, 0x81, 0x48, 0x01, 0x07];
        let el = BerElement::parse(&data).unwrap();
        assert_eq!(el.class, TagClass::Application);
        assert_eq!(el.tag, 200);
        assert_eq!(el.bytes().unwrap(), &[0x07]);
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let mut reader: &[u8] = &[];
        let mut buf = BytesMut::new();
        assert!(read_frame(&mut reader, &mut buf, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_eof_mid_message() {
        let mut reader: &[u8] = &[0x30, 0x05, 0x02];
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_frame(&mut reader, &mut buf, 1024).await,
            Err(BerError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_indefinite_does_not_hang() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x30, 0x80])
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        let res = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            read_frame(&mut server, &mut buf, 1024),
        )
        .await
        .expect("framing must fail without waiting for more input");
        assert!(matches!(res, Err(BerError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_read_frame_two_messages() {
        let mut reader: &[u8] = &[0x02, 0x01, 0x01, 0x02, 0x01, 0x02];
        let mut buf = BytesMut::new();
        let a = read_frame(&mut reader, &mut buf, 1024).await.unwrap().unwrap();
        let b = read_frame(&mut reader, &mut buf, 1024).await.unwrap().unwrap();
        assert_eq!(a, vec![0x02, 0x01, 0x01]);
        assert_eq!(b, vec![0x02, 0x01, 0x02]);
        assert!(read_frame(&mut reader, &mut buf, 1024).await.unwrap().is_none());
    }

    #[test]
    fn test_parse_nested() {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_integer(7);
        let app = w.start_constructed(0x63);
        w.write_string("dc=example");
        w.write_enumerated(2);
        w.write_boolean(true);
        w.end(app);
        w.end(seq);
        let el = BerElement::parse(&w.into_bytes()).unwrap();
        let parts = el.children().unwrap();
        assert_eq!(parts[0].as_integer().unwrap(), 7);
        assert!(parts[1].is(TagClass::Application, 3));
        let inner = parts[1].children().unwrap();
        assert_eq!(inner[0].as_string().unwrap(), "dc=example");
        assert_eq!(inner[1].as_integer().unwrap(), 2);
        assert!(inner[2].as_bool().unwrap());
    }

    #[test]
    fn test_parse_truncated_child() {
        // SEQUENCE claims 3 bytes, child INTEGER claims 5
        let data = [0x30, 0x03, 0x02, 0x05, 0x01];
        assert!(matches!(BerElement::parse(&data), Err(BerError::Malformed(_))));
    }

    #[test]
    fn test_parse_trailing_bytes() {
        let data = [0x02, 0x01, 0x01, 0x00];
        assert!(BerElement::parse(&data).is_err());
    }

    #[test]
    fn test_integer_encoding() {
        let cases: [(i64, &[u8]); 7] = [
            (0, &[0x02, 0x01, 0x00]),
            (127, &[0x02, 0x01, 0x7f]),
            (128, &[0x02, 0x02, 0x00, 0x80]),
            (256, &[0x02, 0x02, 0x01, 0x00]),
            (-1, &[0x02, 0x01, 0xff]),
            (-128, &[0x02, 0x01, 0x80]),
            (-129, &[0x02, 0x02, 0xff, 0x7f]),
        ];
        for (value, expected) in cases {
            let mut w = BerWriter::new();
            w.write_integer(value);
            let bytes = w.into_bytes();
            assert_eq!(bytes, expected, "encoding {}", value);
            assert_eq!(BerElement::parse(&bytes).unwrap().as_integer().unwrap(), value);
        }
    }

    #[test]
    fn test_long_length_back_patch() {
        let mut w = BerWriter::new();
        let seq = w.start_sequence();
        w.write_string(&"y".repeat(300));
        w.end(seq);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..4], &[0x30, 0x82, 0x01, 0x30]);
        let el = BerElement::parse(&bytes).unwrap();
        assert_eq!(el.children().unwrap()[0].bytes().unwrap().len(), 300);
    }
}
