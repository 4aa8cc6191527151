//! Wire format encoding and decoding.
//!
//! Every word is a variable-length size prefix followed by UTF-8 bytes:
//! ```text
//! ┌───────────────────────┬────────────┬──────────────────────────────┐
//! │ Length                │ Prefix     │ Leading byte                 │
//! ├───────────────────────┼────────────┼──────────────────────────────┤
//! │ < 0x80                │ 1 byte     │ 0xxxxxxx                     │
//! │ < 0x4000              │ 2 bytes BE │ 10xxxxxx                     │
//! │ < 0x200000            │ 3 bytes BE │ 110xxxxx                     │
//! │ < 0x10000000          │ 4 bytes BE │ 1110xxxx                     │
//! │ otherwise             │ 5 bytes    │ 0xF0 marker + u32 BE length  │
//! └───────────────────────┴────────────┴──────────────────────────────┘
//! ```
//!
//! A sentence ends with the empty word, a single `0x00` byte.

use bytes::{BufMut, BytesMut};

use crate::error::{ApiError, Result};

/// Largest prefix size in bytes.
pub const MAX_PREFIX_SIZE: usize = 5;

/// Default maximum accepted inbound word size (16 MiB).
pub const DEFAULT_MAX_WORD_SIZE: u32 = 16 * 1024 * 1024;

/// The empty word that terminates a sentence.
pub const SENTENCE_TERMINATOR: u8 = 0x00;

/// Marker byte of the 5-byte length form.
pub const LONG_FORM_MARKER: u8 = 0xF0;

/// Default plain TCP port.
pub const DEFAULT_PORT: u16 = 8728;

/// Default port when the transport is TLS-wrapped.
pub const DEFAULT_TLS_PORT: u16 = 8729;

/// Reserved words of the protocol.
pub mod words {
    /// Data row.
    pub const RE: &str = "!re";
    /// Command completion.
    pub const DONE: &str = "!done";
    /// Command error.
    pub const TRAP: &str = "!trap";
    /// Connection-ending error.
    pub const FATAL: &str = "!fatal";
    /// Empty result announcement sent by newer devices before `!done`.
    pub const EMPTY: &str = "!empty";

    /// Routing attribute prefix.
    pub const TAG_PREFIX: &str = ".tag=";
    /// Login challenge attribute (as a word prefix).
    pub const RET_PREFIX: &str = "=ret=";

    /// Login command.
    pub const LOGIN: &str = "/login";
    /// Cancel a running command by tag.
    pub const CANCEL: &str = "/cancel";
    /// Graceful disconnect.
    pub const QUIT: &str = "/quit";
}

/// Number of prefix bytes announced by the leading byte.
///
/// Leading bytes `0xF1..=0xFF` are control bytes the protocol never uses
/// for lengths; they are rejected.
pub fn prefix_size(first: u8) -> Result<usize> {
    match first {
        b if b & 0x80 == 0x00 => Ok(1),
        b if b & 0xC0 == 0x80 => Ok(2),
        b if b & 0xE0 == 0xC0 => Ok(3),
        b if b & 0xF0 == 0xE0 => Ok(4),
        LONG_FORM_MARKER => Ok(5),
        b => Err(ApiError::Protocol(format!(
            "Invalid length prefix byte 0x{:02X}",
            b
        ))),
    }
}

/// Number of bytes [`encode_length`] emits for `len`.
#[inline]
pub fn encoded_length_size(len: u32) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Append the length prefix for `len` to `buf`.
pub fn encode_length_into(len: u32, buf: &mut BytesMut) {
    match encoded_length_size(len) {
        1 => buf.put_u8(len as u8),
        2 => buf.put_u16(len as u16 | 0x8000),
        3 => {
            let v = len | 0x00C0_0000;
            buf.put_slice(&v.to_be_bytes()[1..]);
        }
        4 => buf.put_u32(len | 0xE000_0000),
        _ => {
            buf.put_u8(LONG_FORM_MARKER);
            buf.put_u32(len);
        }
    }
}

/// Encode a length prefix (standalone function).
///
/// # Example
///
/// ```
/// use apiwire_client::protocol::encode_length;
///
/// assert_eq!(encode_length(0x7F), vec![0x7F]);
/// assert_eq!(encode_length(0x80), vec![0x80, 0x80]);
/// ```
pub fn encode_length(len: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(MAX_PREFIX_SIZE);
    encode_length_into(len, &mut buf);
    buf.to_vec()
}

/// Decode a length prefix from the start of `buf`.
///
/// Returns:
/// - `Ok(Some((consumed, length)))` when the whole prefix is present
/// - `Ok(None)` when the leading byte announces more bytes than are buffered
/// - `Err(...)` when `buf` is empty or the leading byte is not a length byte
///
/// # Example
///
/// ```
/// use apiwire_client::protocol::decode_length;
///
/// assert_eq!(decode_length(&[0x81, 0x00]).unwrap(), Some((2, 0x100)));
/// assert_eq!(decode_length(&[0x81]).unwrap(), None);
/// assert!(decode_length(&[]).is_err());
/// ```
pub fn decode_length(buf: &[u8]) -> Result<Option<(usize, u32)>> {
    let first = *buf
        .first()
        .ok_or_else(|| ApiError::Protocol("Cannot decode length from empty buffer".to_string()))?;

    let size = prefix_size(first)?;
    if buf.len() < size {
        return Ok(None);
    }

    let len = match size {
        1 => u32::from(first),
        2 => u32::from_be_bytes([0, 0, first & 0x3F, buf[1]]),
        3 => u32::from_be_bytes([0, first & 0x1F, buf[1], buf[2]]),
        4 => u32::from_be_bytes([first & 0x0F, buf[1], buf[2], buf[3]]),
        _ => u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
    };

    Ok(Some((size, len)))
}

/// Append one word (prefix + UTF-8 bytes) to `buf`.
pub fn encode_word_into(word: &str, buf: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(word.len()).map_err(|_| {
        ApiError::Protocol(format!("Word of {} bytes exceeds the 32-bit limit", word.len()))
    })?;
    buf.reserve(encoded_length_size(len) + word.len());
    encode_length_into(len, buf);
    buf.put_slice(word.as_bytes());
    Ok(())
}

/// Encode a single word (standalone function).
///
/// The sentence terminator is not included; see
/// [`Sentence::encode`](crate::protocol::Sentence::encode).
pub fn encode_word(word: &str) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(MAX_PREFIX_SIZE + word.len());
    encode_word_into(word, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode one word from the start of `buf`.
///
/// Returns `Ok(None)` if the prefix or payload is incomplete.
pub fn decode_word(buf: &[u8]) -> Result<Option<(usize, String)>> {
    let Some((prefix, len)) = decode_length(buf)? else {
        return Ok(None);
    };
    let end = prefix + len as usize;
    if buf.len() < end {
        return Ok(None);
    }
    let text = std::str::from_utf8(&buf[prefix..end])
        .map_err(|e| ApiError::Protocol(format!("Word is not valid UTF-8: {}", e)))?;
    Ok(Some((end, text.to_string())))
}
