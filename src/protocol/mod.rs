//! Protocol module - wire format, sentence reassembly, and reply classification.
//!
//! This module implements the byte level of the device API:
//! - Variable-length word prefix encoding/decoding
//! - Sentence buffer for accumulating partial reads
//! - Reply classification (`!re`, `!done`, `!trap`, `!fatal`) with tag extraction

mod reply;
mod sentence;
mod sentence_buffer;
mod wire_format;

pub use reply::{classify, Reply, ReplyKind, Row, Trap, TrapCategory, TrapEntry};
pub use sentence::Sentence;
pub use sentence_buffer::SentenceBuffer;
pub use wire_format::{
    decode_length, decode_word, encode_length, encode_length_into, encode_word, encode_word_into,
    encoded_length_size, prefix_size, words, DEFAULT_MAX_WORD_SIZE, DEFAULT_PORT,
    DEFAULT_TLS_PORT, LONG_FORM_MARKER, MAX_PREFIX_SIZE, SENTENCE_TERMINATOR,
};
