//! Sentence buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management.
//! Implements a state machine for handling fragmented words:
//! - `WaitingForLength`: Need a complete length prefix (1-5 bytes)
//! - `WaitingForWord`: Prefix parsed, need N more payload bytes
//!
//! Completed words collect into the in-progress sentence until the empty
//! word arrives, at which point the sentence is emitted.
//!
//! # Example
//!
//! ```
//! use apiwire_client::protocol::{Sentence, SentenceBuffer};
//!
//! let bytes = Sentence::from_words(["!done", ".tag=1"]).encode().unwrap();
//! let mut buffer = SentenceBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let sentences = buffer.push(&bytes[3..]).unwrap();
//!
//! assert_eq!(sentences[0].first(), Some("!done"));
//! ```

use bytes::BytesMut;

use super::wire_format::{decode_length, DEFAULT_MAX_WORD_SIZE};
use super::Sentence;
use crate::error::{ApiError, Result};

/// State machine for word parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete length prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for payload bytes.
    WaitingForWord { remaining: usize },
}

/// One step of extraction.
enum Item {
    Word(String),
    Terminator,
}

/// Buffer for accumulating incoming bytes and extracting complete sentences.
///
/// Bytes are consumed exactly once; a length prefix or word payload split
/// across reads is resumed on the next [`push`](Self::push).
pub struct SentenceBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Words of the sentence being assembled.
    words: Vec<String>,
    /// Maximum allowed word size.
    max_word_size: u32,
}

impl SentenceBuffer {
    /// Create a new sentence buffer with default settings.
    ///
    /// Default capacity: 64KB, max word: 16MB.
    pub fn new() -> Self {
        Self::with_max_word_size(DEFAULT_MAX_WORD_SIZE)
    }

    /// Create a new sentence buffer with a custom max word size.
    pub fn with_max_word_size(max_word_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            words: Vec::new(),
            max_word_size,
        }
    }

    /// Push data into the buffer and extract all complete sentences.
    ///
    /// Returns the sentences completed by this chunk, in arrival order
    /// (may be empty if still waiting for data). Sentences with no words
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an invalid prefix byte, a word larger
    /// than the configured maximum, or a word that is not UTF-8. The
    /// stream cannot be resynchronized after an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Sentence>> {
        self.buffer.extend_from_slice(data);

        let mut sentences = Vec::new();

        while let Some(item) = self.try_extract_one()? {
            match item {
                Item::Word(word) => self.words.push(word),
                Item::Terminator => {
                    if !self.words.is_empty() {
                        let words = std::mem::take(&mut self.words);
                        sentences.push(Sentence::from_words(words));
                    }
                }
            }
        }

        Ok(sentences)
    }

    /// Try to extract a single word or terminator from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Item>> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.is_empty() {
                    return Ok(None);
                }

                let Some((prefix, len)) = decode_length(&self.buffer)? else {
                    return Ok(None);
                };

                if len > self.max_word_size {
                    return Err(ApiError::Protocol(format!(
                        "Word size {} exceeds maximum {}",
                        len, self.max_word_size
                    )));
                }

                let _ = self.buffer.split_to(prefix);

                if len == 0 {
                    return Ok(Some(Item::Terminator));
                }

                self.state = State::WaitingForWord {
                    remaining: len as usize,
                };

                self.try_extract_one()
            }

            State::WaitingForWord { remaining } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining);
                self.state = State::WaitingForLength;

                let word = String::from_utf8(payload.to_vec())
                    .map_err(|e| ApiError::Protocol(format!("Word is not valid UTF-8: {}", e)))?;

                Ok(Some(Item::Word(word)))
            }
        }
    }

    /// Get the number of buffered bytes not yet consumed into words.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if there are no buffered bytes.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of words collected for the unfinished sentence.
    pub fn pending_words(&self) -> usize {
        self.words.len()
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForWord { .. } => "WaitingForWord",
        }
    }
}

impl Default for SentenceBuffer {
    fn default() -> Self {
        Self::new()
    }
}
