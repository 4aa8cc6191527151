//! Sentence struct with word accessors.
//!
//! A sentence is an ordered list of words; on the wire it is followed by
//! the empty word. Outbound sentences are encoded into one contiguous
//! buffer so the writer never interleaves two sentences.
//!
//! # Example
//!
//! ```
//! use apiwire_client::protocol::Sentence;
//!
//! let sentence = Sentence::from_words(["/ip/address/print", ".tag=1"]);
//! assert_eq!(sentence.first(), Some("/ip/address/print"));
//!
//! let bytes = sentence.encode().unwrap();
//! assert_eq!(*bytes.last().unwrap(), 0x00);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{encode_word_into, encoded_length_size, SENTENCE_TERMINATOR};
use crate::error::Result;

/// A complete protocol sentence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sentence {
    words: Vec<String>,
}

impl Sentence {
    /// Create an empty sentence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sentence from words (copies data).
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a word.
    pub fn push(&mut self, word: impl Into<String>) {
        self.words.push(word.into());
    }

    /// All words in order.
    #[inline]
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// The first word (reply type or command path).
    #[inline]
    pub fn first(&self) -> Option<&str> {
        self.words.first().map(String::as_str)
    }

    /// Number of words.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Check if the sentence has no words.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Consume the sentence and return its words.
    pub fn into_words(self) -> Vec<String> {
        self.words
    }

    /// Encoded size in bytes, terminator included.
    pub fn encoded_len(&self) -> usize {
        self.words
            .iter()
            .map(|w| encoded_length_size(u32::try_from(w.len()).unwrap_or(u32::MAX)) + w.len())
            .sum::<usize>()
            + 1
    }

    /// Append the encoded sentence, terminator included, to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.encoded_len());
        for word in &self.words {
            encode_word_into(word, buf)?;
        }
        buf.put_u8(SENTENCE_TERMINATOR);
        Ok(())
    }

    /// Encode the sentence as a single contiguous buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl<S: Into<String>> FromIterator<S> for Sentence {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_words(iter)
    }
}

impl<'a> IntoIterator for &'a Sentence {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.words.iter()
    }
}
