//! Reply classification.
//!
//! Turns a finished [`Sentence`] into a [`Reply`]: the kind comes from the
//! first word, `=name=value` words fill an ordered field map, and a
//! `.tag=<id>` word becomes the routing tag.
//!
//! # Example
//!
//! ```
//! use apiwire_client::protocol::{classify, ReplyKind, Sentence};
//!
//! let sentence = Sentence::from_words(["!re", "=.id=*1", "=address=10.0.0.1/24", ".tag=3"]);
//! let reply = classify(&sentence).unwrap();
//!
//! assert_eq!(reply.kind(), ReplyKind::Row);
//! assert_eq!(reply.tag(), Some(3));
//! assert_eq!(reply.get(".id"), Some("*1"));
//! ```

use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

use super::wire_format::words;
use super::Sentence;
use crate::error::{ApiError, Result};

/// Reply type, determined by the first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// `!re`: one data row.
    Row,
    /// `!done`: the command finished.
    Done,
    /// `!trap`: the command failed (more traps or `!done` may follow).
    Trap,
    /// `!fatal`: the connection is about to close.
    Fatal,
    /// `!empty`: the command has no rows; `!done` follows.
    Empty,
}

/// Ordered `name → value` map of one reply.
///
/// Inserting an existing name overwrites the value in place, so the order
/// is that of first appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    fields: Vec<(String, String)>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing the value of an existing one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Check if `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the row has no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Trap categories reported in the `category` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCategory {
    /// 0: missing item or command.
    MissingItem,
    /// 1: argument value failure.
    ArgumentValue,
    /// 2: execution of command interrupted.
    Interrupted,
    /// 3: scripting related failure.
    Scripting,
    /// 4: general failure.
    General,
    /// 5: API related failure.
    Api,
    /// 6: TTY related failure.
    Tty,
    /// 7: value generated with `:return`.
    Return,
}

impl TrapCategory {
    /// Map the numeric category.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::MissingItem,
            1 => Self::ArgumentValue,
            2 => Self::Interrupted,
            3 => Self::Scripting,
            4 => Self::General,
            5 => Self::Api,
            6 => Self::Tty,
            7 => Self::Return,
            _ => return None,
        })
    }
}

/// One `!trap` sentence.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TrapEntry {
    /// Numeric `category`, if the device sent one.
    pub category: Option<u32>,
    /// Human-readable `message`.
    pub message: String,
    /// Every field of the trap, `category` and `message` included.
    pub fields: Row,
}

impl TrapEntry {
    /// Build an entry from trap fields.
    pub fn from_fields(fields: Row) -> Self {
        Self {
            category: fields.get("category").and_then(|c| c.parse().ok()),
            message: fields.get("message").unwrap_or_default().to_string(),
            fields,
        }
    }

    /// Typed category.
    pub fn kind(&self) -> Option<TrapCategory> {
        self.category.and_then(TrapCategory::from_code)
    }
}

/// All trap entries one command reported before its `!done`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Trap {
    entries: Vec<TrapEntry>,
}

impl Trap {
    /// Wrap collected entries.
    pub fn new(entries: Vec<TrapEntry>) -> Self {
        Self { entries }
    }

    /// The entries, in arrival order.
    pub fn entries(&self) -> &[TrapEntry] {
        &self.entries
    }

    /// Message of the first entry.
    pub fn message(&self) -> &str {
        self.entries.first().map_or("", |e| e.message.as_str())
    }

    /// Check if no entries were collected.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("unspecified trap");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            f.write_str(&entry.message)?;
        }
        Ok(())
    }
}

/// A classified sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    kind: ReplyKind,
    tag: Option<u32>,
    fields: Row,
    attributes: Row,
    text: Vec<String>,
}

impl Reply {
    /// Reply type.
    #[inline]
    pub fn kind(&self) -> ReplyKind {
        self.kind
    }

    /// Routing tag from `.tag=<id>`.
    #[inline]
    pub fn tag(&self) -> Option<u32> {
        self.tag
    }

    /// Field map.
    #[inline]
    pub fn fields(&self) -> &Row {
        &self.fields
    }

    /// API attributes other than the tag (`.section=` and the like),
    /// without the leading dot.
    #[inline]
    pub fn attributes(&self) -> &Row {
        &self.attributes
    }

    /// API attribute by name, without the leading dot.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name)
    }

    /// Consume the reply and return its fields.
    pub fn into_fields(self) -> Row {
        self.fields
    }

    /// Field value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name)
    }

    /// The `ret` field (login challenge).
    pub fn ret(&self) -> Option<&str> {
        self.fields.get("ret")
    }

    /// Trap entry for `!trap` replies.
    pub fn trap_entry(&self) -> Option<TrapEntry> {
        (self.kind == ReplyKind::Trap).then(|| TrapEntry::from_fields(self.fields.clone()))
    }

    /// Reason text for `!fatal` replies.
    ///
    /// Devices send the reason as a bare word; a `message` field is used
    /// when present.
    pub fn fatal_message(&self) -> String {
        if let Some(message) = self.fields.get("message") {
            return message.to_string();
        }
        self.text.join(" ")
    }
}

/// Split `=name=value` into its parts. A missing second `=` yields an empty value.
fn parse_attribute(word: &str) -> Option<(&str, &str)> {
    let rest = word.strip_prefix('=')?;
    Some(rest.split_once('=').unwrap_or((rest, "")))
}

/// Classify a finished sentence.
///
/// # Errors
///
/// Returns a protocol error for an empty sentence, an unknown first word,
/// or a `.tag=` word whose value is not a number.
pub fn classify(sentence: &Sentence) -> Result<Reply> {
    let first = sentence
        .first()
        .ok_or_else(|| ApiError::Protocol("Cannot classify an empty sentence".to_string()))?;

    let (kind, rest) = match first {
        words::RE => (ReplyKind::Row, &sentence.words()[1..]),
        words::DONE => (ReplyKind::Done, &sentence.words()[1..]),
        words::TRAP => (ReplyKind::Trap, &sentence.words()[1..]),
        words::FATAL => (ReplyKind::Fatal, &sentence.words()[1..]),
        words::EMPTY => (ReplyKind::Empty, &sentence.words()[1..]),
        w if w.starts_with(words::RET_PREFIX) => (ReplyKind::Row, sentence.words()),
        other => {
            return Err(ApiError::Protocol(format!(
                "Unknown reply type '{}'",
                other
            )))
        }
    };

    let mut reply = Reply {
        kind,
        tag: None,
        fields: Row::new(),
        attributes: Row::new(),
        text: Vec::new(),
    };

    for word in rest {
        if let Some(id) = word.strip_prefix(words::TAG_PREFIX) {
            let tag = id
                .parse()
                .map_err(|_| ApiError::Protocol(format!("Invalid tag '{}'", id)))?;
            reply.tag = Some(tag);
        } else if let Some((name, value)) = parse_attribute(word) {
            reply.fields.insert(name, value);
        } else if let Some((name, value)) = word.strip_prefix('.').and_then(|w| w.split_once('=')) {
            reply.attributes.insert(name, value);
        } else {
            reply.text.push(word.clone());
        }
    }

    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(words: &[&str]) -> Reply {
        classify(&Sentence::from_words(words.iter().copied())).unwrap()
    }

    #[test]
    fn test_kinds_from_first_word() {
        assert_eq!(reply(&["!re"]).kind(), ReplyKind::Row);
        assert_eq!(reply(&["!done"]).kind(), ReplyKind::Done);
        assert_eq!(reply(&["!trap"]).kind(), ReplyKind::Trap);
        assert_eq!(reply(&["!fatal"]).kind(), ReplyKind::Fatal);
        assert_eq!(reply(&["!empty"]).kind(), ReplyKind::Empty);
    }

    #[test]
    fn test_unknown_first_word_rejected() {
        let result = classify(&Sentence::from_words(["!weird"]));
        assert!(matches!(result, Err(ApiError::Protocol(_))));
    }

    #[test]
    fn test_empty_sentence_rejected() {
        assert!(classify(&Sentence::new()).is_err());
    }

    #[test]
    fn test_fields_and_tag() {
        let r = reply(&["!re", "=.id=*A", "=name=ether1", ".tag=12"]);

        assert_eq!(r.tag(), Some(12));
        assert_eq!(r.get(".id"), Some("*A"));
        assert_eq!(r.get("name"), Some("ether1"));
        assert!(!r.fields().contains("tag"));
        assert_eq!(r.fields().len(), 2);
    }

    #[test]
    fn test_value_may_contain_equals() {
        let r = reply(&["!re", "=script=:put a=b"]);
        assert_eq!(r.get("script"), Some(":put a=b"));
    }

    #[test]
    fn test_missing_value_is_empty() {
        let r = reply(&["!re", "=disabled"]);
        assert_eq!(r.get("disabled"), Some(""));
    }

    #[test]
    fn test_duplicate_keys_overwrite() {
        let r = reply(&["!re", "=name=a", "=mtu=1500", "=name=b"]);

        assert_eq!(r.get("name"), Some("b"));
        let names: Vec<&str> = r.fields().iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["name", "mtu"]);
    }

    #[test]
    fn test_invalid_tag_rejected() {
        let result = classify(&Sentence::from_words(["!done", ".tag=abc"]));
        assert!(result.unwrap_err().to_string().contains("Invalid tag"));
    }

    #[test]
    fn test_bare_ret_sentence_is_row() {
        let r = reply(&["=ret=0102030405060708090a0b0c0d0e0f10"]);

        assert_eq!(r.kind(), ReplyKind::Row);
        assert_eq!(r.ret(), Some("0102030405060708090a0b0c0d0e0f10"));
        assert_eq!(r.fields().len(), 1);
    }

    #[test]
    fn test_done_with_ret() {
        let r = reply(&["!done", "=ret=abcd"]);
        assert_eq!(r.kind(), ReplyKind::Done);
        assert_eq!(r.ret(), Some("abcd"));
    }

    #[test]
    fn test_trap_entry() {
        let r = reply(&["!trap", "=category=2", "=message=interrupted", ".tag=5"]);

        let entry = r.trap_entry().unwrap();
        assert_eq!(entry.category, Some(2));
        assert_eq!(entry.kind(), Some(TrapCategory::Interrupted));
        assert_eq!(entry.message, "interrupted");
        assert_eq!(r.tag(), Some(5));
    }

    #[test]
    fn test_trap_without_category() {
        let entry = reply(&["!trap", "=message=no such command"])
            .trap_entry()
            .unwrap();
        assert_eq!(entry.category, None);
        assert_eq!(entry.kind(), None);
    }

    #[test]
    fn test_trap_entry_only_for_traps() {
        assert!(reply(&["!done", "=message=x"]).trap_entry().is_none());
    }

    #[test]
    fn test_fatal_message_from_bare_word() {
        let r = reply(&["!fatal", "session terminated on request"]);
        assert_eq!(r.fatal_message(), "session terminated on request");
    }

    #[test]
    fn test_fatal_message_from_field() {
        let r = reply(&["!fatal", "=message=not logged in"]);
        assert_eq!(r.fatal_message(), "not logged in");
    }

    #[test]
    fn test_dot_attributes_kept_out_of_fields() {
        let r = reply(&["!re", ".section=1", "=name=x", ".tag=3"]);
        assert_eq!(r.attribute("section"), Some("1"));
        assert_eq!(r.attributes().len(), 1);
        assert_eq!(r.get(".section"), None);
        assert_eq!(r.tag(), Some(3));

        let row = r.into_fields();
        assert_eq!(row.len(), 1);
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"name":"x"}"#);
    }

    #[test]
    fn test_trap_display_joins_messages() {
        let trap = Trap::new(vec![
            TrapEntry::from_fields([("message", "first")].into_iter().collect()),
            TrapEntry::from_fields([("message", "second")].into_iter().collect()),
        ]);
        assert_eq!(trap.to_string(), "first; second");
        assert_eq!(trap.message(), "first");
        assert_eq!(Trap::default().to_string(), "unspecified trap");
    }

    #[test]
    fn test_row_serializes_as_ordered_map() {
        let row: Row = [("b", "2"), ("a", "1")].into_iter().collect();
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"b":"2","a":"1"}"#);
    }
}
