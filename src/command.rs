//! Commands and their completion handles.
//!
//! A [`Command`] is the word list of one remote operation. Once written to a
//! channel, its progress arrives on a [`CommandHandle`]:
//! - `Row` - one `!re` row (zero or more)
//! - `Done` - all rows, terminal
//! - `Trap` - the device rejected the command, terminal
//! - `Error` - the connection or channel went away, terminal
//!
//! # Example
//!
//! ```ignore
//! let handle = channel.write("/ip/address/print", Params::new());
//! while let Some(event) = handle.next_event().await {
//!     match event {
//!         CommandEvent::Row(row) => println!("{:?}", row.get("address")),
//!         CommandEvent::Done(rows) => println!("{} rows", rows.len()),
//!         CommandEvent::Trap(trap) => eprintln!("trap: {}", trap),
//!         CommandEvent::Error(failure) => eprintln!("failed: {:?}", failure),
//!     }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;

use crate::error::{ApiError, Failure, Result};
use crate::protocol::{words, Row, Sentence, Trap};

/// Ordered command parameters, sent as `=name=value` words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Create an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add a parameter, replacing an earlier value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Iterate parameters in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Params {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> From<Vec<(K, V)>> for Params {
    fn from(pairs: Vec<(K, V)>) -> Self {
        pairs.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> From<BTreeMap<K, V>> for Params {
    fn from(map: BTreeMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> From<HashMap<K, V>> for Params {
    fn from(map: HashMap<K, V>) -> Self {
        map.into_iter().collect()
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::new()
    }
}

/// Words of one remote operation, without the routing tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    words: Vec<String>,
}

impl Command {
    /// Build a command.
    ///
    /// `operation` is split on newlines: the first line is the command path,
    /// further non-empty lines are sent verbatim (query words such as
    /// `?type=ether`). `params` follow as `=name=value` words.
    pub fn new(operation: &str, params: &Params) -> Self {
        let mut words: Vec<String> = operation
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        words.extend(params.iter().map(|(n, v)| format!("={}={}", n, v)));
        Self { words }
    }

    /// Build a command from raw words.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    /// `/cancel =tag=<id>` for the command running under `tag`.
    pub fn cancel(tag: u32) -> Self {
        Self::from_words([words::CANCEL.to_string(), format!("=tag={}", tag)])
    }

    /// `/quit`.
    pub fn quit() -> Self {
        Self::from_words([words::QUIT])
    }

    /// Command path (first word).
    pub fn operation(&self) -> &str {
        self.words.first().map_or("", String::as_str)
    }

    /// All words.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Sentence to put on the wire, tagged when `tag` is given.
    pub fn to_sentence(&self, tag: Option<u32>) -> Sentence {
        let mut sentence = Sentence::from_words(self.words.iter().cloned());
        if let Some(tag) = tag {
            sentence.push(format!("{}{}", words::TAG_PREFIX, tag));
        }
        sentence
    }
}

/// Notification delivered on a [`CommandHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    /// One `!re` row.
    Row(Row),
    /// `!done`: every row of the command, in order.
    Done(Vec<Row>),
    /// `!trap` entries followed by `!done`.
    Trap(Trap),
    /// Connection-level or channel-level failure.
    Error(Failure),
}

impl CommandEvent {
    /// Check if no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandEvent::Row(_))
    }
}

/// Caller side of a command: receives its notifications.
#[derive(Debug)]
pub struct CommandHandle {
    tag: u32,
    rx: mpsc::UnboundedReceiver<CommandEvent>,
}

impl CommandHandle {
    /// Tag of the channel the command was written to.
    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Next notification, or `None` once the terminal one was delivered
    /// (or the command was dropped).
    pub async fn next_event(&mut self) -> Option<CommandEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next_event`](Self::next_event).
    pub fn try_next_event(&mut self) -> Option<CommandEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the terminal notification and return the rows.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Trap`] if the device rejected the command
    /// - the converted [`Failure`] for connection or channel failures
    /// - [`ApiError::WriteAfterClose`] if the command was dropped because
    ///   the channel was closing
    pub async fn wait(mut self) -> Result<Vec<Row>> {
        while let Some(event) = self.rx.recv().await {
            match event {
                CommandEvent::Row(_) => {}
                CommandEvent::Done(rows) => return Ok(rows),
                CommandEvent::Trap(trap) => return Err(ApiError::Trap(trap)),
                CommandEvent::Error(failure) => return Err(failure.into()),
            }
        }
        Err(ApiError::WriteAfterClose(self.tag))
    }
}

/// Connection side of a command: emits its notifications.
///
/// Sends never block; a dropped handle simply discards them.
#[derive(Debug)]
pub(crate) struct CommandSink {
    tx: mpsc::UnboundedSender<CommandEvent>,
}

impl CommandSink {
    /// Emit a row.
    pub(crate) fn row(&self, row: Row) {
        let _ = self.tx.send(CommandEvent::Row(row));
    }

    /// Emit the terminal `Done`.
    pub(crate) fn done(self, rows: Vec<Row>) {
        let _ = self.tx.send(CommandEvent::Done(rows));
    }

    /// Emit the terminal `Trap`.
    pub(crate) fn trap(self, trap: Trap) {
        let _ = self.tx.send(CommandEvent::Trap(trap));
    }

    /// Emit the terminal `Error`.
    pub(crate) fn fail(self, failure: Failure) {
        let _ = self.tx.send(CommandEvent::Error(failure));
    }
}

/// Create a connected sink/handle pair.
pub(crate) fn command_pair(tag: u32) -> (CommandSink, CommandHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSink { tx }, CommandHandle { tag, rx })
}
