//! Channels: independently sequenced command streams sharing one connection.
//!
//! A [`Channel`] is a lightweight handle. All channel state lives in the
//! connection's dispatch task ([`multiplexer`]); the handle only sends
//! [`Control`] messages to it, so writing never blocks.
//!
//! # Example
//!
//! ```ignore
//! let channel = connection.open_channel(None).await?;
//!
//! let first = channel.write("/interface/print", ());
//! let second = channel.write("/ip/route/print", Params::new().with(".proplist", "dst-address"));
//!
//! // `second` goes on the wire only after `first` is done
//! let interfaces = first.wait().await?;
//! let routes = second.wait().await?;
//!
//! channel.close(false).await?;
//! ```

pub(crate) mod multiplexer;

use tokio::sync::{mpsc, oneshot};

use crate::command::{command_pair, Command, CommandHandle, CommandSink, Params};
use crate::error::{Failure, Result};

/// Options for opening a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Requested tag; `None` picks the smallest free one. Tag 0 is rejected.
    pub tag: Option<u32>,
    /// Close the channel once it is idle with nothing queued.
    pub close_on_done: bool,
    /// Close the channel after a command trapped, failing the queue.
    pub close_on_trap: bool,
}

impl ChannelOptions {
    /// Default options: auto tag, stay open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options requesting a specific tag.
    pub fn with_tag(tag: u32) -> Self {
        Self {
            tag: Some(tag),
            ..Self::default()
        }
    }

    /// Set the requested tag.
    pub fn tag(mut self, tag: u32) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Set close-on-done.
    pub fn close_on_done(mut self, value: bool) -> Self {
        self.close_on_done = value;
        self
    }

    /// Set close-on-trap.
    pub fn close_on_trap(mut self, value: bool) -> Self {
        self.close_on_trap = value;
        self
    }
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Idle, accepting commands.
    Open,
    /// A command is on the wire.
    Running,
    /// Close requested; waiting for the running command to finish.
    Closing,
    /// Removed from the connection.
    Closed,
}

/// Identity of one opened channel.
///
/// Tags are reused once a channel is removed; serials never are, so a
/// handle of a closed channel cannot reach a later channel with its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChannelId {
    pub(crate) tag: u32,
    pub(crate) serial: u64,
}

/// Requests from handles to the dispatch task.
#[derive(Debug)]
pub(crate) enum Control {
    Open {
        options: ChannelOptions,
        reply: oneshot::Sender<Result<ChannelId>>,
    },
    Write {
        id: ChannelId,
        command: Command,
        sink: CommandSink,
    },
    Close {
        id: ChannelId,
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseAll {
        force: bool,
    },
    SetCloseOnDone(bool),
    Status {
        id: ChannelId,
        reply: oneshot::Sender<ChannelStatus>,
    },
}

/// Handle to one open channel.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    control: mpsc::UnboundedSender<Control>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, control: mpsc::UnboundedSender<Control>) -> Self {
        Self { id, control }
    }

    /// Tag carried by every command of this channel.
    #[inline]
    pub fn tag(&self) -> u32 {
        self.id.tag
    }

    /// Write a command.
    ///
    /// `operation` is the command path; extra lines are sent as raw words.
    /// The command is sent at once if the channel is idle, otherwise it is
    /// queued behind the running one. Once the channel is closing or closed
    /// the command is dropped and [`CommandHandle::wait`] reports
    /// `WriteAfterClose`.
    pub fn write(&self, operation: &str, params: impl Into<Params>) -> CommandHandle {
        self.write_command(Command::new(operation, &params.into()))
    }

    /// Write a prepared command.
    pub fn write_command(&self, command: Command) -> CommandHandle {
        let (sink, handle) = command_pair(self.id.tag);
        let request = Control::Write {
            id: self.id,
            command,
            sink,
        };
        if let Err(mpsc::error::SendError(Control::Write { sink, .. })) = self.control.send(request)
        {
            sink.fail(Failure::Closed);
        }
        handle
    }

    /// Close the channel and wait until it is closed.
    ///
    /// Without `force` the running command and the queue finish first. With
    /// `force` the running command is cancelled on the device and queued
    /// commands fail with `ChannelClosed`.
    ///
    /// # Errors
    ///
    /// [`ApiError::UnknownChannel`](crate::ApiError::UnknownChannel) if this
    /// channel was already closed.
    pub async fn close(&self, force: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let request = Control::Close {
            id: self.id,
            force,
            reply,
        };
        if self.control.send(request).is_err() {
            // connection already gone
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> ChannelStatus {
        let (reply, rx) = oneshot::channel();
        if self
            .control
            .send(Control::Status {
                id: self.id,
                reply,
            })
            .is_err()
        {
            return ChannelStatus::Closed;
        }
        rx.await.unwrap_or(ChannelStatus::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandEvent;

    fn id(tag: u32) -> ChannelId {
        ChannelId { tag, serial: 1 }
    }

    #[test]
    fn test_options_builder() {
        let options = ChannelOptions::new()
            .tag(7)
            .close_on_done(true)
            .close_on_trap(true);

        assert_eq!(options.tag, Some(7));
        assert!(options.close_on_done);
        assert!(options.close_on_trap);
        assert_eq!(ChannelOptions::with_tag(3).tag, Some(3));
    }

    #[tokio::test]
    async fn test_write_sends_control() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Channel::new(id(4), tx);

        let handle = channel.write("/ip/address/print", [("interface", "ether1")]);
        assert_eq!(handle.tag(), 4);

        let Some(Control::Write { id: sent, command, .. }) = rx.recv().await else {
            panic!("expected write");
        };
        assert_eq!(sent, id(4));
        assert_eq!(command.words(), ["/ip/address/print", "=interface=ether1"]);
    }

    #[tokio::test]
    async fn test_write_on_dead_connection_fails_handle() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = Channel::new(id(1), tx);

        let mut handle = channel.write("/x", ());
        assert_eq!(
            handle.next_event().await,
            Some(CommandEvent::Error(Failure::Closed))
        );
    }

    #[tokio::test]
    async fn test_close_on_dead_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = Channel::new(id(1), tx);

        assert!(channel.close(true).await.is_ok());
        assert_eq!(channel.status().await, ChannelStatus::Closed);
    }
}
