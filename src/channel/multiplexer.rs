//! Channel multiplexer.
//!
//! Synchronous state machine owned by the connection's dispatch task. It
//! keeps the channel table, routes classified replies by tag, and collects
//! outbound sentences in an outbox that the dispatcher flushes to the
//! writer after every step.
//!
//! Per channel at most one command is on the wire; later commands wait in
//! a FIFO queue until the running one receives its terminal `!done`.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{ChannelId, ChannelOptions, ChannelStatus};
use crate::command::{Command, CommandSink};
use crate::error::{ApiError, Failure, Result};
use crate::protocol::{Reply, ReplyKind, Row, Sentence, Trap, TrapEntry};

/// What the dispatcher should do after a reply was handled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Keep reading.
    Continue,
    /// Stop the connection; `None` means a graceful end.
    Shutdown(Option<Failure>),
}

struct Pending {
    command: Command,
    sink: CommandSink,
}

struct Running {
    sink: CommandSink,
    rows: Vec<Row>,
    traps: Vec<TrapEntry>,
    cancelled: bool,
}

struct ChannelState {
    serial: u64,
    queue: VecDeque<Pending>,
    running: Option<Running>,
    close_on_done: bool,
    close_on_trap: bool,
    close_requested: bool,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ChannelState {
    fn new(options: &ChannelOptions, serial: u64) -> Self {
        Self {
            serial,
            queue: VecDeque::new(),
            running: None,
            close_on_done: options.close_on_done,
            close_on_trap: options.close_on_trap,
            close_requested: false,
            waiters: Vec::new(),
        }
    }

    fn status(&self) -> ChannelStatus {
        if self.close_requested {
            ChannelStatus::Closing
        } else if self.running.is_some() {
            ChannelStatus::Running
        } else {
            ChannelStatus::Open
        }
    }

    fn fail_queue(&mut self, failure: &Failure) {
        for pending in self.queue.drain(..) {
            pending.sink.fail(failure.clone());
        }
    }
}

/// Channel table plus outbox.
pub(crate) struct Multiplexer {
    channels: HashMap<u32, ChannelState>,
    next_serial: u64,
    outbox: Vec<Sentence>,
    close_on_done: bool,
    closing: bool,
    quit_sent: bool,
    cancel_acks: usize,
}

impl Multiplexer {
    pub(crate) fn new(close_on_done: bool) -> Self {
        Self {
            channels: HashMap::new(),
            next_serial: 1,
            outbox: Vec::new(),
            close_on_done,
            closing: false,
            quit_sent: false,
            cancel_acks: 0,
        }
    }

    /// Open a channel, assigning the smallest free tag when none is given.
    pub(crate) fn open_channel(&mut self, options: &ChannelOptions) -> Result<ChannelId> {
        if self.closing || self.quit_sent {
            return Err(ApiError::ConnectionClosed);
        }

        let tag = match options.tag {
            Some(0) => return Err(ApiError::InvalidTag),
            Some(tag) if self.channels.contains_key(&tag) => {
                return Err(ApiError::DuplicateChannel(tag));
            }
            Some(tag) => tag,
            None => self.next_free_tag(),
        };

        let serial = self.next_serial;
        self.next_serial += 1;
        self.channels.insert(tag, ChannelState::new(options, serial));
        debug!(tag, serial, "Channel opened");
        Ok(ChannelId { tag, serial })
    }

    /// Check that the channel `id` names was not removed since.
    fn is_current(&self, id: ChannelId) -> bool {
        self.channels
            .get(&id.tag)
            .is_some_and(|channel| channel.serial == id.serial)
    }

    fn next_free_tag(&self) -> u32 {
        let mut tag = 1;
        while self.channels.contains_key(&tag) {
            tag += 1;
        }
        tag
    }

    /// Submit a command on a channel.
    ///
    /// Writes to a closing or removed channel are dropped; the handle then
    /// ends without events.
    pub(crate) fn write(&mut self, id: ChannelId, command: Command, sink: CommandSink) {
        let tag = id.tag;
        let Some(channel) = self
            .channels
            .get_mut(&tag)
            .filter(|channel| channel.serial == id.serial && !channel.close_requested)
        else {
            warn!(tag, operation = command.operation(), "Write after close dropped");
            drop(sink);
            return;
        };

        if channel.running.is_some() {
            trace!(tag, operation = command.operation(), "Command queued");
            channel.queue.push_back(Pending { command, sink });
            return;
        }

        Self::dispatch(&mut self.outbox, tag, channel, Pending { command, sink });
    }

    fn dispatch(outbox: &mut Vec<Sentence>, tag: u32, channel: &mut ChannelState, pending: Pending) {
        trace!(tag, operation = pending.command.operation(), "Command dispatched");
        outbox.push(pending.command.to_sentence(Some(tag)));
        channel.running = Some(Running {
            sink: pending.sink,
            rows: Vec::new(),
            traps: Vec::new(),
            cancelled: false,
        });
    }

    /// Request a channel close.
    ///
    /// `waiter` resolves once the channel is actually removed. A forced close
    /// cancels the running command and fails the queued ones; otherwise the
    /// queue drains first.
    pub(crate) fn close_channel(
        &mut self,
        id: ChannelId,
        force: bool,
        waiter: Option<oneshot::Sender<Result<()>>>,
    ) {
        if !self.is_current(id) {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(ApiError::UnknownChannel(id.tag)));
            }
            return;
        }
        self.close_tag(id.tag, force, waiter);
    }

    fn close_tag(&mut self, tag: u32, force: bool, waiter: Option<oneshot::Sender<Result<()>>>) {
        let Some(channel) = self.channels.get_mut(&tag) else {
            return;
        };

        channel.close_requested = true;
        channel.waiters.extend(waiter);

        if force {
            channel.fail_queue(&Failure::ChannelClosed(tag));
            if let Some(running) = channel.running.as_mut() {
                if !running.cancelled {
                    debug!(tag, "Cancelling running command");
                    running.cancelled = true;
                    self.cancel_acks += 1;
                    self.outbox.push(Command::cancel(tag).to_sentence(None));
                }
            }
        }

        if channel.running.is_none() {
            self.finalize_close(tag);
        } else {
            debug!(tag, force, "Channel close deferred");
        }
    }

    /// Close every channel, then send `/quit`.
    pub(crate) fn close_all(&mut self, force: bool) {
        self.closing = true;
        let mut tags: Vec<u32> = self.channels.keys().copied().collect();
        tags.sort_unstable();
        for tag in tags {
            self.close_tag(tag, force, None);
        }
        self.maybe_quit();
    }

    /// Change the connection-level close-on-done flag.
    pub(crate) fn set_close_on_done(&mut self, value: bool) {
        self.close_on_done = value;
    }

    /// Route one classified reply.
    pub(crate) fn handle_reply(&mut self, reply: Reply) -> Flow {
        match reply.kind() {
            ReplyKind::Fatal => {
                let message = reply.fatal_message();
                if self.quit_sent {
                    debug!(%message, "Connection closed after quit");
                    return Flow::Shutdown(None);
                }
                return Flow::Shutdown(Some(Failure::Fatal(message)));
            }
            ReplyKind::Empty => return Flow::Continue,
            _ => {}
        }

        let Some(tag) = reply.tag() else {
            self.handle_untagged(&reply);
            return Flow::Continue;
        };

        let Some(running) = self
            .channels
            .get_mut(&tag)
            .and_then(|channel| channel.running.as_mut())
        else {
            warn!(tag, kind = ?reply.kind(), "Reply for idle or unknown channel dropped");
            return Flow::Continue;
        };

        match reply.kind() {
            ReplyKind::Row => {
                let row = reply.into_fields();
                running.rows.push(row.clone());
                running.sink.row(row);
            }
            ReplyKind::Trap => {
                if let Some(entry) = reply.trap_entry() {
                    debug!(tag, message = %entry.message, "Command trap");
                    running.traps.push(entry);
                }
            }
            ReplyKind::Done => self.finish_command(tag),
            ReplyKind::Fatal | ReplyKind::Empty => {}
        }

        Flow::Continue
    }

    fn handle_untagged(&mut self, reply: &Reply) {
        match reply.kind() {
            ReplyKind::Done if self.cancel_acks > 0 => {
                self.cancel_acks -= 1;
                trace!("Cancel acknowledged");
            }
            ReplyKind::Trap => {
                let message = reply.get("message").unwrap_or_default();
                warn!(%message, "Untagged trap dropped");
            }
            kind => warn!(?kind, "Untagged reply dropped"),
        }
    }

    fn finish_command(&mut self, tag: u32) {
        let Some(channel) = self.channels.get_mut(&tag) else {
            return;
        };
        let Some(running) = channel.running.take() else {
            return;
        };

        let trapped = !running.traps.is_empty();
        if trapped {
            running.sink.trap(Trap::new(running.traps));
        } else {
            running.sink.done(running.rows);
        }

        if trapped && channel.close_on_trap {
            channel.close_requested = true;
            channel.fail_queue(&Failure::ChannelClosed(tag));
        }

        if let Some(next) = channel.queue.pop_front() {
            Self::dispatch(&mut self.outbox, tag, channel, next);
            return;
        }

        if channel.close_requested || channel.close_on_done {
            self.finalize_close(tag);
        }
    }

    fn finalize_close(&mut self, tag: u32) {
        if let Some(channel) = self.channels.remove(&tag) {
            for waiter in channel.waiters {
                let _ = waiter.send(Ok(()));
            }
            debug!(tag, "Channel closed");
        }
        self.maybe_quit();
    }

    fn maybe_quit(&mut self) {
        if self.quit_sent || !self.channels.is_empty() {
            return;
        }
        if self.closing || self.close_on_done {
            debug!("No channels left, sending quit");
            self.closing = true;
            self.quit_sent = true;
            self.outbox.push(Command::quit().to_sentence(None));
        }
    }

    /// Fail every running and queued command and drop all channels.
    pub(crate) fn fail_all(&mut self, failure: &Failure) {
        for (tag, mut channel) in self.channels.drain() {
            if let Some(running) = channel.running.take() {
                running.sink.fail(failure.clone());
            }
            channel.fail_queue(failure);
            for waiter in channel.waiters {
                let _ = waiter.send(Ok(()));
            }
            trace!(tag, "Channel dropped");
        }
        self.closing = true;
    }

    /// Take the sentences produced since the last call.
    pub(crate) fn drain_outbox(&mut self) -> Vec<Sentence> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn status(&self, id: ChannelId) -> ChannelStatus {
        if !self.is_current(id) {
            return ChannelStatus::Closed;
        }
        self.channels
            .get(&id.tag)
            .map_or(ChannelStatus::Closed, ChannelState::status)
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn quit_sent(&self) -> bool {
        self.quit_sent
    }

    #[cfg(test)]
    fn queued(&self, id: ChannelId) -> usize {
        self.channels.get(&id.tag).map_or(0, |c| c.queue.len())
    }
}
