//! Connection lifecycle and dispatch loop.
//!
//! [`Connection::connect`] manages the lifecycle:
//! 1. Open the TCP (optionally TLS) stream
//! 2. Spawn the writer task
//! 3. Run the login handshake
//! 4. Spawn the dispatch task, which reads sentences, classifies them and
//!    routes them through the channel multiplexer
//!
//! Handles ([`Connection`], [`Channel`]) talk to the dispatch task over a
//! control queue. Once every handle is dropped the connection closes
//! gracefully.
//!
//! # Example
//!
//! ```ignore
//! use apiwire_client::{Config, Params};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Config::new("192.168.88.1").connect("admin", "").await?;
//!
//!     let rows = connection
//!         .write("/ip/address/print", Params::new())
//!         .await?
//!         .wait()
//!         .await?;
//!     for row in rows {
//!         println!("{:?}", row.get("address"));
//!     }
//!
//!     connection.close(false).await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, trace};

use crate::auth::{Handshake, Step};
use crate::channel::multiplexer::{Flow, Multiplexer};
use crate::channel::{Channel, ChannelOptions, ChannelStatus, Control};
use crate::command::{CommandHandle, Params};
use crate::config::Config;
use crate::error::{ApiError, Failure, Result};
use crate::protocol::{classify, Sentence, SentenceBuffer};
use crate::transport::connect_tcp;
use crate::writer::{spawn_writer_task, WriterHandle};

#[cfg(feature = "tls")]
use crate::transport::connect_tls;

/// Read buffer size for the socket.
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Open,
    Closed(Option<Failure>),
}

/// A logged-in connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<ConnectionState>,
    writer: WriterHandle,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &*self.state.borrow())
            .field("pending_writes", &self.writer.pending_count())
            .finish()
    }
}

impl Connection {
    /// Connect to the configured device and log in.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Timeout`] or [`ApiError::Io`] if the socket cannot be opened
    /// - [`ApiError::Tls`] if the TLS handshake fails
    /// - [`ApiError::Auth`] if the device rejects the login
    pub async fn connect(config: Config, username: &str, password: &str) -> Result<Self> {
        let stream = connect_tcp(&config.host, config.port(), config.connect_timeout()).await?;

        #[cfg(feature = "tls")]
        if let Some(tls) = &config.tls {
            let stream = connect_tls(stream, &config.host, tls, config.connect_timeout()).await?;
            return Self::from_stream(stream, config, username, password).await;
        }

        Self::from_stream(stream, config, username, password).await
    }

    /// Log in over an already established stream.
    ///
    /// The login must finish within the configured timeout.
    pub async fn from_stream<S>(
        stream: S,
        config: Config,
        username: &str,
        password: &str,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let mut buffer = SentenceBuffer::with_max_word_size(config.max_word_size);

        let handshake = Handshake::new(config.login_method, username, password);
        let handshake = login(&mut reader, &mut buffer, &writer, handshake);
        let leftover = match timeout(config.connect_timeout(), handshake).await {
            Ok(Ok(leftover)) => leftover,
            Ok(Err(e)) => {
                writer_task.abort();
                return Err(e);
            }
            Err(_) => {
                writer_task.abort();
                return Err(ApiError::Timeout("login".into()));
            }
        };
        debug!(host = %config.host, username, "Logged in");

        let (control, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Open);

        let dispatcher = Dispatcher {
            reader,
            buffer,
            mux: Multiplexer::new(config.close_on_done),
            writer: writer.clone(),
            control_rx,
            idle_timeout: config.idle_timeout(),
        };
        tokio::spawn(dispatcher.run(leftover, state_tx, writer_task));

        Ok(Self {
            control,
            state,
            writer,
        })
    }

    /// Open a channel; `None` picks the smallest free tag.
    ///
    /// # Errors
    ///
    /// [`ApiError::DuplicateChannel`] if the tag is in use,
    /// [`ApiError::ConnectionClosed`] if the connection is closing.
    pub async fn open_channel(&self, tag: Option<u32>) -> Result<Channel> {
        let options = ChannelOptions {
            tag,
            ..ChannelOptions::default()
        };
        self.open_channel_with(options).await
    }

    /// Open a channel with options.
    pub async fn open_channel_with(&self, options: ChannelOptions) -> Result<Channel> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Open { options, reply })
            .map_err(|_| ApiError::ConnectionClosed)?;
        let id = rx.await.map_err(|_| ApiError::ConnectionClosed)??;
        Ok(Channel::new(id, self.control.clone()))
    }

    /// Run one command on a fresh channel that closes when it is done.
    pub async fn write(&self, operation: &str, params: impl Into<Params>) -> Result<CommandHandle> {
        let channel = self
            .open_channel_with(ChannelOptions::new().close_on_done(true))
            .await?;
        Ok(channel.write(operation, params))
    }

    /// Send `/quit` once the last channel closed.
    pub fn set_close_on_done(&self, value: bool) -> Result<()> {
        self.control
            .send(Control::SetCloseOnDone(value))
            .map_err(|_| ApiError::ConnectionClosed)
    }

    /// Close every channel, log out and wait for the connection to end.
    ///
    /// Without `force` running and queued commands finish first; with
    /// `force` they are cancelled.
    pub async fn close(&self, force: bool) -> Result<()> {
        if self.control.send(Control::CloseAll { force }).is_err() {
            trace!("Close on finished connection");
        }
        self.wait_closed().await
    }

    /// Wait until the connection ended.
    ///
    /// Returns the failure that ended it, or `Ok` after a graceful close.
    pub async fn wait_closed(&self) -> Result<()> {
        let mut state = self.state.clone();
        let outcome = match state.wait_for(|s| matches!(s, ConnectionState::Closed(_))).await {
            Ok(closed) => match &*closed {
                ConnectionState::Closed(Some(failure)) => Some(failure.clone()),
                _ => None,
            },
            Err(_) => Some(Failure::Closed),
        };
        match outcome {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    /// Check if the connection ended.
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Closed(_))
    }

    /// Sentences queued but not yet written to the socket.
    pub fn pending_writes(&self) -> usize {
        self.writer.pending_count()
    }
}

/// Drive the handshake until it finished.
///
/// Returns sentences that arrived after the login completed in the same read.
async fn login<R>(
    reader: &mut R,
    buffer: &mut SentenceBuffer,
    writer: &WriterHandle,
    mut handshake: Handshake,
) -> Result<Vec<Sentence>>
where
    R: AsyncRead + Unpin,
{
    writer.send_sentence(&handshake.start()).await?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(handshake.interrupted().into());
        }

        let mut sentences = buffer.push(&buf[..n])?.into_iter();
        while let Some(sentence) = sentences.next() {
            let reply = classify(&sentence)?;
            match handshake.on_reply(&reply) {
                Step::Send(next) => writer.send_sentence(&next).await?,
                Step::Pending => {}
                Step::Connected => return Ok(sentences.collect()),
                Step::Failed(e) => return Err(e.into()),
            }
        }
    }
}

/// Single reader of the socket and sole owner of the channel table.
struct Dispatcher<R> {
    reader: R,
    buffer: SentenceBuffer,
    mux: Multiplexer,
    writer: WriterHandle,
    control_rx: mpsc::UnboundedReceiver<Control>,
    idle_timeout: Option<Duration>,
}

impl<R> Dispatcher<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(
        mut self,
        leftover: Vec<Sentence>,
        state: watch::Sender<ConnectionState>,
        writer_task: JoinHandle<Result<()>>,
    ) {
        let failure = self.run_loop(leftover).await.err();
        match &failure {
            Some(failure) => error!(?failure, "Connection failed"),
            None => debug!("Connection closed"),
        }

        self.mux.fail_all(failure.as_ref().unwrap_or(&Failure::Closed));
        self.reject_pending_controls();

        state.send_replace(ConnectionState::Closed(failure));
        writer_task.abort();
    }

    async fn run_loop(&mut self, leftover: Vec<Sentence>) -> std::result::Result<(), Failure> {
        if let Flow::Shutdown(outcome) = self.process(leftover)? {
            return outcome.map_or(Ok(()), Err);
        }
        self.flush().await?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut control_open = true;
        let mut deadline = self.idle_timeout.map(|idle| Instant::now() + idle);

        loop {
            // Requests queued before a reply are applied before that reply.
            tokio::select! {
                biased;

                request = self.control_rx.recv(), if control_open => {
                    match request {
                        Some(request) => self.handle_control(request),
                        None => {
                            debug!("All handles dropped, closing");
                            control_open = false;
                            self.mux.close_all(false);
                        }
                    }
                }
                read = read_chunk(&mut self.reader, &mut buf, deadline) => {
                    let n = read?;
                    if n == 0 {
                        if self.mux.quit_sent() {
                            return Ok(());
                        }
                        return Err(Failure::Transport("connection closed by peer".into()));
                    }
                    deadline = self.idle_timeout.map(|idle| Instant::now() + idle);

                    let sentences = self.buffer.push(&buf[..n]).map_err(|e| Failure::from(&e))?;
                    if let Flow::Shutdown(outcome) = self.process(sentences)? {
                        return outcome.map_or(Ok(()), Err);
                    }
                }
            }

            self.flush().await?;
        }
    }

    fn process(&mut self, sentences: Vec<Sentence>) -> std::result::Result<Flow, Failure> {
        for sentence in sentences {
            trace!(words = ?sentence.words(), "Inbound sentence");
            let reply = classify(&sentence).map_err(|e| Failure::from(&e))?;
            if let Flow::Shutdown(outcome) = self.mux.handle_reply(reply) {
                return Ok(Flow::Shutdown(outcome));
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_control(&mut self, request: Control) {
        match request {
            Control::Open { options, reply } => {
                let _ = reply.send(self.mux.open_channel(&options));
            }
            Control::Write { id, command, sink } => self.mux.write(id, command, sink),
            Control::Close { id, force, reply } => self.mux.close_channel(id, force, Some(reply)),
            Control::CloseAll { force } => self.mux.close_all(force),
            Control::SetCloseOnDone(value) => self.mux.set_close_on_done(value),
            Control::Status { id, reply } => {
                let _ = reply.send(self.mux.status(id));
            }
        }
    }

    async fn flush(&mut self) -> std::result::Result<(), Failure> {
        for sentence in self.mux.drain_outbox() {
            trace!(words = ?sentence.words(), "Outbound sentence");
            self.writer
                .send_sentence(&sentence)
                .await
                .map_err(|e| Failure::from(&e))?;
        }
        Ok(())
    }

    /// Answer requests that raced with the shutdown.
    fn reject_pending_controls(&mut self) {
        self.control_rx.close();
        while let Ok(request) = self.control_rx.try_recv() {
            match request {
                Control::Open { reply, .. } => {
                    let _ = reply.send(Err(ApiError::ConnectionClosed));
                }
                Control::Write { sink, .. } => sink.fail(Failure::Closed),
                Control::Close { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                Control::Status { reply, .. } => {
                    let _ = reply.send(ChannelStatus::Closed);
                }
                Control::CloseAll { .. } | Control::SetCloseOnDone(_) => {}
            }
        }
    }
}

/// Read one chunk, failing when nothing arrives before `deadline`.
async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> std::result::Result<usize, Failure>
where
    R: AsyncRead + Unpin,
{
    let read = reader.read(buf);
    let result = match deadline {
        Some(deadline) => timeout_at(deadline, read)
            .await
            .map_err(|_| Failure::Transport("read timed out".into()))?,
        None => read.await,
    };
    result.map_err(|e| Failure::Transport(e.to_string()))
}
