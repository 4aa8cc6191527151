//! Dedicated writer task for outbound sentences.
//!
//! Every outbound sentence goes through one writer task that owns the write
//! half of the socket. A sentence is encoded into one contiguous buffer
//! before it is queued, so two sentences can never interleave on the wire.
//!
//! # Architecture
//!
//! ```text
//! Handshake  ─┐
//! Dispatcher ─┴─► mpsc::Sender<OutboundSentence> ─► Writer Task ─► Socket
//! ```
//!
//! Ready sentences are batched into a single `write_vectored` call, and a
//! pending counter provides backpressure when the socket cannot keep up.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ApiError, Result};
use crate::protocol::Sentence;

/// Default maximum pending sentences before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_SENTENCES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum sentences to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded sentence, terminator included.
#[derive(Debug, Clone)]
pub struct OutboundSentence {
    bytes: Bytes,
}

impl OutboundSentence {
    /// Encode a sentence for the writer.
    ///
    /// # Errors
    ///
    /// Fails if a word is too long to encode.
    pub fn encode(sentence: &Sentence) -> Result<Self> {
        Ok(Self {
            bytes: sentence.encode()?,
        })
    }

    /// Encoded bytes.
    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Encoded size.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending sentences before backpressure kicks in.
    pub max_pending_sentences: usize,
    /// Channel capacity for the sentence queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_sentences: DEFAULT_MAX_PENDING_SENTENCES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending sentences to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundSentence>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundSentence>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send an encoded sentence to the writer task.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, sentence: OutboundSentence) -> Result<()> {
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(sentence).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            ApiError::ConnectionClosed
        })
    }

    /// Encode and send a sentence.
    pub async fn send_sentence(&self, sentence: &Sentence) -> Result<()> {
        self.send(OutboundSentence::encode(sentence)?).await
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(ApiError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Number of sentences queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending sentences.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, after
/// writing what is still queued, and shuts the write half down.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_sentences,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundSentence>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(s) => s,
            None => {
                // All handles dropped
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(sentence) => batch.push(sentence),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        if let Err(e) = result {
            tracing::error!("Writer error: {}", e);
            return Err(e);
        }
    }
}

/// Write a batch of sentences using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundSentence]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch.iter().map(|s| IoSlice::new(&s.bytes)).collect();
    let total_size: usize = batch.iter().map(OutboundSentence::size).sum();

    let mut total_written = writer.write_vectored(&slices).await?;

    // Partial write: continue with what is left
    while total_written < total_size {
        if total_written == 0 {
            return Err(write_zero());
        }

        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(write_zero());
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> ApiError {
    ApiError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundSentence], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for sentence in batch {
        let end = offset + sentence.size();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&sentence.bytes[start..]));
        }
        offset = end;
    }

    slices
}
