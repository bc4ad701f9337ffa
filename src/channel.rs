//! In-process queue between transport callbacks and the ingestion consumer
//!
//! Producers call [`MessageChannel::try_write`], which never waits: an
//! unbounded channel always accepts, a bounded one reports `false` when full
//! and the caller drops the message. Consumers either suspend on
//! [`MessageChannel::recv`] (continuous mode) or pop with
//! [`MessageChannel::try_read`] until empty (batch mode).
//!
//! FIFO order holds per producer; there is no ordering across producers.

use crate::identity::InboundMessage;
use futures::Stream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

enum Sender {
    Bounded(mpsc::Sender<InboundMessage>),
    Unbounded(mpsc::UnboundedSender<InboundMessage>),
}

enum Receiver {
    Bounded(mpsc::Receiver<InboundMessage>),
    Unbounded(mpsc::UnboundedReceiver<InboundMessage>),
}

impl Receiver {
    fn try_recv(&mut self) -> Option<InboundMessage> {
        match self {
            Receiver::Bounded(rx) => rx.try_recv().ok(),
            Receiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        match self {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Process-wide message queue
pub struct MessageChannel {
    sender: Sender,
    receiver: Mutex<Receiver>,
    capacity: Option<usize>,
    closed: CancellationToken,
    written: AtomicU64,
    dropped: AtomicU64,
    read: AtomicU64,
}

impl MessageChannel {
    /// Channel that never rejects a write; memory is the only bound
    pub fn unbounded() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::from_parts(Sender::Unbounded(tx), Receiver::Unbounded(rx), None)
    }

    /// Channel holding at most `capacity` messages (minimum 1)
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self::from_parts(Sender::Bounded(tx), Receiver::Bounded(rx), Some(capacity))
    }

    /// `None` = unbounded
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Self::unbounded(),
        }
    }

    fn from_parts(sender: Sender, receiver: Receiver, capacity: Option<usize>) -> Self {
        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
            closed: CancellationToken::new(),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            read: AtomicU64::new(0),
        }
    }

    /// Non-blocking push; `false` when the channel is full or closed
    pub fn try_write(&self, message: InboundMessage) -> bool {
        if self.closed.is_cancelled() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let accepted = match &self.sender {
            Sender::Bounded(tx) => tx.try_send(message).is_ok(),
            Sender::Unbounded(tx) => tx.send(message).is_ok(),
        };

        if accepted {
            self.written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Non-blocking pop; `None` when nothing is queued right now
    ///
    /// Also returns `None` while another consumer holds the receiver.
    pub fn try_read(&self) -> Option<InboundMessage> {
        let mut receiver = self.receiver.try_lock().ok()?;
        let message = receiver.try_recv();
        if message.is_some() {
            self.read.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    /// Wait for the next message
    ///
    /// Returns `None` once `cancel` fires, or once the channel is closed and
    /// everything queued before the close has been read.
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<InboundMessage> {
        let mut receiver = tokio::select! {
            guard = self.receiver.lock() => guard,
            _ = cancel.cancelled() => return None,
        };

        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            message = receiver.recv() => message,
            _ = self.closed.cancelled() => receiver.try_recv(),
        };

        if message.is_some() {
            self.read.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    /// Continuous consumption as a stream; ends on cancel or drained close
    pub fn stream(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = InboundMessage> + Send {
        futures::stream::unfold((self, cancel), |(channel, cancel)| async move {
            let message = channel.recv(&cancel).await?;
            Some((message, (channel, cancel)))
        })
    }

    /// Stop accepting writes; queued messages stay readable
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Messages currently queued
    pub fn len(&self) -> usize {
        let written = self.written.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Relaxed);
        written.saturating_sub(read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Total accepted writes
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Total rejected writes (full or closed)
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
