//! FIFO queue of outgoing commands shared between callers and the session worker.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::command::{Command, CommandTag};

/// Commands drained in one write burst.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadyBatch {
    /// Unframed bodies in enqueue order.
    pub payloads: Vec<Vec<u8>>,
    /// At least one drained command asked for a channel list.
    pub expects_channel_list: bool,
}

impl ReadyBatch {
    /// Whether the batch holds no commands.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    commands: VecDeque<Command>,
    /// Set while a connection is ready to carry commands.
    open: bool,
}

/// Thread-safe FIFO of outgoing commands.
///
/// Callers enqueue from any thread; only the session worker drains. The worker
/// opens the queue when a connection becomes ready and closes it when that
/// connection ends, so a command accepted by [`CommandQueue::try_enqueue`] is
/// either sent on the connection it was accepted for or dropped with it.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<Inner>,
    ready: Notify,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded data is a plain deque and a flag; a panicking holder cannot corrupt it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command and wake the worker, whether or not the queue is open.
    pub fn enqueue(&self, cmd: Command) {
        self.lock().commands.push_back(cmd);
        self.ready.notify_one();
    }

    /// Append a command only if the queue is open.
    ///
    /// Returns the command back when no connection is ready for it.
    pub fn try_enqueue(&self, cmd: Command) -> Result<(), Command> {
        {
            let mut inner = self.lock();
            if !inner.open {
                return Err(cmd);
            }
            inner.commands.push_back(cmd);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Start accepting commands for a fresh connection, dropping leftovers.
    pub fn open(&self) -> usize {
        let mut inner = self.lock();
        inner.open = true;
        std::mem::take(&mut inner.commands).len()
    }

    /// Stop accepting commands and drop everything queued.
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.open = false;
        std::mem::take(&mut inner.commands).len()
    }

    /// Whether [`CommandQueue::try_enqueue`] currently accepts commands.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Remove and return every queued command, oldest first.
    pub fn dequeue_all_ready(&self) -> ReadyBatch {
        let drained: Vec<Command> = self.lock().commands.drain(..).collect();

        let mut batch = ReadyBatch {
            payloads: Vec::with_capacity(drained.len()),
            expects_channel_list: false,
        };
        for cmd in drained {
            let (payload, tag) = cmd.into_parts();
            batch.expects_channel_list |= tag == CommandTag::ChannelListRequest;
            batch.payloads.push(payload);
        }
        batch
    }

    /// Drop every queued command, returning how many were dropped.
    pub fn clear(&self) -> usize {
        std::mem::take(&mut self.lock().commands).len()
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.lock().commands.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().commands.is_empty()
    }

    /// Wait until a command has been enqueued since the last wake-up.
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }
}
