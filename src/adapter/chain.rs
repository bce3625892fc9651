//! Assembled pipeline head.
//!
//! [`Chain`] owns the outermost stage, re-injects loopback messages
//! downward through an explicit work queue, and hands every other
//! notification to the application sink.

use super::{Adapter, AdapterContext, OutHandler};
use crate::error::Result;
use crate::message::Message;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// The application-facing end of an adapter chain.
pub struct Chain {
    outer: Arc<dyn Adapter>,
    /// Loopbacks waiting to be re-injected.
    queue: Mutex<VecDeque<Message>>,
    /// Held by whichever thread is currently dispatching downward; queued
    /// loopbacks are drained by the holder, so continuation never recurses.
    dispatch: Mutex<()>,
    sink: RwLock<Option<OutHandler>>,
}

impl Chain {
    /// Take ownership of the outermost stage and wire its notifications.
    pub fn new(outer: Arc<dyn Adapter>) -> Arc<Self> {
        let chain = Arc::new(Self {
            outer: outer.clone(),
            queue: Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(()),
            sink: RwLock::new(None),
        });

        let weak = Arc::downgrade(&chain);
        outer.set_out_handler(Box::new(move |message| {
            if let Some(chain) = weak.upgrade() {
                chain.on_out(message);
            }
        }));

        chain
    }

    pub fn context(&self) -> &AdapterContext {
        self.outer.context()
    }

    /// Submit a command, then drain any loopback continuations it produced.
    pub fn send_in(&self, message: Message) -> Result<()> {
        let result = {
            let _guard = self.dispatch.lock();
            self.outer.send_in(message)
        };
        self.drain();
        result
    }

    /// Register the application notification sink.
    pub fn set_sink(&self, sink: OutHandler) {
        *self.sink.write() = Some(sink);
    }

    /// Convenience sink: a bounded channel handle.
    ///
    /// Notifications that would overflow the buffer are dropped with a
    /// warning; size the buffer for the consumer's worst lag.
    pub fn events(&self, buffer: usize) -> ChainEvents {
        let (sender, receiver) = bounded(buffer);
        self.set_sink(Box::new(move |message| {
            if sender.try_send(message).is_err() {
                tracing::warn!("chain event buffer full, notification dropped");
            }
        }));
        ChainEvents { receiver }
    }

    fn on_out(&self, message: Message) {
        if message.is_loopback() {
            self.queue.lock().push_back(message);
            // No-op while a send_in further up the stack holds the
            // dispatch lock; that holder drains afterwards.
            self.drain();
        } else if let Some(sink) = &*self.sink.read() {
            sink(message);
        }
    }

    fn drain(&self) {
        loop {
            let Some(_guard) = self.dispatch.try_lock() else {
                return;
            };
            let Some(message) = self.queue.lock().pop_front() else {
                return;
            };
            // The failing stage already published its error reply.
            if let Err(err) = self.outer.send_in(message) {
                tracing::error!(error = %err, "loopback continuation failed");
            }
        }
    }
}

/// Receiving side of the chain's notification stream.
pub struct ChainEvents {
    receiver: Receiver<Message>,
}

impl ChainEvents {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> std::result::Result<Message, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Message, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Message, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<Message> {
        self.receiver.try_iter().collect()
    }
}
