//! Historical-range splitter stage.
//!
//! Many venues cap how much history a single request may cover. This stage
//! presents an unbounded `[from, to)` (or open-ended "from X onward")
//! subscription to the application while issuing a bounded sequence of
//! sub-requests to the inner chain, one at a time, driven forward by
//! self-addressed continuation messages.

use crate::adapter::{Adapter, AdapterContext, AdapterCore, Wrapper};
use crate::error::{AdapterError, Result};
use crate::message::{MarketDataRequest, Message};
use crate::types::{DataKind, Timestamp, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Per-subscription download window state.
///
/// Invariants: at most one sub-request is in flight; the window never
/// regresses; once `last_iteration` holds no further window is minted.
struct DownloadCursor {
    /// Immutable clone of the original request.
    origin: MarketDataRequest,
    step: Duration,
    interval: Duration,
    /// Upper bound for window advancement: the origin `to`, or "now" at
    /// creation for open-ended requests.
    max_from: Timestamp,
    curr_from: Timestamp,
    next_from: Timestamp,
    first_iteration: bool,
    /// Transaction id of the in-flight sub-request.
    curr_trans_id: Option<TransactionId>,
    /// First reply wins; later replies for this cursor are swallowed.
    reply_received: bool,
}

impl DownloadCursor {
    fn new(
        origin: MarketDataRequest,
        step: Duration,
        interval: Duration,
        now: Timestamp,
    ) -> Result<Self> {
        if step.is_zero() {
            return Err(AdapterError::InvalidRequest(
                "history step must be positive".into(),
            ));
        }

        let max_from = origin.to.unwrap_or(now);
        let curr_from = origin.from.unwrap_or(max_from - step);

        Ok(Self {
            origin,
            step,
            interval,
            max_from,
            curr_from,
            next_from: curr_from,
            first_iteration: true,
            curr_trans_id: None,
            reply_received: false,
        })
    }

    /// The advancing window has reached or passed the original end bound.
    fn last_iteration(&self) -> bool {
        match self.origin.to {
            Some(to) => self.next_from >= to,
            None => false,
        }
    }

    /// Advance the window edge to the last server time observed; never
    /// regress it.
    fn try_update_next_from(&mut self, last: Timestamp) {
        if self.next_from < last {
            self.next_from = last;
        }
    }

    /// Mint the next bounded sub-window, or the live conversion once an
    /// open-ended origin has caught up.
    fn init_next(&mut self, ctx: &AdapterContext) -> MarketDataRequest {
        debug_assert!(!self.last_iteration());

        let mut request = self.origin.clone();

        if self.first_iteration {
            self.first_iteration = false;

            self.next_from = (self.curr_from + self.step).min(self.max_from);

            request.transaction_id = ctx.next_transaction_id();
            request.from = Some(self.curr_from);
            request.to = Some(self.next_from);

            self.curr_trans_id = Some(request.transaction_id);
        } else if self.origin.to.is_none() && self.next_from >= self.max_from {
            // Caught up to "now": continue as a plain live subscription
            // under the original transaction id.
            request.from = None;
        } else {
            self.curr_from = self.next_from;
            self.next_from = (self.next_from + self.step).min(self.max_from);

            request.transaction_id = ctx.next_transaction_id();
            request.from = Some(self.curr_from);
            request.to = Some(self.next_from);

            self.curr_trans_id = Some(request.transaction_id);
        }

        request
    }
}

#[derive(Default)]
struct DownloadState {
    /// Origin subscription id -> cursor.
    original: HashMap<TransactionId, DownloadCursor>,
    /// In-flight sub-request id -> origin subscription id.
    partial_requests: HashMap<TransactionId, TransactionId>,
    /// Re-addressed unsubscribe id -> (app's unsubscribe id, origin id).
    unsubscribe_requests: HashMap<TransactionId, (TransactionId, TransactionId)>,
    /// Plain live request id -> whether it was converted from a split download.
    live_requests: HashMap<TransactionId, bool>,
}

impl DownloadState {
    fn remove_download(&mut self, origin_id: TransactionId) {
        self.original.remove(&origin_id);
        self.partial_requests.retain(|_, origin| *origin != origin_id);
    }
}

/// Stage that splits large historical subscriptions into a sequence of
/// bounded sub-requests.
pub struct PartialDownloadAdapter {
    core: AdapterCore,
    inner: Arc<dyn Adapter>,
    state: Mutex<DownloadState>,
    /// Used by delayed continuations published off-thread.
    self_ref: RwLock<Weak<PartialDownloadAdapter>>,
}

impl PartialDownloadAdapter {
    pub fn new(inner: Arc<dyn Adapter>) -> Arc<Self> {
        let stage = Arc::new(Self {
            core: AdapterCore::new(inner.context().clone()),
            inner,
            state: Mutex::new(DownloadState::default()),
            self_ref: RwLock::new(Weak::new()),
        });
        *stage.self_ref.write() = Arc::downgrade(&stage);
        crate::adapter::attach(&stage);
        stage
    }

    fn ctx(&self) -> &AdapterContext {
        self.core.context()
    }

    /// Emit the continuation loopback for `origin_id`, after the inter-step
    /// delay. The delay runs on its own thread so neither the notification
    /// path nor other subscriptions stall.
    fn schedule_continuation(&self, origin_id: TransactionId, interval: Duration) {
        let loopback = Message::PartialDownload {
            original: origin_id,
        }
        .into_loopback(self.core.id());

        if interval.is_zero() {
            self.core.publish(loopback);
            return;
        }

        let weak = self.self_ref.read().clone();
        let spawned = thread::Builder::new()
            .name("partial-download-delay".into())
            .spawn(move || {
                thread::sleep(interval);
                if let Some(stage) = weak.upgrade() {
                    stage.core.publish(loopback);
                }
            });
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to schedule download continuation");
        }
    }

    /// Returns the message to forward down, or `None` when the request was
    /// answered locally.
    fn process_market_data_in(&self, md: MarketDataRequest) -> Result<Option<Message>> {
        if md.is_subscribe {
            if md.from.is_none() && md.to.is_none() {
                self.state
                    .lock()
                    .live_requests
                    .insert(md.transaction_id, false);
                return Ok(Some(Message::MarketData(md)));
            }

            let step = self.inner.history_step(&md.kind);

            if !step.supports_history() {
                if md.to.is_some() {
                    // The venue cannot serve the range; the bounded request
                    // is already complete.
                    self.core.publish(Message::SubscriptionFinished {
                        original: md.transaction_id,
                    });
                    return Ok(None);
                }

                let mut md = md;
                md.from = None;
                md.to = None;
                self.state
                    .lock()
                    .live_requests
                    .insert(md.transaction_id, false);
                return Ok(Some(Message::MarketData(md)));
            }

            let origin_id = md.transaction_id;
            let mut cursor =
                DownloadCursor::new(md.clone(), step.step, step.interval, self.ctx().now())?;
            let request = cursor.init_next(self.ctx());

            let mut state = self.state.lock();
            state.partial_requests.insert(request.transaction_id, origin_id);
            state.original.insert(origin_id, cursor);

            Ok(Some(Message::MarketData(request)))
        } else {
            let mut md = md;
            let mut state = self.state.lock();
            if let Some(origin_id) = md.original_transaction_id {
                let curr = state
                    .original
                    .get(&origin_id)
                    .and_then(|cursor| cursor.curr_trans_id);
                if let Some(curr) = curr {
                    // Unsubscribe the in-flight sub-request; the reply is
                    // re-mapped back to the app's own unsubscribe id.
                    let unsub_id = self.ctx().next_transaction_id();
                    state
                        .unsubscribe_requests
                        .insert(unsub_id, (md.transaction_id, origin_id));
                    md.original_transaction_id = Some(curr);
                    md.transaction_id = unsub_id;
                }
            }
            Ok(Some(Message::MarketData(md)))
        }
    }

    fn process_continuation(&self, origin_id: TransactionId) -> Option<Message> {
        let mut state = self.state.lock();
        // Torn down (unsubscribe, reset) while the continuation was pending.
        let cursor = state.original.get_mut(&origin_id)?;

        let request = cursor.init_next(self.ctx());

        if request.to.is_none() {
            state.live_requests.insert(request.transaction_id, true);
            state.remove_download(origin_id);
        } else {
            state
                .partial_requests
                .insert(request.transaction_id, origin_id);
        }

        Some(Message::MarketData(request))
    }

    /// Rewrite an outbound notification; returns the message to publish and
    /// an optional follow-up.
    fn rewrite_out(&self, message: Message) -> (Option<Message>, Option<Message>) {
        match message {
            Message::SubscriptionResponse { original, error } => {
                let mut state = self.state.lock();

                if let Some(was_partial) = state.live_requests.remove(&original) {
                    if was_partial {
                        if error.is_none() {
                            // The subscribe ack already surfaced with the
                            // first window; announce the live transition.
                            return (Some(Message::SubscriptionOnline { original }), None);
                        }
                        return (Some(Message::SubscriptionResponse { original, error }), None);
                    }
                    let follow_up = error
                        .is_none()
                        .then_some(Message::SubscriptionOnline { original });
                    return (
                        Some(Message::SubscriptionResponse { original, error }),
                        follow_up,
                    );
                }

                if let Some(origin_id) = state.partial_requests.get(&original).copied() {
                    if let Some(cursor) = state.original.get_mut(&origin_id) {
                        if cursor.reply_received {
                            return (None, None);
                        }
                        cursor.reply_received = true;
                        if error.is_some() {
                            state.remove_download(origin_id);
                        }
                    }
                    return (
                        Some(Message::SubscriptionResponse {
                            original: origin_id,
                            error,
                        }),
                        None,
                    );
                }

                if let Some((app_id, origin_id)) = state.unsubscribe_requests.remove(&original) {
                    state.remove_download(origin_id);
                    return (
                        Some(Message::SubscriptionResponse {
                            original: app_id,
                            error,
                        }),
                        None,
                    );
                }

                (Some(Message::SubscriptionResponse { original, error }), None)
            }

            Message::SubscriptionFinished { original } => {
                let mut state = self.state.lock();

                let Some(origin_id) = state.partial_requests.get(&original).copied() else {
                    return (Some(Message::SubscriptionFinished { original }), None);
                };

                let (last, interval) = match state.original.get(&origin_id) {
                    Some(cursor) => (cursor.last_iteration(), cursor.interval),
                    None => (true, Duration::ZERO),
                };

                if last {
                    state.remove_download(origin_id);
                    return (
                        Some(Message::SubscriptionFinished {
                            original: origin_id,
                        }),
                        None,
                    );
                }

                // Window done, more to fetch: suppress the notification and
                // continue with the next window.
                state.partial_requests.remove(&original);
                drop(state);
                self.schedule_continuation(origin_id, interval);
                (None, None)
            }

            other => (Some(self.retag_data(other)), None),
        }
    }

    /// Advance the owning cursor past the observed server time and re-tag a
    /// data message with the original subscription id.
    fn retag_data(&self, mut message: Message) -> Message {
        let applies = match &message {
            Message::Candle(_) | Message::Level1(_) | Message::Quotes(_) => true,
            Message::Execution(report) => report.is_market_data(),
            _ => false,
        };
        if !applies {
            return message;
        }

        let Some(sub_id) = message.original_transaction_id() else {
            return message;
        };

        let mut state = self.state.lock();
        let Some(origin_id) = state.partial_requests.get(&sub_id).copied() else {
            return message;
        };
        if let Some(cursor) = state.original.get_mut(&origin_id) {
            if let Some(server_time) = message.server_time() {
                cursor.try_update_next_from(server_time);
            }
        }
        drop(state);

        message.set_original_transaction_id(Some(origin_id));
        message
    }
}

impl Wrapper for PartialDownloadAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    fn inner(&self) -> &Arc<dyn Adapter> {
        &self.inner
    }

    fn process_in(&self, message: Message) -> Result<()> {
        match message {
            Message::Reset | Message::Disconnect => {
                *self.state.lock() = DownloadState::default();
                self.inner.send_in(message)
            }

            Message::OrderStatus(mut os) if os.is_subscribe => {
                if os.from.is_some() || os.to.is_some() {
                    let step = self.inner.history_step(&DataKind::Transactions);
                    if !step.supports_history() {
                        if os.to.is_some() {
                            // The venue has no transaction history; the
                            // bounded reconciliation is already complete.
                            self.core.publish(Message::SubscriptionFinished {
                                original: os.transaction_id,
                            });
                            return Ok(());
                        }
                        os.from = None;
                        os.to = None;
                        self.state
                            .lock()
                            .live_requests
                            .insert(os.transaction_id, false);
                    }
                } else {
                    self.state
                        .lock()
                        .live_requests
                        .insert(os.transaction_id, false);
                }
                self.inner.send_in(Message::OrderStatus(os))
            }

            Message::MarketData(md) => match self.process_market_data_in(md)? {
                Some(message) => self.inner.send_in(message),
                None => Ok(()),
            },

            Message::PartialDownload { original } => match self.process_continuation(original) {
                Some(message) => self.inner.send_in(message),
                None => Ok(()),
            },

            other => self.inner.send_in(other),
        }
    }

    fn process_out(&self, message: Message) {
        let (message, follow_up) = self.rewrite_out(message);
        if let Some(message) = message {
            self.core.publish(message);
        }
        if let Some(message) = follow_up {
            self.core.publish(message);
        }
    }
}
