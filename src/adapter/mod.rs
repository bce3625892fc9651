//! Adapter chain primitives.
//!
//! A pipeline is a linked sequence of stages implementing [`Adapter`].
//! Terminal adapters talk to a real venue; every other stage wraps exactly
//! one inner adapter, intercepting commands on the way down and
//! notifications on the way up. Wrapping stages implement [`Wrapper`] and
//! get the loopback and propagate-and-report protocol for free.

mod chain;

pub use chain::{Chain, ChainEvents};

use crate::error::Result;
use crate::message::Message;
use crate::types::{
    AdapterId, CandleKind, Clock, DataKind, SecurityId, SystemClock, Timestamp, TransactionId,
    TransactionIdGenerator,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outbound notification callback.
pub type OutHandler = Box<dyn Fn(Message) + Send + Sync>;

/// History splitting capability for one data kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryStep {
    /// Max range one request may cover. Zero means no historical capability.
    pub step: Duration,
    /// Pause between consecutive sub-requests.
    pub interval: Duration,
}

impl HistoryStep {
    /// No historical capability.
    pub const NONE: HistoryStep = HistoryStep {
        step: Duration::ZERO,
        interval: Duration::ZERO,
    };

    pub fn new(step: Duration, interval: Duration) -> Self {
        Self { step, interval }
    }

    pub fn supports_history(&self) -> bool {
        !self.step.is_zero()
    }
}

/// Shared side services of a chain: the time source and id generators.
///
/// Cloned into every stage; all clones share the same counters, so ids are
/// unique across the whole chain.
#[derive(Clone)]
pub struct AdapterContext {
    clock: Arc<dyn Clock>,
    transaction_ids: Arc<TransactionIdGenerator>,
    adapter_ids: Arc<AtomicU64>,
}

impl AdapterContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            transaction_ids: Arc::new(TransactionIdGenerator::new()),
            adapter_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Context over the wall clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn next_transaction_id(&self) -> TransactionId {
        self.transaction_ids.next_id()
    }

    pub(crate) fn next_adapter_id(&self) -> AdapterId {
        AdapterId(self.adapter_ids.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterContext").finish_non_exhaustive()
    }
}

/// One stage of the pipeline.
pub trait Adapter: Send + Sync {
    /// Submit a command.
    ///
    /// Synchronous from the caller's perspective. A processing failure is
    /// first published as the command's canonical error reply, then
    /// returned to the caller.
    fn send_in(&self, message: Message) -> Result<()>;

    /// Register the outbound notification handler.
    fn set_out_handler(&self, handler: OutHandler);

    /// Shared clock and id generators.
    fn context(&self) -> &AdapterContext;

    fn id(&self) -> AdapterId;

    /// History splitting capability; [`HistoryStep::NONE`] when the venue
    /// cannot serve ranged requests for this kind.
    fn history_step(&self, kind: &DataKind) -> HistoryStep {
        let _ = kind;
        HistoryStep::NONE
    }

    /// Candle kinds available for a security.
    fn candle_kinds(&self, security: &SecurityId) -> Vec<CandleKind> {
        let _ = security;
        Vec::new()
    }
}

/// State embedded by every stage: identity, context, registered out handler.
pub struct AdapterCore {
    id: AdapterId,
    ctx: AdapterContext,
    out: RwLock<Option<OutHandler>>,
}

impl AdapterCore {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            id: ctx.next_adapter_id(),
            ctx,
            out: RwLock::new(None),
        }
    }

    pub fn id(&self) -> AdapterId {
        self.id
    }

    pub fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    /// Publish an outbound notification to the registered handler.
    ///
    /// Notifications published before a handler is registered are dropped.
    pub fn publish(&self, message: Message) {
        if let Some(handler) = &*self.out.read() {
            handler(message);
        }
    }

    pub fn set_out_handler(&self, handler: OutHandler) {
        *self.out.write() = Some(handler);
    }
}

/// A stage that wraps one inner adapter.
///
/// Implementors provide `process_in`/`process_out`; the blanket [`Adapter`]
/// impl supplies the loopback routing and error-reply protocol. Call
/// [`attach`] after construction to wire the inner adapter's notifications
/// into the stage.
pub trait Wrapper: Send + Sync {
    fn core(&self) -> &AdapterCore;

    fn inner(&self) -> &Arc<dyn Adapter>;

    /// Forward loopbacks addressed to other stages further down.
    fn forwards_foreign_loopbacks(&self) -> bool {
        true
    }

    /// Stage-specific inbound processing; default forwards unchanged.
    fn process_in(&self, message: Message) -> Result<()> {
        self.inner().send_in(message)
    }

    /// Stage-specific outbound processing; default republishes unchanged.
    fn process_out(&self, message: Message) {
        self.core().publish(message);
    }

    fn history_step(&self, kind: &DataKind) -> HistoryStep {
        self.inner().history_step(kind)
    }

    fn candle_kinds(&self, security: &SecurityId) -> Vec<CandleKind> {
        self.inner().candle_kinds(security)
    }
}

impl<T: Wrapper> Adapter for T {
    fn send_in(&self, message: Message) -> Result<()> {
        wrapper_send_in(self, message)
    }

    fn set_out_handler(&self, handler: OutHandler) {
        self.core().set_out_handler(handler);
    }

    fn context(&self) -> &AdapterContext {
        self.core().context()
    }

    fn id(&self) -> AdapterId {
        self.core().id()
    }

    fn history_step(&self, kind: &DataKind) -> HistoryStep {
        Wrapper::history_step(self, kind)
    }

    fn candle_kinds(&self, security: &SecurityId) -> Vec<CandleKind> {
        Wrapper::candle_kinds(self, security)
    }
}

/// `send_in` protocol shared by all wrapping stages.
///
/// A loopback addressed to this stage is unwrapped and processed as if
/// newly submitted; a foreign one is forwarded down unchanged. Any
/// processing failure is published as the command's canonical error reply
/// before being returned to the caller.
pub(crate) fn wrapper_send_in<W: Wrapper + ?Sized>(stage: &W, message: Message) -> Result<()> {
    let message = match message {
        Message::Loopback { target, inner } => {
            if target == stage.core().id() {
                *inner
            } else if stage.forwards_foreign_loopbacks() {
                return stage.inner().send_in(Message::Loopback { target, inner });
            } else {
                Message::Loopback { target, inner }
            }
        }
        other => other,
    };

    let reply_source = match &message {
        Message::MarketData(_) | Message::OrderStatus(_) | Message::OrderCancel(_) => {
            Some(message.clone())
        }
        _ => None,
    };

    match stage.process_in(message) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "stage failed to process inbound message");
            if let Some(source) = reply_source {
                if let Some(reply) =
                    source.error_reply(&err.to_string(), stage.core().context().now())
                {
                    stage.core().publish(reply);
                }
            }
            Err(err)
        }
    }
}

/// Out-path protocol: loopbacks pass upward untouched, everything else goes
/// through the stage's `process_out`.
pub(crate) fn wrapper_out<W: Wrapper + ?Sized>(stage: &W, message: Message) {
    if message.is_loopback() {
        stage.core().publish(message);
    } else {
        stage.process_out(message);
    }
}

/// Wire `stage` as the consumer of its inner adapter's notifications.
pub fn attach<W>(stage: &Arc<W>)
where
    W: Wrapper + 'static,
{
    let weak = Arc::downgrade(stage);
    stage.inner().set_out_handler(Box::new(move |message| {
        if let Some(stage) = weak.upgrade() {
            wrapper_out(stage.as_ref(), message);
        }
    }));
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Terminal adapter that records commands and lets tests publish
    /// notifications by hand.
    pub struct Probe {
        core: AdapterCore,
        pub received: Mutex<Vec<Message>>,
        pub step: Mutex<HistoryStep>,
    }

    impl Probe {
        pub fn new(ctx: AdapterContext) -> Arc<Self> {
            Arc::new(Self {
                core: AdapterCore::new(ctx),
                received: Mutex::new(Vec::new()),
                step: Mutex::new(HistoryStep::NONE),
            })
        }

        pub fn publish(&self, message: Message) {
            self.core.publish(message);
        }
    }

    impl Adapter for Probe {
        fn send_in(&self, message: Message) -> Result<()> {
            self.received.lock().push(message);
            Ok(())
        }

        fn set_out_handler(&self, handler: OutHandler) {
            self.core.set_out_handler(handler);
        }

        fn context(&self) -> &AdapterContext {
            self.core.context()
        }

        fn id(&self) -> AdapterId {
            self.core.id()
        }

        fn history_step(&self, _kind: &DataKind) -> HistoryStep {
            *self.step.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Probe;
    use super::*;
    use crate::error::AdapterError;
    use crate::message::MarketDataRequest;
    use parking_lot::Mutex;

    struct FailingStage {
        core: AdapterCore,
        inner: Arc<dyn Adapter>,
    }

    impl Wrapper for FailingStage {
        fn core(&self) -> &AdapterCore {
            &self.core
        }

        fn inner(&self) -> &Arc<dyn Adapter> {
            &self.inner
        }

        fn process_in(&self, _message: Message) -> Result<()> {
            Err(AdapterError::InvalidRequest("rejected".into()))
        }
    }

    #[test]
    fn test_failure_publishes_error_reply_and_propagates() {
        let ctx = AdapterContext::system();
        let probe = Probe::new(ctx.clone());
        let stage = Arc::new(FailingStage {
            core: AdapterCore::new(ctx.clone()),
            inner: probe.clone() as Arc<dyn Adapter>,
        });
        attach(&stage);

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        stage.set_out_handler(Box::new(move |msg| sink.lock().push(msg)));

        let md = MarketDataRequest::subscribe(
            TransactionId(1),
            SecurityId::new("TEST"),
            DataKind::Ticks,
        );
        let result = stage.send_in(Message::MarketData(md));
        assert!(result.is_err());

        let published = published.lock();
        assert_eq!(published.len(), 1);
        match &published[0] {
            Message::SubscriptionResponse { original, error } => {
                assert_eq!(*original, TransactionId(1));
                assert!(error.is_some());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    struct PassThrough {
        core: AdapterCore,
        inner: Arc<dyn Adapter>,
    }

    impl Wrapper for PassThrough {
        fn core(&self) -> &AdapterCore {
            &self.core
        }

        fn inner(&self) -> &Arc<dyn Adapter> {
            &self.inner
        }
    }

    #[test]
    fn test_own_loopback_is_unwrapped_foreign_forwarded() {
        let ctx = AdapterContext::system();
        let probe = Probe::new(ctx.clone());
        let stage = Arc::new(PassThrough {
            core: AdapterCore::new(ctx.clone()),
            inner: probe.clone() as Arc<dyn Adapter>,
        });
        attach(&stage);

        // Addressed to this stage: unwrapped before processing, so the
        // terminal adapter sees the bare continuation.
        let own = Message::PartialDownload {
            original: TransactionId(5),
        }
        .into_loopback(stage.id());
        stage.send_in(own).unwrap();
        assert!(matches!(
            probe.received.lock()[0],
            Message::PartialDownload { .. }
        ));

        // Addressed elsewhere: forwarded still wrapped.
        let foreign = Message::PartialDownload {
            original: TransactionId(6),
        }
        .into_loopback(AdapterId(999));
        stage.send_in(foreign).unwrap();
        assert!(probe.received.lock()[1].is_loopback());
    }

    #[test]
    fn test_out_path_passes_loopbacks_untouched() {
        let ctx = AdapterContext::system();
        let probe = Probe::new(ctx.clone());
        let stage = Arc::new(PassThrough {
            core: AdapterCore::new(ctx.clone()),
            inner: probe.clone() as Arc<dyn Adapter>,
        });
        attach(&stage);

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        stage.set_out_handler(Box::new(move |msg| sink.lock().push(msg)));

        probe.publish(
            Message::PartialDownload {
                original: TransactionId(1),
            }
            .into_loopback(AdapterId(42)),
        );

        assert!(published.lock()[0].is_loopback());
    }
}
