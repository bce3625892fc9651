//! Scripted venue adapter shared by the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tapeline::{
    Adapter, AdapterContext, AdapterCore, AdapterId, DataKind, ExecKind, ExecutionReport,
    HistoryStep, MarketDataRequest, Message, OutHandler, Result, SecurityId, Timestamp,
};

type DataFn = Box<dyn Fn(&MarketDataRequest) -> Vec<Message> + Send + Sync>;

/// Terminal adapter with a scripted response policy.
///
/// By default every subscribe is acknowledged and every bounded subscribe
/// is finished immediately; a data generator can inject records between the
/// two. Tests that drive replies by hand flip the flags off and call
/// [`FakeExchange::publish`].
pub struct FakeExchange {
    core: AdapterCore,
    pub received: Mutex<Vec<Message>>,
    step: Mutex<HistoryStep>,
    auto_ack: AtomicBool,
    auto_finish: AtomicBool,
    data: Mutex<Option<DataFn>>,
}

impl FakeExchange {
    pub fn new(ctx: AdapterContext) -> Arc<Self> {
        Arc::new(Self {
            core: AdapterCore::new(ctx),
            received: Mutex::new(Vec::new()),
            step: Mutex::new(HistoryStep::NONE),
            auto_ack: AtomicBool::new(true),
            auto_finish: AtomicBool::new(true),
            data: Mutex::new(None),
        })
    }

    pub fn set_step(&self, step: HistoryStep) {
        *self.step.lock() = step;
    }

    pub fn set_auto_ack(&self, on: bool) {
        self.auto_ack.store(on, Ordering::SeqCst);
    }

    pub fn set_auto_finish(&self, on: bool) {
        self.auto_finish.store(on, Ordering::SeqCst);
    }

    pub fn set_data_fn(&self, data: DataFn) {
        *self.data.lock() = Some(data);
    }

    pub fn publish(&self, message: Message) {
        self.core.publish(message);
    }

    /// Subscribe commands that reached the venue.
    pub fn market_data_requests(&self) -> Vec<MarketDataRequest> {
        self.received
            .lock()
            .iter()
            .filter_map(|message| match message {
                Message::MarketData(md) => Some(md.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Adapter for FakeExchange {
    fn send_in(&self, message: Message) -> Result<()> {
        self.received.lock().push(message.clone());

        match &message {
            Message::MarketData(md) if md.is_subscribe => {
                if self.auto_ack.load(Ordering::SeqCst) {
                    self.core.publish(Message::SubscriptionResponse {
                        original: md.transaction_id,
                        error: None,
                    });
                }
                if let Some(data) = &*self.data.lock() {
                    for record in data(md) {
                        self.core.publish(record);
                    }
                }
                if md.to.is_some() && self.auto_finish.load(Ordering::SeqCst) {
                    self.core.publish(Message::SubscriptionFinished {
                        original: md.transaction_id,
                    });
                }
            }
            Message::MarketData(md) => {
                if self.auto_ack.load(Ordering::SeqCst) {
                    self.core.publish(Message::SubscriptionResponse {
                        original: md.transaction_id,
                        error: None,
                    });
                }
            }
            Message::OrderStatus(os) if os.is_subscribe => {
                if self.auto_ack.load(Ordering::SeqCst) {
                    self.core.publish(Message::SubscriptionResponse {
                        original: os.transaction_id,
                        error: None,
                    });
                }
            }
            _ => {}
        }

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

/// A tick trade tagged with the subscription that produced it.
pub fn tick(security: &str, time: i64, price: f64, original: Option<tapeline::TransactionId>) -> Message {
    Message::Execution(ExecutionReport {
        security: SecurityId::new(security),
        exec_kind: ExecKind::Tick,
        server_time: Timestamp(time),
        original_transaction_id: original,
        trade_price: Some(price),
        trade_volume: Some(1.0),
        has_trade_info: true,
        ..Default::default()
    })
}
