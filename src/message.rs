//! The message catalog flowing through adapter chains.
//!
//! Every request and notification in the pipeline is one [`Message`].
//! Commands travel inward (`send_in`), notifications travel outward through
//! registered handlers. A message is always moved or deep-cloned across
//! stage boundaries, never shared mutably.

use crate::types::{
    AdapterId, CandleKind, DataKind, ExecKind, Level1Field, OrderState, PositionField, SecurityId,
    Side, Timestamp, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Market-data subscribe/unsubscribe command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarketDataRequest {
    /// Id naming this request.
    pub transaction_id: TransactionId,
    /// For unsubscribe: the id of the subscription being torn down.
    pub original_transaction_id: Option<TransactionId>,
    pub is_subscribe: bool,
    pub security: SecurityId,
    pub kind: DataKind,
    /// Inclusive lower time bound; `None` means "live only" (or storage default lookback).
    pub from: Option<Timestamp>,
    /// Exclusive upper time bound; `None` means "and continue live".
    pub to: Option<Timestamp>,
    /// Preferred source series when candles are built rather than fetched.
    pub build_from: Option<DataKind>,
}

impl MarketDataRequest {
    pub fn subscribe(transaction_id: TransactionId, security: SecurityId, kind: DataKind) -> Self {
        Self {
            transaction_id,
            original_transaction_id: None,
            is_subscribe: true,
            security,
            kind,
            from: None,
            to: None,
            build_from: None,
        }
    }

    pub fn unsubscribe(
        transaction_id: TransactionId,
        original: TransactionId,
        security: SecurityId,
        kind: DataKind,
    ) -> Self {
        Self {
            transaction_id,
            original_transaction_id: Some(original),
            is_subscribe: false,
            security,
            kind,
            from: None,
            to: None,
            build_from: None,
        }
    }
}

/// Order-status (own transactions) subscribe/unsubscribe command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderStatusRequest {
    pub transaction_id: TransactionId,
    pub is_subscribe: bool,
    /// Restrict to a single security, if set.
    pub security: Option<SecurityId>,
    /// Restrict to a single order, if set.
    pub order_id: Option<i64>,
    pub order_string_id: Option<String>,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

/// Cancel command for a previously registered order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderCancel {
    pub transaction_id: TransactionId,
    /// Transaction id of the registration being cancelled.
    pub order_transaction_id: TransactionId,
    pub security: SecurityId,
    pub order_id: Option<i64>,
    pub order_string_id: Option<String>,
}

/// Execution report: a tick trade, an order-log entry, or an own order/trade event.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub security: SecurityId,
    pub exec_kind: ExecKind,
    pub server_time: Timestamp,
    /// Id of the request that produced this report, when known.
    pub transaction_id: Option<TransactionId>,
    /// Id of the subscription or command this report answers.
    pub original_transaction_id: Option<TransactionId>,
    pub order_id: Option<i64>,
    pub order_string_id: Option<String>,
    pub order_state: Option<OrderState>,
    pub side: Option<Side>,
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub balance: Option<f64>,
    pub trade_id: Option<i64>,
    pub trade_price: Option<f64>,
    pub trade_volume: Option<f64>,
    /// Carries order state.
    pub has_order_info: bool,
    /// Carries trade state.
    pub has_trade_info: bool,
    /// Echo of a cancel command.
    pub is_cancelled: bool,
    pub error: Option<String>,
}

impl ExecutionReport {
    /// Tick and order-log reports are market data; transactions are not.
    pub fn is_market_data(&self) -> bool {
        self.exec_kind != ExecKind::Transaction
    }
}

/// Level-1 change set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Level1Change {
    pub security: SecurityId,
    pub server_time: Timestamp,
    pub original_transaction_id: Option<TransactionId>,
    pub changes: BTreeMap<Level1Field, f64>,
}

/// One price level of an order book.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub volume: f64,
}

/// Order book (market depth) state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuoteChange {
    pub security: SecurityId,
    pub server_time: Timestamp,
    pub original_transaction_id: Option<TransactionId>,
    pub bids: Vec<Quote>,
    pub asks: Vec<Quote>,
}

/// A single candle of some series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandleMessage {
    pub security: SecurityId,
    pub kind: CandleKind,
    pub original_transaction_id: Option<TransactionId>,
    pub open_time: Timestamp,
    /// Unset while the candle is still forming.
    pub close_time: Option<Timestamp>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl CandleMessage {
    /// The last server time this candle accounts for.
    pub fn last_time(&self) -> Timestamp {
        match self.close_time {
            Some(close) => close,
            None => match self.kind.frame() {
                Some(frame) => self.open_time + frame,
                None => self.open_time,
            },
        }
    }
}

/// Position change set for a portfolio/security pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PositionChange {
    pub security: SecurityId,
    pub portfolio: String,
    pub server_time: Timestamp,
    pub original_transaction_id: Option<TransactionId>,
    pub changes: BTreeMap<PositionField, f64>,
}

/// News item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewsMessage {
    pub id: Option<String>,
    pub security: Option<SecurityId>,
    pub server_time: Timestamp,
    pub original_transaction_id: Option<TransactionId>,
    pub headline: String,
    pub story: Option<String>,
}

/// Trading session state of a board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Suspended,
    Closed,
}

/// Board session state change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoardStateMessage {
    pub board: String,
    pub server_time: Timestamp,
    pub original_transaction_id: Option<TransactionId>,
    pub state: SessionState,
}

/// A message flowing through the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // --- Commands (inward) ---
    /// Drop all per-connection state in every stage.
    Reset,
    Connect,
    Disconnect,
    MarketData(MarketDataRequest),
    OrderStatus(OrderStatusRequest),
    OrderCancel(OrderCancel),

    // --- Internal continuation ---
    /// Self-addressed continuation of a split download.
    PartialDownload { original: TransactionId },

    /// A message re-addressed to the stage that issued it. The chain head
    /// re-injects it downward; the addressed stage unwraps and processes it.
    Loopback {
        target: AdapterId,
        inner: Box<Message>,
    },

    // --- Control replies (outward) ---
    /// Ack (or failure) of a subscription command.
    SubscriptionResponse {
        original: TransactionId,
        error: Option<String>,
    },
    /// The requested range is fully delivered.
    SubscriptionFinished { original: TransactionId },
    /// Historical part done; data from here on is live.
    SubscriptionOnline { original: TransactionId },

    // --- Data (outward) ---
    Execution(ExecutionReport),
    Level1(Level1Change),
    Quotes(QuoteChange),
    Candle(CandleMessage),
    Position(PositionChange),
    News(NewsMessage),
    BoardState(BoardStateMessage),
}

impl Message {
    /// Wrap into a loopback addressed to `target`.
    pub fn into_loopback(self, target: AdapterId) -> Message {
        Message::Loopback {
            target,
            inner: Box::new(self),
        }
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self, Message::Loopback { .. })
    }

    /// The id naming this command, for inbound messages.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Message::MarketData(md) => Some(md.transaction_id),
            Message::OrderStatus(os) => Some(os.transaction_id),
            Message::OrderCancel(oc) => Some(oc.transaction_id),
            _ => None,
        }
    }

    /// The id of the request this message answers or continues.
    pub fn original_transaction_id(&self) -> Option<TransactionId> {
        match self {
            Message::PartialDownload { original } => Some(*original),
            Message::SubscriptionResponse { original, .. } => Some(*original),
            Message::SubscriptionFinished { original } => Some(*original),
            Message::SubscriptionOnline { original } => Some(*original),
            Message::Execution(e) => e.original_transaction_id,
            Message::Level1(l1) => l1.original_transaction_id,
            Message::Quotes(q) => q.original_transaction_id,
            Message::Candle(c) => c.original_transaction_id,
            Message::Position(p) => p.original_transaction_id,
            Message::News(n) => n.original_transaction_id,
            Message::BoardState(b) => b.original_transaction_id,
            _ => None,
        }
    }

    /// Re-tag a data message or reply with another originating request id.
    pub fn set_original_transaction_id(&mut self, id: Option<TransactionId>) {
        match self {
            Message::SubscriptionResponse { original, .. }
            | Message::SubscriptionFinished { original }
            | Message::SubscriptionOnline { original }
            | Message::PartialDownload { original } => {
                if let Some(id) = id {
                    *original = id;
                }
            }
            Message::Execution(e) => e.original_transaction_id = id,
            Message::Level1(l1) => l1.original_transaction_id = id,
            Message::Quotes(q) => q.original_transaction_id = id,
            Message::Candle(c) => c.original_transaction_id = id,
            Message::Position(p) => p.original_transaction_id = id,
            Message::News(n) => n.original_transaction_id = id,
            Message::BoardState(b) => b.original_transaction_id = id,
            _ => {}
        }
    }

    /// Exchange-side time carried by data messages.
    pub fn server_time(&self) -> Option<Timestamp> {
        match self {
            Message::Execution(e) => Some(e.server_time),
            Message::Level1(l1) => Some(l1.server_time),
            Message::Quotes(q) => Some(q.server_time),
            Message::Candle(c) => Some(c.last_time()),
            Message::Position(p) => Some(p.server_time),
            Message::News(n) => Some(n.server_time),
            Message::BoardState(b) => Some(b.server_time),
            _ => None,
        }
    }

    pub fn security(&self) -> Option<&SecurityId> {
        match self {
            Message::MarketData(md) => Some(&md.security),
            Message::OrderCancel(oc) => Some(&oc.security),
            Message::OrderStatus(os) => os.security.as_ref(),
            Message::Execution(e) => Some(&e.security),
            Message::Level1(l1) => Some(&l1.security),
            Message::Quotes(q) => Some(&q.security),
            Message::Candle(c) => Some(&c.security),
            Message::Position(p) => Some(&p.security),
            Message::News(n) => n.security.as_ref(),
            _ => None,
        }
    }

    /// The canonical failure reply for a command, or `None` when the message
    /// kind has no reply shape.
    pub fn error_reply(&self, error: &str, server_time: Timestamp) -> Option<Message> {
        match self {
            Message::MarketData(md) => Some(Message::SubscriptionResponse {
                original: md.transaction_id,
                error: Some(error.to_string()),
            }),
            Message::OrderStatus(os) => Some(Message::SubscriptionResponse {
                original: os.transaction_id,
                error: Some(error.to_string()),
            }),
            Message::OrderCancel(oc) => Some(Message::Execution(ExecutionReport {
                security: oc.security.clone(),
                exec_kind: ExecKind::Transaction,
                server_time,
                transaction_id: Some(oc.transaction_id),
                original_transaction_id: Some(oc.order_transaction_id),
                order_id: oc.order_id,
                order_string_id: oc.order_string_id.clone(),
                order_state: Some(OrderState::Failed),
                has_order_info: true,
                error: Some(error.to_string()),
                ..Default::default()
            })),
            _ => None,
        }
    }
}
