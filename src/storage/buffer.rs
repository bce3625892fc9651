//! Accumulation of outbound traffic between flush cycles.

use crate::message::{
    CandleMessage, ExecutionReport, Level1Change, Message, NewsMessage, PositionChange, QuoteChange,
};
use crate::types::{CandleKind, ExecKind, SecurityId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;

/// Per-category buckets of messages awaiting persistence.
///
/// `add` is called on the notification path and must stay cheap: one lock,
/// one push. The flush task drains whole buckets with `take_*`.
#[derive(Default)]
pub struct MessageBuffer {
    ticks: Mutex<HashMap<SecurityId, Vec<ExecutionReport>>>,
    order_log: Mutex<HashMap<SecurityId, Vec<ExecutionReport>>>,
    transactions: Mutex<HashMap<SecurityId, Vec<ExecutionReport>>>,
    order_books: Mutex<HashMap<SecurityId, Vec<QuoteChange>>>,
    level1: Mutex<HashMap<SecurityId, Vec<Level1Change>>>,
    candles: Mutex<HashMap<(SecurityId, CandleKind), Vec<CandleMessage>>>,
    positions: Mutex<HashMap<SecurityId, Vec<PositionChange>>>,
    news: Mutex<Vec<NewsMessage>>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound message if its kind is persistable.
    pub fn add(&self, message: &Message) {
        match message {
            Message::Execution(report) => {
                let bucket = match report.exec_kind {
                    ExecKind::Tick => &self.ticks,
                    ExecKind::OrderLog => &self.order_log,
                    ExecKind::Transaction => &self.transactions,
                };
                bucket
                    .lock()
                    .entry(report.security.clone())
                    .or_default()
                    .push(report.clone());
            }
            Message::Quotes(quotes) => {
                self.order_books
                    .lock()
                    .entry(quotes.security.clone())
                    .or_default()
                    .push(quotes.clone());
            }
            Message::Level1(l1) => {
                self.level1
                    .lock()
                    .entry(l1.security.clone())
                    .or_default()
                    .push(l1.clone());
            }
            Message::Candle(candle) => {
                self.candles
                    .lock()
                    .entry((candle.security.clone(), candle.kind))
                    .or_default()
                    .push(candle.clone());
            }
            Message::Position(position) => {
                self.positions
                    .lock()
                    .entry(position.security.clone())
                    .or_default()
                    .push(position.clone());
            }
            Message::News(news) => {
                self.news.lock().push(news.clone());
            }
            _ => {}
        }
    }

    pub fn take_ticks(&self) -> HashMap<SecurityId, Vec<ExecutionReport>> {
        mem::take(&mut *self.ticks.lock())
    }

    pub fn take_order_log(&self) -> HashMap<SecurityId, Vec<ExecutionReport>> {
        mem::take(&mut *self.order_log.lock())
    }

    pub fn take_transactions(&self) -> HashMap<SecurityId, Vec<ExecutionReport>> {
        mem::take(&mut *self.transactions.lock())
    }

    pub fn take_order_books(&self) -> HashMap<SecurityId, Vec<QuoteChange>> {
        mem::take(&mut *self.order_books.lock())
    }

    pub fn take_level1(&self) -> HashMap<SecurityId, Vec<Level1Change>> {
        mem::take(&mut *self.level1.lock())
    }

    pub fn take_candles(&self) -> HashMap<(SecurityId, CandleKind), Vec<CandleMessage>> {
        mem::take(&mut *self.candles.lock())
    }

    pub fn take_positions(&self) -> HashMap<SecurityId, Vec<PositionChange>> {
        mem::take(&mut *self.positions.lock())
    }

    pub fn take_news(&self) -> Vec<NewsMessage> {
        mem::take(&mut *self.news.lock())
    }

    /// Drop everything accumulated so far.
    pub fn clear(&self) {
        self.take_ticks();
        self.take_order_log();
        self.take_transactions();
        self.take_order_books();
        self.take_level1();
        self.take_candles();
        self.take_positions();
        self.take_news();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn tick(security: &str, time: i64) -> Message {
        Message::Execution(ExecutionReport {
            security: SecurityId::new(security),
            exec_kind: ExecKind::Tick,
            server_time: Timestamp(time),
            trade_price: Some(1.0),
            has_trade_info: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_buckets_by_security_and_kind() {
        let buffer = MessageBuffer::new();
        buffer.add(&tick("AAA", 1));
        buffer.add(&tick("AAA", 2));
        buffer.add(&tick("BBB", 3));

        let ticks = buffer.take_ticks();
        assert_eq!(ticks[&SecurityId::new("AAA")].len(), 2);
        assert_eq!(ticks[&SecurityId::new("BBB")].len(), 1);

        // Drained.
        assert!(buffer.take_ticks().is_empty());
    }

    #[test]
    fn test_control_messages_are_not_buffered() {
        let buffer = MessageBuffer::new();
        buffer.add(&Message::SubscriptionOnline {
            original: crate::types::TransactionId(1),
        });
        assert!(buffer.take_ticks().is_empty());
        assert!(buffer.take_news().is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let buffer = MessageBuffer::new();
        buffer.add(&tick("AAA", 1));
        buffer.add(&Message::News(NewsMessage {
            id: None,
            security: None,
            server_time: Timestamp(1),
            original_transaction_id: None,
            headline: "hello".into(),
            story: None,
        }));
        buffer.clear();
        assert!(buffer.take_ticks().is_empty());
        assert!(buffer.take_news().is_empty());
    }
}
