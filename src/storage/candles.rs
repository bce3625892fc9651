//! Building candles from stored smaller series.
//!
//! When a candle subscription finds no native candle storage, the requested
//! series is aggregated from stored trades, order-log entries, level-1
//! last-trade changes, or order-book mid prices, over a bounded lookback.

use crate::message::{CandleMessage, Message};
use crate::types::{CandleKind, Level1Field, SecurityId, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Default lookback when building candles from a smaller series.
pub const DEFAULT_BUILD_LOOKBACK: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// A price observation extracted from a source series.
#[derive(Clone, Copy, Debug)]
struct TradePoint {
    time: Timestamp,
    price: f64,
    volume: f64,
}

/// Extract price points from a stored source series, in input order.
///
/// Trades and order-log entries contribute their trade price; level-1
/// contributes last-trade-price changes; order books contribute the
/// best-bid/ask mid price.
fn trade_points(messages: &[Message]) -> Vec<TradePoint> {
    let mut points = Vec::new();
    for message in messages {
        match message {
            Message::Execution(report) => {
                if let Some(price) = report.trade_price {
                    points.push(TradePoint {
                        time: report.server_time,
                        price,
                        volume: report.trade_volume.unwrap_or(0.0),
                    });
                }
            }
            Message::Level1(l1) => {
                if let Some(price) = l1.changes.get(&Level1Field::LastTradePrice) {
                    points.push(TradePoint {
                        time: l1.server_time,
                        price: *price,
                        volume: l1
                            .changes
                            .get(&Level1Field::LastTradeVolume)
                            .copied()
                            .unwrap_or(0.0),
                    });
                }
            }
            Message::Quotes(quotes) => {
                let bid = quotes.bids.first().map(|q| q.price);
                let ask = quotes.asks.first().map(|q| q.price);
                if let (Some(bid), Some(ask)) = (bid, ask) {
                    points.push(TradePoint {
                        time: quotes.server_time,
                        price: (bid + ask) / 2.0,
                        volume: 0.0,
                    });
                }
            }
            _ => {}
        }
    }
    points
}

/// Aggregate a source series into complete time-frame candles.
pub fn build_time_frame_candles(
    security: &SecurityId,
    kind: CandleKind,
    messages: &[Message],
) -> Vec<CandleMessage> {
    let Some(frame) = kind.frame() else {
        return Vec::new();
    };
    let frame_micros = frame.as_micros() as i64;
    if frame_micros == 0 {
        return Vec::new();
    }

    let mut candles: Vec<CandleMessage> = Vec::new();

    for point in trade_points(messages) {
        let open_time = Timestamp(point.time.0 - point.time.0.rem_euclid(frame_micros));

        match candles.last_mut() {
            Some(candle) if candle.open_time == open_time => {
                candle.high = candle.high.max(point.price);
                candle.low = candle.low.min(point.price);
                candle.close = point.price;
                candle.volume += point.volume;
            }
            _ => candles.push(CandleMessage {
                security: security.clone(),
                kind,
                original_transaction_id: None,
                open_time,
                close_time: Some(open_time + frame),
                open: point.price,
                high: point.price,
                low: point.price,
                close: point.price,
                volume: point.volume,
            }),
        }
    }

    candles
}

type CacheKey = (SecurityId, CandleKind, Timestamp, Timestamp);

/// LRU cache of built candle series, keyed by security, kind and range.
pub struct CandleCache {
    cache: Mutex<LruCache<CacheKey, Vec<CandleMessage>>>,
}

impl CandleCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Return the cached series or build and cache it.
    pub fn get_or_build<F>(&self, key: CacheKey, build: F) -> crate::error::Result<Vec<CandleMessage>>
    where
        F: FnOnce() -> crate::error::Result<Vec<CandleMessage>>,
    {
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(cached.clone());
        }
        let built = build()?;
        self.cache.lock().put(key, built.clone());
        Ok(built)
    }
}
