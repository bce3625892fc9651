//! Core identifier and market-data types shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Process-wide unique identifier naming one request.
///
/// Replies reference the request they answer through its transaction id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrId({})", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one stage in an adapter chain.
///
/// Loopback messages carry the id of the stage they are addressed to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterId(pub u64);

impl fmt::Debug for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdapterId({})", self.0)
    }
}

/// Instrument key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecurityId(pub String);

impl SecurityId {
    pub fn new(id: impl Into<String>) -> Self {
        SecurityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SecurityId {
    fn default() -> Self {
        SecurityId(String::new())
    }
}

impl fmt::Debug for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityId({})", self.0)
    }
}

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const MICROS_PER_DAY: i64 = 24 * 60 * 60 * 1_000_000;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch");
        Timestamp(duration.as_micros() as i64)
    }

    /// Midnight (UTC) of the day this timestamp falls in.
    pub fn start_of_day(self) -> Self {
        Timestamp(self.0 - self.0.rem_euclid(MICROS_PER_DAY))
    }

    /// The smallest representable step forward.
    pub fn next_micro(self) -> Self {
        Timestamp(self.0 + 1)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 - rhs.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Candle series kind plus its argument.
///
/// Arguments are integer-valued so a kind can key a storage map: time frames
/// are microseconds, ranges and boxes are price steps, the rest are counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleKind {
    /// Fixed time frame, width in microseconds.
    TimeFrame(i64),
    /// Fixed number of trades per candle.
    Tick(u64),
    /// Fixed traded volume per candle.
    Volume(u64),
    /// Fixed price range per candle, in price steps.
    Range(u64),
    /// Renko box size, in price steps.
    Renko(u64),
    /// Point-and-figure box size, in price steps.
    PointAndFigure(u64),
}

impl CandleKind {
    /// Time-frame kind from a duration.
    pub fn time_frame(frame: Duration) -> Self {
        CandleKind::TimeFrame(frame.as_micros() as i64)
    }

    /// The frame width, for time-frame candles.
    pub fn frame(&self) -> Option<Duration> {
        match self {
            CandleKind::TimeFrame(micros) => Some(Duration::from_micros(*micros as u64)),
            _ => None,
        }
    }
}

/// What stream of data a subscription asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// Tick trades.
    Ticks,
    /// Order log (anonymous order events).
    OrderLog,
    /// Level-1 fields (best bid/ask, last trade, ...).
    Level1,
    /// Order book depth.
    MarketDepth,
    /// News items.
    News,
    /// Trading-board state changes.
    BoardState,
    /// Own transactions (orders and trades).
    Transactions,
    /// Portfolio position changes.
    Positions,
    /// Candle series of the given kind.
    Candles(CandleKind),
}

impl DataKind {
    /// Whether this kind is stored per security (news and board state are not).
    pub fn is_security_scoped(&self) -> bool {
        !matches!(self, DataKind::News | DataKind::BoardState)
    }
}

/// Side of a trade or order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Order lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Active,
    Done,
    Failed,
}

/// Which stream an execution report belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecKind {
    /// Anonymous tick trade (market data).
    Tick,
    /// Order-log entry (market data).
    OrderLog,
    /// Own order/trade transaction.
    Transaction,
}

impl Default for ExecKind {
    fn default() -> Self {
        ExecKind::Transaction
    }
}

/// Level-1 change-set fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level1Field {
    BestBidPrice,
    BestBidVolume,
    BestAskPrice,
    BestAskVolume,
    LastTradePrice,
    LastTradeVolume,
    OpenPrice,
    HighPrice,
    LowPrice,
    ClosePrice,
    Volume,
    OpenInterest,
}

/// Position change-set fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PositionField {
    CurrentValue,
    BlockedValue,
    AveragePrice,
    RealizedPnL,
    UnrealizedPnL,
    Commission,
}

/// Process-wide transaction id source shared by a whole chain.
///
/// Ids are never reused across distinct requests.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    next: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TransactionId {
        TransactionId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Current-time source exposed by an adapter chain.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start.0 as u64),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now.0 as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst) as i64)
    }
}
