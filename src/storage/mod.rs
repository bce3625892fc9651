//! Storage-backed replay and persistence.
//!
//! The storage stage answers subscriptions from local storage before (or
//! instead of) the network and persists in-flight traffic in the
//! background. The physical engine is injected behind the [`StorageDrive`]
//! contract; [`MemoryDrive`] and [`FileDrive`] are the bundled
//! implementations.

mod adapter;
mod buffer;
pub mod candles;
mod file;
mod memory;

pub use adapter::{StorageAdapter, StorageConfig};
pub use buffer::MessageBuffer;
pub use candles::CandleCache;
pub use file::FileDrive;
pub use memory::MemoryDrive;

use crate::error::Result;
use crate::message::Message;
use crate::types::{CandleKind, DataKind, SecurityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Storage mode flags. Both modes may be active simultaneously.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageModes {
    /// Append every message to a time-ordered log.
    pub incremental: bool,
    /// Maintain exactly one latest-state record per key.
    pub snapshot: bool,
}

impl StorageModes {
    pub const NONE: StorageModes = StorageModes {
        incremental: false,
        snapshot: false,
    };
    pub const INCREMENTAL: StorageModes = StorageModes {
        incremental: true,
        snapshot: false,
    };
    pub const SNAPSHOT: StorageModes = StorageModes {
        incremental: false,
        snapshot: true,
    };
    pub const BOTH: StorageModes = StorageModes {
        incremental: true,
        snapshot: true,
    };

    pub fn enabled(&self) -> bool {
        self.incremental || self.snapshot
    }
}

/// On-disk payload encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageFormat {
    MessagePack,
    Json,
}

impl Default for StorageFormat {
    fn default() -> Self {
        StorageFormat::MessagePack
    }
}

/// Time-ordered storage for one `(security, kind)` key.
pub trait MessageStorage: Send + Sync {
    /// Append messages. Input order does not matter; `load` returns time
    /// order.
    fn save(&self, messages: &[Message]) -> Result<()>;

    /// Load the range `[from, to)` in ascending server-time order.
    fn load(&self, from: Timestamp, to: Timestamp) -> Result<Vec<Message>>;

    /// Overall stored `(first, last)` server times, if anything is stored.
    fn dates(&self) -> Result<Option<(Timestamp, Timestamp)>>;
}

/// Latest-state-only storage for one data kind.
///
/// Implementations derive the record key from the message itself (see
/// [`snapshot_record_key`]): the security for market-data kinds, the owning
/// transaction id plus order/trade part for executions.
pub trait SnapshotStorage: Send + Sync {
    /// Latest record for a security-keyed kind.
    fn get(&self, security: &SecurityId) -> Result<Option<Message>>;

    /// Overwrite the record under the message's own key.
    fn update(&self, message: &Message) -> Result<()>;

    /// All records with server time in `[from, to)`, ascending.
    fn all(&self, from: Timestamp, to: Timestamp) -> Result<Vec<Message>>;
}

/// Keyed access to the physical storage engine.
pub trait StorageDrive: Send + Sync {
    /// Range storage for a key. `security` is `None` for kinds that are not
    /// security-scoped (news, board state).
    fn storage(&self, security: Option<&SecurityId>, kind: &DataKind) -> Arc<dyn MessageStorage>;

    /// Snapshot storage for a kind.
    fn snapshot(&self, kind: &DataKind) -> Arc<dyn SnapshotStorage>;

    /// Candle kinds with stored data for this security.
    fn candle_kinds(&self, security: &SecurityId) -> Vec<CandleKind>;
}

/// Key under which a snapshot record is stored, or `None` when the message
/// kind has no snapshot representation.
pub(crate) fn snapshot_record_key(message: &Message) -> Option<String> {
    match message {
        Message::Level1(l1) => Some(l1.security.0.clone()),
        Message::Quotes(q) => Some(q.security.0.clone()),
        Message::Position(p) => Some(format!("{}|{}", p.security, p.portfolio)),
        Message::Execution(e) => {
            let id = e.transaction_id?;
            let part = if e.has_trade_info && !e.has_order_info {
                "trade"
            } else {
                "order"
            };
            Some(format!("t{id}:{part}"))
        }
        _ => None,
    }
}
