//! # Tapeline
//!
//! A composable message-adapter pipeline for trading data: a chain of
//! stream processors between a raw venue connection and application
//! consumers, each stage transforming, splitting, or persisting a stream of
//! typed trading messages.
//!
//! ## Core Concepts
//!
//! - **Messages**: typed commands and notifications correlated by
//!   transaction id
//! - **Adapters**: chain stages that intercept commands on the way down and
//!   notifications on the way up
//! - **Partial download**: one large historical subscription split into
//!   bounded sequential sub-requests
//! - **Storage stage**: replay from local storage before the network, plus
//!   background persistence into incremental and snapshot storage
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tapeline::{
//!     Chain, FileDrive, PartialDownloadAdapter, StorageAdapter, StorageConfig,
//!     StorageFormat, StorageModes,
//! };
//!
//! let venue = Arc::new(MyVenueAdapter::new(ctx));
//! let split = PartialDownloadAdapter::new(venue);
//! let drive = Arc::new(FileDrive::open("./market-data", StorageFormat::MessagePack)?);
//! let storage = StorageAdapter::new(split, drive, StorageConfig {
//!     modes: StorageModes::BOTH,
//!     ..Default::default()
//! });
//!
//! let chain = Chain::new(storage);
//! let events = chain.events(1024);
//! chain.send_in(subscribe_ticks)?;
//! ```

pub mod adapter;
pub mod download;
pub mod error;
pub mod message;
pub mod settings;
pub mod storage;
pub mod types;

// Re-exports
pub use adapter::{
    attach, Adapter, AdapterContext, AdapterCore, Chain, ChainEvents, HistoryStep, OutHandler,
    Wrapper,
};
pub use download::PartialDownloadAdapter;
pub use error::{AdapterError, Result};
pub use message::{
    BoardStateMessage, CandleMessage, ExecutionReport, Level1Change, MarketDataRequest, Message,
    NewsMessage, OrderCancel, OrderStatusRequest, PositionChange, Quote, QuoteChange, SessionState,
};
pub use settings::Settings;
pub use storage::{
    CandleCache, FileDrive, MemoryDrive, MessageBuffer, MessageStorage, SnapshotStorage,
    StorageAdapter, StorageConfig, StorageDrive, StorageFormat, StorageModes,
};
pub use types::*;
