//! Storage-backed replay and persistence stage.
//!
//! Wraps the chain outermost. On subscribe it replays stored history into
//! the outbound stream synchronously, forwards only the unfilled tail to
//! the network, and finishes locally when storage already covers the
//! requested range. A background task drains accumulated outbound traffic
//! into incremental and/or snapshot storage, resolving execution reports to
//! the transaction id of the order that produced them.

use super::buffer::MessageBuffer;
use super::candles::{build_time_frame_candles, CandleCache, DEFAULT_BUILD_LOOKBACK};
use super::{MessageStorage, SnapshotStorage, StorageDrive, StorageFormat, StorageModes};
use crate::adapter::{Adapter, AdapterCore, Wrapper};
use crate::error::Result;
use crate::message::{CandleMessage, ExecutionReport, MarketDataRequest, Message, OrderStatusRequest};
use crate::settings::Settings;
use crate::types::{CandleKind, DataKind, SecurityId, Timestamp, TransactionId};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Built-candle cache capacity (series, not candles).
const CANDLE_CACHE_CAPACITY: usize = 64;

/// Storage stage configuration. Settable before chain activation.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub modes: StorageModes,
    /// On-disk payload encoding of the drive.
    pub format: StorageFormat,
    /// Default lookback when a subscription has no lower bound. Zero
    /// disables replay for such requests.
    pub days_load: Duration,
    /// Cache candle series built from smaller stored data.
    pub cache_buildable_candles: bool,
    /// Period of the background persistence task.
    pub flush_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            modes: StorageModes::INCREMENTAL,
            format: StorageFormat::default(),
            days_load: Duration::ZERO,
            cache_buildable_candles: false,
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Storage-backed replay and persistence stage.
pub struct StorageAdapter {
    core: AdapterCore,
    inner: Arc<dyn Adapter>,
    drive: Arc<dyn StorageDrive>,
    config: RwLock<StorageConfig>,
    buffer: MessageBuffer,
    candle_cache: CandleCache,

    /// Subscriptions answered entirely from storage; their unsubscribe is
    /// resolved locally too.
    fully_processed: Mutex<HashSet<TransactionId>>,
    /// Exchange-native order id -> registration transaction id.
    order_ids: Mutex<HashMap<i64, TransactionId>>,
    /// Exchange-native string order id (lowercased) -> registration id.
    order_string_ids: Mutex<HashMap<String, TransactionId>>,
    /// Cancel transaction id -> original registration transaction id.
    cancel_transactions: Mutex<HashMap<TransactionId, TransactionId>>,
    /// Transaction ids that originated from a status request.
    order_status_ids: Mutex<HashSet<TransactionId>>,
    /// Trades that could not be resolved yet, keyed by order id.
    pending_by_order_id: Mutex<HashMap<i64, Vec<ExecutionReport>>>,
    /// Same, keyed by lowercased string order id.
    pending_by_order_string: Mutex<HashMap<String, Vec<ExecutionReport>>>,

    flush_stop: Mutex<Option<Sender<()>>>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StorageAdapter {
    pub fn new(
        inner: Arc<dyn Adapter>,
        drive: Arc<dyn StorageDrive>,
        config: StorageConfig,
    ) -> Arc<Self> {
        let stage = Arc::new(Self {
            core: AdapterCore::new(inner.context().clone()),
            inner,
            drive,
            config: RwLock::new(config),
            buffer: MessageBuffer::new(),
            candle_cache: CandleCache::new(CANDLE_CACHE_CAPACITY),
            fully_processed: Mutex::new(HashSet::new()),
            order_ids: Mutex::new(HashMap::new()),
            order_string_ids: Mutex::new(HashMap::new()),
            cancel_transactions: Mutex::new(HashMap::new()),
            order_status_ids: Mutex::new(HashSet::new()),
            pending_by_order_id: Mutex::new(HashMap::new()),
            pending_by_order_string: Mutex::new(HashMap::new()),
            flush_stop: Mutex::new(None),
            flush_thread: Mutex::new(None),
        });
        crate::adapter::attach(&stage);
        Self::spawn_flush(&stage);
        stage
    }

    pub fn config(&self) -> StorageConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: StorageConfig) {
        *self.config.write() = config;
    }

    pub fn save_settings(&self, settings: &mut Settings) -> Result<()> {
        let config = self.config.read().clone();
        settings.set("storage.modes", &config.modes)?;
        settings.set("storage.format", &config.format)?;
        settings.set("storage.days_load", &config.days_load)?;
        settings.set("storage.cache_buildable_candles", &config.cache_buildable_candles)?;
        settings.set("storage.flush_interval", &config.flush_interval)?;
        Ok(())
    }

    pub fn load_settings(&self, settings: &Settings) {
        let mut config = self.config.write();
        if let Some(modes) = settings.get("storage.modes") {
            config.modes = modes;
        }
        if let Some(format) = settings.get("storage.format") {
            config.format = format;
        }
        if let Some(days_load) = settings.get("storage.days_load") {
            config.days_load = days_load;
        }
        if let Some(cache) = settings.get("storage.cache_buildable_candles") {
            config.cache_buildable_candles = cache;
        }
        if let Some(interval) = settings.get("storage.flush_interval") {
            config.flush_interval = interval;
        }
    }

    /// Drain accumulated traffic to storage immediately.
    ///
    /// The background task calls this on its fixed period; tests and
    /// shutdown paths may call it directly. Failures are logged per
    /// category and never propagate.
    pub fn flush(&self) {
        let config = self.config.read().clone();
        if !config.modes.enabled() {
            return;
        }

        for (security, reports) in self.buffer.take_ticks() {
            let messages = into_messages(reports);
            self.try_save(
                &self.drive.storage(Some(&security), &DataKind::Ticks),
                &messages,
            );
        }

        for (security, reports) in self.buffer.take_order_log() {
            let messages = into_messages(reports);
            self.try_save(
                &self.drive.storage(Some(&security), &DataKind::OrderLog),
                &messages,
            );
        }

        for (security, reports) in self.buffer.take_transactions() {
            if config.modes.incremental {
                let messages: Vec<Message> =
                    reports.iter().cloned().map(Message::Execution).collect();
                self.try_save(
                    &self.drive.storage(Some(&security), &DataKind::Transactions),
                    &messages,
                );
            }
            if config.modes.snapshot {
                let snapshots = self.drive.snapshot(&DataKind::Transactions);
                self.persist_transaction_snapshots(&security, reports, snapshots.as_ref());
            }
        }

        for (security, books) in self.buffer.take_order_books() {
            let messages: Vec<Message> = books.into_iter().map(Message::Quotes).collect();
            if config.modes.incremental {
                self.try_save(
                    &self.drive.storage(Some(&security), &DataKind::MarketDepth),
                    &messages,
                );
            }
            if config.modes.snapshot {
                let snapshots = self.drive.snapshot(&DataKind::MarketDepth);
                for message in &messages {
                    self.try_update(snapshots.as_ref(), message);
                }
            }
        }

        let today = self.core.context().now().start_of_day();
        for (security, changes) in self.buffer.take_level1() {
            let (historical, current): (Vec<_>, Vec<_>) = changes
                .into_iter()
                .filter(|l1| !l1.changes.is_empty())
                .partition(|l1| l1.server_time < today);

            let storage = self.drive.storage(Some(&security), &DataKind::Level1);
            // Older-than-today changes always go to the incremental archive
            // so the live snapshot covers only the current day.
            let historical: Vec<Message> = historical.into_iter().map(Message::Level1).collect();
            self.try_save(&storage, &historical);

            let current: Vec<Message> = current.into_iter().map(Message::Level1).collect();
            if config.modes.incremental {
                self.try_save(&storage, &current);
            }
            if config.modes.snapshot {
                let snapshots = self.drive.snapshot(&DataKind::Level1);
                for message in &current {
                    self.try_update(snapshots.as_ref(), message);
                }
            }
        }

        for ((security, kind), candles) in self.buffer.take_candles() {
            let messages: Vec<Message> = candles.into_iter().map(Message::Candle).collect();
            self.try_save(
                &self
                    .drive
                    .storage(Some(&security), &DataKind::Candles(kind)),
                &messages,
            );
        }

        for (security, changes) in self.buffer.take_positions() {
            let messages: Vec<Message> = changes
                .into_iter()
                .filter(|p| !p.changes.is_empty())
                .map(Message::Position)
                .collect();
            if config.modes.incremental {
                self.try_save(
                    &self.drive.storage(Some(&security), &DataKind::Positions),
                    &messages,
                );
            }
            if config.modes.snapshot {
                let snapshots = self.drive.snapshot(&DataKind::Positions);
                for message in &messages {
                    self.try_update(snapshots.as_ref(), message);
                }
            }
        }

        let news: Vec<Message> = self.buffer.take_news().into_iter().map(Message::News).collect();
        self.try_save(&self.drive.storage(None, &DataKind::News), &news);
    }

    fn try_save(&self, storage: &Arc<dyn MessageStorage>, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        if let Err(err) = storage.save(messages) {
            tracing::error!(error = %err, "storage flush failed");
        }
    }

    fn try_update(&self, snapshots: &dyn SnapshotStorage, message: &Message) {
        if let Err(err) = snapshots.update(message) {
            tracing::error!(error = %err, "snapshot update failed");
        }
    }

    /// Persist execution reports into the transaction snapshot, resolving
    /// every report to the transaction id of the order that produced it.
    fn persist_transaction_snapshots(
        &self,
        security: &SecurityId,
        reports: Vec<ExecutionReport>,
        snapshots: &dyn SnapshotStorage,
    ) {
        for mut report in reports {
            let mut origin = report.original_transaction_id;

            if report.transaction_id.is_none() && origin.is_none() {
                if !report.has_trade_info {
                    continue;
                }

                // Resolve through the exchange-native order identifiers, or
                // hold the trade until the owning registration shows up.
                if let Some(order_id) = report.order_id {
                    match self.order_ids.lock().get(&order_id).copied() {
                        Some(id) => origin = Some(id),
                        None => {
                            self.pending_by_order_id
                                .lock()
                                .entry(order_id)
                                .or_default()
                                .push(report);
                            continue;
                        }
                    }
                } else if let Some(string_id) = report.order_string_id.clone() {
                    let key = string_id.to_ascii_lowercase();
                    match self.order_string_ids.lock().get(&key).copied() {
                        Some(id) => origin = Some(id),
                        None => {
                            self.pending_by_order_string
                                .lock()
                                .entry(key)
                                .or_default()
                                .push(report);
                            continue;
                        }
                    }
                } else {
                    continue;
                }
            } else {
                // Cancel command echoes are never persisted.
                if report.is_cancelled && report.transaction_id.is_some() {
                    continue;
                }

                if let Some(referenced) = origin {
                    let mut referenced = referenced;
                    if let Some(registration) =
                        self.cancel_transactions.lock().get(&referenced).copied()
                    {
                        // Cancellation errors are not state either.
                        if report.error.is_some() {
                            continue;
                        }
                        // Re-key the cancel reference to the original order.
                        referenced = registration;
                    }

                    if self.order_status_ids.lock().contains(&referenced) {
                        // A reconciliation reply belongs to its own order.
                        origin = report.transaction_id;
                    } else {
                        origin = Some(referenced);
                    }
                }

                if let Some(owner) = origin {
                    if let Some(order_id) = report.order_id {
                        self.order_ids.lock().entry(order_id).or_insert(owner);
                    } else if let Some(string_id) = &report.order_string_id {
                        self.order_string_ids
                            .lock()
                            .entry(string_id.to_ascii_lowercase())
                            .or_insert(owner);
                    }
                }
            }

            report.security = security.clone();
            if report.transaction_id.is_none() {
                report.transaction_id = origin;
            }
            report.original_transaction_id = None;

            let resolved_id = report.transaction_id;
            let order_id = report.order_id;
            let order_string = report.order_string_id.clone();

            if let Err(err) = save_transaction(snapshots, report) {
                tracing::error!(error = %err, "transaction snapshot failed");
                continue;
            }

            // The owning id is known now; flush any trades held for it.
            let suspended = match (order_id, &order_string) {
                (Some(order_id), _) => self.pending_by_order_id.lock().remove(&order_id),
                (None, Some(string_id)) => self
                    .pending_by_order_string
                    .lock()
                    .remove(&string_id.to_ascii_lowercase()),
                (None, None) => None,
            };
            for mut trade in suspended.into_iter().flatten() {
                trade.transaction_id = resolved_id;
                if let Err(err) = save_transaction(snapshots, trade) {
                    tracing::error!(error = %err, "suspended trade snapshot failed");
                }
            }
        }
    }

    fn process_market_data(&self, md: MarketDataRequest) -> Result<()> {
        let config = self.config.read().clone();

        if md.from.is_none() && config.days_load.is_zero() {
            return self.inner.send_in(Message::MarketData(md));
        }

        if md.is_subscribe {
            if !config.modes.enabled() {
                return self.inner.send_in(Message::MarketData(md));
            }

            let transaction_id = md.transaction_id;

            // Acknowledge first; replay is synchronous and ordered before
            // anything live.
            self.core.publish(Message::SubscriptionResponse {
                original: transaction_id,
                error: None,
            });

            let last_time = self.replay(&md, &config)?;

            if let (Some(to), Some(last)) = (md.to, last_time) {
                if to <= last {
                    // Storage covers the whole range; the network never
                    // hears about this subscription.
                    self.fully_processed.lock().insert(transaction_id);
                    self.core.publish(Message::SubscriptionFinished {
                        original: transaction_id,
                    });
                    return Ok(());
                }
            }

            let mut md = md;
            if let Some(last) = last_time {
                let keep_bounds =
                    md.kind == DataKind::MarketDepth && md.from.is_none() && md.to.is_none();
                if !keep_bounds {
                    md.from = Some(last.next_micro());
                }
            }

            self.inner.send_in(Message::MarketData(md))
        } else {
            if let Some(original) = md.original_transaction_id {
                if self.fully_processed.lock().remove(&original) {
                    // Resolved locally; the inner chain never saw it.
                    self.core.publish(Message::SubscriptionResponse {
                        original: md.transaction_id,
                        error: None,
                    });
                    return Ok(());
                }
            }
            self.inner.send_in(Message::MarketData(md))
        }
    }

    fn process_order_status(&self, os: OrderStatusRequest) -> Result<()> {
        self.order_status_ids.lock().insert(os.transaction_id);

        if !os.is_subscribe {
            return self.inner.send_in(Message::OrderStatus(os));
        }

        let config = self.config.read().clone();
        let whole_book = os.order_id.is_none() && os.order_string_id.is_none();

        if whole_book && !config.days_load.is_zero() && config.modes.snapshot {
            let snapshots = self.drive.snapshot(&DataKind::Transactions);
            let now = self.core.context().now();
            let from = os.from.unwrap_or(now.start_of_day() - config.days_load);
            let to = os.to.unwrap_or(Timestamp(i64::MAX));

            for mut snapshot in snapshots.all(from, to)? {
                if let Message::Execution(report) = &snapshot {
                    if let Some(owner) = report.transaction_id {
                        if let Some(order_id) = report.order_id {
                            self.order_ids.lock().entry(order_id).or_insert(owner);
                        } else if let Some(string_id) = &report.order_string_id {
                            self.order_string_ids
                                .lock()
                                .entry(string_id.to_ascii_lowercase())
                                .or_insert(owner);
                        }
                    }
                }
                snapshot.set_original_transaction_id(Some(os.transaction_id));
                self.core.publish(snapshot);
            }
        }

        self.inner.send_in(Message::OrderStatus(os))
    }

    /// Replay stored history for a subscription. Returns the server time of
    /// the last replayed record.
    fn replay(&self, md: &MarketDataRequest, config: &StorageConfig) -> Result<Option<Timestamp>> {
        match md.kind {
            DataKind::Level1 => self.replay_latest_or_range(md, config, DataKind::Level1),
            DataKind::MarketDepth => self.replay_latest_or_range(md, config, DataKind::MarketDepth),
            DataKind::Ticks => self.replay_range(
                &self.drive.storage(Some(&md.security), &DataKind::Ticks),
                md,
                config.days_load,
            ),
            DataKind::OrderLog => self.replay_range(
                &self.drive.storage(Some(&md.security), &DataKind::OrderLog),
                md,
                config.days_load,
            ),
            DataKind::News => self.replay_range(
                &self.drive.storage(None, &DataKind::News),
                md,
                config.days_load,
            ),
            DataKind::BoardState => self.replay_range(
                &self.drive.storage(None, &DataKind::BoardState),
                md,
                config.days_load,
            ),
            DataKind::Transactions | DataKind::Positions => Ok(None),
            DataKind::Candles(kind) => self.replay_candles(md, kind, config),
        }
    }

    /// Level-1 and depth: one latest snapshot record under snapshot mode,
    /// a range replay under incremental mode.
    fn replay_latest_or_range(
        &self,
        md: &MarketDataRequest,
        config: &StorageConfig,
        kind: DataKind,
    ) -> Result<Option<Timestamp>> {
        if config.modes.snapshot {
            let Some(mut message) = self.drive.snapshot(&kind).get(&md.security)? else {
                return Ok(None);
            };
            let last = message.server_time();
            message.set_original_transaction_id(Some(md.transaction_id));
            self.core.publish(message);
            Ok(last)
        } else if config.modes.incremental {
            self.replay_range(
                &self.drive.storage(Some(&md.security), &kind),
                md,
                Duration::ZERO,
            )
        } else {
            Ok(None)
        }
    }

    fn replay_range(
        &self,
        storage: &Arc<dyn MessageStorage>,
        md: &MarketDataRequest,
        lookback: Duration,
    ) -> Result<Option<Timestamp>> {
        let Some((_, last_stored)) = storage.dates()? else {
            return Ok(None);
        };

        let to = md.to.unwrap_or_else(|| last_stored.next_micro());
        let from = md.from.unwrap_or(to - lookback);

        let mut last = None;
        for mut message in storage.load(from, to)? {
            message.set_original_transaction_id(Some(md.transaction_id));
            last = message.server_time().or(last);
            self.core.publish(message);
        }

        // Stored data extending past the requested bound means storage
        // covers the whole range.
        if let Some(bound) = md.to {
            if last_stored >= bound {
                return Ok(Some(last_stored));
            }
        }
        Ok(last)
    }

    fn replay_candles(
        &self,
        md: &MarketDataRequest,
        kind: CandleKind,
        config: &StorageConfig,
    ) -> Result<Option<Timestamp>> {
        let native = self
            .drive
            .storage(Some(&md.security), &DataKind::Candles(kind));
        if native.dates()?.is_some() {
            return self.replay_range(&native, md, config.days_load);
        }

        // No native series; build time-frame candles from a smaller stored
        // series over a bounded lookback.
        if kind.frame().is_none() {
            return Ok(None);
        }

        let source_kind = md.build_from.unwrap_or(DataKind::Ticks);
        let source = self.drive.storage(Some(&md.security), &source_kind);
        let Some((_, last_stored)) = source.dates()? else {
            return Ok(None);
        };

        let to = md.to.unwrap_or_else(|| last_stored.next_micro());
        let from = md.from.unwrap_or(to - DEFAULT_BUILD_LOOKBACK);

        let security = md.security.clone();
        let build = || -> Result<Vec<CandleMessage>> {
            let source_messages = source.load(from, to)?;
            Ok(build_time_frame_candles(&security, kind, &source_messages))
        };

        let candles = if config.cache_buildable_candles {
            self.candle_cache
                .get_or_build((security.clone(), kind, from, to), build)?
        } else {
            build()?
        };

        let mut last = None;
        for mut candle in candles {
            candle.original_transaction_id = Some(md.transaction_id);
            last = Some(candle.last_time());
            self.core.publish(Message::Candle(candle));
        }

        if let Some(bound) = md.to {
            if last_stored >= bound {
                return Ok(Some(last_stored));
            }
        }
        Ok(last)
    }

    fn spawn_flush(stage: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(stage);
        let (stop, stopped) = bounded::<()>(0);

        let spawned = thread::Builder::new()
            .name("storage-flush".into())
            .spawn(move || loop {
                let interval = match weak.upgrade() {
                    Some(stage) => stage.config.read().flush_interval,
                    None => break,
                };
                match stopped.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(stage) = weak.upgrade() else { break };
                        // Single worker: a slow cycle delays the next one,
                        // runs never overlap.
                        stage.flush();
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                *stage.flush_stop.lock() = Some(stop);
                *stage.flush_thread.lock() = Some(handle);
            }
            Err(err) => tracing::error!(error = %err, "failed to start storage flush task"),
        }
    }
}

impl Wrapper for StorageAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    fn inner(&self) -> &Arc<dyn Adapter> {
        &self.inner
    }

    fn process_in(&self, message: Message) -> Result<()> {
        match message {
            Message::Reset => {
                self.fully_processed.lock().clear();
                self.order_ids.lock().clear();
                self.order_string_ids.lock().clear();
                self.cancel_transactions.lock().clear();
                self.order_status_ids.lock().clear();
                self.pending_by_order_id.lock().clear();
                self.pending_by_order_string.lock().clear();
                self.buffer.clear();
                self.inner.send_in(Message::Reset)
            }
            Message::MarketData(md) => self.process_market_data(md),
            Message::OrderStatus(os) => self.process_order_status(os),
            Message::OrderCancel(oc) => {
                self.cancel_transactions
                    .lock()
                    .insert(oc.transaction_id, oc.order_transaction_id);
                self.inner.send_in(Message::OrderCancel(oc))
            }
            other => self.inner.send_in(other),
        }
    }

    fn process_out(&self, message: Message) {
        if self.config.read().modes.enabled() {
            self.buffer.add(&message);
        }
        self.core.publish(message);
    }

    fn candle_kinds(&self, security: &SecurityId) -> Vec<CandleKind> {
        let mut kinds = self.inner.candle_kinds(security);
        for kind in self.drive.candle_kinds(security) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }
}

impl Drop for StorageAdapter {
    fn drop(&mut self) {
        // Dropping the sender wakes the flush thread into shutdown.
        self.flush_stop.get_mut().take();
        if let Some(handle) = self.flush_thread.get_mut().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Split a combined order+trade report into two snapshot records sharing
/// the same transaction id; order state and trade state are updated
/// independently from here on.
fn save_transaction(snapshots: &dyn SnapshotStorage, mut report: ExecutionReport) -> Result<()> {
    let trade_part = (report.has_order_info && report.has_trade_info).then(|| ExecutionReport {
        security: report.security.clone(),
        exec_kind: report.exec_kind,
        server_time: report.server_time,
        transaction_id: report.transaction_id,
        side: report.side,
        trade_id: report.trade_id,
        trade_price: report.trade_price,
        trade_volume: report.trade_volume,
        has_trade_info: true,
        ..Default::default()
    });

    if trade_part.is_some() {
        report.has_trade_info = false;
        report.trade_id = None;
        report.trade_price = None;
        report.trade_volume = None;
    }

    snapshots.update(&Message::Execution(report))?;
    if let Some(trade) = trade_part {
        snapshots.update(&Message::Execution(trade))?;
    }
    Ok(())
}

fn into_messages(reports: Vec<ExecutionReport>) -> Vec<Message> {
    reports.into_iter().map(Message::Execution).collect()
}
