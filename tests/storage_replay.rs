//! Integration tests for the storage stage: replay, narrowing, and the
//! replay-then-live ordering across the whole pipeline.

mod common;

use common::{tick, FakeExchange};
use std::sync::Arc;
use std::time::Duration;
use tapeline::{
    AdapterContext, CandleKind, Chain, ChainEvents, DataKind, ExecKind, ExecutionReport,
    HistoryStep, Level1Change, Level1Field, ManualClock, MarketDataRequest, MemoryDrive, Message,
    OrderStatusRequest, PartialDownloadAdapter, SecurityId, Settings, StorageAdapter,
    StorageConfig, StorageDrive, StorageModes, Timestamp, TransactionId,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn day_micros(days: i64) -> i64 {
    days * DAY.as_micros() as i64
}

struct Setup {
    chain: Arc<Chain>,
    exchange: Arc<FakeExchange>,
    drive: Arc<MemoryDrive>,
    storage: Arc<StorageAdapter>,
    events: ChainEvents,
}

/// Storage stage directly over the venue.
fn setup(modes: StorageModes, days_load: Duration) -> Setup {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let clock = Arc::new(ManualClock::new(Timestamp(day_micros(100))));
    let ctx = AdapterContext::new(clock);
    let exchange = FakeExchange::new(ctx);
    let drive = Arc::new(MemoryDrive::new());
    let storage = StorageAdapter::new(
        exchange.clone(),
        drive.clone(),
        StorageConfig {
            modes,
            days_load,
            flush_interval: Duration::from_secs(3600),
            ..Default::default()
        },
    );
    let chain = Chain::new(storage.clone());
    let events = chain.events(4096);
    Setup {
        chain,
        exchange,
        drive,
        storage,
        events,
    }
}

/// Full pipeline: storage over the range splitter over the venue.
fn setup_full(modes: StorageModes, days_load: Duration, step: HistoryStep) -> Setup {
    let clock = Arc::new(ManualClock::new(Timestamp(day_micros(100))));
    let ctx = AdapterContext::new(clock);
    let exchange = FakeExchange::new(ctx);
    exchange.set_step(step);
    let split = PartialDownloadAdapter::new(exchange.clone());
    let drive = Arc::new(MemoryDrive::new());
    let storage = StorageAdapter::new(
        split,
        drive.clone(),
        StorageConfig {
            modes,
            days_load,
            flush_interval: Duration::from_secs(3600),
            ..Default::default()
        },
    );
    let chain = Chain::new(storage.clone());
    let events = chain.events(4096);
    Setup {
        chain,
        exchange,
        drive,
        storage,
        events,
    }
}

fn seed_ticks(drive: &MemoryDrive, security: &SecurityId, times: &[i64]) {
    let messages: Vec<Message> = times
        .iter()
        .map(|time| tick(security.as_str(), *time, 100.0, None))
        .collect();
    drive
        .storage(Some(security), &DataKind::Ticks)
        .save(&messages)
        .unwrap();
}

fn subscribe_ticks(chain: &Chain, from: Option<i64>, to: Option<i64>) -> TransactionId {
    let id = chain.context().next_transaction_id();
    let mut request = MarketDataRequest::subscribe(id, SecurityId::new("SBER"), DataKind::Ticks);
    request.from = from.map(Timestamp);
    request.to = to.map(Timestamp);
    chain.send_in(Message::MarketData(request)).unwrap();
    id
}

#[test]
fn fully_covered_request_never_reaches_the_network() {
    let setup = setup(StorageModes::INCREMENTAL, DAY);
    let security = SecurityId::new("SBER");
    seed_ticks(&setup.drive, &security, &[10, 20, 30, 100]);

    let origin = subscribe_ticks(&setup.chain, Some(0), Some(50));

    assert!(setup.exchange.received.lock().is_empty());

    let events = setup.events.drain();
    assert!(matches!(
        events[0],
        Message::SubscriptionResponse { original, error: None } if original == origin
    ));
    let replayed: Vec<i64> = events
        .iter()
        .filter_map(|event| match event {
            Message::Execution(report) => Some(report.server_time.0),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, vec![10, 20, 30]);
    assert!(matches!(
        events.last().unwrap(),
        Message::SubscriptionFinished { original } if *original == origin
    ));

    // Unsubscribing a fully processed subscription resolves locally too.
    let unsub_id = setup.chain.context().next_transaction_id();
    let unsub =
        MarketDataRequest::unsubscribe(unsub_id, origin, security.clone(), DataKind::Ticks);
    setup.chain.send_in(Message::MarketData(unsub)).unwrap();
    assert!(setup.exchange.received.lock().is_empty());
    assert!(matches!(
        setup.events.drain()[0],
        Message::SubscriptionResponse { original, error: None } if original == unsub_id
    ));
}

#[test]
fn partially_covered_request_forwards_only_the_gap() {
    let setup = setup(StorageModes::INCREMENTAL, DAY);
    let security = SecurityId::new("SBER");
    seed_ticks(&setup.drive, &security, &[10, 20]);

    subscribe_ticks(&setup.chain, Some(0), Some(1_000));

    let forwarded = &setup.exchange.market_data_requests()[0];
    // Narrowed to just after the last replayed record.
    assert_eq!(forwarded.from, Some(Timestamp(21)));
    assert_eq!(forwarded.to, Some(Timestamp(1_000)));
}

#[test]
fn disabled_storage_forwards_the_request_unmodified() {
    let setup = setup(StorageModes::NONE, Duration::ZERO);

    let origin = subscribe_ticks(&setup.chain, Some(123), Some(456));

    let forwarded = &setup.exchange.market_data_requests()[0];
    assert_eq!(forwarded.transaction_id, origin);
    assert_eq!(forwarded.from, Some(Timestamp(123)));
    assert_eq!(forwarded.to, Some(Timestamp(456)));

    // No storage ack, no replay: only the venue's own reply surfaced.
    let events = setup.events.drain();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Message::SubscriptionResponse { .. }));
    assert!(matches!(events[1], Message::SubscriptionFinished { .. }));
}

#[test]
fn replay_then_online_then_live_ordering() {
    let setup = setup_full(
        StorageModes::INCREMENTAL,
        DAY,
        HistoryStep::new(10 * DAY, Duration::ZERO),
    );
    let security = SecurityId::new("SBER");
    seed_ticks(&setup.drive, &security, &[10, 20]);

    // Network data for the gap window.
    setup.exchange.set_data_fn(Box::new(|md| {
        md.from
            .map(|from| vec![tick("SBER", from.0 + 1, 100.0, Some(md.transaction_id))])
            .into_iter()
            .flatten()
            .collect()
    }));

    let origin = subscribe_ticks(&setup.chain, Some(0), None);

    // Live data after the online transition.
    let live_sub = setup
        .exchange
        .market_data_requests()
        .iter()
        .rev()
        .find(|md| md.is_subscribe && md.from.is_none())
        .map(|md| md.transaction_id)
        .expect("live conversion must reach the venue");
    setup
        .exchange
        .publish(tick("SBER", day_micros(100) + 5, 101.0, Some(live_sub)));

    let events = setup.events.drain();

    let online_at = events
        .iter()
        .position(|event| {
            matches!(event, Message::SubscriptionOnline { original } if *original == origin)
        })
        .expect("online transition must surface");

    let stored_positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(index, event)| match event {
            Message::Execution(report) if report.server_time.0 <= 20 => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(stored_positions.len(), 2);
    assert!(stored_positions.iter().all(|index| *index < online_at));

    let live_position = events
        .iter()
        .position(|event| {
            matches!(event, Message::Execution(report) if report.server_time.0 == day_micros(100) + 5)
        })
        .expect("live tick must surface");
    assert!(live_position > online_at);

    // Everything the consumer saw is tagged with the one logical
    // subscription.
    assert!(events
        .iter()
        .filter_map(Message::original_transaction_id)
        .all(|id| id == origin));
}

#[test]
fn snapshot_mode_replays_single_latest_level1_record() {
    let setup = setup(StorageModes::SNAPSHOT, DAY);
    let security = SecurityId::new("SBER");

    let mut changes = std::collections::BTreeMap::new();
    changes.insert(Level1Field::LastTradePrice, 42.0);
    setup
        .drive
        .snapshot(&DataKind::Level1)
        .update(&Message::Level1(Level1Change {
            security: security.clone(),
            server_time: Timestamp(500),
            original_transaction_id: None,
            changes,
        }))
        .unwrap();

    let id = setup.chain.context().next_transaction_id();
    let mut request = MarketDataRequest::subscribe(id, security, DataKind::Level1);
    request.from = Some(Timestamp(0));
    setup.chain.send_in(Message::MarketData(request)).unwrap();

    let events = setup.events.drain();
    let level1: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Message::Level1(l1) => Some(l1),
            _ => None,
        })
        .collect();
    assert_eq!(level1.len(), 1);
    assert_eq!(level1[0].original_transaction_id, Some(id));

    // The live request was narrowed past the snapshot time.
    let forwarded = &setup.exchange.market_data_requests()[0];
    assert_eq!(forwarded.from, Some(Timestamp(501)));
}

#[test]
fn candles_are_built_from_stored_ticks() {
    let setup = setup(StorageModes::INCREMENTAL, DAY);
    let security = SecurityId::new("SBER");
    let minute = 60_000_000i64;
    seed_ticks(
        &setup.drive,
        &security,
        &[1, 30_000_000, minute + 1, minute + 30_000_000, 3 * minute],
    );

    let kind = CandleKind::time_frame(Duration::from_secs(60));
    let id = setup.chain.context().next_transaction_id();
    let mut request = MarketDataRequest::subscribe(id, security, DataKind::Candles(kind));
    request.from = Some(Timestamp(0));
    request.to = Some(Timestamp(2 * minute));
    setup.chain.send_in(Message::MarketData(request)).unwrap();

    let events = setup.events.drain();
    let candles: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Message::Candle(candle) => Some(candle),
            _ => None,
        })
        .collect();
    assert_eq!(candles.len(), 2);
    assert!(candles.iter().all(|c| c.kind == kind));
    assert!(candles.iter().all(|c| c.original_transaction_id == Some(id)));

    // Ticks extend past the bound, so the request finished locally.
    assert!(setup.exchange.received.lock().is_empty());
    assert!(matches!(
        events.last().unwrap(),
        Message::SubscriptionFinished { original } if *original == id
    ));
}

#[test]
fn order_status_replays_transaction_snapshots() {
    let setup = setup(StorageModes::SNAPSHOT, DAY);

    setup
        .drive
        .snapshot(&DataKind::Transactions)
        .update(&Message::Execution(ExecutionReport {
            security: SecurityId::new("SBER"),
            exec_kind: ExecKind::Transaction,
            server_time: Timestamp(day_micros(100) - 500),
            transaction_id: Some(TransactionId(77)),
            order_id: Some(4242),
            has_order_info: true,
            ..Default::default()
        }))
        .unwrap();

    let id = setup.chain.context().next_transaction_id();
    setup
        .chain
        .send_in(Message::OrderStatus(OrderStatusRequest {
            transaction_id: id,
            is_subscribe: true,
            security: None,
            order_id: None,
            order_string_id: None,
            from: None,
            to: None,
        }))
        .unwrap();

    let events = setup.events.drain();
    let replayed: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Message::Execution(report) => Some(report),
            _ => None,
        })
        .collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].original_transaction_id, Some(id));
    assert_eq!(replayed[0].transaction_id, Some(TransactionId(77)));

    // The request itself still goes to the venue.
    assert_eq!(setup.exchange.received.lock().len(), 1);
}

#[test]
fn outbound_traffic_is_persisted_by_flush() {
    let setup = setup(StorageModes::INCREMENTAL, DAY);
    let security = SecurityId::new("SBER");

    let origin = subscribe_ticks(&setup.chain, None, None);
    for time in [1_000, 2_000] {
        setup
            .exchange
            .publish(tick("SBER", time, 100.0, Some(origin)));
    }

    setup.storage.flush();

    let stored = setup
        .drive
        .storage(Some(&security), &DataKind::Ticks)
        .load(Timestamp(0), Timestamp(i64::MAX))
        .unwrap();
    assert_eq!(stored.len(), 2);
}

#[test]
fn settings_roundtrip_restores_configuration() {
    let setup = setup(StorageModes::SNAPSHOT, 3 * DAY);

    let mut settings = Settings::new();
    setup.storage.save_settings(&mut settings).unwrap();
    let json = settings.to_json().unwrap();

    let other = setup_full(
        StorageModes::NONE,
        Duration::ZERO,
        HistoryStep::NONE,
    );
    other
        .storage
        .load_settings(&Settings::from_json(&json).unwrap());

    let restored = other.storage.config();
    assert_eq!(restored.modes, StorageModes::SNAPSHOT);
    assert_eq!(restored.days_load, 3 * DAY);
}
