//! Hotpath processor scenarios over in-memory stores and bus.

use crate::bus::MemoryBus;
use crate::cache::MemoryCache;
use crate::config::Topics;
use crate::engine::classifier::Classifier;
use crate::engine::contracts::{ContractRulesResolver, MockContractService};
use crate::engine::error::EngineError;
use crate::engine::hotpath::{HotpathProcessor, ProcessOutcome};
use crate::engine::state::PositionStatus;
use crate::models::{Direction, Trade, TradeType};
use crate::store::{Database, IdempotencyStatus, LifecycleEvent, PositionSnapshot};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    db: Database,
    bus: Arc<MemoryBus>,
    processor: HotpathProcessor,
    topics: Topics,
}

fn harness() -> Harness {
    let db = Database::in_memory().unwrap();
    let cache = Arc::new(MemoryCache::new());
    let bus = Arc::new(MemoryBus::new(3));
    let contracts = Arc::new(ContractRulesResolver::new(
        Arc::new(MockContractService::new(crate::models::TaxLotMethod::Fifo)),
        cache.clone(),
        Duration::from_secs(60),
        crate::models::TaxLotMethod::Fifo,
    ));
    let topics = Topics::default();
    let processor = HotpathProcessor::new(
        db.clone(),
        cache,
        contracts,
        bus.clone(),
        Classifier::new(chrono_tz::UTC),
        topics.clone(),
        16,
        3,
    );
    Harness {
        db,
        bus,
        processor,
        topics,
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn trade(id: &str, trade_type: TradeType, qty: Decimal, price: Decimal, effective: NaiveDate) -> Trade {
    Trade {
        trade_id: id.into(),
        account: "ACC".into(),
        instrument: "AAPL".into(),
        currency: "USD".into(),
        direction: Direction::Long,
        position_key: None,
        trade_type,
        quantity: qty,
        price,
        effective_date: effective,
        settlement_date: None,
        contract_id: None,
        correlation_id: None,
        causation_id: None,
        user_id: None,
        dated_class: None,
    }
}

fn applied(outcome: ProcessOutcome) -> PositionSnapshot {
    match outcome {
        ProcessOutcome::Applied { snapshot, .. } => snapshot,
        other => panic!("expected Applied, got {:?}", other),
    }
}

#[tokio::test]
async fn new_position_single_buy() {
    let h = harness();
    let outcome = h
        .processor
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
        .await
        .unwrap();

    let snapshot = applied(outcome);
    assert_eq!(snapshot.total_qty, dec!(100));
    assert_eq!(snapshot.last_ver, 1);
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.status, PositionStatus::Active);
    assert_eq!(snapshot.lots.ids.len(), 1);

    // One event, one idempotency row, a CREATED lifecycle entry.
    let events = h.db.events().list(&snapshot.position_key).unwrap();
    assert_eq!(events.len(), 1);
    let record = h.db.idempotency().check("T1").unwrap().unwrap();
    assert_eq!(record.event_ver, 1);
    assert_eq!(record.status, IdempotencyStatus::Processed);
    let history = h.db.lifecycle().history(&snapshot.position_key).unwrap();
    assert_eq!(history[0].lifecycle_event, LifecycleEvent::Created);
}

#[tokio::test]
async fn fifo_partial_close_realizes_pnl() {
    let h = harness();
    h.processor
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
        .await
        .unwrap();
    h.processor
        .process(trade(
            "T2",
            TradeType::Increase,
            dec!(50),
            dec!(55),
            today() + chrono::Duration::days(1),
        ))
        .await
        .unwrap();
    let outcome = h
        .processor
        .process(trade(
            "T3",
            TradeType::Decrease,
            dec!(80),
            dec!(60),
            today() + chrono::Duration::days(2),
        ))
        .await
        .unwrap();

    let snapshot = applied(outcome);
    assert_eq!(snapshot.total_qty, dec!(70));
    assert_eq!(snapshot.realized_pnl, dec!(800)); // (60-50)*80

    let state = snapshot.to_state().unwrap();
    let remaining: Vec<Decimal> = state.open_lots.iter().map(|l| l.remaining_qty).collect();
    assert_eq!(remaining, vec![dec!(20), dec!(50)]);
}

#[tokio::test]
async fn full_close_then_reopen() {
    let h = harness();
    h.processor
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
        .await
        .unwrap();
    let closed = applied(
        h.processor
            .process(trade("T2", TradeType::Decrease, dec!(100), dec!(55), today()))
            .await
            .unwrap(),
    );

    assert_eq!(closed.status, PositionStatus::Terminated);
    assert_eq!(closed.total_qty, dec!(0));
    assert_eq!(closed.realized_pnl, dec!(500));
    // DECREASE event + POSITION_CLOSED marker.
    let events = h.db.events().list(&closed.position_key).unwrap();
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .any(|e| e.event_type == crate::engine::events::EventType::PositionClosed));
    assert_eq!(closed.last_ver, 3);

    let reopened = applied(
        h.processor
            .process(trade(
                "T4",
                TradeType::NewTrade,
                dec!(200),
                dec!(60),
                today() + chrono::Duration::days(1),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(reopened.status, PositionStatus::Active);
    assert_eq!(reopened.total_qty, dec!(200));
    assert_eq!(reopened.lots.ids.len(), 1);

    let history = h.db.lifecycle().history(&reopened.position_key).unwrap();
    let kinds: Vec<LifecycleEvent> = history.iter().map(|r| r.lifecycle_event).collect();
    assert_eq!(
        kinds,
        vec![
            LifecycleEvent::Created,
            LifecycleEvent::Terminated,
            LifecycleEvent::Reopened
        ]
    );
}

#[tokio::test]
async fn new_trade_on_active_position_is_a_state_violation() {
    let h = harness();
    let first = applied(
        h.processor
            .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
            .await
            .unwrap(),
    );

    let err = h
        .processor
        .process(trade("T5", TradeType::NewTrade, dec!(1), dec!(1), today()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StateViolation(_)));

    // Snapshot unchanged.
    let snapshot = h.db.snapshots().load(&first.position_key).unwrap().unwrap();
    assert_eq!(snapshot.version, first.version);
    assert_eq!(snapshot.total_qty, dec!(100));
}

#[tokio::test]
async fn duplicate_trade_returns_cached_outcome() {
    let h = harness();
    let first = applied(
        h.processor
            .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
            .await
            .unwrap(),
    );

    let second = h
        .processor
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
        .await
        .unwrap();
    match second {
        ProcessOutcome::Duplicate(record) => {
            assert_eq!(record.position_key, first.position_key);
            assert_eq!(record.event_ver, 1);
        }
        other => panic!("expected Duplicate, got {:?}", other),
    }

    // Single event, snapshot version unmoved.
    assert_eq!(h.db.events().list(&first.position_key).unwrap().len(), 1);
    let snapshot = h.db.snapshots().load(&first.position_key).unwrap().unwrap();
    assert_eq!(snapshot.version, first.version);
}

#[tokio::test]
async fn backdated_trade_routes_to_coldpath_topic() {
    let h = harness();
    h.processor
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
        .await
        .unwrap();

    let outcome = h
        .processor
        .process(trade(
            "T2",
            TradeType::Increase,
            dec!(30),
            dec!(45),
            today() - chrono::Duration::days(5),
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::RoutedToColdpath { .. }));

    let routed = h.bus.published(&h.topics.backdated_trades);
    assert_eq!(routed.len(), 1);
    let trade: Trade = serde_json::from_slice(&routed[0].1).unwrap();
    assert_eq!(trade.dated_class, Some(crate::models::DatedClass::Backdated));
    assert!(trade.position_key.is_some());

    // Nothing applied on the hotpath.
    assert!(h.db.idempotency().check("T2").unwrap().is_none());
}

#[tokio::test]
async fn forward_dated_trades_apply_on_the_hotpath() {
    let h = harness();
    h.processor
        .process(trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today()))
        .await
        .unwrap();
    let outcome = h
        .processor
        .process(trade(
            "T2",
            TradeType::Increase,
            dec!(10),
            dec!(51),
            today() + chrono::Duration::days(30),
        ))
        .await
        .unwrap();
    let snapshot = applied(outcome);
    assert_eq!(snapshot.total_qty, dec!(110));
    assert_eq!(h.bus.published_count(&h.topics.backdated_trades), 0);
}

#[tokio::test]
async fn under_allocated_decrease_closes_what_exists() {
    let h = harness();
    h.processor
        .process(trade("T1", TradeType::NewTrade, dec!(60), dec!(50), today()))
        .await
        .unwrap();
    let snapshot = applied(
        h.processor
            .process(trade("T2", TradeType::Decrease, dec!(100), dec!(55), today()))
            .await
            .unwrap(),
    );
    // Allocate what is available, never over-close.
    assert_eq!(snapshot.total_qty, dec!(0));
    assert_eq!(snapshot.status, PositionStatus::Terminated);
    assert_eq!(snapshot.realized_pnl, dec!(300));

    let events = h.db.events().list(&snapshot.position_key).unwrap();
    let decrease = events
        .iter()
        .find(|e| e.event_type == crate::engine::events::EventType::Decrease)
        .unwrap();
    assert!(!decrease.meta_lots.as_ref().unwrap().fully_allocated);
}

#[tokio::test]
async fn short_position_lifecycle() {
    let h = harness();
    let mut open = trade("T1", TradeType::NewTrade, dec!(100), dec!(50), today());
    open.direction = Direction::Short;
    let snapshot = applied(h.processor.process(open).await.unwrap());
    assert_eq!(snapshot.total_qty, dec!(-100));
    assert_eq!(snapshot.status, PositionStatus::Active);

    let mut cover = trade("T2", TradeType::Decrease, dec!(100), dec!(45), today());
    cover.direction = Direction::Short;
    let closed = applied(h.processor.process(cover).await.unwrap());
    assert_eq!(closed.total_qty, dec!(0));
    assert_eq!(closed.status, PositionStatus::Terminated);
    assert_eq!(closed.realized_pnl, dec!(500)); // (50-45)*100
}
