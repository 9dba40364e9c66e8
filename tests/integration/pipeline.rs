//! End-to-end engine runs against the fake accrual service.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use accrual_engine::engine::errors::{EngineError, ErrorSink};
use accrual_engine::engine::rate_gate::RateGate;
use accrual_engine::engine::{AccrualEngine, EngineConfig, EngineStats, ShutdownReport};
use accrual_engine::oracle::HttpAccrualClient;
use accrual_engine::retry::RetrySchedule;
use accrual_engine::storage::{OrderStore, SqliteStore};
use accrual_engine::types::OrderStatus;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fake_accrual::{FakeAccrual, Reply};

const ORDER_A: &str = "79927398713";
const ORDER_B: &str = "12345678903";
const ORDER_C: &str = "4561261212345467";

/// Requests already in flight when a 429 lands may arrive just after it.
const IN_FLIGHT: Duration = Duration::from_millis(300);

fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(50),
        worker_count: 2,
        queue_capacity: 16,
        claim_batch_size: 10,
        redelivery_delay: Duration::from_millis(20),
        returned_delay: Duration::from_millis(50),
        max_pending_cycles: 0,
        recover_on_start: true,
        store_retry: RetrySchedule::from_millis(&[10, 10]),
        error_sink_capacity: 16,
    }
}

struct Running {
    store: SqliteStore,
    cancel: CancellationToken,
    reports: mpsc::Receiver<EngineError>,
    stats: Arc<EngineStats>,
    handle: JoinHandle<ShutdownReport>,
}

impl Running {
    async fn shutdown(self) -> (ShutdownReport, mpsc::Receiver<EngineError>) {
        self.cancel.cancel();
        let report = self.handle.await.unwrap();
        (report, self.reports)
    }

    async fn status(&self, number: &str) -> OrderStatus {
        self.store.fetch_order(number).await.unwrap().unwrap().status
    }

    async fn balance(&self, login: &str) -> Decimal {
        self.store.balance(login).await.unwrap().current
    }
}

/// A store with user `alice` owning `orders`.
async fn store_with_orders(orders: &[&str]) -> SqliteStore {
    let store = SqliteStore::connect_in_memory().await.unwrap();
    store.create_user("alice").await.unwrap();
    for number in orders {
        store.upload_order("alice", number).await.unwrap();
    }
    store
}

async fn start(fake: &FakeAccrual, store: SqliteStore, config: EngineConfig) -> Running {
    start_with_retry(fake, store, config, &[10, 10, 10]).await
}

async fn start_with_retry(fake: &FakeAccrual, store: SqliteStore, config: EngineConfig, retry: &[u64]) -> Running {
    let base = fake.serve().await;
    let gate = Arc::new(RateGate::new());
    let oracle = HttpAccrualClient::new(&base, Some(Duration::from_secs(5)), RetrySchedule::from_millis(retry))
        .unwrap()
        .with_rate_gate(Arc::clone(&gate));
    let (sink, reports) = ErrorSink::channel(64);
    let engine = AccrualEngine::new(Arc::new(store.clone()), Arc::new(oracle), config)
        .with_error_sink(sink)
        .with_rate_gate(gate);

    let stats = engine.stats();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(engine.run(cancel.clone()));
    Running { store, cancel, reports, stats, handle }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Every recorded request either raced the 429 at `paused_at` or waited
/// out the full `pause`.
fn assert_outside_pause(fake: &FakeAccrual, orders: &[&str], paused_at: Instant, pause: Duration) {
    for number in orders {
        for at in fake.requests_for(number) {
            assert!(
                at <= paused_at + IN_FLIGHT || at - paused_at >= pause,
                "request for {number} sent {:?} into a {pause:?} pause",
                at - paused_at
            );
        }
    }
}

#[tokio::test]
async fn test_order_settles_after_intermediate_verdicts() {
    let fake = FakeAccrual::new();
    fake.script(
        ORDER_A,
        vec![Reply::status("PROCESSING"), Reply::status("PROCESSING"), Reply::processed(500.0)],
    );
    let running = start(&fake, store_with_orders(&[ORDER_A]).await, fast_config()).await;

    wait_for("order to be processed", || async { running.status(ORDER_A).await == OrderStatus::Processed }).await;

    assert_eq!(running.balance("alice").await, dec!(500));
    let order = running.store.fetch_order(ORDER_A).await.unwrap().unwrap();
    assert_eq!(order.accrual, Some(dec!(500)));
    assert_eq!(fake.requests_for(ORDER_A).len(), 3);

    let (report, mut reports) = running.shutdown().await;
    assert_eq!(report.stats.settled, 1);
    assert_eq!(report.stats.pending, 2);
    assert_eq!(report.drained, 0);
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn test_invalid_order_settles_without_credit() {
    let fake = FakeAccrual::new();
    fake.script(ORDER_B, vec![Reply::status("INVALID")]);
    let running = start(&fake, store_with_orders(&[ORDER_B]).await, fast_config()).await;

    wait_for("order to be invalid", || async { running.status(ORDER_B).await == OrderStatus::Invalid }).await;
    assert_eq!(running.balance("alice").await, dec!(0));

    running.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_defers_next_request() {
    let fake = FakeAccrual::new();
    fake.script(ORDER_B, vec![Reply::TooMany { retry_after: Some("2") }, Reply::processed(10.0)]);
    let running = start(&fake, store_with_orders(&[ORDER_B]).await, fast_config()).await;

    wait_for("order to be processed", || async { running.status(ORDER_B).await == OrderStatus::Processed }).await;

    let requests = fake.requests_for(ORDER_B);
    assert_eq!(requests.len(), 2);
    assert!(requests[1] - requests[0] >= Duration::from_secs(2));
    assert_eq!(running.balance("alice").await, dec!(10));

    let (report, _) = running.shutdown().await;
    assert_eq!(report.stats.returned, 1);
}

#[tokio::test]
async fn test_rate_limit_pauses_every_worker() {
    let fake = FakeAccrual::new();
    fake.script(ORDER_A, vec![Reply::TooMany { retry_after: Some("1") }, Reply::processed(1.0)]);
    fake.script(ORDER_B, vec![Reply::processed(2.0)]);
    fake.script(ORDER_C, vec![Reply::processed(3.0)]);

    let mut config = fast_config();
    config.worker_count = 3;
    let running = start(&fake, store_with_orders(&[ORDER_A, ORDER_B, ORDER_C]).await, config).await;

    wait_for("all orders to be processed", || async {
        running.balance("alice").await == dec!(6)
    })
    .await;

    let first_429 = fake.requests_for(ORDER_A)[0];
    assert_outside_pause(&fake, &[ORDER_A, ORDER_B, ORDER_C], first_429, Duration::from_secs(1));
    let second = fake.requests_for(ORDER_A)[1];
    assert!(second - first_429 >= Duration::from_secs(1));
    running.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_holds_client_retry_in_progress() {
    let fake = FakeAccrual::new();
    fake.script(ORDER_A, vec![Reply::TooMany { retry_after: Some("3") }, Reply::processed(1.0)]);
    fake.script(ORDER_B, vec![Reply::Status(500), Reply::processed(2.0)]);

    // B's worker is sleeping on its 1s client retry when A's 429 lands.
    let running =
        start_with_retry(&fake, store_with_orders(&[ORDER_A, ORDER_B]).await, fast_config(), &[1_000]).await;

    wait_for("both orders to be processed", || async { running.balance("alice").await == dec!(3) }).await;

    let first_429 = fake.requests_for(ORDER_A)[0];
    assert_outside_pause(&fake, &[ORDER_A, ORDER_B], first_429, Duration::from_secs(3));
    assert_eq!(fake.requests_for(ORDER_B).len(), 2);

    let (report, mut reports) = running.shutdown().await;
    assert_eq!(report.stats.settled, 2);
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn test_rate_limit_without_hint_backs_off() {
    let fake = FakeAccrual::new();
    fake.script(ORDER_A, vec![Reply::TooMany { retry_after: None }]);
    let mut config = fast_config();
    config.worker_count = 1;
    config.returned_delay = Duration::from_millis(100);
    let store = store_with_orders(&[ORDER_A]).await;
    let running = start(&fake, store.clone(), config).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let requests = fake.requests_for(ORDER_A).len();
    assert!(requests >= 2, "order was not retried");
    assert!(requests <= 12, "{requests} requests in one second");

    let (report, mut reports) = running.shutdown().await;
    assert!(report.stats.returned >= 2);
    assert!(matches!(reports.try_recv(), Ok(EngineError::RetryAfter { .. })));
    assert_eq!(store.fetch_order(ORDER_A).await.unwrap().unwrap().status, OrderStatus::New);
}

#[tokio::test]
async fn test_unknown_order_returns_to_new_without_error() {
    let fake = FakeAccrual::new();
    let running = start(&fake, store_with_orders(&[ORDER_C]).await, fast_config()).await;

    wait_for("order to be reset", || async { running.stats.snapshot().reset >= 1 }).await;
    assert!(!fake.requests_for(ORDER_C).is_empty());

    let (report, mut reports) = running.shutdown().await;
    assert!(report.stats.reset >= 1);
    assert_eq!(report.stats.settled, 0);
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_order_balance_untouched() {
    let fake = FakeAccrual::new();
    let store = store_with_orders(&[ORDER_C]).await;
    let running = start(&fake, store.clone(), fast_config()).await;

    wait_for("order to be queried", || async { !fake.requests_for(ORDER_C).is_empty() }).await;
    running.shutdown().await;

    let order = store.fetch_order(ORDER_C).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(order.accrual, None);
    assert_eq!(store.balance("alice").await.unwrap().current, dec!(0));
}

#[tokio::test]
async fn test_shutdown_leaves_no_processing_orders() {
    let fake = FakeAccrual::new();
    for number in [ORDER_A, ORDER_B, ORDER_C] {
        fake.script(number, vec![Reply::status("REGISTERED")]);
    }
    let store = store_with_orders(&[ORDER_A, ORDER_B, ORDER_C]).await;
    let running = start(&fake, store.clone(), fast_config()).await;

    wait_for("every order to be queried", || async {
        [ORDER_A, ORDER_B, ORDER_C].iter().all(|n| !fake.requests_for(n).is_empty())
    })
    .await;

    let (report, _) = running.shutdown().await;
    assert_eq!(report.drained, 3);

    for number in [ORDER_A, ORDER_B, ORDER_C] {
        assert_eq!(store.fetch_order(number).await.unwrap().unwrap().status, OrderStatus::New);
    }
    // Nothing left for a recovery pass to find.
    assert_eq!(store.release_stale_claims().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pending_budget_releases_order() {
    let fake = FakeAccrual::new();
    fake.script(ORDER_A, vec![Reply::status("PROCESSING")]);
    let mut config = fast_config();
    config.max_pending_cycles = 2;
    let running = start(&fake, store_with_orders(&[ORDER_A]).await, config).await;

    wait_for("order to be released", || async { running.stats.snapshot().released >= 1 }).await;
    assert!(fake.requests_for(ORDER_A).len() >= 2);

    let (report, _) = running.shutdown().await;
    assert!(report.stats.released >= 1);
}

#[tokio::test]
async fn test_startup_recovery_releases_stale_claims() {
    let fake = FakeAccrual::new();
    fake.script(ORDER_A, vec![Reply::processed(42.0)]);

    // A previous run claimed the order and died.
    let store = store_with_orders(&[ORDER_A]).await;
    assert_eq!(store.claim_new_orders(10).await.unwrap().len(), 1);

    let running = start(&fake, store, fast_config()).await;
    wait_for("order to be processed", || async { running.status(ORDER_A).await == OrderStatus::Processed }).await;
    assert_eq!(running.balance("alice").await, dec!(42));

    let (report, _) = running.shutdown().await;
    assert_eq!(report.stats.recovered, 1);
}

#[tokio::test]
async fn test_oracle_outage_is_reported_and_order_retried() {
    let fake = FakeAccrual::new();
    // Four failures exhaust the client's three retries for the first query.
    fake.script(
        ORDER_B,
        vec![
            Reply::Status(500),
            Reply::Status(503),
            Reply::Status(500),
            Reply::Status(503),
            Reply::processed(5.0),
        ],
    );
    let running = start(&fake, store_with_orders(&[ORDER_B]).await, fast_config()).await;

    wait_for("order to be processed", || async { running.status(ORDER_B).await == OrderStatus::Processed }).await;
    assert_eq!(running.balance("alice").await, dec!(5));

    let (report, mut reports) = running.shutdown().await;
    assert_eq!(report.stats.returned, 1);
    match reports.try_recv() {
        Ok(EngineError::Oracle { order, .. }) => assert_eq!(order, ORDER_B),
        other => panic!("expected oracle error report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_each_order_credited_once_under_many_workers() {
    let fake = FakeAccrual::new();
    for number in [ORDER_A, ORDER_B, ORDER_C] {
        fake.script(number, vec![Reply::processed(100.0)]);
    }
    let mut config = fast_config();
    config.worker_count = 6;
    let store = store_with_orders(&[ORDER_A, ORDER_B, ORDER_C]).await;
    let running = start(&fake, store.clone(), config).await;

    wait_for("all orders to be processed", || async { running.balance("alice").await >= dec!(300) }).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (report, _) = running.shutdown().await;
    assert_eq!(report.stats.settled, 3);
    assert_eq!(store.balance("alice").await.unwrap().current, dec!(300));
    for number in [ORDER_A, ORDER_B, ORDER_C] {
        assert_eq!(fake.requests_for(number).len(), 1);
    }
}
