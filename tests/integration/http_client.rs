use std::sync::Arc;
use std::time::Duration;

use accrual_engine::engine::rate_gate::RateGate;
use accrual_engine::oracle::{AccrualOracle, AccrualStatus, HttpAccrualClient, OracleError, Verdict};
use accrual_engine::retry::RetrySchedule;
use rust_decimal_macros::dec;

use crate::fake_accrual::{FakeAccrual, Reply};

const ORDER: &str = "79927398713";

async fn client_for(fake: &FakeAccrual, retry: &[u64]) -> HttpAccrualClient {
    let base = fake.serve().await;
    HttpAccrualClient::new(&base, Some(Duration::from_secs(5)), RetrySchedule::from_millis(retry)).unwrap()
}

#[tokio::test]
async fn test_processed_verdict() {
    let fake = FakeAccrual::new();
    fake.script(ORDER, vec![Reply::processed(729.98)]);
    let client = client_for(&fake, &[]).await;

    let verdict = tokio_test::assert_ok!(client.fetch_verdict(ORDER).await);
    match verdict {
        Verdict::Assessed(v) => {
            assert_eq!(v.order, ORDER);
            assert_eq!(v.status, AccrualStatus::Processed);
            assert_eq!(v.accrual, Some(dec!(729.98)));
        }
        other => panic!("expected assessed verdict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_no_content_is_unknown() {
    let fake = FakeAccrual::new();
    let client = client_for(&fake, &[]).await;

    assert_eq!(client.fetch_verdict(ORDER).await.unwrap(), Verdict::Unknown);
}

#[tokio::test]
async fn test_retries_server_errors_then_succeeds() {
    let fake = FakeAccrual::new();
    fake.script(ORDER, vec![Reply::Status(503), Reply::Status(500), Reply::status("REGISTERED")]);
    let client = client_for(&fake, &[10, 10, 10]).await;

    let verdict = client.fetch_verdict(ORDER).await.unwrap();
    assert!(matches!(verdict, Verdict::Assessed(v) if v.status == AccrualStatus::Registered));
    assert_eq!(fake.request_count(), 3);
}

#[tokio::test]
async fn test_gives_up_after_schedule() {
    let fake = FakeAccrual::new();
    fake.script(ORDER, vec![Reply::Status(503)]);
    let client = client_for(&fake, &[10, 10]).await;

    let err = tokio_test::assert_err!(client.fetch_verdict(ORDER).await);
    assert!(matches!(err, OracleError::Unavailable { status: 503, attempts: 3 }));
    assert_eq!(fake.request_count(), 3);
}

#[tokio::test]
async fn test_rate_limit_hint_parsing() {
    let fake = FakeAccrual::new();
    fake.script("1", vec![Reply::TooMany { retry_after: Some("3") }]);
    fake.script("2", vec![Reply::TooMany { retry_after: None }]);
    fake.script("3", vec![Reply::TooMany { retry_after: Some("soon") }]);
    fake.script("4", vec![Reply::TooMany { retry_after: Some("0") }]);
    let client = client_for(&fake, &[10]).await;

    assert_eq!(
        client.fetch_verdict("1").await.unwrap(),
        Verdict::RateLimited { retry_after: Some(Duration::from_secs(3)) }
    );
    assert_eq!(client.fetch_verdict("2").await.unwrap(), Verdict::RateLimited { retry_after: None });
    assert_eq!(client.fetch_verdict("3").await.unwrap(), Verdict::RateLimited { retry_after: None });
    assert_eq!(client.fetch_verdict("4").await.unwrap(), Verdict::RateLimited { retry_after: None });
    // 429 is never retried by the client.
    assert_eq!(fake.request_count(), 4);
}

#[tokio::test]
async fn test_unexpected_status_and_bad_body() {
    let fake = FakeAccrual::new();
    fake.script("1", vec![Reply::Status(404)]);
    fake.script("2", vec![Reply::Body("not json")]);
    let client = client_for(&fake, &[10]).await;

    assert!(matches!(
        client.fetch_verdict("1").await,
        Err(OracleError::UnexpectedStatus { status: 404, .. })
    ));
    assert!(matches!(client.fetch_verdict("2").await, Err(OracleError::Decode(_))));
}

#[tokio::test]
async fn test_retry_waits_for_shared_gate() {
    let fake = FakeAccrual::new();
    fake.script(ORDER, vec![Reply::Status(500), Reply::processed(1.0)]);
    let gate = Arc::new(RateGate::new());
    let client = client_for(&fake, &[100]).await.with_rate_gate(Arc::clone(&gate));

    // Another caller hits a rate limit while this one sleeps before its retry.
    let raiser = Arc::clone(&gate);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        raiser.set_delay_for(Duration::from_secs(1));
    });

    let verdict = client.fetch_verdict(ORDER).await.unwrap();
    assert!(matches!(verdict, Verdict::Assessed(v) if v.status == AccrualStatus::Processed));

    let requests = fake.requests_for(ORDER);
    assert_eq!(requests.len(), 2);
    assert!(requests[1] - requests[0] >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_closed_gate_holds_first_attempt() {
    let fake = FakeAccrual::new();
    fake.script(ORDER, vec![Reply::status("REGISTERED")]);
    let gate = Arc::new(RateGate::new());
    gate.set_delay_for(Duration::from_millis(500));
    let client = client_for(&fake, &[]).await.with_rate_gate(gate);

    let started = std::time::Instant::now();
    tokio_test::assert_ok!(client.fetch_verdict(ORDER).await);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(fake.request_count(), 1);
}
