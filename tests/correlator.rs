use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mqtt_delivery::{
    //
    AckMode,
    ConnectError,
    ConnectOptions,
    DeliveryCorrelator,
    DeliveryToken,
    Error,
    FailurePolicy,
    ListenerPtr,
    MemoryBroker,
    MemoryCall,
    MqttConfig,
    OutboundMessage,
    Outcome,
    ReasonCode,
    SessionListener,
    Transport,
    TransportPtr,
};

type Outcomes = Arc<Mutex<Vec<Outcome>>>;

async fn open(broker: &Arc<MemoryBroker>, policy: FailurePolicy) -> DeliveryCorrelator {
    // ---
    let config = MqttConfig::memory()
        .with_client_id("correlator-test")
        .with_policy(policy);

    DeliveryCorrelator::open_with(&config, |config, listener| {
        broker.create_transport(config, listener)
    })
    .await
    .expect("failed to open correlator")
}

fn recorder() -> (Outcomes, impl FnOnce(Outcome) + Send + 'static) {
    // ---
    let seen: Outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |outcome| sink.lock().unwrap().push(outcome))
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    // ---
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_acknowledgement_after_registration() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    broker.set_next_token(7);
    let correlator = open(&broker, FailurePolicy::Report).await;

    // ---
    // Act
    // ---
    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OL", handler).await;

    // ---
    // Assert
    // ---
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(correlator.pending(), 1);

    assert!(broker.acknowledge(DeliveryToken::from(7)));

    assert_eq!(*seen.lock().unwrap(), vec![Outcome::Delivered]);
    assert_eq!(correlator.pending(), 0);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(&*published[0].1.topic, "ups/ups0/status");
    assert_eq!(&published[0].1.payload[..], b"OL");

    correlator.close().await;
}

#[tokio::test]
async fn test_acknowledgement_before_publish_returns() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::BeforeReturn);
    broker.set_next_token(9);
    let correlator = open(&broker, FailurePolicy::Report).await;

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/charge", "100", handler).await;

    assert_eq!(*seen.lock().unwrap(), vec![Outcome::Delivered]);
    assert_eq!(correlator.pending(), 0);
    assert_eq!(broker.published()[0].0, DeliveryToken::from(9));

    correlator.close().await;
}

#[tokio::test]
async fn test_refused_handoff_completes_synchronously() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.fail_next_publish(ReasonCode(3));
    let correlator = open(&broker, FailurePolicy::Report).await;

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OB", handler).await;

    let outcomes = seen.lock().unwrap().clone();
    assert_eq!(outcomes, vec![Outcome::Rejected(ReasonCode(3))]);
    assert_eq!(outcomes[0].reason_code().value(), 3);
    assert!(!outcomes[0].succeeded());
    assert_eq!(correlator.pending(), 0);
    assert!(broker.published().is_empty());

    correlator.close().await;
}

#[tokio::test]
async fn test_unusable_connection_reports_failure() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    let correlator = open(&broker, FailurePolicy::Report).await;

    broker.drop_connection("keep-alive timeout");
    assert!(!correlator.is_usable());

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OL", handler).await;

    assert_eq!(*seen.lock().unwrap(), vec![Outcome::Unusable]);
    assert!(broker.published().is_empty());

    let result = correlator.publish_confirmed("ups/ups0/status", "OL").await;
    assert!(matches!(result, Err(Error::Unusable)));

    correlator.close().await;
}

#[tokio::test]
async fn test_unusable_connection_legacy_drops_silently() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    let correlator = open(&broker, FailurePolicy::Legacy).await;

    broker.drop_connection("keep-alive timeout");

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OL", handler).await;

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(correlator.pending(), 0);
    assert!(broker.published().is_empty());

    let result = correlator.publish_confirmed("ups/ups0/status", "OL").await;
    assert!(matches!(result, Err(Error::Dropped)));

    correlator.close().await;
}

#[tokio::test]
async fn test_connection_loss_fails_waiting_handlers() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    let correlator = open(&broker, FailurePolicy::Report).await;

    let mut recorded = Vec::new();
    for i in 0..3 {
        let (seen, handler) = recorder();
        correlator
            .publish("ups/ups0/load", i.to_string(), handler)
            .await;
        recorded.push(seen);
    }
    assert_eq!(correlator.pending(), 3);

    broker.drop_connection("connection reset by peer");

    for seen in &recorded {
        assert_eq!(*seen.lock().unwrap(), vec![Outcome::ConnectionLost]);
    }
    assert_eq!(correlator.pending(), 0);
    assert!(!correlator.is_usable());

    correlator.close().await;
}

#[tokio::test]
async fn test_connection_loss_legacy_leaves_handlers_waiting() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    let correlator = open(&broker, FailurePolicy::Legacy).await;

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/load", "12", handler).await;

    broker.drop_connection("connection reset by peer");

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(correlator.pending(), 1);

    correlator.close().await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_drop_without_close_fails_waiting_handlers() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    let correlator = open(&broker, FailurePolicy::Report).await;

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OL", handler).await;
    assert!(seen.lock().unwrap().is_empty());

    drop(correlator);

    assert_eq!(*seen.lock().unwrap(), vec![Outcome::ConnectionLost]);
    assert_eq!(
        broker.calls(),
        vec![MemoryCall::Create, MemoryCall::Connect, MemoryCall::Release]
    );
}

#[tokio::test]
async fn test_drop_without_close_legacy_leaves_handlers() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    let correlator = open(&broker, FailurePolicy::Legacy).await;

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OL", handler).await;
    drop(correlator);

    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pending_tracks_outstanding_publishes() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    let correlator = open(&broker, FailurePolicy::Report).await;

    let delivered = Arc::new(AtomicUsize::new(0));
    for i in 0..5 {
        let delivered = delivered.clone();
        correlator
            .publish("ups/ups0/voltage", format!("23{i}"), move |outcome| {
                assert_eq!(outcome, Outcome::Delivered);
                delivered.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }
    assert_eq!(correlator.pending(), 5);

    let tokens = broker.unacknowledged();
    assert!(broker.acknowledge(tokens[0]));
    assert!(broker.acknowledge(tokens[3]));
    assert_eq!(correlator.pending(), 3);
    assert_eq!(delivered.load(Ordering::SeqCst), 2);

    assert_eq!(broker.acknowledge_all(), 3);
    assert_eq!(correlator.pending(), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 5);

    correlator.close().await;
}

#[tokio::test]
async fn test_early_confirmation_waits_for_registration() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    broker.set_next_token(42);
    let correlator = open(&broker, FailurePolicy::Report).await;

    // Acknowledgement overtakes the publish.
    correlator.on_delivery_confirmed(DeliveryToken::from(42));
    assert_eq!(correlator.pending(), 1);

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OL", handler).await;

    assert_eq!(*seen.lock().unwrap(), vec![Outcome::Delivered]);
    assert_eq!(correlator.pending(), 0);

    correlator.close().await;
}

#[tokio::test]
async fn test_handler_may_call_back_into_correlator() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::BeforeReturn);
    let correlator = Arc::new(open(&broker, FailurePolicy::Report).await);

    let observed = Arc::new(Mutex::new(None));
    {
        let correlator_in_handler = correlator.clone();
        let observed = observed.clone();
        correlator
            .publish("ups/ups0/status", "OL", move |outcome| {
                let pending = correlator_in_handler.pending();
                let usable = correlator_in_handler.is_usable();
                *observed.lock().unwrap() = Some((outcome, pending, usable));
            })
            .await;
    }

    assert_eq!(*observed.lock().unwrap(), Some((Outcome::Delivered, 0, true)));

    // Handler from the notification task this time.
    broker.set_ack_mode(AckMode::Deferred);
    let (tx, rx) = tokio::sync::oneshot::channel();
    {
        let correlator_in_handler = correlator.clone();
        correlator
            .publish("ups/ups0/status", "OB", move |outcome| {
                let _ = tx.send((outcome, correlator_in_handler.pending()));
            })
            .await;
    }

    let (outcome, pending) = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("timed out waiting for handler")
        .expect("handler dropped");
    assert_eq!(outcome, Outcome::Delivered);
    assert_eq!(pending, 0);

    let correlator = Arc::try_unwrap(correlator)
        .unwrap_or_else(|_| panic!("correlator still shared"));
    correlator.close().await;
}

#[tokio::test]
async fn test_publish_confirmed_outcomes() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    let correlator = open(&broker, FailurePolicy::Report).await;

    correlator
        .publish_confirmed("ups/ups0/status", "OL")
        .await
        .expect("publish should be delivered");

    broker.fail_next_publish(ReasonCode::MAX_MESSAGES_INFLIGHT);
    let result = correlator.publish_confirmed("ups/ups0/status", "OL").await;
    assert!(matches!(
        result,
        Err(Error::Rejected(ReasonCode::MAX_MESSAGES_INFLIGHT))
    ));

    let result = correlator.publish_confirmed("", "OL").await;
    assert!(matches!(result, Err(Error::Rejected(ReasonCode::NULL_PARAMETER))));

    correlator.close().await;
}

#[tokio::test]
async fn test_close_fails_outstanding_and_releases_session() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);
    let correlator = open(&broker, FailurePolicy::Report).await;

    let (seen, handler) = recorder();
    correlator.publish("ups/ups0/status", "OL", handler).await;

    correlator.close().await;

    assert_eq!(*seen.lock().unwrap(), vec![Outcome::ConnectionLost]);
    assert_eq!(
        broker.calls(),
        vec![
            MemoryCall::Create,
            MemoryCall::Connect,
            MemoryCall::Disconnect,
            MemoryCall::Release
        ]
    );
}

#[tokio::test]
async fn test_open_failures_are_distinguished() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    let broker = MemoryBroker::new();
    broker.fail_create(ReasonCode::BAD_PROTOCOL);
    let result = DeliveryCorrelator::open_with(&MqttConfig::memory(), |config, listener| {
        broker.create_transport(config, listener)
    })
    .await;
    assert!(matches!(
        result,
        Err(Error::Connect(ConnectError::Create(ReasonCode::BAD_PROTOCOL)))
    ));

    let broker = MemoryBroker::new();
    broker.fail_connect(ReasonCode(5));
    let result = DeliveryCorrelator::open_with(&MqttConfig::memory(), |config, listener| {
        broker.create_transport(config, listener)
    })
    .await;
    match result {
        Err(Error::Connect(err)) => {
            assert_eq!(err, ConnectError::Connect(ReasonCode(5)));
            assert_eq!(err.reason_code(), ReasonCode(5));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connect should fail"),
    }
    assert_eq!(
        broker.calls(),
        vec![MemoryCall::Create, MemoryCall::Connect, MemoryCall::Release]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_complete_exactly_once() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    const TASKS: usize = 8;
    const PER_TASK: usize = 250;
    const TOTAL: usize = TASKS * PER_TASK;

    let broker = MemoryBroker::new();
    let correlator = Arc::new(open(&broker, FailurePolicy::Report).await);

    log::info!("publishing {TOTAL} messages from {TASKS} tasks");

    let completed = Arc::new(Mutex::new(HashSet::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for task in 0..TASKS {
        // ---
        let correlator = correlator.clone();
        let completed = completed.clone();
        let calls = calls.clone();

        handles.push(tokio::spawn(async move {
            for i in 0..PER_TASK {
                let id = task * PER_TASK + i;
                let completed = completed.clone();
                let calls = calls.clone();

                correlator
                    .publish("ups/stress", id.to_string(), move |outcome| {
                        assert_eq!(outcome, Outcome::Delivered);
                        calls.fetch_add(1, Ordering::SeqCst);
                        assert!(completed.lock().unwrap().insert(id), "{id} completed twice");
                    })
                    .await;
            }
        }));
    }

    for handle in handles {
        handle.await.expect("publisher task panicked");
    }

    wait_for("all acknowledgements", || calls.load(Ordering::SeqCst) >= TOTAL).await;
    log::info!("all {TOTAL} handlers completed");

    // Late duplicates would show up here.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), TOTAL);
    assert_eq!(completed.lock().unwrap().len(), TOTAL);
    assert_eq!(correlator.pending(), 0);

    let correlator = Arc::try_unwrap(correlator)
        .unwrap_or_else(|_| panic!("correlator still shared"));
    correlator.close().await;
}

/// Counts acknowledgements that reach the correlator before the publish
/// that produced their token has returned.
struct EarlyCounter {
    inner: ListenerPtr,
    returned: Mutex<HashSet<DeliveryToken>>,
    early: AtomicUsize,
}

impl SessionListener for EarlyCounter {
    fn delivery_complete(&self, token: DeliveryToken) {
        // ---
        if !self.returned.lock().unwrap().contains(&token) {
            self.early.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.delivery_complete(token);
    }

    fn connection_lost(&self, cause: &str) {
        self.inner.connection_lost(cause);
    }

    fn message_arrived(&self, topic: &str, payload: &[u8]) {
        self.inner.message_arrived(topic, payload);
    }
}

/// Acknowledges every publish from another thread while the publishing
/// task is still between handoff and registration.
///
/// Even tokens are acknowledged before `publish` returns; odd tokens race
/// the return, released together through a barrier.
struct RacingTransport {
    inner: TransportPtr,
    broker: Arc<MemoryBroker>,
    counter: Arc<EarlyCounter>,
}

#[async_trait::async_trait]
impl Transport for RacingTransport {
    // ---
    fn transport_id(&self) -> &str {
        self.inner.transport_id()
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<(), ReasonCode> {
        self.inner.connect(options).await
    }

    async fn publish(&self, msg: OutboundMessage) -> Result<DeliveryToken, ReasonCode> {
        // ---
        let token = self.inner.publish(msg).await?;
        let broker = self.broker.clone();

        if token.value() % 2 == 0 {
            std::thread::spawn(move || broker.acknowledge(token))
                .join()
                .expect("acknowledging thread panicked");
        } else {
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let start = barrier.clone();
            std::thread::spawn(move || {
                start.wait();
                broker.acknowledge(token);
            });
            barrier.wait();
        }

        self.counter.returned.lock().unwrap().insert(token);
        Ok(token)
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), ReasonCode> {
        self.inner.disconnect(timeout).await
    }

    fn release(&self) {
        self.inner.release();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_acknowledgements_take_both_paths() {
    // ---
    #[cfg(feature = "logging")]
    init_logging();

    const TASKS: usize = 4;
    const PER_TASK: usize = 100;
    const TOTAL: usize = TASKS * PER_TASK;

    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    broker.set_ack_mode(AckMode::Manual);

    let counter_slot: Arc<Mutex<Option<Arc<EarlyCounter>>>> = Arc::new(Mutex::new(None));
    let config = MqttConfig::memory().with_client_id("racing");

    let correlator = DeliveryCorrelator::open_with(&config, |config, listener| {
        let counter = Arc::new(EarlyCounter {
            inner: listener,
            returned: Mutex::new(HashSet::new()),
            early: AtomicUsize::new(0),
        });
        *counter_slot.lock().unwrap() = Some(counter.clone());

        let inner = broker.create_transport(config, counter.clone())?;
        let racing: TransportPtr = Arc::new(RacingTransport {
            inner,
            broker: broker.clone(),
            counter,
        });
        Ok(racing)
    })
    .await
    .expect("failed to open correlator");
    let correlator = Arc::new(correlator);
    let counter = counter_slot.lock().unwrap().clone().expect("factory not called");

    // ---
    // Act
    // ---
    let calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for task in 0..TASKS {
        let correlator = correlator.clone();
        let calls = calls.clone();

        handles.push(tokio::spawn(async move {
            for i in 0..PER_TASK {
                let calls = calls.clone();
                correlator
                    .publish("ups/race", format!("{task}-{i}"), move |outcome| {
                        assert_eq!(outcome, Outcome::Delivered);
                        calls.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
            }
        }));
    }
    for handle in handles {
        handle.await.expect("publisher task panicked");
    }

    wait_for("all racing acknowledgements", || {
        calls.load(Ordering::SeqCst) >= TOTAL
    })
    .await;

    // ---
    // Assert
    // ---
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), TOTAL);
    assert_eq!(correlator.pending(), 0);
    assert!(broker.unacknowledged().is_empty());

    // Every even token was confirmed before its registration.
    let early = counter.early.load(Ordering::SeqCst);
    log::info!("{early} of {TOTAL} acknowledgements overtook their publish");
    assert!(early >= TOTAL / 2, "only {early} early confirmations");

    let correlator = Arc::try_unwrap(correlator)
        .unwrap_or_else(|_| panic!("correlator still shared"));
    correlator.close().await;
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}

#[cfg(feature = "logging")]
fn init_logging() {
    imp::init();
}
