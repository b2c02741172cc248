use murmur_base::{EventTemplate, Kind, SecretKey, Timestamp};
use murmur_relay::test_utils::{MemoryTransport, Policy};
use tracing_test::traced_test;

use super::*;
use crate::signer::{LocalSigner, NoSigner};

fn note(key: &SecretKey, content: &str) -> Event {
    EventTemplate::new(Kind::TEXT_NOTE, content)
        .created_at(Timestamp::now())
        .into_unsigned(key.public())
        .sign(key)
}

fn spawn_pool(transport: &MemoryTransport) -> (Pool, Ingress) {
    Pool::spawn(
        Arc::new(transport.clone()),
        Arc::new(NoSigner),
        PoolOptions::default(),
    )
}

fn text_notes() -> Vec<Filter> {
    vec![Filter::new().kind(Kind::TEXT_NOTE)]
}

#[tokio::test]
#[traced_test]
async fn test_subscribe_across_relays_dedupes() {
    let transport = MemoryTransport::new();
    let a = transport.add_relay("wss://a.example.com");
    let b = transport.add_relay("wss://b.example.com");
    let key = SecretKey::from_bytes(&[7u8; 32]);
    let shared = note(&key, "on both");
    a.insert(shared.clone());
    b.insert(shared.clone());

    let (pool, mut ingress) = spawn_pool(&transport);
    let mut sub = pool
        .subscribe([a.url().clone(), b.url().clone()], text_notes())
        .await;

    let mut eose = BTreeSet::new();
    let mut received = 0;
    while eose.len() < 2 {
        match sub.next().await.unwrap() {
            SubscriptionEvent::Event { event, .. } => {
                assert_eq!(event.id, shared.id);
                received += 1;
            }
            SubscriptionEvent::Eose { relay } => {
                eose.insert(relay);
            }
            SubscriptionEvent::Closed { message, .. } => panic!("closed: {message}"),
        }
    }
    // The subscription sees the record from every relay, the ingress only once.
    assert_eq!(received, 2);
    assert_eq!(ingress.recv().await.unwrap().id, shared.id);
    assert!(ingress.try_recv().is_err());
    assert_eq!(pool.seen_on(&shared.id).len(), 2);
}

#[tokio::test]
async fn test_identical_subscriptions_share_req() {
    let transport = MemoryTransport::new();
    let relay = transport.add_relay("wss://relay.example.com");
    let (pool, _ingress) = spawn_pool(&transport);

    let mut first = pool.subscribe([relay.url().clone()], text_notes()).await;
    assert!(matches!(
        first.next().await,
        Some(SubscriptionEvent::Eose { .. })
    ));
    let mut second = pool.subscribe([relay.url().clone()], text_notes()).await;
    assert!(matches!(
        second.next().await,
        Some(SubscriptionEvent::Eose { .. })
    ));
    assert_eq!(relay.req_count(), 1);

    // New records reach both listeners.
    let key = SecretKey::from_bytes(&[7u8; 32]);
    relay.insert(note(&key, "live"));
    for sub in [&mut first, &mut second] {
        let Some(SubscriptionEvent::Event { event, .. }) = sub.next().await else {
            panic!("expected live record");
        };
        assert_eq!(event.content, "live");
    }
}

#[tokio::test]
async fn test_load_returns_newest_first() {
    let transport = MemoryTransport::new();
    let a = transport.add_relay("wss://a.example.com");
    let b = transport.add_relay("wss://b.example.com");
    let key = SecretKey::from_bytes(&[7u8; 32]);
    let now = Timestamp::now();
    let older = EventTemplate::new(Kind::TEXT_NOTE, "older")
        .created_at(now.saturating_sub(Duration::from_secs(60)))
        .into_unsigned(key.public())
        .sign(&key);
    let newer = note(&key, "newer");
    a.insert(older.clone());
    b.insert(older);
    b.insert(newer);

    let (pool, _ingress) = spawn_pool(&transport);
    let events = pool
        .load(
            [a.url().clone(), b.url().clone()],
            text_notes(),
            Duration::from_secs(3),
        )
        .await;
    let contents: Vec<_> = events.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["newer", "older"]);
}

#[tokio::test(start_paused = true)]
async fn test_load_times_out_with_partial_result() {
    let transport = MemoryTransport::new();
    let fast = transport.add_relay("wss://fast.example.com");
    let silent = transport.add_relay("wss://silent.example.com");
    silent.set_policy(Policy::Silent);
    let key = SecretKey::from_bytes(&[7u8; 32]);
    fast.insert(note(&key, "fast"));

    let (pool, _ingress) = spawn_pool(&transport);
    let start = Instant::now();
    let events = pool
        .load(
            [fast.url().clone(), silent.url().clone()],
            text_notes(),
            Duration::from_secs(3),
        )
        .await;
    assert_eq!(events.len(), 1);
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_relay_does_not_block() {
    let transport = MemoryTransport::new();
    let up = transport.add_relay("wss://up.example.com");
    let down: RelayUrl = "wss://down.example.com".parse().unwrap();
    let key = SecretKey::from_bytes(&[7u8; 32]);
    up.insert(note(&key, "hello"));

    let (pool, _ingress) = spawn_pool(&transport);
    let mut sub = pool
        .subscribe([down.clone(), up.url().clone()], text_notes())
        .await;
    let Some(SubscriptionEvent::Event { relay, .. }) = sub.next().await else {
        panic!("expected record");
    };
    assert_eq!(&relay, up.url());

    let conn = pool.connection(down).await.unwrap();
    let mut watcher = conn.watch();
    while watcher.get().unwrap().status != SocketStatus::Error {
        watcher.updated().await.unwrap();
    }
}

#[tokio::test]
async fn test_count_returns_max() {
    let transport = MemoryTransport::new();
    let a = transport.add_relay("wss://a.example.com");
    let b = transport.add_relay("wss://b.example.com");
    let key = SecretKey::from_bytes(&[7u8; 32]);
    for i in 0..3 {
        let event = note(&key, &format!("note {i}"));
        if i == 0 {
            a.insert(event.clone());
        }
        b.insert(event);
    }

    let (pool, _ingress) = spawn_pool(&transport);
    let count = pool
        .count(
            [a.url().clone(), b.url().clone()],
            text_notes(),
            Duration::from_secs(3),
        )
        .await;
    assert_eq!(count, Some(3));

    let none = pool
        .count(Vec::<RelayUrl>::new(), text_notes(), Duration::from_secs(3))
        .await;
    assert_eq!(none, None);
}

#[tokio::test(start_paused = true)]
async fn test_publish_outcomes_per_relay() {
    let transport = MemoryTransport::new();
    let ok = transport.add_relay("wss://ok.example.com");
    let no = transport.add_relay("wss://no.example.com");
    no.set_policy(Policy::Reject("blocked: not today".to_string()));
    let silent = transport.add_relay("wss://silent.example.com");
    silent.set_policy(Policy::Silent);
    let key = SecretKey::from_bytes(&[7u8; 32]);

    let (pool, _ingress) = spawn_pool(&transport);
    let event = Arc::new(note(&key, "hello"));
    let outcomes: BTreeMap<RelayUrl, RelayOutcome> = pool
        .publish(
            [ok.url().clone(), no.url().clone(), silent.url().clone()],
            event.clone(),
        )
        .await
        .collect()
        .await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[ok.url()], RelayOutcome::Accepted);
    assert_eq!(
        outcomes[no.url()],
        RelayOutcome::Rejected("blocked: not today".to_string())
    );
    assert_eq!(outcomes[silent.url()], RelayOutcome::Timeout);
    assert_eq!(ok.events(), vec![Event::clone(&event)]);
}

#[tokio::test]
async fn test_publish_without_relays() {
    let transport = MemoryTransport::new();
    let (pool, _ingress) = spawn_pool(&transport);
    let key = SecretKey::from_bytes(&[7u8; 32]);
    let mut outcomes = pool
        .publish(Vec::<RelayUrl>::new(), Arc::new(note(&key, "nowhere")))
        .await;
    assert!(outcomes.next().await.is_none());
}

#[tokio::test]
#[traced_test]
async fn test_publish_after_authentication() {
    let transport = MemoryTransport::new();
    let relay = transport.add_relay("wss://auth.example.com");
    relay.set_require_auth(true);
    let signer = LocalSigner::new(SecretKey::from_bytes(&[8u8; 32]));
    let event = Arc::new(signer.sign_with_key(
        EventTemplate::new(Kind::TEXT_NOTE, "members only"),
        signer.secret_key(),
    ));

    let (pool, _ingress) = Pool::spawn(
        Arc::new(transport.clone()),
        Arc::new(signer),
        PoolOptions::default(),
    );
    let mut outcomes = pool.publish([relay.url().clone()], event).await;
    let (_, outcome) = outcomes.next().await.unwrap();
    assert_eq!(outcome, RelayOutcome::Accepted);

    let connections = pool.connections().await;
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].auth, AuthStatus::Authenticated);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_swept() {
    let transport = MemoryTransport::new();
    let relay = transport.add_relay("wss://relay.example.com");
    let options = PoolOptions {
        idle_timeout: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(5),
        ..Default::default()
    };
    let (pool, _ingress) = Pool::spawn(Arc::new(transport.clone()), Arc::new(NoSigner), options);

    let events = pool
        .load([relay.url().clone()], text_notes(), Duration::from_secs(3))
        .await;
    assert!(events.is_empty());
    assert_eq!(pool.connections().await.len(), 1);

    // Subscriptions keep connections open.
    let mut sub = pool.subscribe([relay.url().clone()], text_notes()).await;
    assert!(matches!(sub.next().await, Some(SubscriptionEvent::Eose { .. })));
    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(relay.connection_count(), 1);

    drop(sub);
    time::sleep(Duration::from_secs(60)).await;
    assert!(pool.connections().await.is_empty());
    assert_eq!(relay.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_unanswered_relays_degrade_only_with_own_subscription() {
    let transport = MemoryTransport::new();
    let mine = transport.add_relay("wss://mine.example.com");
    let other = transport.add_relay("wss://other.example.com");
    mine.set_policy(Policy::Silent);
    other.set_policy(Policy::Silent);
    let signer = LocalSigner::new(SecretKey::from_bytes(&[9u8; 32]));
    let me = signer.secret_key().public();
    let options = PoolOptions {
        publish_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_secs(5),
        ..Default::default()
    };
    let threshold = options.quality_threshold;
    let (pool, _ingress) = Pool::spawn(Arc::new(transport.clone()), Arc::new(signer), options);

    let _own = pool
        .subscribe([mine.url().clone()], vec![Filter::new().author(me)])
        .await;
    let _feed = pool.subscribe([other.url().clone()], text_notes()).await;
    time::sleep(Duration::from_secs(1)).await;
    for info in pool.connections().await {
        assert_eq!(info.quality, 1.0);
        assert!(!info.degraded);
    }

    // Neither relay ever ends its stored records, so both requests time out.
    time::sleep(Duration::from_secs(20)).await;
    let connections: BTreeMap<RelayUrl, ConnectionInfo> = pool
        .connections()
        .await
        .into_iter()
        .map(|info| (info.url.clone(), info))
        .collect();
    assert_eq!(connections.len(), 2);
    let info = &connections[mine.url()];
    assert!(info.quality < threshold);
    assert!(info.degraded);
    let info = &connections[other.url()];
    assert!(info.quality < threshold);
    assert!(!info.degraded);
    logs_assert(|lines: &[&str]| {
        let degraded: Vec<&&str> = lines
            .iter()
            .filter(|line| line.contains("murmur::_events::relay::degraded"))
            .collect();
        match degraded.as_slice() {
            [line] if line.contains("mine.example.com") => Ok(()),
            other => Err(format!("unexpected degraded events: {other:?}")),
        }
    });
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes() {
    let transport = MemoryTransport::new();
    let relay = transport.add_relay("wss://relay.example.com");
    let (pool, _ingress) = spawn_pool(&transport);

    let mut sub = pool.subscribe([relay.url().clone()], text_notes()).await;
    assert!(matches!(sub.next().await, Some(SubscriptionEvent::Eose { .. })));

    relay.disconnect_all();
    // The connection comes back on its own and the relay sends stored records again.
    assert!(matches!(sub.next().await, Some(SubscriptionEvent::Eose { .. })));
    assert_eq!(relay.req_count(), 2);
    assert_eq!(relay.subscription_count(), 1);
}

#[tokio::test]
async fn test_invalid_records_are_dropped() {
    let transport = MemoryTransport::new();
    let relay = transport.add_relay("wss://relay.example.com");
    let key = SecretKey::from_bytes(&[7u8; 32]);
    let mut forged = note(&key, "original");
    forged.content = "tampered".to_string();
    relay.insert(forged);
    relay.insert(note(&key, "genuine"));

    let (pool, mut ingress) = spawn_pool(&transport);
    let events = pool
        .load([relay.url().clone()], text_notes(), Duration::from_secs(3))
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].content, "genuine");
    assert_eq!(ingress.recv().await.unwrap().content, "genuine");
    assert!(ingress.try_recv().is_err());
}

#[tokio::test]
async fn test_shutdown_ends_subscriptions() {
    let transport = MemoryTransport::new();
    let relay = transport.add_relay("wss://relay.example.com");
    let (pool, _ingress) = spawn_pool(&transport);
    let mut sub = pool.subscribe([relay.url().clone()], text_notes()).await;
    assert!(matches!(sub.next().await, Some(SubscriptionEvent::Eose { .. })));

    pool.shutdown();
    assert!(sub.next().await.is_none());
    assert!(pool.connection(relay.url().clone()).await.is_err());
}
