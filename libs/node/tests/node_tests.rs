use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use polymesh_core::envelope::{Reply, ReplyCode, Request};
use polymesh_core::error::{Error, ErrorKind};
use polymesh_core::Config;
use polymesh_fabric::{Broker, BrokerMessage, BrokerSubscription, MemoryBroker, Socket};
use polymesh_node::{Client, HandlerSet, Server, ServerState, Service, ServiceDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct TestService;

impl Service for TestService {
    fn name(&self) -> Option<String> {
        Some("s".to_string())
    }

    fn handlers(&self) -> HandlerSet {
        HandlerSet::new()
            .handler("echo", |r: Request| async move { Ok(r.data) })
            .handler("fail", |_r: Request| async move {
                Err(anyhow::anyhow!("test"))
            })
            .handler("explode", |r: Request| async move {
                if r.data.is_null() {
                    panic!("boom");
                }
                Ok(r.data)
            })
            .handler("sleep", |r: Request| async move {
                let ms = r.data.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            })
            .handler("_hidden", |_r: Request| async move { Ok(json!("secret")) })
    }
}

fn config() -> Config {
    Config::default()
        .with_host("127.0.0.1")
        .with_port(0)
        .with_interval(Duration::from_millis(50))
}

async fn start_server(broker: &MemoryBroker, config: Config) -> Server {
    let server = Server::new(config, Arc::new(broker.clone()));
    server.add_service(TestService).unwrap();
    server.start().await.unwrap();
    server
}

async fn start_client(broker: &MemoryBroker, config: Config) -> Client {
    let client = Client::new(config, Arc::new(broker.clone()));
    client.start(["s"]).await.unwrap();
    client
}

async fn wait_for_instances(client: &Client, service: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.instances(service).len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("instances were never discovered");
}

async fn wait_for_pending(client: &Client, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.pending() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pending requests never reached the expected count");
}

async fn pair() -> (MemoryBroker, Server, Client) {
    let broker = MemoryBroker::new();
    let server = start_server(&broker, config()).await;
    let client = start_client(&broker, config()).await;
    wait_for_instances(&client, "s", 1).await;
    (broker, server, client)
}

#[tokio::test]
async fn echo_round_trip() {
    let (_broker, server, client) = pair().await;

    assert_eq!(client.send("s.echo", json!(42), None).await.unwrap(), json!(42));
    let nested = json!({ "a": [1, 2, { "b": null }], "c": "text" });
    assert_eq!(
        client.send("s.echo", nested.clone(), None).await.unwrap(),
        nested
    );

    client.shutdown(false).await;
    server.shutdown().await;
}

#[tokio::test]
async fn absent_payload_resolves_to_null() {
    let (_broker, _server, client) = pair().await;
    assert_eq!(
        client.send("s.echo", Value::Null, None).await.unwrap(),
        Value::Null
    );
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i32,
    y: i32,
}

#[tokio::test]
async fn typed_call() {
    let (_broker, _server, client) = pair().await;
    let point: Point = client.call("s.echo", &Point { x: 1, y: -2 }).await.unwrap();
    assert_eq!(point, Point { x: 1, y: -2 });
}

#[tokio::test]
async fn routing_failures() {
    let (_broker, _server, client) = pair().await;

    let err = client.send("x.echo", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownService);

    let err = client.send("s.bogus", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMethod);
}

#[tokio::test]
async fn handler_failures_become_replies() {
    let (_broker, _server, client) = pair().await;

    match client.send("s.fail", Value::Null, None).await.unwrap_err() {
        Error::InvalidResponse { reason, .. } => assert_eq!(reason, "test"),
        e => panic!("Expected InvalidResponse, got {:?}", e),
    }

    match client.send("s.explode", Value::Null, None).await.unwrap_err() {
        Error::InvalidResponse { reason, .. } => assert!(reason.contains("boom")),
        e => panic!("Expected InvalidResponse, got {:?}", e),
    }

    // The server survives both
    assert_eq!(client.send("s.explode", json!(5), None).await.unwrap(), json!(5));
}

#[tokio::test]
async fn timeout_law() {
    let (_broker, _server, client) = pair().await;

    let err = client
        .send("s.sleep", json!(300), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestTimeout);
    assert_eq!(client.pending(), 0);

    // The late reply for the expired request is dropped
    tokio::time::sleep(Duration::from_millis(300)).await;

    let value = client.send("s.sleep", json!(200), None).await.unwrap();
    assert_eq!(value, json!(200));
}

#[tokio::test]
async fn default_timeout_comes_from_config() {
    let broker = MemoryBroker::new();
    let _server = start_server(&broker, config()).await;
    let client = start_client(&broker, config().with_timeout(Duration::from_millis(100))).await;
    wait_for_instances(&client, "s", 1).await;

    let err = client.send("s.sleep", json!(300), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestTimeout);

    // An explicit timeout overrides the default
    let value = client
        .send("s.sleep", json!(200), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(value, json!(200));
}

#[tokio::test]
async fn stale_requests_expire() {
    let broker = MemoryBroker::new();
    // Announce well within the stale window so the instance itself stays
    let _server = start_server(&broker, config().with_interval(Duration::from_millis(20))).await;
    let client = start_client(&broker, config().with_stale(Duration::from_millis(150))).await;
    wait_for_instances(&client, "s", 1).await;

    let err = client.send("s.sleep", json!(2000), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MessageExpired);
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn down_event_reaps_pending_requests() {
    let (_broker, server, client) = pair().await;
    let client = Arc::new(client);

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.send("s.sleep", json!(5000), None).await });
    wait_for_pending(&client, 1).await;

    server.shutdown().await;

    let err = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    match err {
        Error::ServiceUnavailable { service, instance } => {
            assert_eq!(service, "s");
            assert_eq!(instance, server.id());
        }
        e => panic!("Expected ServiceUnavailable, got {:?}", e),
    }

    assert!(client.instances("s").is_empty());
    let err = client.send("s.echo", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoInstanceAvailable);
}

#[tokio::test]
async fn simulated_down_removes_instance() {
    let broker = MemoryBroker::new();
    // Subscribe first so the single announcement of a slow ticker is seen
    let client = Arc::new(start_client(&broker, config()).await);
    let slow = config().with_interval(Duration::from_secs(60));
    let server = start_server(&broker, slow).await;
    wait_for_instances(&client, "s", 1).await;

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.send("s.sleep", json!(5000), None).await });
    wait_for_pending(&client, 1).await;

    let descriptor = server.descriptor().unwrap();
    client
        .handle_discovery(BrokerMessage {
            channel: "down-polymesh".to_string(),
            payload: descriptor.encode().unwrap(),
        })
        .await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    assert_eq!(client.pending(), 0);
    assert!(client.instances("s").is_empty());

    let err = client.send("s.echo", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoInstanceAvailable);
}

#[tokio::test]
async fn requests_spread_across_instances() {
    let broker = MemoryBroker::new();
    let mut servers = Vec::new();
    for label in ["first", "second"] {
        let server = Server::new(config(), Arc::new(broker.clone()));
        server
            .add_service(ServiceDefinition::new(
                "s",
                HandlerSet::new().handler("who", move |_r: Request| async move { Ok(json!(label)) }),
            ))
            .unwrap();
        server.start().await.unwrap();
        servers.push(server);
    }

    let client = start_client(&broker, config()).await;
    wait_for_instances(&client, "s", 2).await;

    let mut seen = HashSet::new();
    for _ in 0..40 {
        let value = client.send("s.who", Value::Null, None).await.unwrap();
        seen.insert(value.as_str().unwrap().to_string());
    }
    assert_eq!(seen.len(), 2);
}

#[tokio::test]
async fn client_shutdown_is_idempotent() {
    let (_broker, _server, client) = pair().await;
    let client = Arc::new(client);

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.send("s.sleep", json!(5000), None).await });
    wait_for_pending(&client, 1).await;

    client.shutdown(false).await;
    client.shutdown(false).await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientShuttingDown);
    assert_eq!(client.pending(), 0);

    let err = client.send("s.echo", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientShuttingDown);
    assert!(matches!(
        client.start(["s"]).await,
        Err(Error::ClientShuttingDown)
    ));
}

#[tokio::test]
async fn remote_shutdown_stops_server() {
    let (_broker, server, client) = pair().await;

    client.shutdown(true).await;

    tokio::time::timeout(Duration::from_secs(2), server.stopped())
        .await
        .expect("server did not stop");
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn validation_fails_without_network() {
    let client = Client::new(config(), Arc::new(MemoryBroker::new()));

    let cases = [
        ("", ErrorKind::InvalidPath),
        ("s", ErrorKind::MissingMethod),
        ("s.", ErrorKind::MissingMethod),
        (".echo", ErrorKind::InvalidPath),
        ("s._hidden", ErrorKind::InvalidMethod),
        ("#CS#.echo", ErrorKind::InvalidPath),
    ];
    for (path, kind) in cases {
        let err = client.send(path, json!(1), None).await.unwrap_err();
        assert_eq!(err.kind(), kind, "path {path:?}");
        assert!(err.is_validation());
    }

    // Valid path, but nothing discovered
    let err = client.send("s.echo", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownService);
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn tracked_service_without_instances() {
    let client = start_client(&MemoryBroker::new(), config()).await;
    let err = client.send("s.echo", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoInstanceAvailable);
    assert_eq!(
        client.start(["s"]).await.unwrap_err().kind(),
        ErrorKind::AlreadyStarted
    );
}

#[tokio::test]
async fn server_lifecycle_errors() {
    let broker = MemoryBroker::new();

    let empty = Server::new(config(), Arc::new(broker.clone()));
    assert_eq!(
        empty.start().await.unwrap_err().kind(),
        ErrorKind::NoServicesRegistered
    );

    let server = Server::new(config(), Arc::new(broker.clone()));
    assert_eq!(server.state(), ServerState::Created);
    assert_eq!(server.add_service(TestService).unwrap(), "s");
    assert_eq!(
        server.add_service(TestService).unwrap_err().kind(),
        ErrorKind::DuplicateService
    );

    let addr = server.start().await.unwrap();
    assert_eq!(server.state(), ServerState::Broadcasting);
    assert_eq!(server.local_addr(), Some(addr));

    let descriptor = server.descriptor().unwrap();
    assert_eq!(descriptor.id, server.id());
    assert_eq!(descriptor.host, "127.0.0.1");
    assert_eq!(descriptor.port, addr.port());
    assert_eq!(descriptor.services, vec!["s"]);

    assert_eq!(
        server.start().await.unwrap_err().kind(),
        ErrorKind::AlreadyStarted
    );
    assert_eq!(
        server.add_service(ServiceDefinition::new("late", HandlerSet::new())).unwrap_err().kind(),
        ErrorKind::AlreadyStarted
    );

    server.shutdown().await;
    server.shutdown().await;
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn server_announces_up_and_down() {
    let broker = MemoryBroker::new();
    let mut events = broker
        .subscribe(&["up-a".to_string(), "down-b".to_string()])
        .await
        .unwrap();

    let server = start_server(&broker, config().with_group("a").with_group("b")).await;
    let up = events.recv().await.unwrap();
    assert_eq!(up.channel, "up-a");

    server.shutdown().await;
    loop {
        let event = events.recv().await.unwrap();
        if event.channel == "down-b" {
            assert!(event.payload.contains(server.id()));
            break;
        }
    }
}

async fn raw_socket(port: u16) -> (Socket, mpsc::UnboundedReceiver<Reply>) {
    let socket = Socket::client();
    let (tx, rx) = mpsc::unbounded_channel();
    let _subscription = socket
        .on_message(move |message| {
            let _ = tx.send(message.decode::<Reply>().unwrap());
        })
        .unwrap();
    socket.connect(port, "127.0.0.1").await.unwrap();
    (socket, rx)
}

async fn next_reply(replies: &mut mpsc::UnboundedReceiver<Reply>) -> Reply {
    tokio::time::timeout(Duration::from_secs(2), replies.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn server_protocol_errors() {
    let broker = MemoryBroker::new();
    let server = start_server(&broker, config()).await;
    let (socket, mut replies) = raw_socket(server.local_addr().unwrap().port()).await;

    socket.send(&Request::new("r1", "x.echo", json!(1)));
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.id, "r1");
    assert_eq!(reply.error, Some(ReplyCode::InvalidService));

    socket.send(&Request::new("r2", "s._hidden", Value::Null));
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.id, "r2");
    assert_eq!(reply.error, Some(ReplyCode::InvalidMethod));

    socket.send_raw(br#"{"_":"r3","p":7}"#.to_vec());
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.id, "r3");
    assert_eq!(reply.error, Some(ReplyCode::InvalidMessage));

    socket.send(&Request::new("r4", "s.echo", Value::Null));
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.service.as_deref(), Some("s"));
    assert_eq!(reply.into_result().unwrap(), Value::Null);
}

/// Broker whose first subscribe fails.
struct FlakyBroker {
    inner: MemoryBroker,
    failed: AtomicBool,
}

#[async_trait::async_trait]
impl Broker for FlakyBroker {
    async fn publish(&self, channel: &str, payload: String) -> polymesh_fabric::Result<()> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channels: &[String]) -> polymesh_fabric::Result<BrokerSubscription> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(polymesh_fabric::Error::Broker("unreachable".to_string()));
        }
        self.inner.subscribe(channels).await
    }
}

#[tokio::test]
async fn failed_subscribe_allows_restart() {
    let broker = MemoryBroker::new();
    let _server = start_server(&broker, config()).await;

    let client = Client::new(
        config(),
        Arc::new(FlakyBroker {
            inner: broker.clone(),
            failed: AtomicBool::new(false),
        }),
    );
    let err = client.start(["s"]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(client.instances("s").is_empty());

    client.start(["s"]).await.unwrap();
    wait_for_instances(&client, "s", 1).await;
    assert_eq!(client.send("s.echo", json!(3), None).await.unwrap(), json!(3));
}

#[tokio::test]
async fn silent_instance_is_dropped() {
    let broker = MemoryBroker::new();
    let client = start_client(&broker, config().with_stale(Duration::from_millis(150))).await;
    // Announces once, then stays quiet for longer than the client tolerates
    let _server = start_server(&broker, config().with_interval(Duration::from_secs(60))).await;
    wait_for_instances(&client, "s", 1).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while !client.instances("s").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("silent instance was never dropped");

    let err = client.send("s.echo", json!(1), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoInstanceAvailable);
}

#[tokio::test]
async fn delimiter_in_service_name_is_rejected() {
    let server = Server::new(config(), Arc::new(MemoryBroker::new()));
    let handlers = HandlerSet::new().handler("ping", |_r: Request| async move { Ok(json!("pong")) });

    let err = server
        .add_service(ServiceDefinition::new("a.b", handlers.clone()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidServiceType);

    let mut slashed = config();
    slashed.delimiter = "/".to_string();
    let server = Server::new(slashed, Arc::new(MemoryBroker::new()));
    assert_eq!(server.add_service(ServiceDefinition::new("a.b", handlers.clone())).unwrap(), "a.b");
    assert_eq!(
        server.add_service(ServiceDefinition::new("a/b", handlers)).unwrap_err().kind(),
        ErrorKind::InvalidServiceType
    );
}
