//! Integration tests for request dispatching over a channel

use async_trait::async_trait;
use bytes::Bytes;
use remoting_connection::{
    Channel, Connection, Endpoint, EndpointOptions, MemoryNetwork, MemoryProviderFactory,
    NameCallback, NegotiationOptions, NotificationHandler, OpenListener, ProviderOptions,
    RemotingError, RequestContext, RequestDispatcher, RequestHandler, ServiceOptions,
};
use remoting_proto::{Fault, FaultKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Serves a handful of test operations
struct TestHandler {
    closed: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl RequestHandler for TestHandler {
    async fn handle(
        &self,
        operation: &str,
        payload: Bytes,
        context: &RequestContext,
    ) -> Result<Bytes, Fault> {
        match operation {
            "echo" => Ok(payload),
            "delayed-echo" => {
                // Later requests finish first
                let delay = 100u64.saturating_sub(payload.len() as u64 * 3);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(payload)
            }
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Bytes::new())
            }
            "subscribe" => {
                context
                    .notifier()
                    .notify(7, payload)
                    .await
                    .map_err(|e| Fault::new(FaultKind::Runtime, e.to_string()))?;
                Ok(Bytes::from_static(b"subscribed"))
            }
            "missing" => Err(Fault::new(FaultKind::InstanceNotFound, "test:type=Missing")),
            other => Err(Fault::new(
                FaultKind::UnknownOperation,
                format!("unknown operation {}", other),
            )),
        }
    }

    fn on_close(&self, _context: &RequestContext) {
        let _ = self.closed.send(());
    }
}

struct Harness {
    client: RequestDispatcher,
    server_closed: mpsc::UnboundedReceiver<()>,
    notifications: mpsc::UnboundedReceiver<(u64, Bytes)>,
    connection: Connection,
    _endpoints: (Endpoint, Endpoint),
}

/// Two endpoints joined by one connection, with a dispatcher on each end of
/// a "rpc" channel; only the accepting side serves requests
async fn harness() -> Harness {
    harness_with(true).await
}

async fn harness_with(serve_requests: bool) -> Harness {
    init_tracing();

    let network = MemoryNetwork::new();
    let factory = MemoryProviderFactory::new(network.clone());

    let server = Endpoint::create("server", EndpointOptions::default()).unwrap();
    server
        .add_connection_provider("local", &factory, ProviderOptions::default())
        .unwrap();

    let (closed_tx, server_closed) = mpsc::unbounded_channel();
    let handler: Option<Arc<dyn RequestHandler>> = if serve_requests {
        Some(Arc::new(TestHandler { closed: closed_tx }))
    } else {
        None
    };
    let listener: Arc<dyn OpenListener> = Arc::new(move |channel: Channel| {
        RequestDispatcher::start(channel, handler.clone(), None);
    });
    server
        .register_service("rpc", listener, ServiceOptions::default())
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = Endpoint::create("client", EndpointOptions::default()).unwrap();
    client
        .add_connection_provider("local", &factory, ProviderOptions::default())
        .unwrap();
    let connection = client
        .connect(
            &acceptor.local_address().to_string(),
            NegotiationOptions::default(),
            Arc::new(NameCallback::anonymous()),
        )
        .await_timeout(WAIT)
        .await
        .unwrap();

    let channel = connection.open_channel("rpc").await_timeout(WAIT).await.unwrap();
    let (notify_tx, notifications) = mpsc::unbounded_channel();
    let on_notify: Arc<dyn NotificationHandler> = Arc::new(move |id: u64, payload: Bytes| {
        let _ = notify_tx.send((id, payload));
    });
    let dispatcher = RequestDispatcher::start(channel, None, Some(on_notify));

    Harness {
        client: dispatcher,
        server_closed,
        notifications,
        connection,
        _endpoints: (server, client),
    }
}

#[tokio::test]
async fn test_invoke_round_trip() {
    let h = harness().await;

    let reply = timeout(WAIT, h.client.invoke("echo", Bytes::from_static(b"ping")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"ping"));
    assert_eq!(h.client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_resolve_to_their_own_responses() {
    let h = harness().await;
    info!("TEST: 32 overlapping calls, answered out of order");

    let calls: Vec<_> = (0..32usize)
        .map(|i| {
            let payload = Bytes::from(vec![b'x'; i + 1]);
            (payload.clone(), h.client.call("delayed-echo", payload))
        })
        .collect();

    for (expected, call) in calls {
        let reply = call.await_timeout(WAIT).await.unwrap();
        assert_eq!(reply, expected);
    }
    assert_eq!(h.client.pending_count(), 0);
}

#[tokio::test]
async fn test_fault_is_delivered_and_channel_survives() {
    let h = harness().await;

    let result = timeout(WAIT, h.client.invoke("missing", Bytes::new()))
        .await
        .unwrap();
    match result {
        Err(RemotingError::RegistryFault(fault)) => {
            assert_eq!(fault.kind, FaultKind::InstanceNotFound);
            assert_eq!(fault.message, "test:type=Missing");
        }
        other => panic!("expected a fault, got {:?}", other),
    }

    let reply = timeout(WAIT, h.client.invoke("echo", Bytes::from_static(b"still here")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"still here"));
}

#[tokio::test]
async fn test_unknown_operation_faults() {
    let h = harness().await;

    assert_eq!(
        timeout(WAIT, h.client.invoke("nope", Bytes::new()))
            .await
            .unwrap()
            .unwrap_err(),
        RemotingError::RegistryFault(Fault::new(
            FaultKind::UnknownOperation,
            "unknown operation nope"
        ))
    );
    assert!(!h.client.channel().is_closed());
}

#[tokio::test]
async fn test_requests_without_handler_fault() {
    let h = harness_with(false).await;

    let result = timeout(WAIT, h.client.invoke("echo", Bytes::new()))
        .await
        .unwrap();
    match result {
        Err(RemotingError::RegistryFault(fault)) => {
            assert_eq!(fault.kind, FaultKind::UnknownOperation);
        }
        other => panic!("expected a fault, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_fails_pending_calls() {
    let mut h = harness().await;
    info!("TEST: closing the channel fails outstanding calls");

    let hanging: Vec<_> = (0..4)
        .map(|_| h.client.call("hang", Bytes::new()))
        .collect();

    timeout(WAIT, async {
        while h.client.pending_count() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.client.close();

    for call in hanging {
        assert_eq!(
            call.await_timeout(WAIT).await,
            Err(RemotingError::ChannelClosed)
        );
    }
    assert_eq!(h.client.pending_count(), 0);
    assert!(h.client.is_closed());

    // Calls after closure fail at once
    assert_eq!(
        h.client
            .call("echo", Bytes::new())
            .await_timeout(WAIT)
            .await,
        Err(RemotingError::ChannelClosed)
    );

    // The serving side notices the closure too
    timeout(WAIT, h.server_closed.recv()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_close_fails_pending_calls() {
    let h = harness().await;

    let hanging = h.client.call("hang", Bytes::new());
    timeout(WAIT, async {
        while h.client.pending_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.connection.close();

    assert!(matches!(
        hanging.await_timeout(WAIT).await,
        Err(RemotingError::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn test_close_keeps_completed_results() {
    let h = harness().await;
    info!("TEST: closing with some calls answered and some outstanding");

    let answered: Vec<_> = (0..3)
        .map(|i| h.client.call("echo", Bytes::from(format!("done-{}", i))))
        .collect();
    let hanging: Vec<_> = (0..2)
        .map(|_| h.client.call("hang", Bytes::new()))
        .collect();

    let mut results = Vec::new();
    for call in answered {
        results.push(call.await_timeout(WAIT).await);
    }
    timeout(WAIT, async {
        while h.client.pending_count() > 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.client.pending_count(), 2);

    h.client.close();

    for call in hanging {
        assert_eq!(
            call.await_timeout(WAIT).await,
            Err(RemotingError::ChannelClosed)
        );
    }
    assert_eq!(
        results,
        (0..3)
            .map(|i| Ok(Bytes::from(format!("done-{}", i))))
            .collect::<Vec<_>>()
    );
    assert_eq!(h.client.pending_count(), 0);
}

#[tokio::test]
async fn test_undecodable_message_closes_connection() {
    let mut h = harness().await;
    info!("TEST: garbage on a dispatcher channel is fatal");

    let hanging = h.client.call("hang", Bytes::new());
    timeout(WAIT, async {
        while h.client.pending_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.client
        .channel()
        .send(Bytes::from_static(&[0xff; 16]))
        .await
        .unwrap();

    assert!(matches!(
        hanging.await_timeout(WAIT).await,
        Err(RemotingError::ConnectionClosed(_))
    ));
    timeout(WAIT, h.connection.closed()).await.unwrap();
    assert!(h.connection.is_closed());
    timeout(WAIT, h.server_closed.recv()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_notifications_reach_the_caller() {
    let mut h = harness().await;

    let reply = timeout(WAIT, h.client.invoke("subscribe", Bytes::from_static(b"event")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"subscribed"));

    let (id, payload) = timeout(WAIT, h.notifications.recv()).await.unwrap().unwrap();
    assert_eq!(id, 7);
    assert_eq!(payload, Bytes::from_static(b"event"));
}
