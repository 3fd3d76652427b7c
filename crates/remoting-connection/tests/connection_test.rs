//! Integration tests for endpoints, connections and channels
//!
//! Most tests run over the in-memory provider; the STARTTLS test uses real
//! TCP sockets so the upgrade runs over a kernel stream.

use bytes::Bytes;
use remoting_connection::{
    Channel, Connection, Endpoint, EndpointOptions, IoFuture, MemoryNetwork,
    MemoryProviderFactory, NameCallback, NegotiationOptions, OpenListener, PolicyMode,
    ProviderOptions, RemotingError, SecurityState, ServerAuthConfig, ServiceOptions,
    TcpProviderFactory, TlsOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
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

fn memory_endpoint(network: &MemoryNetwork, name: &str, options: EndpointOptions) -> Endpoint {
    let endpoint = Endpoint::create(name, options).unwrap();
    endpoint
        .add_connection_provider(
            "local",
            &MemoryProviderFactory::new(network.clone()),
            ProviderOptions::default(),
        )
        .unwrap();
    endpoint
}

/// Listener that echoes every message back on the channel it arrived on
fn echo_listener() -> Arc<dyn OpenListener> {
    Arc::new(|channel: Channel| {
        tokio::spawn(async move {
            while let Some(message) = channel.recv().await {
                if channel.send(message).await.is_err() {
                    break;
                }
            }
        });
    })
}

/// Listener that hands every opened channel to the test
fn collecting_listener() -> (Arc<dyn OpenListener>, mpsc::UnboundedReceiver<Channel>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn OpenListener> = Arc::new(move |channel: Channel| {
        let _ = tx.send(channel);
    });
    (listener, rx)
}

async fn connect_anonymous(client: &Endpoint, address: &str) -> Connection {
    client
        .connect(
            address,
            NegotiationOptions::default(),
            Arc::new(NameCallback::anonymous()),
        )
        .await_timeout(WAIT)
        .await
        .unwrap()
}

/// Wait until `endpoint` tracks an accepted connection and return it
async fn accepted_connection(endpoint: &Endpoint) -> Connection {
    timeout(WAIT, async {
        loop {
            if let Some(connection) = endpoint.connections().into_iter().next() {
                return connection;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no connection was accepted")
}

#[tokio::test]
async fn test_open_channel_round_trip() {
    init_tracing();
    info!("TEST: open a channel and exchange messages");

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    server
        .register_service("echo", echo_listener(), ServiceOptions::default())
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let connection = connect_anonymous(&client, &acceptor.local_address().to_string()).await;

    assert_eq!(connection.local_endpoint(), "client");
    assert_eq!(connection.remote_endpoint(), "server");
    assert_eq!(connection.security(), SecurityState::Plaintext);
    assert!(!connection.principals().is_empty());
    assert!(connection.is_dialer());

    let channel = connection.open_channel("echo").await_timeout(WAIT).await.unwrap();
    assert_eq!(channel.service_name(), "echo");
    assert_eq!(channel.id() % 2, 1, "dialer allocates odd ids");

    for i in 0..20u32 {
        channel
            .send(Bytes::from(format!("message-{}", i)))
            .await
            .unwrap();
    }
    for i in 0..20u32 {
        let reply = timeout(WAIT, channel.recv()).await.unwrap().unwrap();
        assert_eq!(reply, Bytes::from(format!("message-{}", i)));
    }

    let accepted = accepted_connection(&server).await;
    assert_eq!(accepted.remote_endpoint(), "client");
    assert!(!accepted.is_dialer());
    assert_eq!(accepted.principals(), connection.principals());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_open_unknown_service_fails() {
    init_tracing();

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let connection = connect_anonymous(&client, &acceptor.local_address().to_string()).await;

    let result = connection.open_channel("missing").await_timeout(WAIT).await;
    assert_eq!(
        result.unwrap_err(),
        RemotingError::NoSuchService("missing".to_string())
    );

    // The connection survives the refusal
    assert!(!connection.is_closed());
    assert_eq!(connection.channel_count(), 0);
}

#[tokio::test]
async fn test_concurrent_opens_from_both_sides() {
    init_tracing();
    info!("TEST: both sides open channels at the same time");

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    let (server_listener, mut server_inbound) = collecting_listener();
    server
        .register_service("svc", server_listener, ServiceOptions::default())
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let (client_listener, mut client_inbound) = collecting_listener();
    client
        .register_service("svc", client_listener, ServiceOptions::default())
        .unwrap();

    let dialed = connect_anonymous(&client, &acceptor.local_address().to_string()).await;
    let accepted = accepted_connection(&server).await;

    let from_client: Vec<IoFuture<Channel>> = (0..16).map(|_| dialed.open_channel("svc")).collect();
    let from_server: Vec<IoFuture<Channel>> =
        (0..16).map(|_| accepted.open_channel("svc")).collect();

    let mut ids = std::collections::HashSet::new();
    for future in from_client {
        let channel = future.await_timeout(WAIT).await.unwrap();
        assert_eq!(channel.id() % 2, 1);
        assert!(ids.insert(("client", channel.id())));
    }
    for future in from_server {
        let channel = future.await_timeout(WAIT).await.unwrap();
        assert_eq!(channel.id() % 2, 0);
        assert!(ids.insert(("server", channel.id())));
    }

    for _ in 0..16 {
        let channel = timeout(WAIT, server_inbound.recv()).await.unwrap().unwrap();
        assert_eq!(channel.id() % 2, 1);
        let channel = timeout(WAIT, client_inbound.recv()).await.unwrap().unwrap();
        assert_eq!(channel.id() % 2, 0);
    }
}

#[tokio::test]
async fn test_channel_close_leaves_connection_usable() {
    init_tracing();

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    let (listener, mut inbound) = collecting_listener();
    server
        .register_service("svc", listener, ServiceOptions::default())
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let connection = connect_anonymous(&client, &acceptor.local_address().to_string()).await;

    let channel = connection.open_channel("svc").await_timeout(WAIT).await.unwrap();
    let remote = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();

    channel.send(Bytes::from_static(b"last words")).await.unwrap();
    channel.close();
    channel.close();
    assert!(channel.is_closed());
    assert_eq!(
        channel.send(Bytes::from_static(b"too late")).await,
        Err(RemotingError::ChannelClosed)
    );

    // Data sent before the close is still delivered, then the stream ends
    let message = timeout(WAIT, remote.recv()).await.unwrap();
    assert_eq!(message, Some(Bytes::from_static(b"last words")));
    assert_eq!(timeout(WAIT, remote.recv()).await.unwrap(), None);
    timeout(WAIT, remote.closed()).await.unwrap();

    assert!(!connection.is_closed());
    let again = connection.open_channel("svc").await_timeout(WAIT).await.unwrap();
    assert_ne!(again.id(), channel.id());
}

#[tokio::test]
async fn test_unread_channel_does_not_stall_connection() {
    init_tracing();
    info!("TEST: a channel nobody reads overflows alone");

    let network = MemoryNetwork::new();
    let mut options = EndpointOptions::default();
    options.channel_buffer = 8;
    let server = memory_endpoint(&network, "server", options);
    let (listener, mut inbound) = collecting_listener();
    server
        .register_service("sink", listener, ServiceOptions::default())
        .unwrap();
    server
        .register_service("echo", echo_listener(), ServiceOptions::default())
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let connection = connect_anonymous(&client, &acceptor.local_address().to_string()).await;

    let sink = connection.open_channel("sink").await_timeout(WAIT).await.unwrap();
    // Held but never read
    let held = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();

    for i in 0..400u32 {
        if sink.send(Bytes::from(format!("flood-{}", i))).await.is_err() {
            break;
        }
    }
    timeout(WAIT, sink.closed()).await.unwrap();
    assert!(held.is_closed());

    // Control and data for other channels still flow
    let echo = connection.open_channel("echo").await_timeout(WAIT).await.unwrap();
    echo.send(Bytes::from_static(b"still here")).await.unwrap();
    assert_eq!(
        timeout(WAIT, echo.recv()).await.unwrap(),
        Some(Bytes::from_static(b"still here"))
    );
    assert!(!connection.is_closed());

    // What was queued before the overflow is still readable
    assert_eq!(
        timeout(WAIT, held.recv()).await.unwrap(),
        Some(Bytes::from_static(b"flood-0"))
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_connection_close_cascades_to_channels() {
    init_tracing();
    info!("TEST: closing a connection closes its channels on both sides");

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    let (listener, mut inbound) = collecting_listener();
    server
        .register_service("svc", listener, ServiceOptions::default())
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let connection = connect_anonymous(&client, &acceptor.local_address().to_string()).await;
    let channel = connection.open_channel("svc").await_timeout(WAIT).await.unwrap();
    let remote = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    let accepted = accepted_connection(&server).await;

    connection.close();
    connection.close();

    assert!(connection.is_closed());
    assert!(channel.is_closed());
    assert!(matches!(
        channel.send(Bytes::from_static(b"x")).await,
        Err(RemotingError::ConnectionClosed(_))
    ));
    assert!(matches!(
        connection.open_channel("svc").await_timeout(WAIT).await,
        Err(RemotingError::ConnectionClosed(_))
    ));

    timeout(WAIT, remote.closed()).await.unwrap();
    timeout(WAIT, accepted.closed()).await.unwrap();
    assert!(accepted.is_closed());

    // Neither endpoint keeps tracking the dead connection
    assert!(client.connections().is_empty());
    timeout(WAIT, async {
        while !server.connections().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_endpoint_close_terminates_everything() {
    init_tracing();

    struct Terminations(Arc<AtomicUsize>);
    impl OpenListener for Terminations {
        fn channel_opened(&self, _channel: Channel) {}
        fn registration_terminated(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    let terminated = Arc::new(AtomicUsize::new(0));
    let registration = server
        .register_service(
            "svc",
            Arc::new(Terminations(terminated.clone())),
            ServiceOptions::default(),
        )
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();
    let address = acceptor.local_address().to_string();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let connection = connect_anonymous(&client, &address).await;

    server.close().await;

    timeout(WAIT, connection.closed()).await.unwrap();
    assert_eq!(terminated.load(Ordering::SeqCst), 1);
    registration.close();
    assert_eq!(terminated.load(Ordering::SeqCst), 1);

    // The acceptor is gone with the endpoint
    let result = client
        .connect(
            &address,
            NegotiationOptions::default(),
            Arc::new(NameCallback::anonymous()),
        )
        .await_timeout(WAIT)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_reverse_connection_service_on_dialer() {
    init_tracing();
    info!("TEST: the accepting side opens a channel to a service on the dialer");

    let network = MemoryNetwork::new();

    // The management side listens and waits to be dialed
    let listening = memory_endpoint(&network, "listening", EndpointOptions::default());
    let acceptor = listening.start_listening("local", "listening:0").await.unwrap();

    // The side owning the service dials out
    let dialing = memory_endpoint(&network, "dialing", EndpointOptions::default());
    dialing
        .register_service("TestChannel", echo_listener(), ServiceOptions::default())
        .unwrap();
    let _dialed = connect_anonymous(&dialing, &acceptor.local_address().to_string()).await;

    let accepted = accepted_connection(&listening).await;
    let channel = accepted
        .open_channel("TestChannel")
        .await_timeout(WAIT)
        .await
        .unwrap();
    assert_eq!(channel.id() % 2, 0);

    channel.send(Bytes::from_static(b"reverse")).await.unwrap();
    let reply = timeout(WAIT, channel.recv()).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"reverse")));
}

#[tokio::test]
async fn test_service_channel_limit() {
    init_tracing();

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    let (listener, _inbound) = collecting_listener();
    server
        .register_service("svc", listener, ServiceOptions::default().with_max_channels(1))
        .unwrap();
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let connection = connect_anonymous(&client, &acceptor.local_address().to_string()).await;

    let first = connection.open_channel("svc").await_timeout(WAIT).await.unwrap();
    assert_eq!(
        connection.open_channel("svc").await_timeout(WAIT).await.unwrap_err(),
        RemotingError::ServiceUnavailable("svc".to_string())
    );
    drop(first);
}

#[tokio::test]
async fn test_policy_violation_never_exposes_connection() {
    init_tracing();

    let network = MemoryNetwork::new();
    let server_options = EndpointOptions::default()
        .with_server_auth(ServerAuthConfig::default().with_mechanisms(&["ANONYMOUS"]));
    let server = memory_endpoint(&network, "server", server_options);
    let acceptor = server.start_listening("local", "server:0").await.unwrap();

    let client = memory_endpoint(&network, "client", EndpointOptions::default());
    let result = client
        .connect(
            &acceptor.local_address().to_string(),
            NegotiationOptions::default().with_anonymous(PolicyMode::Deny),
            Arc::new(NameCallback::anonymous()),
        )
        .await_timeout(WAIT)
        .await;

    assert!(matches!(
        result,
        Err(RemotingError::PolicyViolation(_)) | Err(RemotingError::Authentication(_))
    ));
    assert!(client.connections().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.connections().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_starttls_over_tcp() {
    init_tracing();
    info!("TEST: in-band TLS upgrade over TCP");

    let server_options = EndpointOptions::default().with_tls(TlsOptions::server_self_signed());
    let server = Endpoint::create("server", server_options).unwrap();
    server
        .add_connection_provider("remote", &TcpProviderFactory, ProviderOptions::default())
        .unwrap();
    server
        .register_service("echo", echo_listener(), ServiceOptions::default())
        .unwrap();
    let acceptor = server.start_listening("remote", "127.0.0.1:0").await.unwrap();

    let client_options =
        EndpointOptions::default().with_tls(TlsOptions::default().with_insecure_skip_verify());
    let client = Endpoint::create("client", client_options).unwrap();
    client
        .add_connection_provider("remote", &TcpProviderFactory, ProviderOptions::default())
        .unwrap();

    let connection = client
        .connect(
            &acceptor.local_address().to_string(),
            NegotiationOptions::default()
                .with_starttls()
                .with_plaintext(PolicyMode::Deny),
            Arc::new(NameCallback::anonymous()),
        )
        .await_timeout(WAIT)
        .await
        .unwrap();
    assert_eq!(connection.security(), SecurityState::Encrypted);

    let channel = connection.open_channel("echo").await_timeout(WAIT).await.unwrap();
    channel.send(Bytes::from_static(b"secret")).await.unwrap();
    let reply = timeout(WAIT, channel.recv()).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"secret")));

    let accepted = accepted_connection(&server).await;
    assert!(accepted.is_encrypted());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_attachments_are_per_connection() {
    init_tracing();

    #[derive(Debug, PartialEq)]
    struct SessionTag(String);

    let network = MemoryNetwork::new();
    let server = memory_endpoint(&network, "server", EndpointOptions::default());
    let acceptor = server.start_listening("local", "server:0").await.unwrap();
    let client = memory_endpoint(&network, "client", EndpointOptions::default());

    let first = connect_anonymous(&client, &acceptor.local_address().to_string()).await;
    let second = connect_anonymous(&client, &acceptor.local_address().to_string()).await;

    first.attachments().insert(SessionTag("first".into()));
    assert_eq!(
        *first.attachments().get::<SessionTag>().unwrap(),
        SessionTag("first".into())
    );
    assert!(second.attachments().get::<SessionTag>().is_none());
    assert_ne!(first.id(), second.id());
    assert_eq!(client.connections().len(), 2);
}
