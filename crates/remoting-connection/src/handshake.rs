//! Drives the negotiation state machines over a raw stream
//!
//! Negotiation messages use [`HandshakeCodec`]. Once a negotiator reports
//! success the same stream, upgraded to TLS when both sides agreed to, is
//! handed back framed with [`FrameCodec`].

use crate::error::{RemotingError, RemotingResult};
use futures::{SinkExt, StreamExt};
use remoting_auth::{
    ClientAction, ClientNegotiator, CredentialCallback, NegotiatedSession, NegotiationOptions,
    ServerAction, ServerAuthConfig, ServerNegotiator,
};
use remoting_proto::{Frame, FrameCodec, HandshakeCodec, HandshakeMessage};
use remoting_transport::tls::{upgrade_client, upgrade_server};
use remoting_transport::BoxedStream;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

type HandshakeFramed = Framed<BoxedStream, HandshakeCodec>;
pub(crate) type FrameStream = Framed<BoxedStream, FrameCodec>;

/// Dialing side of the handshake
pub(crate) async fn negotiate_outbound(
    stream: BoxedStream,
    local_name: &str,
    options: NegotiationOptions,
    callback: Arc<dyn CredentialCallback>,
    connector: &TlsConnector,
    server_name: &str,
) -> RemotingResult<(FrameStream, NegotiatedSession)> {
    let mut negotiator = ClientNegotiator::new(local_name, options, callback);
    let mut framed = Framed::new(stream, HandshakeCodec);

    loop {
        let message = next_message(&mut framed).await?;
        debug!("Negotiation (dialer): received {}", message.kind());

        match negotiator.handle(message)? {
            ClientAction::Send(reply) => {
                debug!("Negotiation (dialer): sending {}", reply.kind());
                framed.send(reply).await?;
            }
            ClientAction::Complete(session) => {
                return Ok((into_frame_stream(framed), session));
            }
            ClientAction::StartTls => {
                debug!("Negotiation (dialer): upgrading to TLS");
                let stream = into_raw_stream(framed)?;
                let stream = upgrade_client(connector, stream, server_name).await?;
                let session = negotiator.upgrade_complete()?;
                return Ok((Framed::new(stream, FrameCodec), session));
            }
        }
    }
}

/// Accepting side of the handshake
pub(crate) async fn negotiate_inbound(
    stream: BoxedStream,
    local_name: &str,
    options: &NegotiationOptions,
    config: Arc<ServerAuthConfig>,
    acceptor: Option<&TlsAcceptor>,
) -> RemotingResult<(FrameStream, NegotiatedSession)> {
    let mut negotiator = ServerNegotiator::new(local_name, options, config, acceptor.is_some());
    let mut framed = Framed::new(stream, HandshakeCodec);

    framed.send(negotiator.greeting()).await?;

    loop {
        let message = next_message(&mut framed).await?;
        debug!("Negotiation (acceptor): received {}", message.kind());

        match negotiator.handle(message) {
            ServerAction::Send(reply) => {
                framed.send(reply).await?;
            }
            ServerAction::SendThenComplete(reply, session) => {
                framed.send(reply).await?;
                return Ok((into_frame_stream(framed), session));
            }
            ServerAction::SendThenStartTls(reply) => {
                framed.send(reply).await?;
                let acceptor = acceptor.ok_or_else(|| {
                    RemotingError::Protocol("TLS upgrade without an acceptor".to_string())
                })?;
                debug!("Negotiation (acceptor): upgrading to TLS");
                let stream = into_raw_stream(framed)?;
                let stream = upgrade_server(acceptor, stream).await?;
                let session = negotiator.upgrade_complete()?;
                return Ok((Framed::new(stream, FrameCodec), session));
            }
            ServerAction::Fail(reply, error) => {
                warn!("Negotiation (acceptor) failed: {}", error);
                let _ = framed.send(reply).await;
                return Err(error.into());
            }
        }
    }
}

async fn next_message(framed: &mut HandshakeFramed) -> RemotingResult<HandshakeMessage> {
    match framed.next().await {
        Some(result) => Ok(result?),
        None => Err(RemotingError::ConnectionClosed(
            "peer closed the stream during negotiation".to_string(),
        )),
    }
}

/// Switch codecs in place; bytes the peer already sent past the last
/// negotiation message stay buffered
fn into_frame_stream(framed: HandshakeFramed) -> FrameStream {
    let parts = framed.into_parts();
    let mut frame_parts = FramedParts::new::<Frame>(parts.io, FrameCodec);
    frame_parts.read_buf = parts.read_buf;
    frame_parts.write_buf = parts.write_buf;
    Framed::from_parts(frame_parts)
}

fn into_raw_stream(framed: HandshakeFramed) -> RemotingResult<BoxedStream> {
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(RemotingError::Protocol(
            "unexpected data before TLS upgrade".to_string(),
        ));
    }
    Ok(parts.io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoting_auth::{NameCallback, PolicyMode, ANONYMOUS, LOCAL_USER};
    use remoting_transport::TlsOptions;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    async fn run_pair(
        client_options: NegotiationOptions,
        server_options: NegotiationOptions,
        server_config: ServerAuthConfig,
        with_tls: bool,
    ) -> (
        RemotingResult<(FrameStream, NegotiatedSession)>,
        RemotingResult<(FrameStream, NegotiatedSession)>,
    ) {
        init_tracing();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let connector = TlsOptions::default()
            .with_insecure_skip_verify()
            .build_connector()
            .unwrap();
        let acceptor = if with_tls {
            Some(TlsOptions::server_self_signed().build_acceptor().unwrap())
        } else {
            None
        };
        let config = Arc::new(server_config);

        let client = negotiate_outbound(
            Box::new(a),
            "client",
            client_options,
            Arc::new(NameCallback::anonymous()),
            &connector,
            "localhost",
        );
        let server = negotiate_inbound(
            Box::new(b),
            "server",
            &server_options,
            config,
            acceptor.as_ref(),
        );

        tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(client, server) })
            .await
            .expect("negotiation timed out")
    }

    #[tokio::test]
    async fn test_plaintext_negotiation_then_frames() {
        let (client, server) = run_pair(
            NegotiationOptions::default().with_mechanisms(&[ANONYMOUS]),
            NegotiationOptions::default(),
            ServerAuthConfig::default(),
            false,
        )
        .await;

        let (mut client_frames, client_session) = client.unwrap();
        let (mut server_frames, server_session) = server.unwrap();
        assert_eq!(client_session.remote_endpoint, "server");
        assert_eq!(server_session.remote_endpoint, "client");
        assert_eq!(client_session.mechanism, ANONYMOUS);
        assert!(!client_session.encrypted);

        client_frames
            .send(Frame::data(1, bytes::Bytes::from_static(b"hello")))
            .await
            .unwrap();
        let frame = server_frames.next().await.unwrap().unwrap();
        assert_eq!(frame.channel_id, 1);
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_starttls_negotiation() {
        let (client, server) = run_pair(
            NegotiationOptions::default()
                .with_starttls()
                .with_mechanisms(&[LOCAL_USER]),
            NegotiationOptions::default(),
            ServerAuthConfig::default(),
            true,
        )
        .await;

        let (mut client_frames, client_session) = client.unwrap();
        let (mut server_frames, server_session) = server.unwrap();
        assert!(client_session.encrypted);
        assert!(server_session.encrypted);
        assert_eq!(client_session.mechanism, LOCAL_USER);

        server_frames
            .send(Frame::data(2, bytes::Bytes::from_static(b"over tls")))
            .await
            .unwrap();
        let frame = client_frames.next().await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"over tls");
    }

    #[tokio::test]
    async fn test_policy_violation_fails_both_sides() {
        let (client, server) = run_pair(
            NegotiationOptions::default().with_mechanisms(&[ANONYMOUS]),
            NegotiationOptions::default().with_anonymous(PolicyMode::Deny),
            ServerAuthConfig::default().with_mechanisms(&[ANONYMOUS]),
            false,
        )
        .await;

        assert!(client.is_err());
        assert!(server.is_err());
    }
}
