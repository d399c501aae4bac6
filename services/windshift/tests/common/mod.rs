#![allow(dead_code)]
// Shared helpers for integration tests: an in-process windshift server plus
// a minimal QUIC client speaking the wire protocol.
use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use std::net::SocketAddr;
use std::sync::Arc;

use windshift::config::ServiceConfig;
use windshift::quic;
use windshift_broker::Broker;
use windshift_events::Events;
use windshift_wire::{EventData, EventFrame, Message, StreamPointer, StreamSource};

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

pub struct TestContext {
    pub connection: quinn::Connection,
    // Keep the endpoints alive for the duration of the test.
    _client: Endpoint,
    _server: tokio::task::JoinHandle<Result<()>>,
}

pub async fn start() -> Result<TestContext> {
    let (server_config, cert) = build_server_config()?;
    let endpoint = Endpoint::server(server_config, "127.0.0.1:0".parse()?)?;
    let addr: SocketAddr = endpoint.local_addr()?;

    let events = Arc::new(Events::new(Arc::new(Broker::new())));
    let config = ServiceConfig {
        quic_bind: addr,
        ..ServiceConfig::default()
    };
    let server = tokio::spawn(quic::serve(endpoint, events, config));

    let client = Endpoint::client("127.0.0.1:0".parse()?)?;
    let client_config = build_client_config(cert)?;
    let connection = client
        .connect_with(client_config, addr, "localhost")?
        .await
        .context("connect to test server")?;

    Ok(TestContext {
        connection,
        _client: client,
        _server: server,
    })
}

fn build_server_config() -> Result<(quinn::ServerConfig, CertificateDer<'static>)> {
    let cert = generate_simple_self_signed(vec!["localhost".into()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
    let server_config =
        quinn::ServerConfig::with_single_cert(vec![cert_der.clone()], key_der.into())?;
    Ok((server_config, cert_der))
}

fn build_client_config(cert: CertificateDer<'static>) -> Result<QuinnClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(cert)?;
    Ok(QuinnClientConfig::with_root_certificates(Arc::new(roots))?)
}

impl TestContext {
    /// One unary request: open a stream, send, read the single response.
    pub async fn request(&self, message: Message) -> Result<Message> {
        let (mut send, mut recv) = self.connection.open_bi().await?;
        quic::write_message(&mut send, &message).await?;
        let _ = send.finish();
        let mut scratch = BytesMut::with_capacity(4 * 1024);
        quic::read_message_limited(&mut recv, MAX_FRAME_BYTES, &mut scratch)
            .await?
            .context("missing response")
    }

    pub async fn ensure_stream(&self, name: &str, subjects: &[&str]) -> Result<u64> {
        let response = self
            .request(Message::EnsureStream {
                name: name.to_string(),
                source: StreamSource::Subjects {
                    subjects: subjects.iter().map(|s| s.to_string()).collect(),
                },
                retention: Default::default(),
                storage: Default::default(),
                dedup_window_ms: None,
            })
            .await?;
        match response {
            Message::StreamEnsured { last_sequence } => Ok(last_sequence),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    pub async fn ensure_consumer(
        &self,
        stream: &str,
        name: Option<&str>,
        subjects: &[&str],
        timeout_ms: Option<u64>,
        pointer: Option<StreamPointer>,
    ) -> Result<String> {
        let response = self
            .request(Message::EnsureConsumer {
                stream: stream.to_string(),
                name: name.map(|n| n.to_string()),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                timeout_ms,
                max_delivery_attempts: 0,
                pointer,
            })
            .await?;
        match response {
            Message::ConsumerEnsured { id } => Ok(id),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    pub async fn publish(&self, subject: &str, value: &str) -> Result<u64> {
        let response = self
            .request(Message::PublishEvent {
                subject: subject.to_string(),
                data: string_value(value),
                timestamp: None,
                idempotency_key: None,
                expected_last_id: None,
            })
            .await?;
        match response {
            Message::EventPublished { id } => Ok(id),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Open an event session; the `Subscribed` (or error) frame is left for
    /// the caller to read.
    pub async fn open_session(&self, stream: &str, consumer: &str) -> Result<SessionStream> {
        let (mut send, recv) = self.connection.open_bi().await?;
        quic::write_message(
            &mut send,
            &Message::Subscribe {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            },
        )
        .await?;
        Ok(SessionStream {
            send,
            recv,
            scratch: BytesMut::with_capacity(4 * 1024),
        })
    }
}

pub struct SessionStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    scratch: BytesMut,
}

impl SessionStream {
    pub async fn send(&mut self, message: Message) -> Result<()> {
        quic::write_message(&mut self.send, &message).await
    }

    pub async fn recv(&mut self) -> Result<Message> {
        quic::read_message_limited(&mut self.recv, MAX_FRAME_BYTES, &mut self.scratch)
            .await?
            .context("session stream closed")
    }

    /// Read the next frame, expecting an event.
    pub async fn recv_event(&mut self) -> Result<EventFrame> {
        match self.recv().await? {
            Message::Event { event } => Ok(event),
            other => bail!("expected an event frame, got {other:?}"),
        }
    }

    /// Read the `Subscribed` acknowledgement.
    pub async fn recv_subscribed(&mut self) -> Result<(String, u64)> {
        match self.recv().await? {
            Message::Subscribed {
                consumer,
                processing_deadline_ms,
            } => Ok((consumer, processing_deadline_ms)),
            other => bail!("expected a subscribed frame, got {other:?}"),
        }
    }
}

pub fn string_value(value: &str) -> EventData {
    EventData {
        type_url: "type.googleapis.com/test.v1.StringValue".to_string(),
        payload: value.as_bytes().to_vec(),
    }
}
