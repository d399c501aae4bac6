//! QUIC transport adapter for the windshift service.
//!
//! Every RPC is one bidirectional stream: unary requests read a single frame
//! and answer with a single frame, while a `Subscribe` frame hands the stream
//! over to the session dispatcher for the lifetime of the subscription.

mod codec;
mod handlers;
mod session;

pub use codec::{read_message_limited, write_message};

use anyhow::Result;
use bytes::BytesMut;
use quinn::Endpoint;
use std::sync::Arc;

use windshift_events::Events;
use windshift_wire::{ErrorCode, Message};

use crate::config::ServiceConfig;

/// Serve incoming QUIC connections until the endpoint closes.
pub async fn serve(endpoint: Endpoint, events: Arc<Events>, config: ServiceConfig) -> Result<()> {
    // Main accept loop: spawn a task per incoming QUIC connection.
    loop {
        let Some(incoming) = endpoint.accept().await else {
            return Ok(());
        };
        let events = Arc::clone(&events);
        let config = config.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => {
                    if let Err(err) = handle_connection(connection, events, config).await {
                        tracing::debug!(error = %err, "connection handler exited");
                    }
                }
                Err(err) => tracing::debug!(error = %err, "failed to accept connection"),
            }
        });
    }
}

async fn handle_connection(
    connection: quinn::Connection,
    events: Arc<Events>,
    config: ServiceConfig,
) -> Result<()> {
    tracing::debug!(peer = %connection.remote_address(), "connection established");
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::ConnectionClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let events = Arc::clone(&events);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(events, config, send, recv).await {
                tracing::debug!(error = %err, "stream handler failed");
            }
        });
    }
}

async fn handle_stream(
    events: Arc<Events>,
    config: ServiceConfig,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) -> Result<()> {
    let mut scratch = BytesMut::with_capacity(4 * 1024);
    let Some(request) = read_message_limited(&mut recv, config.max_frame_bytes, &mut scratch).await?
    else {
        return Ok(());
    };
    match request {
        Message::Subscribe { stream, consumer } => {
            session::run(&events, &config, send, recv, stream, consumer).await
        }
        request @ (Message::EnsureStream { .. }
        | Message::EnsureConsumer { .. }
        | Message::PublishEvent { .. }) => {
            let response = handlers::handle_request(&events, &config, request).await;
            write_message(&mut send, &response).await?;
            let _ = send.finish();
            Ok(())
        }
        other => {
            tracing::debug!(?other, "unexpected first frame on stream");
            write_message(
                &mut send,
                &Message::Error {
                    code: ErrorCode::FailedPrecondition,
                    message: "expected a request or subscribe frame".to_string(),
                },
            )
            .await?;
            let _ = send.finish();
            Ok(())
        }
    }
}
