// Windshift service entry point.
use anyhow::{Context, Result};
use quinn::ServerConfig;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use windshift::config::ServiceConfig;
use windshift::quic;
use windshift_broker::Broker;
use windshift_events::Events;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServiceConfig::from_env()?;

    // In-process broker backing the event bus.
    let broker = Arc::new(Broker::new());
    let events = Arc::new(Events::new(broker));
    tracing::info!("broker started");

    let server_config = build_server_config().context("build QUIC server config")?;
    let endpoint = quinn::Endpoint::server(server_config, config.quic_bind)
        .context("bind QUIC listener")?;
    tracing::info!(addr = %endpoint.local_addr()?, "quic listener started");

    let serve_task = tokio::spawn(quic::serve(endpoint, events, config));

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    serve_task.abort();
    tracing::info!("windshift stopped");
    Ok(())
}

fn build_server_config() -> Result<ServerConfig> {
    let cert = generate_simple_self_signed(vec!["localhost".into()])?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
    Ok(ServerConfig::with_single_cert(vec![cert_der], key_der.into())?)
}
