use anyhow::{Context, Result};
use std::net::SocketAddr;

// Service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // QUIC listener bind address.
    pub quic_bind: SocketAddr,
    // Max frame size accepted on QUIC streams.
    pub max_frame_bytes: usize,
    // Cap on in-flight deliveries per session.
    pub max_pending_events: usize,
    // Deadline for a single publish against the broker.
    pub publish_timeout_ms: u64,
}

const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_PENDING_EVENTS: usize = 50;
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 2000;

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let quic_bind = std::env::var("WINDSHIFT_QUIC_BIND")
            .unwrap_or_else(|_| "0.0.0.0:4780".to_string())
            .parse()
            .context("parse WINDSHIFT_QUIC_BIND")?;
        let max_frame_bytes = std::env::var("WINDSHIFT_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let max_pending_events = std::env::var("WINDSHIFT_MAX_PENDING_EVENTS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_PENDING_EVENTS);
        let publish_timeout_ms = std::env::var("WINDSHIFT_PUBLISH_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS);
        Ok(Self {
            quic_bind,
            max_frame_bytes,
            max_pending_events,
            publish_timeout_ms,
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            quic_bind: ([0, 0, 0, 0], 4780).into(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_pending_events: DEFAULT_MAX_PENDING_EVENTS,
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
        }
    }
}
