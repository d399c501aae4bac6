//! Names of the windshift headers carried on broker messages.

/// RFC 3339 publication time stamped by the producer.
pub const PUBLISHED_TIME: &str = "WS-Published-Time";

/// Fully-qualified type name of the payload, without the type-URL prefix.
pub const DATA_TYPE: &str = "WS-Data-Type";

/// W3C trace context.
pub const TRACE_PARENT: &str = "WS-Trace-Parent";
pub const TRACE_STATE: &str = "WS-Trace-State";

/// Prefix stripped from payload type URLs before they go on the wire.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";
