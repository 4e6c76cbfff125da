//! Registration-and-delivery relay.
//!
//! - [`id`] — generates the opaque identifiers sessions claim
//! - [`registry`] — maps identifiers to single-consumer delivery channels
//!
//! A session claims an [`Inbox`] from the [`Registry`]; webhook handlers look
//! the identifier up and push [`Payload`]s into the matching
//! [`DeliveryChannel`]. Dropping the inbox releases the identifier.

pub mod id;
pub mod registry;

use std::time::{Duration, SystemTime};

use bytes::Bytes;

pub use id::Identifier;
pub use registry::{DeliveryChannel, DeliveryError, Inbox, Registry, RegistryError};

/// One inbound webhook body plus the request metadata it arrived with.
///
/// Only [`Payload::body`] is rendered to the session; the rest is logged
/// when the payload is written out.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Raw request body.
    pub body: Bytes,
    /// HTTP method of the inbound request (`POST`, `PUT`, ...).
    pub method: String,
    /// Path after the identifier segment, without the leading slash.
    pub path: String,
    /// `Content-Type` header, if the sender supplied one.
    pub content_type: Option<String>,
    /// When the webhook handler accepted the request.
    pub received_at: SystemTime,
}

impl Payload {
    /// Build a `POST` payload with no path suffix or content type.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            method: "POST".to_string(),
            path: String::new(),
            content_type: None,
            received_at: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Time spent between arrival and now; zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        self.received_at.elapsed().unwrap_or_default()
    }
}
