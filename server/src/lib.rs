#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_arguments)]

//! # sendit
//!
//! Webhook relay for terminals. A client opens an SSH session, claims a
//! public callback URL, and every request sent to that URL is streamed back
//! to its terminal. The client needs no public IP or inbound firewall rule.
//!
//! ```text
//! $ ssh -p 2222 hooks.example.com init
//! Webhook URL: https://hooks.example.com/Xk3v9QzL1bWt
//! ...
//! {"hello":"world"}
//! ```
//!
//! ## Surfaces
//!
//! | Listener | Default        | Description                                    |
//! |----------|----------------|------------------------------------------------|
//! | SSH      | `0.0.0.0:2222` | Interactive sessions: claim, then stream       |
//! | HTTP     | `0.0.0.0:5000` | `ANY /{id}[/...]` webhook intake, `/api/health` |
//!
//! ## Architecture
//!
//! ```text
//! config.rs        — TOML + env-var configuration
//! state.rs         — AppState for HTTP handlers
//! relay/
//!   id.rs          — Identifier generation
//!   registry.rs    — Registry, DeliveryChannel, Inbox
//! session/
//!   mod.rs         — claim/stream state machine
//!   input.rs       — line assembly for raw terminals
//!   render.rs      — typed outbound messages
//! ssh/
//!   mod.rs         — host key, russh handler, accept loop
//! routes/
//!   webhook.rs     — webhook intake
//!   health.rs      — liveness probe
//! ```
//!
//! The [`Registry`] is created once at startup and injected into both the
//! SSH sessions and the HTTP routes; there is no global state.

pub mod config;
pub mod relay;
pub mod routes;
pub mod session;
pub mod ssh;
pub mod state;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use relay::{Identifier, Payload, Registry};
pub use state::AppState;
