//! `gestura-cockpit` – HTTP and WebSocket front door of the relay.
//!
//! Boots an axum server (default port `5000`) that:
//!
//! 1. **Accepts** partial robot-state updates from gesture producers over
//!    `POST /api/robot-status` and from dashboards over the `/ws`
//!    push-channel, feeding both into the [`StateRelay`].
//!
//! 2. **Pushes** the full snapshot to every open push-channel: once on open,
//!    then after every accepted update from any producer.
//!
//! 3. **Reports** liveness, the current state, recent history and the broker
//!    adapter status.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gestura_middleware::{ConnectionRegistry, StateRelay, StateStore};
//! use gestura_cockpit::CockpitServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let relay = StateRelay::new(
//!         Arc::new(StateStore::default()),
//!         Arc::new(ConnectionRegistry::default()),
//!     );
//!     CockpitServer::new(relay)
//!         .with_port(5000)
//!         .run()
//!         .await
//!         .expect("cockpit server failed");
//! }
//! ```
//!
//! [`StateRelay`]: gestura_middleware::StateRelay

pub mod server;

pub use server::{ApiError, CockpitServer, DEFAULT_PORT, router};
