//! # Shelfcast Node
//!
//! Hosts the real-time core behind its network listeners.
//!
//! ```text
//! ┌───────────────────────────── Node ─────────────────────────────┐
//! │  TCP :9001  ── StreamRegistry ◄──┐                             │
//! │  UDP :9002  ── DatagramRegistry ◄┤ BridgeClient ──► SseHub     │
//! │                                  │                    │        │
//! │  HTTP :8080                      │                    ▼        │
//! │   • GET  /events/progress, /events/notifications  (SSE)        │
//! │   • GET  /ws/chat                                 (RoomHub)    │
//! │   • POST /api/broadcast/progress, /notification   (ingest)     │
//! │   • GET  /api/realtime/status, /health                         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! SHELFCAST_AUTH__SECRET=dev-secret cargo run --bin shelfcast-node
//! ```
//!
//! ## Modules
//!
//! - [`api`] - Router, shared state, ingest endpoints, error mapping
//! - [`realtime_api`] - SSE streams, chat WebSocket, status
//! - [`auth`] - JWT verification
//! - [`config`] - Layered configuration
//! - [`node`] - Startup and shutdown of all components
//! - [`observability`] - Structured logging and request IDs

pub mod api;
pub mod auth;
pub mod config;
pub mod node;
pub mod observability;
pub mod realtime_api;

pub use node::{Node, NodeError};
